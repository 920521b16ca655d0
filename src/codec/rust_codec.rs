//! Pure Rust codec on top of the `image` crate.
//!
//! Everything is statically linked into the binary.
//!
//! ## Crate mapping
//!
//! | Operation | Crate / function |
//! |---|---|
//! | Identify | `image::ImageReader::into_decoder` (dimensions + EXIF orientation) |
//! | Decode (JPEG, PNG, GIF, WebP, BMP, TIFF) | `image` crate pure Rust decoders |
//! | Orientation | `DynamicImage::apply_orientation` |
//! | Subsample | `resize_exact` with a `Triangle` filter after a full decode |
//! | Crop / scale | `crop_imm` + `resize_exact` with `Lanczos3` |
//! | Encode → PNG | `image::codecs::png::PngEncoder` |
//! | Encode → JPEG | `image::codecs::jpeg::JpegEncoder` (quality-controlled) |
//!
//! The `image` decoders have no scaled decode, so [`Codec::native_subsample`]
//! is false and reservations include the full-resolution buffer.
//!
//! Pixel work runs on the rayon pool; the async caller waits on a oneshot
//! channel, so no runtime worker thread is blocked while an image decodes.

use async_trait::async_trait;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::imageops::FilterType;
use image::metadata::Orientation as ExifOrientation;
use image::{DynamicImage, ImageDecoder, ImageFormat, ImageReader};
use std::io::Cursor;

use super::backend::{Codec, CodecError, DecodedImage, OutputFormat};
use crate::options::Quality;
use crate::types::{ImageMime, Orientation, SourceMetadata};

/// Production codec. See the [module docs](self) for the crate mapping.
#[derive(Debug, Clone, Copy, Default)]
pub struct RustCodec;

impl RustCodec {
    pub fn new() -> Self {
        Self
    }
}

impl DecodedImage for DynamicImage {
    fn width(&self) -> u32 {
        DynamicImage::width(self)
    }

    fn height(&self) -> u32 {
        DynamicImage::height(self)
    }
}

fn mime_for(format: ImageFormat) -> Result<ImageMime, CodecError> {
    match format {
        ImageFormat::Jpeg => Ok(ImageMime::Jpeg),
        ImageFormat::Png => Ok(ImageMime::Png),
        ImageFormat::Gif => Ok(ImageMime::Gif),
        ImageFormat::WebP => Ok(ImageMime::WebP),
        ImageFormat::Bmp => Ok(ImageMime::Bmp),
        ImageFormat::Tiff => Ok(ImageMime::Tiff),
        other => Err(CodecError::Unsupported(format!("{other:?}"))),
    }
}

fn reader(source: &[u8]) -> Result<ImageReader<Cursor<&[u8]>>, CodecError> {
    ImageReader::new(Cursor::new(source))
        .with_guessed_format()
        .map_err(|e| CodecError::Decode(format!("Failed to sniff format: {e}")))
}

/// Read format, stored dimensions and orientation from the header.
fn identify_sync(source: &[u8]) -> Result<SourceMetadata, CodecError> {
    let reader = reader(source)?;
    let format = reader
        .format()
        .ok_or_else(|| CodecError::Unsupported("unrecognised image data".into()))?;
    let mime = mime_for(format)?;

    let mut decoder = reader
        .into_decoder()
        .map_err(|e| CodecError::Decode(format!("Failed to read header: {e}")))?;
    let (width, height) = decoder.dimensions();
    let orientation = decoder
        .orientation()
        .map(|o| Orientation::from_exif(o.to_exif() as u16))
        .unwrap_or_default();

    Ok(SourceMetadata::new(width, height, mime).with_orientation(orientation))
}

fn decode_sync(
    source: &[u8],
    subsample: u32,
    orientation: Orientation,
) -> Result<DynamicImage, CodecError> {
    let mut img = reader(source)?
        .decode()
        .map_err(|e| CodecError::Decode(e.to_string()))?;

    if let Some(exif) = ExifOrientation::from_exif(orientation.to_exif() as u8) {
        img.apply_orientation(exif);
    }

    let s = subsample.max(1);
    if s > 1 {
        let (w, h) = (img.width().div_ceil(s), img.height().div_ceil(s));
        img = img.resize_exact(w, h, FilterType::Triangle);
    }
    Ok(img)
}

fn encode_sync(img: &DynamicImage, format: OutputFormat, quality: Quality) -> Result<Bytes, CodecError> {
    let mut buf = Vec::new();
    match format {
        OutputFormat::Png => img
            .write_with_encoder(PngEncoder::new(&mut buf))
            .map_err(|e| CodecError::Encode(format!("PNG encode failed: {e}")))?,
        OutputFormat::Jpeg => {
            // JPEG has no alpha channel
            let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
            // the JPEG encoder has no quality 0
            let q = quality.value().clamp(1, 100) as u8;
            let encoder = JpegEncoder::new_with_quality(&mut buf, q);
            rgb.write_with_encoder(encoder)
                .map_err(|e| CodecError::Encode(format!("JPEG encode failed: {e}")))?
        }
    }
    Ok(Bytes::from(buf))
}

fn crop_square_sync(img: &DynamicImage, edge: u32) -> DynamicImage {
    let side = img.width().min(img.height());
    let x = (img.width() - side) / 2;
    let y = (img.height() - side) / 2;
    let square = img.crop_imm(x, y, side, side);
    if side == edge {
        square
    } else {
        square.resize_exact(edge, edge, FilterType::Lanczos3)
    }
}

/// Run `work` on the rayon pool and wait for it without blocking the runtime.
///
/// If the awaiting future is dropped, the result is discarded when the
/// worker finishes.
async fn on_pool<T, F>(work: F) -> Result<T, CodecError>
where
    F: FnOnce() -> Result<T, CodecError> + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = tokio::sync::oneshot::channel();
    rayon::spawn(move || {
        let _ = tx.send(work());
    });
    rx.await.map_err(|_| CodecError::WorkerGone)?
}

#[async_trait]
impl Codec for RustCodec {
    type Image = DynamicImage;

    fn native_subsample(&self, _mime: ImageMime) -> bool {
        false
    }

    async fn identify(&self, source: &[u8]) -> Result<SourceMetadata, CodecError> {
        // Header-only; cheap enough to run inline.
        identify_sync(source)
    }

    async fn decode(
        &self,
        source: Bytes,
        subsample: u32,
        orientation: Orientation,
    ) -> Result<DynamicImage, CodecError> {
        on_pool(move || decode_sync(&source, subsample, orientation)).await
    }

    async fn encode(
        &self,
        image: DynamicImage,
        format: OutputFormat,
        quality: Quality,
    ) -> Result<Bytes, CodecError> {
        on_pool(move || encode_sync(&image, format, quality)).await
    }

    async fn crop_square(&self, image: DynamicImage, edge: u32) -> Result<DynamicImage, CodecError> {
        if edge == 0 {
            return Err(CodecError::Operation("crop edge must be non-zero".into()));
        }
        on_pool(move || Ok(crop_square_sync(&image, edge))).await
    }

    async fn scale(
        &self,
        image: DynamicImage,
        width: u32,
        height: u32,
    ) -> Result<DynamicImage, CodecError> {
        if width == 0 || height == 0 {
            return Err(CodecError::Operation(format!(
                "cannot scale to {width}x{height}"
            )));
        }
        on_pool(move || Ok(image.resize_exact(width, height, FilterType::Lanczos3))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageEncoder, RgbImage, RgbaImage};

    /// Encode a synthetic gradient as JPEG bytes.
    fn test_jpeg(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        });
        let mut buf = Vec::new();
        JpegEncoder::new(&mut buf)
            .write_image(img.as_raw(), width, height, image::ExtendedColorType::Rgb8)
            .unwrap();
        buf
    }

    fn test_png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_fn(width, height, |x, y| {
            image::Rgba([(x % 256) as u8, (y % 256) as u8, 64, 255])
        });
        let mut buf = Vec::new();
        PngEncoder::new(&mut buf)
            .write_image(img.as_raw(), width, height, image::ExtendedColorType::Rgba8)
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn identify_synthetic_jpeg() {
        let meta = RustCodec::new().identify(&test_jpeg(200, 150)).await.unwrap();
        assert_eq!(meta, SourceMetadata::new(200, 150, ImageMime::Jpeg));
    }

    #[tokio::test]
    async fn identify_png_mime() {
        let meta = RustCodec::new().identify(&test_png(20, 10)).await.unwrap();
        assert_eq!(meta.mime, ImageMime::Png);
        assert_eq!((meta.width, meta.height), (20, 10));
    }

    #[tokio::test]
    async fn identify_garbage_errors() {
        let result = RustCodec::new().identify(b"definitely not an image").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn decode_with_subsample_shrinks() {
        let codec = RustCodec::new();
        let img = codec
            .decode(Bytes::from(test_jpeg(401, 200)), 4, Orientation::Normal)
            .await
            .unwrap();
        assert_eq!((img.width(), img.height()), (101, 50));
    }

    #[tokio::test]
    async fn decode_applies_rotation() {
        let codec = RustCodec::new();
        let img = codec
            .decode(Bytes::from(test_jpeg(40, 20)), 1, Orientation::Rotate90)
            .await
            .unwrap();
        assert_eq!((img.width(), img.height()), (20, 40));
    }

    #[tokio::test]
    async fn crop_square_takes_center_and_resizes() {
        let codec = RustCodec::new();
        let img = codec
            .decode(Bytes::from(test_jpeg(300, 200)), 1, Orientation::Normal)
            .await
            .unwrap();
        let cropped = codec.crop_square(img, 50).await.unwrap();
        assert_eq!((cropped.width(), cropped.height()), (50, 50));
    }

    #[tokio::test]
    async fn encode_roundtrips_through_identify() {
        let codec = RustCodec::new();
        let img = codec
            .decode(Bytes::from(test_png(64, 32)), 1, Orientation::Normal)
            .await
            .unwrap();
        let scaled = codec.scale(img, 32, 16).await.unwrap();

        let jpeg = codec
            .encode(scaled.clone(), OutputFormat::Jpeg, Quality::new(70))
            .await
            .unwrap();
        let png = codec
            .encode(scaled, OutputFormat::Png, Quality::new(70))
            .await
            .unwrap();

        assert_eq!(
            codec.identify(&jpeg).await.unwrap(),
            SourceMetadata::new(32, 16, ImageMime::Jpeg)
        );
        assert_eq!(codec.identify(&png).await.unwrap().mime, ImageMime::Png);
    }

    #[test]
    fn decodes_full_size_before_subsampling() {
        assert!(!RustCodec::new().native_subsample(ImageMime::Jpeg));
    }

    #[tokio::test]
    async fn quality_zero_still_encodes_jpeg() {
        let codec = RustCodec::new();
        let img = DynamicImage::new_rgb8(16, 16);
        let jpeg = codec
            .encode(img, OutputFormat::Jpeg, Quality::new(0))
            .await
            .unwrap();
        assert_eq!(codec.identify(&jpeg).await.unwrap().mime, ImageMime::Jpeg);
    }

    #[tokio::test]
    async fn scale_to_zero_is_an_error() {
        let codec = RustCodec::new();
        let img = DynamicImage::new_rgb8(4, 4);
        assert!(matches!(
            codec.scale(img, 0, 4).await,
            Err(CodecError::Operation(_))
        ));
    }
}
