//! Codec trait and shared types.
//!
//! The [`Codec`] trait defines the operations the encoder needs: identify,
//! decode (with subsampling and orientation correction), crop to square,
//! scale, and encode. The pipeline never names a concrete image library, so
//! tests can drive it with a recording mock and production uses
//! [`RustCodec`](super::rust_codec::RustCodec).
//!
//! All operations are async: implementations are expected to move pixel work
//! off the async runtime and suspend the caller until it is done.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::options::Quality;
use crate::types::{ImageMime, Orientation, SourceMetadata};

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Unsupported image format: {0}")]
    Unsupported(String),
    #[error("Decode failed: {0}")]
    Decode(String),
    #[error("Encode failed: {0}")]
    Encode(String),
    #[error("Image operation failed: {0}")]
    Operation(String),
    #[error("Codec worker stopped before finishing")]
    WorkerGone,
}

/// Output formats a codec must support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    /// Lossless, used for PNG sources that are not forced lossy.
    Png,
    /// Lossy, quality-controlled.
    Jpeg,
}

impl OutputFormat {
    pub fn mime(self) -> ImageMime {
        match self {
            Self::Png => ImageMime::Png,
            Self::Jpeg => ImageMime::Jpeg,
        }
    }
}

/// A decoded image whose pixels live inside the codec.
pub trait DecodedImage: Send + 'static {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
}

#[async_trait]
pub trait Codec: Send + Sync {
    type Image: DecodedImage;

    /// Whether [`decode`](Self::decode) subsamples `mime` sources while
    /// decoding. When it does not, the full-resolution buffer exists before
    /// the shrink and has to be budgeted for.
    fn native_subsample(&self, _mime: ImageMime) -> bool {
        true
    }

    /// Read format, dimensions and orientation without decoding pixels.
    async fn identify(&self, source: &[u8]) -> Result<SourceMetadata, CodecError>;

    /// Decode at `1/subsample` of the stored resolution, applying `orientation`.
    async fn decode(
        &self,
        source: Bytes,
        subsample: u32,
        orientation: Orientation,
    ) -> Result<Self::Image, CodecError>;

    /// Encode to `format`. `quality` only affects lossy formats.
    async fn encode(
        &self,
        image: Self::Image,
        format: OutputFormat,
        quality: Quality,
    ) -> Result<Bytes, CodecError>;

    /// Crop the largest centered square and bring it to `edge × edge`.
    async fn crop_square(&self, image: Self::Image, edge: u32) -> Result<Self::Image, CodecError>;

    /// Resize to exactly `width × height`.
    async fn scale(
        &self,
        image: Self::Image,
        width: u32,
        height: u32,
    ) -> Result<Self::Image, CodecError>;
}
