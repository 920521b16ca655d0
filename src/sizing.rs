//! Sizing policy: pure decision functions for one variant.
//!
//! Nothing here touches pixels or storage. Given the declared
//! [`CompressionOptions`] and what is known about the source, these functions
//! decide whether to rescale, how large the output should be, how coarsely the
//! codec may subsample while decoding, and whether the produced bytes have to
//! be recoded.

use crate::options::CompressionOptions;
use crate::types::SourceMetadata;

/// Hard ceiling on any variant's byte length, animated formats included.
pub const MAX_ANIMATED_BYTES: u64 = 5 * 1024 * 1024;

/// Bytes per pixel of a decoded RGBA buffer.
const BYTES_PER_PIXEL: u64 = 4;

/// Whether the source must go through decode + scale (or crop) at all.
///
/// True when the pixel count exceeds the variant's budget, or when the
/// variant is square and the source is not.
pub fn should_scale_original_size(width: u32, height: u32, options: &CompressionOptions) -> bool {
    let pixels = width as f64 * height as f64;
    pixels > options.max_pixel_count() || (options.crop_to_square && width != height)
}

/// Output dimensions for a variant.
///
/// - Degenerate sources (either edge < 1) yield `(1, 1)`.
/// - Square variants take `min(dimension, short edge)` on both axes; they are
///   never upscaled past the source.
/// - Otherwise the area is brought to `dimension²` with a uniform scale. The
///   width is rounded up and the height is derived from the rounded width so
///   both axes share one aspect ratio.
///
/// # Examples
/// ```
/// # use asset_variants::options::CompressionOptions;
/// # use asset_variants::sizing::calculate_scaled_size;
/// let opts = CompressionOptions::small_profile();
/// assert_eq!(calculate_scaled_size(3000, 2000, &opts), (280, 280));
/// assert_eq!(calculate_scaled_size(0, 2000, &opts), (1, 1));
/// ```
pub fn calculate_scaled_size(
    orig_width: u32,
    orig_height: u32,
    options: &CompressionOptions,
) -> (u32, u32) {
    if orig_width < 1 || orig_height < 1 {
        return (1, 1);
    }

    if options.crop_to_square {
        let edge = options.dimension.min(orig_width.min(orig_height)).max(1);
        return (edge, edge);
    }

    let (w, h) = (orig_width as f64, orig_height as f64);
    let d = options.dimension as f64;
    let scale = (d * d / (w * h)).sqrt();
    let width = (scale * w).ceil().max(1.0);
    let height = (width / w * h).round().max(1.0);
    (width as u32, height as u32)
}

/// Whether produced bytes must be decoded again and re-encoded lossy.
///
/// Uses the global [`MAX_ANIMATED_BYTES`] ceiling; see
/// [`should_recode_with_ceiling`] for a configurable one.
pub fn should_recode(file_len: u64, metadata: &SourceMetadata, options: &CompressionOptions) -> bool {
    should_recode_with_ceiling(file_len, metadata, options, MAX_ANIMATED_BYTES)
}

/// Recode when the format is listed in `recode_mimes`, when a non-animated
/// payload is over the byte budget, when anything is over `ceiling`, or when
/// the image still carries an orientation transform that consumers would
/// otherwise have to apply.
pub fn should_recode_with_ceiling(
    file_len: u64,
    metadata: &SourceMetadata,
    options: &CompressionOptions,
    ceiling: u64,
) -> bool {
    options.recode_mimes.contains(&metadata.mime)
        || (!metadata.mime.is_animated_format() && file_len > options.byte_count)
        || file_len > ceiling
        || metadata.has_orientation_transform()
}

/// Largest power-of-two decode subsample that still leaves enough pixels.
///
/// For a plain scale both decoded axes must stay at least as large as the
/// target. For a square crop only the short decoded edge matters, since the
/// crop keeps the largest centered square.
pub fn calculate_subsample_factor(source: (u32, u32), target: (u32, u32), crop_to_square: bool) -> u32 {
    let (src_w, src_h) = source;
    let (tgt_w, tgt_h) = (target.0.max(1), target.1.max(1));
    let mut factor = 1u32;

    while factor < (1 << 16) {
        let next = factor * 2;
        let (dec_w, dec_h) = (src_w / next, src_h / next);
        let fits = if crop_to_square {
            dec_w.min(dec_h) >= tgt_w.max(tgt_h)
        } else {
            dec_w >= tgt_w && dec_h >= tgt_h
        };
        if !fits {
            break;
        }
        factor = next;
    }

    factor
}

/// Bytes of the source decoded at full resolution.
pub fn full_decode_bytes(source: (u32, u32)) -> u64 {
    source.0 as u64 * source.1 as u64 * BYTES_PER_PIXEL
}

/// Peak bytes held while decoding at `subsample` and producing `target`:
/// the destination RGBA buffer plus the subsampled source buffer.
///
/// Assumes the codec subsamples while decoding; see [`plan_variant`] for
/// codecs that do not.
pub fn estimate_decode_bytes(source: (u32, u32), target: (u32, u32), subsample: u32) -> u64 {
    let s = subsample.max(1);
    let dest = target.0 as u64 * target.1 as u64 * BYTES_PER_PIXEL;
    let decoded = source.0.div_ceil(s) as u64 * source.1.div_ceil(s) as u64 * BYTES_PER_PIXEL;
    dest + decoded
}

/// Decode at `1/subsample`, then scale or crop to `width × height`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaleTarget {
    pub width: u32,
    pub height: u32,
    pub subsample: u32,
    /// Bytes to reserve before decoding.
    pub decode_bytes: u64,
}

/// What the encoder does for one variant before it sees any encoded bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariantPlan {
    /// Store the source bytes as they are.
    PassThrough,
    Scale(ScaleTarget),
}

/// Combine the decisions above for a source, working on its display
/// (post-orientation) dimensions.
pub fn plan_variant(
    metadata: &SourceMetadata,
    options: &CompressionOptions,
    native_subsample: bool,
) -> VariantPlan {
    let source = metadata.display_dimensions();
    if !should_scale_original_size(source.0, source.1, options) {
        return VariantPlan::PassThrough;
    }
    let target = calculate_scaled_size(source.0, source.1, options);
    let subsample = calculate_subsample_factor(source, target, options.crop_to_square);
    let mut decode_bytes = estimate_decode_bytes(source, target, subsample);
    if subsample > 1 && !native_subsample {
        // full-size decode first, shrunk copy after
        decode_bytes += full_decode_bytes(source);
    }
    VariantPlan::Scale(ScaleTarget {
        width: target.0,
        height: target.1,
        subsample,
        decode_bytes,
    })
}
