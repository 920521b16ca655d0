//! Codec capability: the only place pixels are touched.
//!
//! | Operation | Trait method | `RustCodec` |
//! |---|---|---|
//! | **Identify** | [`Codec::identify`] | header read via `image::ImageReader` (+ EXIF orientation) |
//! | **Decode** | [`Codec::decode`] | full decode, orientation applied, subsample emulated with a triangle filter |
//! | **Crop** | [`Codec::crop_square`] | largest centered square, resized to the edge with Lanczos3 |
//! | **Scale** | [`Codec::scale`] | `resize_exact` with Lanczos3 |
//! | **Encode** | [`Codec::encode`] | PNG (lossless) or JPEG (lossy, quality-controlled) |
//!
//! The module is split into:
//! - **Backend**: the [`Codec`] trait, [`DecodedImage`], [`OutputFormat`], [`CodecError`]
//! - **RustCodec**: the production implementation on top of the `image` crate

pub mod backend;
pub mod rust_codec;

pub use backend::{Codec, CodecError, DecodedImage, OutputFormat};
pub use rust_codec::RustCodec;
