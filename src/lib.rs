//! # asset-variants
//!
//! Derives a fixed family of image variants from one source image: a tiny
//! inline `preview`, a `medium` rendition bounded by pixel and byte budgets,
//! and a square `smallProfile` for profile pictures. Each variant meets its
//! own size, quality and format constraints while peak decode memory stays
//! under a shared budget and unnecessary re-encodes are skipped.
//!
//! # Architecture: Four Layers
//!
//! ```text
//! AssetPipeline      one profile: identify once, fold options right to left
//!   └─ VariantEncoder    one variant: decode → scale/crop → encode → recode?
//!        ├─ sizing           pure decisions (target size, subsample, recode)
//!        ├─ MemoryBudget     reservation before every decode
//!        └─ Codec / ContentStore   collaborators behind traits
//! ```
//!
//! The separation keeps every decision testable without pixels: [`sizing`]
//! is pure, and the encoder and pipeline run against a recording mock codec
//! and an in-memory store in unit tests.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`types`] | Shared data: `SourceMetadata`, `VariantResult`, `AssetVariantSet` |
//! | [`options`] | `CompressionOptions`, `Quality`, the stock profiles |
//! | [`sizing`] | Pure sizing and recode decisions |
//! | [`memory`] | Cooperative decode memory budget with RAII reservations |
//! | [`codec`] | `Codec` trait and the `image`-crate implementation |
//! | [`store`] | `ContentStore` trait and the directory-backed store |
//! | [`encoder`] | Per-variant state machine |
//! | [`pipeline`] | Per-asset driver and progress events |
//! | [`error`] | `PipelineError` taxonomy |
//! | [`config`] | `config.toml` loading, validation and merging |
//! | [`cache`] | Content-addressed cache of derived profiles |
//! | [`derive`] | Batch driver over files on disk |
//! | [`output`] | CLI output formatting |
//!
//! # Design Decisions
//!
//! ## Display Dimensions Everywhere
//!
//! Sizing works on the image as it will be shown, i.e. after the EXIF
//! orientation is applied. A portrait photo stored sideways gets the same
//! variants as the same photo stored upright, and the decoder applies the
//! orientation so no variant carries an orientation tag.
//!
//! ## Reservations Are Guards
//!
//! A memory reservation is released when its guard is dropped. Success,
//! failure and cancellation (dropping the pipeline future) all release the
//! budget without any cleanup code on the caller's side.
//!
//! ## Pixel Work Off the Runtime
//!
//! The `image`-crate codec runs decode, resize and encode on the rayon pool
//! and awaits the result, so concurrent assets never block tokio workers.

pub mod cache;
pub mod codec;
pub mod config;
pub mod derive;
pub mod encoder;
pub mod error;
pub mod memory;
pub mod options;
pub mod output;
pub mod pipeline;
pub mod sizing;
pub mod store;
pub mod types;

pub use error::PipelineError;
pub use pipeline::AssetPipeline;
