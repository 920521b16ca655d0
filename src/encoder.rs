//! Variant encoder: produces one variant for one [`CompressionOptions`].
//!
//! ## Stages
//!
//! ```text
//! Start ─┬─ Decoding → Scaling ─┐
//!        └─ PassThrough ────────┴─ Encoding ─┬─ Done
//!                                            └─ Recoding → Done
//! any stage ─→ Failed
//! ```
//!
//! - **Scale path** (source over the pixel budget, or a square variant of a
//!   non-square source): reserve memory, decode subsampled with orientation
//!   applied, crop or scale, encode (PNG for non-forced PNG sources, JPEG
//!   otherwise), store.
//! - **Pass-through**: the source bytes are stored unchanged.
//! - **Recode**: if the stored bytes break the byte budget, are in a format
//!   listed for recoding, or still carry an orientation tag, they are decoded
//!   again at full resolution and re-encoded as JPEG. Dimensions come from the
//!   decoded image, never from the options.
//! - **Inline**: payloads under the inline threshold are returned as base64
//!   and their store entry is removed.
//!
//! Every failure is fatal for the variant. Entries written by the failed
//! attempt are removed best-effort before the error is returned.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::codec::{Codec, CodecError, DecodedImage, OutputFormat};
use crate::error::PipelineError;
use crate::memory::{MemoryBudget, ReservationKey};
use crate::options::CompressionOptions;
use crate::pipeline::{EventSender, PipelineEvent};
use crate::sizing::{
    MAX_ANIMATED_BYTES, ScaleTarget, VariantPlan, estimate_decode_bytes, plan_variant,
    should_recode_with_ceiling,
};
use crate::store::{ContentStore, StorageHandle, StoreError, StoreLocation};
use crate::types::{AssetId, ImageMime, SourceMetadata, VariantResult};

/// Payloads strictly smaller than this are inlined into the result.
pub const INLINE_THRESHOLD: u64 = 2048;

/// Stage of the per-variant state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodeStage {
    Start,
    Decoding,
    Scaling,
    PassThrough,
    Encoding,
    Recoding,
    Done,
    Failed,
}

impl fmt::Display for EncodeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Start => "start",
            Self::Decoding => "decoding",
            Self::Scaling => "scaling",
            Self::PassThrough => "pass-through",
            Self::Encoding => "encoding",
            Self::Recoding => "recoding",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Tunables that are not part of any single variant's options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderSettings {
    pub inline_threshold: u64,
    pub max_animated_bytes: u64,
    pub location: StoreLocation,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            inline_threshold: INLINE_THRESHOLD,
            max_animated_bytes: MAX_ANIMATED_BYTES,
            location: StoreLocation::Cache,
        }
    }
}

/// Bytes that made it into the store, with what we know about them.
struct Stored {
    handle: StorageHandle,
    bytes: Bytes,
    metadata: SourceMetadata,
}

/// One-variant orchestrator over borrowed collaborators.
pub struct VariantEncoder<'a, C, S> {
    codec: &'a C,
    store: &'a S,
    budget: &'a MemoryBudget,
    settings: &'a EncoderSettings,
    events: Option<&'a EventSender>,
    run: u64,
}

impl<'a, C: Codec, S: ContentStore> VariantEncoder<'a, C, S> {
    pub fn new(
        codec: &'a C,
        store: &'a S,
        budget: &'a MemoryBudget,
        settings: &'a EncoderSettings,
    ) -> Self {
        Self {
            codec,
            store,
            budget,
            settings,
            events: None,
            run: 0,
        }
    }

    pub fn with_events(mut self, events: Option<&'a EventSender>) -> Self {
        self.events = events;
        self
    }

    /// Reserve memory under `run` (see [`MemoryBudget::begin_run`]).
    pub fn with_run(mut self, run: u64) -> Self {
        self.run = run;
        self
    }

    /// Produce the variant described by `options` from `source`.
    ///
    /// `prior` is the running original-size estimate from variants generated
    /// earlier in the profile; `(0, 0)` for the first one.
    pub async fn produce(
        &self,
        asset_id: &AssetId,
        source: &Bytes,
        metadata: &SourceMetadata,
        options: &CompressionOptions,
        prior: (u32, u32),
    ) -> Result<VariantResult, PipelineError> {
        self.enter(asset_id, &options.tag, EncodeStage::Start);
        let mut written = Vec::new();

        match self
            .run(asset_id, source, metadata, options, prior, &mut written)
            .await
        {
            Ok(result) => {
                self.enter(asset_id, &options.tag, EncodeStage::Done);
                Ok(result)
            }
            Err(err) => {
                self.enter(asset_id, &options.tag, EncodeStage::Failed);
                for key in written {
                    if let Err(e) = self.store.remove(&key).await {
                        log::warn!("could not clean up {key} after failed variant: {e}");
                    }
                }
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        asset_id: &AssetId,
        source: &Bytes,
        metadata: &SourceMetadata,
        options: &CompressionOptions,
        prior: (u32, u32),
        written: &mut Vec<String>,
    ) -> Result<VariantResult, PipelineError> {
        let tag = options.tag.as_str();

        let native = self.codec.native_subsample(metadata.mime);
        let mut stored = match plan_variant(metadata, options, native) {
            VariantPlan::Scale(target) => {
                self.scale_and_encode(asset_id, source, metadata, options, target, written)
                    .await?
            }
            VariantPlan::PassThrough => {
                self.enter(asset_id, tag, EncodeStage::PassThrough);
                let handle = self
                    .put(asset_id, tag, metadata.mime, source.clone(), written)
                    .await?;
                Stored {
                    handle,
                    bytes: source.clone(),
                    metadata: *metadata,
                }
            }
        };

        if should_recode_with_ceiling(
            stored.bytes.len() as u64,
            &stored.metadata,
            options,
            self.settings.max_animated_bytes,
        ) {
            stored = self.recode(asset_id, stored, options, written).await?;
        }

        let byte_length = stored.bytes.len() as u64;
        let (storage, inline_data) = if byte_length < self.settings.inline_threshold {
            let encoded = BASE64.encode(&stored.bytes);
            self.remove(tag, &stored.handle.key, written).await?;
            (None, Some(encoded))
        } else {
            (Some(stored.handle), None)
        };

        let meta = stored.metadata;
        log::info!(
            "{asset_id}/{tag}: {}x{} {} ({byte_length} bytes{})",
            meta.width,
            meta.height,
            meta.mime,
            if inline_data.is_some() { ", inline" } else { "" }
        );

        Ok(VariantResult {
            tag: tag.to_string(),
            mime: meta.mime,
            width: meta.width,
            height: meta.height,
            original_width: meta.width.max(prior.0),
            original_height: meta.height.max(prior.1),
            byte_length,
            storage,
            inline_data,
        })
    }

    async fn scale_and_encode(
        &self,
        asset_id: &AssetId,
        source: &Bytes,
        metadata: &SourceMetadata,
        options: &CompressionOptions,
        target: ScaleTarget,
        written: &mut Vec<String>,
    ) -> Result<Stored, PipelineError> {
        let tag = options.tag.as_str();
        let (target_w, target_h) = (target.width, target.height);

        let reservation = self
            .budget
            .acquire(self.reservation_key(asset_id, tag), target.decode_bytes)
            .await?;

        self.enter(asset_id, tag, EncodeStage::Decoding);
        let image = self
            .codec
            .decode(source.clone(), target.subsample, metadata.orientation)
            .await
            .map_err(decode_failure(tag))?;

        self.enter(asset_id, tag, EncodeStage::Scaling);
        let image = if options.crop_to_square {
            self.codec
                .crop_square(image, target_w)
                .await
                .map_err(encode_failure(tag))?
        } else if image.width() > target_w {
            self.codec
                .scale(image, target_w, target_h)
                .await
                .map_err(encode_failure(tag))?
        } else {
            image
        };

        let format = if metadata.mime == ImageMime::Png && !options.force_lossy {
            OutputFormat::Png
        } else {
            OutputFormat::Jpeg
        };

        self.enter(asset_id, tag, EncodeStage::Encoding);
        let (width, height) = (image.width(), image.height());
        let bytes = self
            .codec
            .encode(image, format, options.quality)
            .await
            .map_err(encode_failure(tag))?;
        drop(reservation);

        let handle = self
            .put(asset_id, tag, format.mime(), bytes.clone(), written)
            .await?;
        Ok(Stored {
            handle,
            bytes,
            metadata: SourceMetadata::new(width, height, format.mime()),
        })
    }

    async fn recode(
        &self,
        asset_id: &AssetId,
        previous: Stored,
        options: &CompressionOptions,
        written: &mut Vec<String>,
    ) -> Result<Stored, PipelineError> {
        let tag = options.tag.as_str();
        self.enter(asset_id, tag, EncodeStage::Recoding);

        let dims = previous.metadata.display_dimensions();
        let reservation = self
            .budget
            .acquire(
                self.reservation_key(asset_id, tag),
                estimate_decode_bytes(dims, dims, 1),
            )
            .await?;

        let image = self
            .codec
            .decode(previous.bytes.clone(), 1, previous.metadata.orientation)
            .await
            .map_err(decode_failure(tag))?;
        let (width, height) = (image.width(), image.height());
        let bytes = self
            .codec
            .encode(image, OutputFormat::Jpeg, options.quality)
            .await
            .map_err(encode_failure(tag))?;
        drop(reservation);

        let handle = self
            .put(asset_id, tag, ImageMime::Jpeg, bytes.clone(), written)
            .await?;
        self.remove(tag, &previous.handle.key, written).await?;

        Ok(Stored {
            handle,
            bytes,
            metadata: SourceMetadata::new(width, height, ImageMime::Jpeg),
        })
    }

    /// Store `bytes` under a fresh `{asset}/{tag}/{uuid}.{ext}` key.
    async fn put(
        &self,
        asset_id: &AssetId,
        tag: &str,
        mime: ImageMime,
        bytes: Bytes,
        written: &mut Vec<String>,
    ) -> Result<StorageHandle, PipelineError> {
        let key = format!("{asset_id}/{tag}/{}.{}", Uuid::new_v4(), mime.extension());
        let handle = self
            .store
            .put(&key, bytes, self.settings.location)
            .await
            .map_err(storage_failure(tag))?;
        written.push(key);
        Ok(handle)
    }

    async fn remove(
        &self,
        tag: &str,
        key: &str,
        written: &mut Vec<String>,
    ) -> Result<(), PipelineError> {
        self.store
            .remove(key)
            .await
            .map_err(storage_failure(tag))?;
        written.retain(|k| k != key);
        Ok(())
    }

    fn reservation_key(&self, asset_id: &AssetId, tag: &str) -> ReservationKey {
        ReservationKey::new(asset_id.clone(), tag).with_run(self.run)
    }

    fn enter(&self, asset_id: &AssetId, tag: &str, stage: EncodeStage) {
        log::debug!("{asset_id}/{tag}: {stage}");
        if let Some(events) = self.events {
            // A closed receiver only means nobody is listening any more.
            let _ = events.send(PipelineEvent::StageChanged {
                asset_id: asset_id.clone(),
                tag: tag.to_string(),
                stage,
            });
        }
    }
}

fn decode_failure(tag: &str) -> impl FnOnce(CodecError) -> PipelineError + '_ {
    move |source| PipelineError::Decode {
        tag: tag.to_string(),
        source,
    }
}

fn encode_failure(tag: &str) -> impl FnOnce(CodecError) -> PipelineError + '_ {
    move |source| PipelineError::Encode {
        tag: tag.to_string(),
        source,
    }
}

fn storage_failure(tag: &str) -> impl FnOnce(StoreError) -> PipelineError + '_ {
    move |source| PipelineError::Storage {
        tag: tag.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::backend::tests::{MockCodec, RecordedOp, mock_source, parse_mock};
    use crate::memory::MemoryPolicy;
    use crate::options::Quality;
    use crate::store::tests::MemoryStore;
    use crate::types::Orientation;
    use std::sync::atomic::Ordering;

    const BUDGET: u64 = 1 << 30;

    struct Harness {
        codec: MockCodec,
        store: MemoryStore,
        budget: MemoryBudget,
        settings: EncoderSettings,
    }

    impl Harness {
        fn new(codec: MockCodec) -> Self {
            Self {
                codec,
                store: MemoryStore::new(),
                budget: MemoryBudget::new(BUDGET, MemoryPolicy::Fail),
                settings: EncoderSettings::default(),
            }
        }

        async fn produce(
            &self,
            meta: SourceMetadata,
            source_len: usize,
            options: &CompressionOptions,
            prior: (u32, u32),
        ) -> Result<VariantResult, PipelineError> {
            let source = mock_source(meta, source_len);
            VariantEncoder::new(&self.codec, &self.store, &self.budget, &self.settings)
                .produce(&AssetId::new("asset"), &source, &meta, options, prior)
                .await
        }
    }

    fn jpeg(w: u32, h: u32) -> SourceMetadata {
        SourceMetadata::new(w, h, ImageMime::Jpeg)
    }

    #[tokio::test]
    async fn medium_of_large_jpeg_is_scaled_and_keeps_mime() {
        let h = Harness::new(MockCodec::new());
        let result = h
            .produce(jpeg(3000, 2000), 900_000, &CompressionOptions::medium(), (0, 0))
            .await
            .unwrap();

        assert_eq!((result.width, result.height), (1774, 1183));
        assert!((result.width as f64 * result.height as f64) <= 1.3 * 1448.0 * 1448.0);
        assert_eq!(result.mime, ImageMime::Jpeg);
        assert_eq!((result.original_width, result.original_height), (1774, 1183));
        // 1774*1183/8 ≈ 262 KB < 310 KiB → no recode
        assert_eq!(
            h.codec.get_operations(),
            vec![
                RecordedOp::Decode {
                    subsample: 1,
                    orientation: Orientation::Normal
                },
                RecordedOp::Scale {
                    width: 1774,
                    height: 1183
                },
                RecordedOp::Encode {
                    format: OutputFormat::Jpeg,
                    width: 1774,
                    height: 1183,
                    quality: 75
                },
            ]
        );
        let handle = result.storage.expect("large variant is stored");
        assert_eq!(h.store.get(&handle.key).unwrap().len() as u64, result.byte_length);
    }

    #[tokio::test]
    async fn small_profile_crops_and_is_always_lossy() {
        let h = Harness::new(MockCodec::new());
        let png = SourceMetadata::new(3000, 2000, ImageMime::Png);
        let result = h
            .produce(png, 900_000, &CompressionOptions::small_profile(), (0, 0))
            .await
            .unwrap();

        assert_eq!((result.width, result.height), (280, 280));
        assert_eq!(result.mime, ImageMime::Jpeg);
        let ops = h.codec.get_operations();
        assert_eq!(
            ops[0],
            RecordedOp::Decode {
                subsample: 4,
                orientation: Orientation::Normal
            }
        );
        assert_eq!(ops[1], RecordedOp::CropSquare { edge: 280 });
    }

    #[tokio::test]
    async fn under_budget_source_passes_through_byte_identical() {
        let h = Harness::new(MockCodec::new());
        let meta = jpeg(800, 600);
        let result = h
            .produce(meta, 50_000, &CompressionOptions::medium(), (0, 0))
            .await
            .unwrap();

        assert_eq!(result.mime, ImageMime::Jpeg);
        assert_eq!((result.width, result.height), (800, 600));
        let stored = h.store.get(&result.storage.unwrap().key).unwrap();
        assert_eq!(stored, mock_source(meta, 50_000));
        assert!(h.codec.get_operations().is_empty());
    }

    #[tokio::test]
    async fn oversized_png_is_recoded_to_jpeg() {
        let h = Harness::new(MockCodec::new());
        let png = SourceMetadata::new(3000, 2000, ImageMime::Png);
        let result = h
            .produce(png, 900_000, &CompressionOptions::medium(), (0, 0))
            .await
            .unwrap();

        // first PNG encode is 1774*1183 bytes > 310 KiB, so it is recoded
        assert_eq!(result.mime, ImageMime::Jpeg);
        assert_eq!((result.width, result.height), (1774, 1183));
        let ops = h.codec.get_operations();
        assert!(matches!(
            ops[2],
            RecordedOp::Encode {
                format: OutputFormat::Png,
                ..
            }
        ));
        assert_eq!(
            ops[3],
            RecordedOp::Decode {
                subsample: 1,
                orientation: Orientation::Normal
            }
        );
        assert!(matches!(
            ops[4],
            RecordedOp::Encode {
                format: OutputFormat::Jpeg,
                width: 1774,
                height: 1183,
                ..
            }
        ));
        // the PNG entry was replaced, only the JPEG remains
        assert_eq!(h.store.len(), 1);
        assert_eq!(h.store.removed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rotated_pass_through_is_recoded_with_orientation() {
        let h = Harness::new(MockCodec::new());
        let meta = jpeg(600, 400).with_orientation(Orientation::Rotate90);
        let result = h
            .produce(meta, 20_000, &CompressionOptions::medium(), (0, 0))
            .await
            .unwrap();

        assert_eq!((result.width, result.height), (400, 600));
        assert_eq!(
            h.codec.get_operations()[0],
            RecordedOp::Decode {
                subsample: 1,
                orientation: Orientation::Rotate90
            }
        );
        let stored = h.store.get(&result.storage.unwrap().key).unwrap();
        assert_eq!(parse_mock(&stored).unwrap().orientation, Orientation::Normal);
    }

    #[tokio::test]
    async fn inline_boundary() {
        for (len, inlined) in [(2047usize, true), (2048, false)] {
            let h = Harness::new(MockCodec::with_encoded_len(move |_, _, _| len));
            let result = h
                .produce(jpeg(3000, 2000), 900_000, &CompressionOptions::preview(), (0, 0))
                .await
                .unwrap();
            assert_eq!(result.byte_length, len as u64);
            assert_eq!(result.is_inline(), inlined, "len {len}");
            assert_eq!(result.storage.is_some(), !inlined);
            assert_eq!(h.store.len(), usize::from(!inlined));
        }
    }

    #[tokio::test]
    async fn inline_payload_is_base64_of_encoded_bytes() {
        let h = Harness::new(MockCodec::with_encoded_len(|_, _, _| 100));
        let result = h
            .produce(jpeg(3000, 2000), 900_000, &CompressionOptions::preview(), (0, 0))
            .await
            .unwrap();
        let decoded = BASE64.decode(result.inline_data.unwrap()).unwrap();
        assert_eq!(decoded.len(), 100);
        assert_eq!(parse_mock(&decoded).unwrap().width, result.width);
    }

    #[tokio::test]
    async fn effective_original_takes_max_with_prior() {
        let h = Harness::new(MockCodec::new());
        let result = h
            .produce(jpeg(3000, 2000), 900_000, &CompressionOptions::preview(), (1774, 1183))
            .await
            .unwrap();
        assert_eq!((result.width, result.height), (79, 53));
        assert_eq!((result.original_width, result.original_height), (1774, 1183));
    }

    #[tokio::test]
    async fn decode_failure_aborts_and_releases_budget() {
        let h = Harness::new(MockCodec::new());
        h.codec.fail_decode.store(true, Ordering::SeqCst);
        let err = h
            .produce(jpeg(3000, 2000), 900_000, &CompressionOptions::medium(), (0, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Decode { ref tag, .. } if tag == "medium"));
        assert_eq!(h.budget.total_reserved(), 0);
        assert_eq!(h.store.len(), 0);
    }

    #[tokio::test]
    async fn encode_failure_during_recode_cleans_up_first_write() {
        let h = Harness::new(MockCodec::new());
        // pass-through of a BMP always recodes; fail the recode encode
        h.codec.fail_encode.store(true, Ordering::SeqCst);
        let bmp = SourceMetadata::new(100, 100, ImageMime::Bmp);
        let err = h
            .produce(bmp, 40_000, &CompressionOptions::medium(), (0, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Encode { .. }));
        assert_eq!(h.store.len(), 0, "pass-through copy must be removed");
        assert_eq!(h.budget.total_reserved(), 0);
    }

    #[tokio::test]
    async fn storage_rejection_is_fatal() {
        let h = Harness::new(MockCodec::new());
        h.store.reject_puts.store(true, Ordering::SeqCst);
        let err = h
            .produce(jpeg(10, 10), 3000, &CompressionOptions::medium(), (0, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Storage { .. }));
    }

    #[tokio::test]
    async fn memory_pressure_surfaces_under_fail_policy() {
        let mut h = Harness::new(MockCodec::new());
        h.budget = MemoryBudget::new(1024, MemoryPolicy::Fail);
        let _other = h
            .budget
            .try_acquire(ReservationKey::new(AssetId::new("other"), "medium"), 1)
            .unwrap();
        let err = h
            .produce(jpeg(3000, 2000), 900_000, &CompressionOptions::medium(), (0, 0))
            .await
            .unwrap_err();
        assert!(err.is_memory_pressure());
        assert!(h.codec.get_operations().is_empty(), "no decode before reservation");
    }

    #[tokio::test]
    async fn full_decode_is_budgeted_when_codec_cannot_subsample() {
        let mut h = Harness::new(MockCodec::new());
        h.budget = MemoryBudget::new(1_000_000, MemoryPolicy::Fail);
        let _other = h
            .budget
            .try_acquire(ReservationKey::new(AssetId::new("other"), "medium"), 1000)
            .unwrap();

        // a 1/32 decode of the 3000x2000 source fits easily
        h.produce(jpeg(3000, 2000), 900_000, &CompressionOptions::preview(), (0, 0))
            .await
            .unwrap();

        h.codec.native_subsample.store(false, Ordering::SeqCst);
        let err = h
            .produce(jpeg(3000, 2000), 900_000, &CompressionOptions::preview(), (0, 0))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::MemoryPressure { requested, .. } if requested > 3000 * 2000 * 4
        ));
        assert_eq!(h.budget.total_reserved(), 1000);
    }

    #[tokio::test]
    async fn quality_is_forwarded_to_encoder() {
        let h = Harness::new(MockCodec::new());
        let options = CompressionOptions {
            quality: Quality::new(42),
            ..CompressionOptions::medium()
        };
        h.produce(jpeg(3000, 2000), 900_000, &options, (0, 0))
            .await
            .unwrap();
        assert!(
            h.codec
                .get_operations()
                .iter()
                .any(|op| matches!(op, RecordedOp::Encode { quality: 42, .. }))
        );
    }
}
