//! Asset pipeline: one source image in, one [`AssetVariantSet`] out.
//!
//! The pipeline resolves [`SourceMetadata`] once through
//! [`Codec::identify`], then runs the profile's options list **right to
//! left**, one variant at a time. Each variant sees the running
//! "effective original" size of the variants produced before it, so the
//! stock lists (which put the large `medium` variant last) report the real
//! display size on their small variants too.
//!
//! ```text
//! [preview, medium]  ──fold right──▶  medium(prior 0×0) ─▶ preview(prior 1774×1183)
//!                                     └────────── sort by tag ──────────┘
//! ```
//!
//! Variants within a profile are sequential; separate profiles may run
//! concurrently against the same [`MemoryBudget`], each under its own run id.
//! A failing variant fails the whole profile: the stored entries of variants
//! already produced are removed before the error is returned. Dropping the
//! future cancels the profile, and any held reservation is released with it.

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

use crate::codec::Codec;
use crate::encoder::{EncodeStage, EncoderSettings, VariantEncoder};
use crate::error::PipelineError;
use crate::memory::MemoryBudget;
use crate::options::{ProfileKind, ProfileSet};
use crate::store::ContentStore;
use crate::types::{AssetId, AssetVariantSet, SourceMetadata, VariantResult};

/// Progress notifications for callers that want to display them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    ProfileStarted {
        asset_id: AssetId,
        profile: ProfileKind,
        metadata: SourceMetadata,
        variants: usize,
    },
    VariantStarted {
        asset_id: AssetId,
        tag: String,
    },
    StageChanged {
        asset_id: AssetId,
        tag: String,
        stage: EncodeStage,
    },
    VariantFinished {
        asset_id: AssetId,
        result: VariantResult,
    },
}

pub type EventSender = UnboundedSender<PipelineEvent>;

pub struct AssetPipeline<C, S> {
    codec: C,
    store: S,
    budget: Arc<MemoryBudget>,
    settings: EncoderSettings,
    profiles: ProfileSet,
}

impl<C: Codec, S: ContentStore> AssetPipeline<C, S> {
    pub fn new(codec: C, store: S, budget: Arc<MemoryBudget>) -> Self {
        Self {
            codec,
            store,
            budget,
            settings: EncoderSettings::default(),
            profiles: ProfileSet::default(),
        }
    }

    pub fn with_settings(mut self, settings: EncoderSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_profiles(mut self, profiles: ProfileSet) -> Self {
        self.profiles = profiles;
        self
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn budget(&self) -> &MemoryBudget {
        &self.budget
    }

    pub fn settings(&self) -> &EncoderSettings {
        &self.settings
    }

    pub fn profiles(&self) -> &ProfileSet {
        &self.profiles
    }

    pub async fn generate_profile(
        &self,
        asset_id: AssetId,
        source: Bytes,
        namespace_id: impl Into<String>,
        profile: ProfileKind,
    ) -> Result<AssetVariantSet, PipelineError> {
        self.generate_profile_with_events(asset_id, source, namespace_id, profile, None)
            .await
    }

    /// [`generate_profile`](Self::generate_profile), reporting progress to
    /// `events`. A closed receiver does not affect the run.
    pub async fn generate_profile_with_events(
        &self,
        asset_id: AssetId,
        source: Bytes,
        namespace_id: impl Into<String>,
        profile: ProfileKind,
        events: Option<&EventSender>,
    ) -> Result<AssetVariantSet, PipelineError> {
        let metadata = self
            .codec
            .identify(&source)
            .await
            .map_err(PipelineError::UnreadableImage)?;

        let options = self.profiles.options_for(profile);
        log::debug!(
            "{asset_id}: {}x{} {} ({}), {} profile with {} variants",
            metadata.width,
            metadata.height,
            metadata.mime,
            metadata.orientation.to_exif(),
            profile.as_str(),
            options.len()
        );
        emit(
            events,
            PipelineEvent::ProfileStarted {
                asset_id: asset_id.clone(),
                profile,
                metadata,
                variants: options.len(),
            },
        );

        let encoder = VariantEncoder::new(&self.codec, &self.store, &self.budget, &self.settings)
            .with_events(events)
            .with_run(self.budget.begin_run());

        let mut variants = Vec::with_capacity(options.len());
        let mut running_original = (0, 0);
        for opts in options.iter().rev() {
            emit(
                events,
                PipelineEvent::VariantStarted {
                    asset_id: asset_id.clone(),
                    tag: opts.tag.clone(),
                },
            );
            let result = match encoder
                .produce(&asset_id, &source, &metadata, opts, running_original)
                .await
            {
                Ok(result) => result,
                Err(err) => {
                    self.discard(&asset_id, &variants).await;
                    return Err(err);
                }
            };
            running_original = (result.original_width, result.original_height);
            emit(
                events,
                PipelineEvent::VariantFinished {
                    asset_id: asset_id.clone(),
                    result: result.clone(),
                },
            );
            variants.push(result);
        }
        variants.sort_by(|a, b| a.tag.cmp(&b.tag));

        Ok(AssetVariantSet {
            asset_id,
            namespace_id: namespace_id.into(),
            variants,
        })
    }

    /// Best-effort removal of the stored entries of `variants`.
    async fn discard(&self, asset_id: &AssetId, variants: &[VariantResult]) {
        for handle in variants.iter().filter_map(|v| v.storage.as_ref()) {
            if let Err(e) = self.store.remove(&handle.key).await {
                log::warn!("{asset_id}: could not remove {} of failed profile: {e}", handle.key);
            }
        }
    }
}

fn emit(events: Option<&EventSender>, event: PipelineEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}
