//! Batch driver: derive variant sets for files on disk.
//!
//! Used by the `derive` CLI command. Each input file becomes one asset whose
//! id is the first 16 hex digits of the SHA-256 of its bytes, so ids are
//! stable across runs and always safe as store key components.
//!
//! ## Flow
//!
//! ```text
//! inputs ─▶ collect_inputs (walkdir) ─▶ buffer_unordered(N) ─┬─ cache hit ─▶ reuse
//!                                                           └─ miss ──────▶ AssetPipeline
//!                                     ◀── outcomes, back in input order ──┘
//! ```
//!
//! A failing asset does not stop the batch; it is recorded in the manifest's
//! `failures` list. Only errors outside any single asset (unreadable input
//! directory, manifest write) abort the run.
//!
//! ## Output Structure
//!
//! ```text
//! <store>/
//! ├── manifest.json           # DeriveManifest
//! ├── .variant-cache.json     # VariantCache
//! └── cache/<asset>/<tag>/<uuid>.<ext>
//! ```

use bytes::Bytes;
use futures::StreamExt;
use futures::stream;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use walkdir::WalkDir;

use crate::cache::{CacheStats, VariantCache, hash_bytes, hash_options};
use crate::codec::Codec;
use crate::config::ConfigError;
use crate::options::ProfileKind;
use crate::pipeline::{AssetPipeline, EventSender, PipelineEvent};
use crate::store::{ContentStore, StorageHandle};
use crate::types::{AssetId, AssetVariantSet};

/// Name of the manifest written into the store root.
pub const MANIFEST_FILENAME: &str = "manifest.json";

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp", "tif", "tiff"];

#[derive(Error, Debug)]
pub enum DeriveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("Input not found: {0}")]
    MissingInput(PathBuf),
    #[error("No images found in the given inputs")]
    NoInputs,
}

/// Per-run settings for [`derive`].
#[derive(Debug, Clone)]
pub struct DeriveOptions {
    pub profile: ProfileKind,
    pub namespace_id: String,
    /// Maximum number of assets in flight.
    pub concurrency: usize,
}

/// Whether an asset's variants were produced in this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetStatus {
    Cached,
    Derived,
}

/// Progress events emitted during [`derive`].
#[derive(Debug, Clone)]
pub enum DeriveEvent {
    /// Forwarded from the asset pipeline.
    Pipeline(PipelineEvent),
    AssetFinished {
        index: usize,
        total: usize,
        source: String,
        status: AssetStatus,
        set: AssetVariantSet,
    },
    AssetFailed {
        index: usize,
        total: usize,
        source: String,
        error: String,
    },
}

/// One successfully derived asset in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedAsset {
    pub source: String,
    pub source_hash: String,
    pub status: AssetStatus,
    #[serde(flatten)]
    pub set: AssetVariantSet,
}

/// One asset that could not be derived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedAsset {
    pub source: String,
    pub error: String,
}

/// Written to `<store>/manifest.json` after a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeriveManifest {
    pub profile: ProfileKind,
    pub namespace_id: String,
    pub assets: Vec<DerivedAsset>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<FailedAsset>,
}

#[derive(Debug)]
pub struct DeriveResult {
    pub manifest: DeriveManifest,
    pub cache_stats: CacheStats,
}

/// Expand `inputs` into a de-duplicated list of image files.
///
/// Files named explicitly are kept whatever their extension; directories are
/// walked recursively (sorted by name) and only image extensions are kept.
pub fn collect_inputs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>, DeriveError> {
    let mut files: Vec<PathBuf> = Vec::new();
    let mut push = |path: PathBuf| {
        if !files.contains(&path) {
            files.push(path);
        }
    };

    for input in inputs {
        if input.is_file() {
            push(input.clone());
        } else if input.is_dir() {
            for entry in WalkDir::new(input).sort_by_file_name() {
                let entry = entry?;
                if entry.file_type().is_file() && is_image_path(entry.path()) {
                    push(entry.into_path());
                }
            }
        } else {
            return Err(DeriveError::MissingInput(input.clone()));
        }
    }

    if files.is_empty() {
        return Err(DeriveError::NoInputs);
    }
    Ok(files)
}

fn is_image_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Stable asset id derived from the source hash.
pub fn asset_id_for(source_hash: &str) -> AssetId {
    AssetId::new(&source_hash[..source_hash.len().min(16)])
}

struct AssetOutcome {
    index: usize,
    source: String,
    result: Result<(String, AssetStatus, AssetVariantSet), String>,
}

/// Derive the profile for every file in `files`.
///
/// `cache` is consulted before each asset (pass [`VariantCache::empty`] to
/// bypass it) and updated with every newly derived profile. `is_present`
/// tells whether a cached stored variant still exists.
pub async fn derive<C: Codec, S: ContentStore>(
    pipeline: &AssetPipeline<C, S>,
    files: &[PathBuf],
    options: &DeriveOptions,
    cache: &mut VariantCache,
    is_present: impl Fn(&StorageHandle) -> bool,
    events: Option<&UnboundedSender<DeriveEvent>>,
) -> Result<DeriveResult, DeriveError> {
    let options_hash = hash_options(
        pipeline.profiles().options_for(options.profile),
        pipeline.settings(),
    );

    let (pipeline_tx, mut pipeline_rx) = tokio::sync::mpsc::unbounded_channel();
    let forward = async {
        while let Some(event) = pipeline_rx.recv().await {
            if let Some(tx) = events {
                let _ = tx.send(DeriveEvent::Pipeline(event));
            }
        }
    };

    let lookup: &VariantCache = cache;
    let options_hash_ref = options_hash.as_str();
    let is_present = &is_present;
    let work = async move {
        let pipeline_tx = pipeline_tx;
        let total = files.len();
        stream::iter(files.iter().enumerate())
            .map(|(index, path)| {
                derive_one(
                    pipeline,
                    index,
                    total,
                    path,
                    options,
                    lookup,
                    options_hash_ref,
                    is_present,
                    &pipeline_tx,
                    events,
                )
            })
            .buffer_unordered(options.concurrency.max(1))
            .collect::<Vec<_>>()
            .await
    };

    let (mut outcomes, ()) = futures::join!(work, forward);
    outcomes.sort_by_key(|o| o.index);

    let mut stats = CacheStats::default();
    let mut manifest = DeriveManifest {
        profile: options.profile,
        namespace_id: options.namespace_id.clone(),
        assets: Vec::new(),
        failures: Vec::new(),
    };
    for outcome in outcomes {
        match outcome.result {
            Ok((source_hash, status, set)) => {
                match status {
                    AssetStatus::Cached => stats.hit(),
                    AssetStatus::Derived => {
                        stats.miss();
                        cache.insert(
                            source_hash.clone(),
                            options_hash.clone(),
                            set.variants.clone(),
                        );
                    }
                }
                manifest.assets.push(DerivedAsset {
                    source: outcome.source,
                    source_hash,
                    status,
                    set,
                });
            }
            Err(error) => {
                stats.failure();
                manifest.failures.push(FailedAsset {
                    source: outcome.source,
                    error,
                });
            }
        }
    }

    Ok(DeriveResult {
        manifest,
        cache_stats: stats,
    })
}

#[allow(clippy::too_many_arguments)]
async fn derive_one<C: Codec, S: ContentStore>(
    pipeline: &AssetPipeline<C, S>,
    index: usize,
    total: usize,
    path: &Path,
    options: &DeriveOptions,
    cache: &VariantCache,
    options_hash: &str,
    is_present: &impl Fn(&StorageHandle) -> bool,
    pipeline_events: &EventSender,
    events: Option<&UnboundedSender<DeriveEvent>>,
) -> AssetOutcome {
    let source = path.display().to_string();
    let result = derive_source(
        pipeline,
        path,
        options,
        cache,
        options_hash,
        is_present,
        pipeline_events,
    )
    .await;

    if let Some(tx) = events {
        let event = match &result {
            Ok((_, status, set)) => DeriveEvent::AssetFinished {
                index,
                total,
                source: source.clone(),
                status: *status,
                set: set.clone(),
            },
            Err(error) => DeriveEvent::AssetFailed {
                index,
                total,
                source: source.clone(),
                error: error.clone(),
            },
        };
        let _ = tx.send(event);
    }
    if let Err(error) = &result {
        log::warn!("{source}: {error}");
    }

    AssetOutcome {
        index,
        source,
        result,
    }
}

async fn derive_source<C: Codec, S: ContentStore>(
    pipeline: &AssetPipeline<C, S>,
    path: &Path,
    options: &DeriveOptions,
    cache: &VariantCache,
    options_hash: &str,
    is_present: &impl Fn(&StorageHandle) -> bool,
    pipeline_events: &EventSender,
) -> Result<(String, AssetStatus, AssetVariantSet), String> {
    let bytes = tokio::fs::read(path).await.map_err(|e| e.to_string())?;
    let source_hash = hash_bytes(&bytes);
    let asset_id = asset_id_for(&source_hash);

    if let Some(variants) = cache.find_cached(&source_hash, options_hash, is_present) {
        log::debug!("{}: cache hit for {asset_id}", path.display());
        let set = AssetVariantSet {
            asset_id,
            namespace_id: options.namespace_id.clone(),
            variants: variants.to_vec(),
        };
        return Ok((source_hash, AssetStatus::Cached, set));
    }

    let set = pipeline
        .generate_profile_with_events(
            asset_id,
            Bytes::from(bytes),
            options.namespace_id.clone(),
            options.profile,
            Some(pipeline_events),
        )
        .await
        .map_err(|e| e.to_string())?;
    Ok((source_hash, AssetStatus::Derived, set))
}

/// Write `manifest` to `<store_root>/manifest.json`.
pub fn write_manifest(store_root: &Path, manifest: &DeriveManifest) -> Result<PathBuf, DeriveError> {
    std::fs::create_dir_all(store_root)?;
    let path = store_root.join(MANIFEST_FILENAME);
    let json = serde_json::to_string_pretty(manifest)?;
    std::fs::write(&path, json)?;
    Ok(path)
}
