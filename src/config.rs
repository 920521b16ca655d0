//! Pipeline configuration.
//!
//! Handles loading, validating, and merging `config.toml`. The user file is
//! sparse: it is merged over the stock defaults, so it only needs the keys it
//! wants to change.
//!
//! ## Configuration Options
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! [memory]
//! budget_bytes = 134217728   # Shared decode budget (128 MiB)
//! policy = "wait"            # "wait" queues decodes, "fail" errors out
//!
//! [output]
//! inline_threshold = 2048    # Variants smaller than this are inlined as base64
//! max_animated_bytes = 5242880
//! location = "cache"         # "cache" | "persistent"
//!
//! [processing]
//! max_concurrent_assets = 4  # Assets derived at once (omit for auto = CPU cores)
//! max_threads = 4            # Pixel worker threads (omit for auto = CPU cores)
//!
//! [[profiles.normal]]        # Replaces the whole stock list when present
//! tag = "preview"
//! byte_count = 1024
//! dimension = 64
//! quality = 30
//! force_lossy = true
//! ```
//!
//! Unknown keys are rejected to catch typos early.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::encoder::{EncoderSettings, INLINE_THRESHOLD};
use crate::memory::{MemoryBudget, MemoryPolicy};
use crate::options::ProfileSet;
use crate::sizing::MAX_ANIMATED_BYTES;
use crate::store::StoreLocation;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Configuration loaded from `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Decode memory budget.
    pub memory: MemoryConfig,
    /// Inline threshold, animated ceiling, store location.
    pub output: OutputConfig,
    /// Concurrency settings.
    pub processing: ProcessingConfig,
    /// Options lists per profile kind.
    pub profiles: ProfileSet,
}

impl PipelineConfig {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memory.budget_bytes == 0 {
            return Err(ConfigError::Validation(
                "memory.budget_bytes must be > 0".into(),
            ));
        }
        if self.output.max_animated_bytes == 0 {
            return Err(ConfigError::Validation(
                "output.max_animated_bytes must be > 0".into(),
            ));
        }
        if self.processing.max_concurrent_assets == Some(0) {
            return Err(ConfigError::Validation(
                "processing.max_concurrent_assets must be > 0".into(),
            ));
        }
        if self.processing.max_threads == Some(0) {
            return Err(ConfigError::Validation(
                "processing.max_threads must be > 0".into(),
            ));
        }
        self.profiles.validate().map_err(ConfigError::Validation)
    }

    pub fn encoder_settings(&self) -> EncoderSettings {
        EncoderSettings {
            inline_threshold: self.output.inline_threshold,
            max_animated_bytes: self.output.max_animated_bytes,
            location: self.output.location,
        }
    }

    pub fn memory_budget(&self) -> MemoryBudget {
        MemoryBudget::new(self.memory.budget_bytes, self.memory.policy)
    }
}

/// Decode memory budget settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemoryConfig {
    /// Bytes of decoded pixels allowed in flight across all assets.
    pub budget_bytes: u64,
    /// What to do when a decode does not fit.
    pub policy: MemoryPolicy,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 128 * 1024 * 1024,
            policy: MemoryPolicy::Wait,
        }
    }
}

/// Output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    /// Variants strictly smaller than this are inlined.
    pub inline_threshold: u64,
    /// Any variant above this is recoded, animated or not.
    pub max_animated_bytes: u64,
    pub location: StoreLocation,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            inline_threshold: INLINE_THRESHOLD,
            max_animated_bytes: MAX_ANIMATED_BYTES,
            location: StoreLocation::Cache,
        }
    }
}

/// Parallel processing settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessingConfig {
    /// Maximum number of assets derived concurrently.
    /// When absent, defaults to the number of CPU cores.
    pub max_concurrent_assets: Option<usize>,
    /// Size of the pixel worker pool.
    /// When absent, defaults to the number of CPU cores.
    /// Values larger than the core count are clamped down.
    pub max_threads: Option<usize>,
}

fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Resolve the effective worker thread count from config.
///
/// - `None` → use all available cores
/// - `Some(n)` → use `min(n, cores)` (user can constrain down, not up)
pub fn effective_threads(config: &ProcessingConfig) -> usize {
    let cores = available_cores();
    config.max_threads.map(|n| n.min(cores)).unwrap_or(cores)
}

/// Resolve how many assets may be in flight at once.
///
/// Not clamped to cores: most of an asset's life is spent waiting on the
/// memory budget or the worker pool.
pub fn effective_concurrency(config: &ProcessingConfig) -> usize {
    config
        .max_concurrent_assets
        .unwrap_or_else(available_cores)
        .max(1)
}

/// Returns the stock default config as a `toml::Value::Table`.
pub fn stock_defaults_value() -> Result<toml::Value, ConfigError> {
    Ok(toml::Value::try_from(PipelineConfig::default())?)
}

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay replace base values entirely, so a
///   `[[profiles.normal]]` list replaces the stock list as a whole.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Load a config file as a raw TOML value.
///
/// Returns `Ok(None)` if the file does not exist.
pub fn load_raw_config(path: &Path) -> Result<Option<toml::Value>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    let value: toml::Value = toml::from_str(&content)?;
    Ok(Some(value))
}

/// Merge an optional overlay onto the stock defaults, then deserialize and
/// validate.
pub fn resolve_config(overlay: Option<toml::Value>) -> Result<PipelineConfig, ConfigError> {
    let base = stock_defaults_value()?;
    let merged = match overlay {
        Some(ov) => merge_toml(base, ov),
        None => base,
    };
    let config: PipelineConfig = merged.try_into()?;
    config.validate()?;
    Ok(config)
}

/// Load config from `path`, falling back to the defaults when it is missing.
pub fn load_config(path: &Path) -> Result<PipelineConfig, ConfigError> {
    resolve_config(load_raw_config(path)?)
}

/// Returns a fully-commented stock `config.toml` with all keys and explanations.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# asset-variants configuration
# ============================
# All settings are optional. Remove or comment out any you don't need.
# Values shown below are the defaults.
# Unknown keys will cause an error.

# ---------------------------------------------------------------------------
# Decode memory budget
# ---------------------------------------------------------------------------
[memory]
# Bytes of decoded pixel buffers allowed in flight across all assets.
# A single decode larger than this still runs when nothing else is in flight.
budget_bytes = 134217728

# "wait": queue decodes until budget is released.
# "fail": fail the asset with a memory-pressure error.
policy = "wait"

# ---------------------------------------------------------------------------
# Output
# ---------------------------------------------------------------------------
[output]
# Variants strictly smaller than this many bytes are returned inline (base64)
# instead of being written to the store.
inline_threshold = 2048

# Any variant larger than this is recoded, even animated GIFs.
max_animated_bytes = 5242880

# Store area for written variants: "cache" or "persistent".
location = "cache"

# ---------------------------------------------------------------------------
# Processing
# ---------------------------------------------------------------------------
[processing]
# Assets derived at once. Omit to auto-detect (= number of CPU cores).
# max_concurrent_assets = 4

# Pixel worker threads. Omit to auto-detect (= number of CPU cores).
# max_threads = 4

# ---------------------------------------------------------------------------
# Profiles
# ---------------------------------------------------------------------------
# Each list replaces the stock list as a whole. Lists are processed last to
# first; put the largest variant last.
#
# [[profiles.normal]]
# tag = "preview"
# byte_count = 1024
# dimension = 64
# quality = 30
# force_lossy = true
#
# [[profiles.normal]]
# tag = "medium"
# byte_count = 317440
# dimension = 1448
# quality = 75
#
# [[profiles.self_profile]]
# tag = "smallProfile"
# byte_count = 15360
# dimension = 280
# quality = 75
# force_lossy = true
# crop_to_square = true
#
# [[profiles.self_profile]]
# tag = "medium"
# byte_count = 317440
# dimension = 1448
# quality = 75
"##
}
