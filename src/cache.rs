//! Variant cache for repeated derive runs.
//!
//! Deriving a profile means at least one full-resolution decode and one or
//! two encodes per asset. This module lets the batch driver skip all of it
//! when the source bytes and the profile haven't changed since the last run.
//!
//! ## Cache keys
//!
//! The cache is **content-addressed**: lookups are by the combination of
//! `source_hash` and `options_hash`, not by input path or asset id, so
//! renaming an input file does not invalidate it.
//!
//! - **`source_hash`**: SHA-256 of the source bytes.
//! - **`options_hash`**: SHA-256 of the profile's options list together with
//!   the output settings that shape a result (inline threshold, animated
//!   ceiling, store location). Changing any of them re-derives the asset.
//!
//! A whole profile is cached, never a single variant: the dimensions a
//! variant reports depend on the variants processed before it.
//!
//! A cache hit requires:
//! 1. An entry with matching `source_hash` and `options_hash` exists
//! 2. Every stored (non-inline) variant is still present in the store
//!
//! ## Storage
//!
//! The manifest is a JSON file at `<store_root>/.variant-cache.json`. Pass
//! `--no-cache` to `derive` to start from an empty manifest.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use crate::encoder::EncoderSettings;
use crate::options::CompressionOptions;
use crate::store::StorageHandle;
use crate::types::VariantResult;

/// Name of the cache manifest file within the store root.
const MANIFEST_FILENAME: &str = ".variant-cache.json";

/// Version of the cache manifest format. Bump this to invalidate all
/// existing caches when the format or key computation changes.
const MANIFEST_VERSION: u32 = 1;

/// Variants previously derived for one (source, profile) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachedProfile {
    pub source_hash: String,
    pub options_hash: String,
    pub variants: Vec<VariantResult>,
}

/// On-disk manifest keyed by `"{source_hash}:{options_hash}"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantCache {
    pub version: u32,
    pub entries: HashMap<String, CachedProfile>,
}

fn content_key(source_hash: &str, options_hash: &str) -> String {
    format!("{}:{}", source_hash, options_hash)
}

impl VariantCache {
    /// Create an empty manifest (used for `--no-cache` or the first run).
    pub fn empty() -> Self {
        Self {
            version: MANIFEST_VERSION,
            entries: HashMap::new(),
        }
    }

    /// Load from the store root. Returns an empty manifest if the file
    /// doesn't exist or can't be parsed (version mismatch, corruption).
    pub fn load(store_root: &Path) -> Self {
        let content = match std::fs::read_to_string(manifest_path(store_root)) {
            Ok(c) => c,
            Err(_) => return Self::empty(),
        };
        let manifest: Self = match serde_json::from_str(&content) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("ignoring unreadable variant cache: {e}");
                return Self::empty();
            }
        };
        if manifest.version != MANIFEST_VERSION {
            return Self::empty();
        }
        manifest
    }

    /// Save to the store root.
    pub fn save(&self, store_root: &Path) -> io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(manifest_path(store_root), json)
    }

    /// Look up a cached profile by content hashes.
    ///
    /// `is_present` decides whether a stored variant still exists; inline
    /// variants never need a store lookup.
    pub fn find_cached(
        &self,
        source_hash: &str,
        options_hash: &str,
        is_present: impl Fn(&StorageHandle) -> bool,
    ) -> Option<&[VariantResult]> {
        let entry = self.entries.get(&content_key(source_hash, options_hash))?;
        let all_present = entry
            .variants
            .iter()
            .all(|v| v.storage.as_ref().is_none_or(&is_present));
        all_present.then_some(entry.variants.as_slice())
    }

    /// Record the variants derived for a (source, profile) pair, replacing
    /// any previous entry.
    pub fn insert(&mut self, source_hash: String, options_hash: String, variants: Vec<VariantResult>) {
        self.entries.insert(
            content_key(&source_hash, &options_hash),
            CachedProfile {
                source_hash,
                options_hash,
                variants,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// SHA-256 of `bytes`, returned as a hex string.
pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// SHA-256 of a profile's options list and the output settings.
pub fn hash_options(options: &[CompressionOptions], settings: &EncoderSettings) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"profile\0");
    hasher.update(settings.inline_threshold.to_le_bytes());
    hasher.update(settings.max_animated_bytes.to_le_bytes());
    hasher.update(format!("{:?}\0", settings.location).as_bytes());
    for opts in options {
        hasher.update(opts.tag.as_bytes());
        hasher.update(b"\0");
        hasher.update(opts.byte_count.to_le_bytes());
        hasher.update(opts.dimension.to_le_bytes());
        hasher.update(opts.quality.value().to_le_bytes());
        hasher.update([u8::from(opts.force_lossy), u8::from(opts.crop_to_square)]);
        for mime in &opts.recode_mimes {
            hasher.update(mime.as_str().as_bytes());
            hasher.update(b"\0");
        }
        hasher.update(b"\x01");
    }
    format!("{:x}", hasher.finalize())
}

/// Summary of cache performance for a derive run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u32,
    pub misses: u32,
    pub failures: u32,
}

impl CacheStats {
    pub fn hit(&mut self) {
        self.hits += 1;
    }

    pub fn miss(&mut self) {
        self.misses += 1;
    }

    pub fn failure(&mut self) {
        self.failures += 1;
    }

    pub fn total(&self) -> u32 {
        self.hits + self.misses + self.failures
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.hits > 0 {
            write!(f, "{} cached, {} derived", self.hits, self.misses)?;
        } else {
            write!(f, "{} derived", self.misses)?;
        }
        if self.failures > 0 {
            write!(f, ", {} failed", self.failures)?;
        }
        if self.hits > 0 || self.failures > 0 {
            write!(f, " ({} total)", self.total())?;
        }
        Ok(())
    }
}

/// Resolve the cache manifest path for a store root.
pub fn manifest_path(store_root: &Path) -> PathBuf {
    store_root.join(MANIFEST_FILENAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ProfileKind;
    use crate::store::StoreLocation;
    use crate::types::ImageMime;
    use std::fs;
    use tempfile::TempDir;

    fn stored(tag: &str, key: &str) -> VariantResult {
        VariantResult {
            tag: tag.into(),
            mime: ImageMime::Jpeg,
            width: 10,
            height: 10,
            original_width: 10,
            original_height: 10,
            byte_length: 4096,
            storage: Some(StorageHandle {
                key: key.into(),
                length: 4096,
                location: StoreLocation::Cache,
            }),
            inline_data: None,
        }
    }

    fn inline(tag: &str) -> VariantResult {
        VariantResult {
            storage: None,
            inline_data: Some("AAAA".into()),
            byte_length: 3,
            ..stored(tag, "")
        }
    }

    // =========================================================================
    // VariantCache basics
    // =========================================================================

    #[test]
    fn empty_manifest_has_no_entries() {
        let m = VariantCache::empty();
        assert_eq!(m.version, MANIFEST_VERSION);
        assert!(m.is_empty());
    }

    #[test]
    fn find_cached_hit_when_files_present() {
        let mut m = VariantCache::empty();
        m.insert(
            "src".into(),
            "opt".into(),
            vec![stored("medium", "a/medium/x.jpg"), inline("preview")],
        );

        let hit = m.find_cached("src", "opt", |_| true).unwrap();
        assert_eq!(hit.len(), 2);
        assert_eq!(hit[0].tag, "medium");
    }

    #[test]
    fn find_cached_miss_wrong_hashes() {
        let mut m = VariantCache::empty();
        m.insert("src".into(), "opt".into(), vec![inline("preview")]);
        assert!(m.find_cached("other", "opt", |_| true).is_none());
        assert!(m.find_cached("src", "other", |_| true).is_none());
    }

    #[test]
    fn find_cached_miss_when_stored_variant_gone() {
        let mut m = VariantCache::empty();
        m.insert(
            "src".into(),
            "opt".into(),
            vec![stored("medium", "gone"), inline("preview")],
        );
        assert!(m.find_cached("src", "opt", |h| h.key != "gone").is_none());
    }

    #[test]
    fn inline_only_profile_needs_no_store() {
        let mut m = VariantCache::empty();
        m.insert("src".into(), "opt".into(), vec![inline("preview")]);
        assert!(m.find_cached("src", "opt", |_| false).is_some());
    }

    #[test]
    fn insert_replaces_previous_entry() {
        let mut m = VariantCache::empty();
        m.insert("s".into(), "o".into(), vec![inline("preview")]);
        m.insert("s".into(), "o".into(), vec![inline("thumb")]);
        assert_eq!(m.len(), 1);
        assert_eq!(m.find_cached("s", "o", |_| true).unwrap()[0].tag, "thumb");
    }

    // =========================================================================
    // Save / Load
    // =========================================================================

    #[test]
    fn save_and_load_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let mut m = VariantCache::empty();
        m.insert("s1".into(), "o1".into(), vec![stored("medium", "k")]);
        m.save(tmp.path()).unwrap();

        let loaded = VariantCache::load(tmp.path());
        assert_eq!(loaded.version, MANIFEST_VERSION);
        assert_eq!(loaded.entries, m.entries);
    }

    #[test]
    fn load_missing_file_returns_empty() {
        let tmp = TempDir::new().unwrap();
        assert!(VariantCache::load(tmp.path()).is_empty());
    }

    #[test]
    fn load_corrupt_json_returns_empty() {
        let tmp = TempDir::new().unwrap();
        fs::write(manifest_path(tmp.path()), "not json").unwrap();
        assert!(VariantCache::load(tmp.path()).is_empty());
    }

    #[test]
    fn load_wrong_version_returns_empty() {
        let tmp = TempDir::new().unwrap();
        let json = format!(
            r#"{{"version": {}, "entries": {{}}}}"#,
            MANIFEST_VERSION + 1
        );
        fs::write(manifest_path(tmp.path()), json).unwrap();
        assert!(VariantCache::load(tmp.path()).is_empty());
    }

    // =========================================================================
    // Hash functions
    // =========================================================================

    #[test]
    fn hash_bytes_deterministic() {
        let h1 = hash_bytes(b"hello world");
        assert_eq!(h1, hash_bytes(b"hello world"));
        assert_eq!(h1.len(), 64);
        assert_ne!(h1, hash_bytes(b"hello world!"));
    }

    #[test]
    fn hash_options_deterministic() {
        let settings = EncoderSettings::default();
        let opts = ProfileKind::Normal.default_options();
        assert_eq!(hash_options(&opts, &settings), hash_options(&opts, &settings));
    }

    #[test]
    fn hash_options_varies_with_profile() {
        let settings = EncoderSettings::default();
        assert_ne!(
            hash_options(&ProfileKind::Normal.default_options(), &settings),
            hash_options(&ProfileKind::SelfProfile.default_options(), &settings)
        );
    }

    #[test]
    fn hash_options_varies_with_quality_and_settings() {
        let settings = EncoderSettings::default();
        let base = vec![CompressionOptions::medium()];
        let mut tweaked = base.clone();
        tweaked[0].quality = crate::options::Quality::new(74);
        assert_ne!(hash_options(&base, &settings), hash_options(&tweaked, &settings));

        let inline_off = EncoderSettings {
            inline_threshold: 0,
            ..EncoderSettings::default()
        };
        assert_ne!(hash_options(&base, &settings), hash_options(&base, &inline_off));
    }

    #[test]
    fn hash_options_varies_with_order() {
        let settings = EncoderSettings::default();
        let forward = ProfileKind::Normal.default_options();
        let mut reversed = forward.clone();
        reversed.reverse();
        assert_ne!(hash_options(&forward, &settings), hash_options(&reversed, &settings));
    }

    // =========================================================================
    // CacheStats
    // =========================================================================

    #[test]
    fn cache_stats_display_with_hits() {
        let s = CacheStats {
            hits: 5,
            misses: 2,
            failures: 0,
        };
        assert_eq!(format!("{}", s), "5 cached, 2 derived (7 total)");
    }

    #[test]
    fn cache_stats_display_with_failures() {
        let s = CacheStats {
            hits: 0,
            misses: 3,
            failures: 1,
        };
        assert_eq!(format!("{}", s), "3 derived, 1 failed (4 total)");
    }

    #[test]
    fn cache_stats_display_no_hits() {
        let mut s = CacheStats::default();
        s.miss();
        s.miss();
        s.miss();
        assert_eq!(format!("{}", s), "3 derived");
    }
}
