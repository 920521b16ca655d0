//! Content store collaborator.
//!
//! The pipeline treats storage as an opaque content-addressable byte store:
//! it writes encoded variants under keys it generates, and removes entries it
//! no longer needs (replaced by a recode, or inlined into the result). The
//! store never decides keys on its own.
//!
//! [`FsStore`] is the directory-backed implementation used by the CLI:
//!
//! ```text
//! <root>/
//! ├── cache/<key>          # StoreLocation::Cache
//! └── persistent/<key>     # StoreLocation::Persistent
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid store key: {0}")]
    InvalidKey(String),
    #[error("Store rejected write for {0}")]
    Rejected(String),
}

/// Where a write should land. Advisory: stores may collapse the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreLocation {
    /// Evictable cache area.
    #[default]
    Cache,
    /// Area the caller intends to keep (e.g. until upload).
    Persistent,
}

impl StoreLocation {
    fn dir_name(self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Persistent => "persistent",
        }
    }
}

/// Reference to bytes written into a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageHandle {
    pub key: String,
    pub length: u64,
    pub location: StoreLocation,
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Write `bytes` under `key`, replacing any previous entry.
    async fn put(
        &self,
        key: &str,
        bytes: Bytes,
        location: StoreLocation,
    ) -> Result<StorageHandle, StoreError>;

    /// Remove `key`. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Directory-backed store.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path for `key` in `location`. Rejects keys that would escape
    /// the root.
    pub fn path_for(&self, key: &str, location: StoreLocation) -> Result<PathBuf, StoreError> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(location.dir_name()).join(relative))
    }

    /// Whether the bytes behind `handle` are still on disk.
    pub fn contains(&self, handle: &StorageHandle) -> bool {
        self.path_for(&handle.key, handle.location)
            .map(|p| p.is_file())
            .unwrap_or(false)
    }
}

#[async_trait]
impl ContentStore for FsStore {
    async fn put(
        &self,
        key: &str,
        bytes: Bytes,
        location: StoreLocation,
    ) -> Result<StorageHandle, StoreError> {
        let path = self.path_for(key, location)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &bytes).await?;
        Ok(StorageHandle {
            key: key.to_string(),
            length: bytes.len() as u64,
            location,
        })
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        for location in [StoreLocation::Cache, StoreLocation::Persistent] {
            let path = self.path_for(key, location)?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
