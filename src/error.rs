//! Error taxonomy of the derivation pipeline.
//!
//! Every failure is fatal for the variant it happens in, and since later
//! variants depend on the dimension estimate of earlier ones, fatal for the
//! whole profile. [`PipelineError::MemoryPressure`] is the only error a caller
//! may reasonably treat as "back off and retry".

use thiserror::Error;

use crate::codec::CodecError;
use crate::memory::ReservationKey;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Image could not be added to cache: {0}")]
    UnreadableImage(#[source] CodecError),
    #[error("Decoding variant '{tag}' failed: {source}")]
    Decode {
        tag: String,
        #[source]
        source: CodecError,
    },
    #[error("Encoding variant '{tag}' failed: {source}")]
    Encode {
        tag: String,
        #[source]
        source: CodecError,
    },
    #[error("Storing variant '{tag}' failed: {source}")]
    Storage {
        tag: String,
        #[source]
        source: StoreError,
    },
    #[error("Memory budget exhausted for {key}: requested {requested} bytes, {available} available")]
    MemoryPressure {
        key: ReservationKey,
        requested: u64,
        available: u64,
    },
}

impl PipelineError {
    pub fn is_memory_pressure(&self) -> bool {
        matches!(self, Self::MemoryPressure { .. })
    }

    /// Tag of the variant the error happened in, if any.
    pub fn variant_tag(&self) -> Option<&str> {
        match self {
            Self::Decode { tag, .. } | Self::Encode { tag, .. } | Self::Storage { tag, .. } => {
                Some(tag)
            }
            Self::MemoryPressure { key, .. } => Some(&key.tag),
            Self::UnreadableImage(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AssetId;

    #[test]
    fn unreadable_image_message() {
        let err = PipelineError::UnreadableImage(CodecError::Unsupported("garbage".into()));
        assert!(err.to_string().starts_with("Image could not be added to cache"));
        assert_eq!(err.variant_tag(), None);
    }

    #[test]
    fn memory_pressure_is_flagged() {
        let err = PipelineError::MemoryPressure {
            key: ReservationKey::new(AssetId::new("a"), "medium"),
            requested: 10,
            available: 2,
        };
        assert!(err.is_memory_pressure());
        assert_eq!(err.variant_tag(), Some("medium"));
        assert!(err.to_string().contains("a/medium"));
    }
}
