//! Error types for cache operations.

use leafsync_storage::StorageError;
use std::sync::Arc;
use thiserror::Error;

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Boxed error produced by a caller-supplied loader.
pub type LoaderError = Arc<dyn std::error::Error + Send + Sync>;

/// Errors that can occur during cache operations.
///
/// Errors are cheap to clone so that every caller coalesced onto one load
/// receives the same error.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The loader failed to produce a value.
    #[error("loader failed for {key:?}: {source}")]
    Load {
        /// The key being loaded.
        key: String,
        /// The loader's error.
        source: LoaderError,
    },

    /// The durable tier failed.
    #[error("cache storage error: {0}")]
    Storage(Arc<StorageError>),

    /// A durable entry could not be encoded or decoded.
    #[error("cache codec error: {0}")]
    Codec(String),
}

impl From<StorageError> for CacheError {
    fn from(err: StorageError) -> Self {
        Self::Storage(Arc::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_error_display_includes_key_and_cause() {
        let err = CacheError::Load {
            key: "cover/7".into(),
            source: Arc::new(std::io::Error::other("503 from CDN")),
        };
        let text = err.to_string();
        assert!(text.contains("cover/7"));
        assert!(text.contains("503 from CDN"));
    }

    #[test]
    fn clones_share_the_source() {
        let source: LoaderError = Arc::new(std::io::Error::other("boom"));
        let err = CacheError::Load {
            key: "k".into(),
            source: source.clone(),
        };
        let CacheError::Load { source: cloned, .. } = err.clone() else {
            panic!("expected load error");
        };
        assert!(Arc::ptr_eq(&source, &cloned));
    }
}
