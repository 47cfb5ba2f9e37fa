//! Error types for the record store.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in record store operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] leafsync_storage::StorageError),

    /// A stored record could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// A record or collection name failed validation.
    #[error("invalid record {id:?}: {reason}")]
    InvalidRecord {
        /// The offending id or collection name.
        id: String,
        /// Why it was rejected.
        reason: String,
    },
}

impl CoreError {
    /// Returns true if retrying the operation later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(err) => err.is_retryable(),
            Self::Codec(_) | Self::InvalidRecord { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leafsync_storage::StorageError;

    #[test]
    fn storage_errors_keep_their_retryability() {
        let locked: CoreError = StorageError::AccessDenied("vault locked".into()).into();
        assert!(locked.is_retryable());

        let corrupted: CoreError = StorageError::Corrupted("bad tag".into()).into();
        assert!(!corrupted.is_retryable());
    }

    #[test]
    fn invalid_record_display() {
        let err = CoreError::InvalidRecord {
            id: String::new(),
            reason: "id must not be empty".into(),
        };
        assert_eq!(err.to_string(), "invalid record \"\": id must not be empty");
    }
}
