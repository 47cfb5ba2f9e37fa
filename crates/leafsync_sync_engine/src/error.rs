//! Error types for the sync engine.

use leafsync_core::CoreError;
use leafsync_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
///
/// [`is_retryable`](Self::is_retryable) separates transient failures, which
/// are retried with backoff, from fatal ones, which wait for an explicit
/// trigger.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// A remote call didn't finish within the request timeout.
    #[error("remote call timed out")]
    Timeout,

    /// The remote refused our credentials.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The remote doesn't know the collection.
    #[error("remote collection not found: {0}")]
    CollectionNotFound(String),

    /// No store is registered for the collection.
    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    /// The local record store failed.
    #[error("store error: {0}")]
    Store(#[from] CoreError),

    /// The remote answered with something that breaks the contract.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration.
    #[error("invalid sync config: {0}")]
    Config(String),

    /// A pass awaited through [`SyncManager::sync_now`](crate::SyncManager::sync_now) failed.
    #[error("sync pass {pass} failed: {reason}")]
    PassFailed {
        /// Pass number.
        pass: u64,
        /// Display form of the underlying error.
        reason: String,
        /// Whether the underlying error was transient.
        retryable: bool,
    },

    /// The manager shut down.
    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } | SyncError::PassFailed { retryable, .. } => {
                *retryable
            }
            SyncError::Timeout => true,
            SyncError::Store(err) => err.is_retryable(),
            _ => false,
        }
    }

    /// Returns true if retrying won't help until something outside the
    /// engine changes (credentials, configuration, remote setup).
    pub fn is_fatal(&self) -> bool {
        !self.is_retryable() && !matches!(self, SyncError::Cancelled)
    }
}

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        Self::Store(CoreError::Storage(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection lost").is_retryable());
        assert!(!SyncError::transport_fatal("invalid certificate").is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
    }

    #[test]
    fn fatal_errors() {
        assert!(SyncError::AuthenticationFailed("expired token".into()).is_fatal());
        assert!(SyncError::CollectionNotFound("books".into()).is_fatal());
        assert!(!SyncError::Timeout.is_fatal());
        assert!(!SyncError::Cancelled.is_fatal());
    }

    #[test]
    fn locked_vault_is_transient() {
        let err: SyncError = StorageError::AccessDenied("device locked".into()).into();
        assert!(err.is_retryable());
    }

    #[test]
    fn error_display() {
        let err = SyncError::PassFailed {
            pass: 3,
            reason: "remote call timed out".into(),
            retryable: true,
        };
        assert_eq!(err.to_string(), "sync pass 3 failed: remote call timed out");
    }
}
