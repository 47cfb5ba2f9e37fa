//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
///
/// A missing key is not an error: lookups return `Ok(None)`.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The key is empty, too long, or contains forbidden characters.
    #[error("invalid key {key:?}: {reason}")]
    InvalidKey {
        /// The rejected key.
        key: String,
        /// Why the key was rejected.
        reason: &'static str,
    },

    /// The credential vault is locked (e.g. the device has not been unlocked yet).
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// The storage directory is held by another process.
    #[error("storage locked: another process has exclusive access")]
    Locked,

    /// A stored value could not be interpreted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// Encryption or decryption failed.
    #[error("encryption error: {0}")]
    Encryption(String),
}

impl StorageError {
    pub(crate) fn invalid_key(key: &str, reason: &'static str) -> Self {
        Self::InvalidKey {
            key: key.to_string(),
            reason,
        }
    }

    /// Returns true if the operation may succeed when attempted again later.
    ///
    /// A locked vault and transient I/O failures are retryable; invalid input
    /// and corrupted data are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            StorageError::AccessDenied(_) | StorageError::Locked => true,
            StorageError::Io(err) => !matches!(
                err.kind(),
                io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData
            ),
            _ => false,
        }
    }
}
