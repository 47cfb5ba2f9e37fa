//! Storage trait definition.

use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;

/// Maximum length of a storage key in bytes.
pub const MAX_KEY_LEN: usize = 200;

/// An async key/value storage backend.
///
/// Backends are **opaque byte stores**. The Record Store, the Sync Manager and
/// the Bounded Cache each own a key prefix and interpret their own values;
/// backends never look inside them.
///
/// # Invariants
///
/// - `get` after a successful `set` returns exactly the bytes written
/// - `get` on a missing key returns `Ok(None)`
/// - `set` replaces the previous value atomically: a reader sees either the
///   old or the new value, never a mix
/// - `keys` returns keys in ascending order
/// - Dropping a returned future cancels the operation; a cancelled `set`
///   leaves the previous value intact
///
/// # Implementors
///
/// - [`super::MemoryStorage`] - For testing
/// - [`super::FileStorage`] - For persistent storage
/// - [`super::SecureStorage`] - For credentials and tokens
/// - [`super::PrefixedStorage`] - For namespacing
#[async_trait]
pub trait Storage: Send + Sync {
    /// Reads the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or the read fails.
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or the write fails.
    async fn set(&self, key: &str, value: &[u8]) -> StorageResult<()>;

    /// Removes the value under `key`.
    ///
    /// Returns `true` if a value was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or the removal fails.
    async fn delete(&self, key: &str) -> StorageResult<bool>;

    /// Lists all keys starting with `prefix`, in ascending order.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing fails.
    async fn keys(&self, prefix: &str) -> StorageResult<Vec<String>>;
}

/// Checks that `key` is acceptable to every backend.
///
/// # Errors
///
/// Returns [`StorageError::InvalidKey`] if the key is empty, longer than
/// [`MAX_KEY_LEN`] bytes, or contains a NUL byte.
pub fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() {
        return Err(StorageError::invalid_key(key, "empty"));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(StorageError::invalid_key(key, "longer than 200 bytes"));
    }
    if key.contains('\0') {
        return Err(StorageError::invalid_key(key, "contains NUL"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_keys() {
        assert!(validate_key("records/bookmarks/42").is_ok());
        assert!(validate_key("ünïcødé key").is_ok());
    }

    #[test]
    fn rejects_bad_keys() {
        assert!(validate_key("").is_err());
        assert!(validate_key("a\0b").is_err());
        assert!(validate_key(&"k".repeat(MAX_KEY_LEN + 1)).is_err());
        assert!(validate_key(&"k".repeat(MAX_KEY_LEN)).is_ok());
    }
}
