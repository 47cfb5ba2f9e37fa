//! Namespaced view over another storage backend.

use crate::backend::{validate_key, Storage};
use crate::error::StorageResult;
use async_trait::async_trait;
use std::sync::Arc;

/// A storage view that transparently prefixes every key.
///
/// Components that share one physical backend each get their own
/// `PrefixedStorage`, so none of them can read or clobber another
/// component's keyspace by accident.
///
/// ```rust
/// use leafsync_storage::{MemoryStorage, PrefixedStorage, Storage};
/// use std::sync::Arc;
///
/// let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
/// rt.block_on(async {
///     let shared = Arc::new(MemoryStorage::new());
///     let cache = PrefixedStorage::new(shared.clone(), "cache/");
///     cache.set("cover/1", b"png").await.unwrap();
///     assert_eq!(cache.keys("").await.unwrap(), vec!["cover/1"]);
///     assert!(shared.get("cache/cover/1").await.unwrap().is_some());
/// });
/// ```
#[derive(Clone)]
pub struct PrefixedStorage {
    inner: Arc<dyn Storage>,
    prefix: String,
}

impl PrefixedStorage {
    /// Creates a view of `inner` restricted to keys under `prefix`.
    pub fn new(inner: Arc<dyn Storage>, prefix: impl Into<String>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
        }
    }

    /// Returns the prefix this view adds to every key.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn full_key(&self, key: &str) -> StorageResult<String> {
        validate_key(key)?;
        Ok(format!("{}{}", self.prefix, key))
    }
}

impl std::fmt::Debug for PrefixedStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefixedStorage")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Storage for PrefixedStorage {
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let key = self.full_key(key)?;
        self.inner.get(&key).await
    }

    async fn set(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        let key = self.full_key(key)?;
        self.inner.set(&key, value).await
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        let key = self.full_key(key)?;
        self.inner.delete(&key).await
    }

    async fn keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let full = format!("{}{}", self.prefix, prefix);
        Ok(self
            .inner
            .keys(&full)
            .await?
            .into_iter()
            .filter_map(|k| k.strip_prefix(&self.prefix).map(str::to_string))
            .collect())
    }
}
