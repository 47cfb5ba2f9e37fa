//! Persistence of per-collection pull cursors.

use crate::error::SyncResult;
use crate::remote::SyncCursor;
use leafsync_core::{from_cbor, to_cbor};
use leafsync_storage::{PrefixedStorage, Storage};
use std::sync::Arc;

/// Keyspace holding the cursors.
pub const CURSOR_PREFIX: &str = "sync/cursors/";

/// Stores the last fully applied cursor of each collection under
/// `sync/cursors/<collection>`.
#[derive(Debug)]
pub struct CursorStore {
    storage: PrefixedStorage,
}

impl CursorStore {
    /// Creates a cursor store over `storage`.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage: PrefixedStorage::new(storage, CURSOR_PREFIX),
        }
    }

    /// Loads the cursor of `collection`, `None` before the first pull.
    pub async fn get(&self, collection: &str) -> SyncResult<Option<SyncCursor>> {
        match self.storage.get(collection).await? {
            Some(bytes) => Ok(Some(from_cbor(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Saves the cursor of `collection`.
    pub async fn set(&self, collection: &str, cursor: &SyncCursor) -> SyncResult<()> {
        self.storage.set(collection, &to_cbor(cursor)?).await?;
        Ok(())
    }

    /// Forgets the cursor of `collection`, forcing a full pull next time.
    pub async fn clear(&self, collection: &str) -> SyncResult<bool> {
        Ok(self.storage.delete(collection).await?)
    }

    /// Lists every collection with a saved cursor.
    pub async fn collections(&self) -> SyncResult<Vec<String>> {
        Ok(self.storage.keys("").await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leafsync_storage::MemoryStorage;

    #[tokio::test]
    async fn cursors_persist_per_collection() {
        let storage = Arc::new(MemoryStorage::new());
        let cursors = CursorStore::new(storage.clone());
        assert_eq!(cursors.get("books").await.unwrap(), None);

        cursors.set("books", &SyncCursor::new("42")).await.unwrap();
        cursors.set("notes", &SyncCursor::new("7")).await.unwrap();

        let reopened = CursorStore::new(storage.clone());
        assert_eq!(
            reopened.get("books").await.unwrap(),
            Some(SyncCursor::new("42"))
        );
        assert_eq!(reopened.collections().await.unwrap(), vec!["books", "notes"]);
        assert!(storage.snapshot("sync/cursors/books").is_some());

        assert!(reopened.clear("books").await.unwrap());
        assert_eq!(reopened.get("books").await.unwrap(), None);
    }
}
