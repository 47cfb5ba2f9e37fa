//! Purge-tombstones command implementation.

use super::{open_collection, open_storage, CommandResult};
use std::path::Path;
use std::time::Duration;

/// Runs the purge-tombstones command.
///
/// Only tombstones the remote has acknowledged are eligible, so a purge
/// never loses a deletion that hasn't been synced.
pub async fn run(
    path: &Path,
    collection: &str,
    retention_secs: u64,
    dry_run: bool,
) -> CommandResult<()> {
    let storage = open_storage(path).await?;
    let store = open_collection(storage, collection).await?;
    let retention = Duration::from_secs(retention_secs);

    if dry_run {
        let expired = store.expired_tombstones(retention);
        println!(
            "Would purge {} tombstones from {collection} (dry run)",
            expired.len()
        );
        for id in expired {
            println!("  {id}");
        }
        return Ok(());
    }

    let purged = store.purge_tombstones(retention).await?;
    println!("Purged {purged} tombstones from {collection}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use leafsync_core::{EventNotifier, RecordStore, StoreOptions};
    use leafsync_storage::FileStorage;
    use std::sync::Arc;

    async fn seed(path: &Path) {
        let storage = Arc::new(FileStorage::open(path).await.unwrap());
        let store = RecordStore::open(
            "books",
            storage,
            EventNotifier::new(),
            StoreOptions::new("phone"),
        )
        .await
        .unwrap();
        for id in ["synced", "unsynced"] {
            store.put(id, b"x".to_vec()).await.unwrap();
            store.soft_delete(&id.into()).await.unwrap();
        }
        store.mark_pushed(&"synced".into(), 2, 1).await.unwrap();
    }

    async fn remaining(path: &Path) -> Vec<String> {
        let storage = open_storage(path).await.unwrap();
        let store = open_collection(storage, "books").await.unwrap();
        store.all().iter().map(|r| r.id.to_string()).collect()
    }

    #[tokio::test]
    async fn purges_only_acknowledged_tombstones() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path()).await;

        run(dir.path(), "books", 0, false).await.unwrap();

        assert_eq!(remaining(dir.path()).await, vec!["unsynced"]);
    }

    #[tokio::test]
    async fn dry_run_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path()).await;

        run(dir.path(), "books", 0, true).await.unwrap();

        assert_eq!(remaining(dir.path()).await, vec!["synced", "unsynced"]);
    }
}
