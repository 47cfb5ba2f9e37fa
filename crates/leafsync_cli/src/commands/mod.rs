//! CLI command implementations.

pub mod dump_records;
pub mod inspect;
pub mod purge_tombstones;

use leafsync_core::{EventNotifier, RecordStore, StoreOptions, RECORD_PREFIX};
use leafsync_storage::{FileStorage, Storage};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Result type shared by the commands.
pub type CommandResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Opens the data directory, failing if it doesn't exist.
///
/// Opening takes the directory lock, so this fails while an app has the
/// directory open.
pub async fn open_storage(path: &Path) -> CommandResult<Arc<FileStorage>> {
    if !path.is_dir() {
        return Err(format!("No data directory found at {}", path.display()).into());
    }
    let storage = FileStorage::open(path).await?;
    debug!(path = %path.display(), "opened data directory");
    Ok(Arc::new(storage))
}

/// Lists the collections that have at least one stored record.
pub async fn discover_collections(storage: &dyn Storage) -> CommandResult<Vec<String>> {
    let names: BTreeSet<String> = storage
        .keys(RECORD_PREFIX)
        .await?
        .iter()
        .filter_map(|key| key.strip_prefix(RECORD_PREFIX)?.split_once('/'))
        .map(|(collection, _)| collection.to_string())
        .collect();
    Ok(names.into_iter().collect())
}

/// Opens one collection's record store read-write.
pub async fn open_collection(
    storage: Arc<FileStorage>,
    collection: &str,
) -> CommandResult<RecordStore> {
    let store = RecordStore::open(
        collection,
        storage,
        EventNotifier::new(),
        StoreOptions::new("leafsync-cli"),
    )
    .await?;
    Ok(store)
}
