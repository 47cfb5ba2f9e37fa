//! Dump-records command implementation.

use super::{open_collection, open_storage, CommandResult};
use leafsync_core::Record;
use serde::Serialize;
use std::path::Path;

/// One record as printed by `dump-records`.
#[derive(Debug, Serialize)]
pub struct RecordRow {
    /// Record id.
    pub id: String,
    /// Local version.
    pub local_version: u64,
    /// Last remote version seen, if any.
    pub remote_version: Option<u64>,
    /// Whether the remote hasn't acknowledged the latest local version.
    pub pending: bool,
    /// Whether this is a tombstone.
    pub deleted: bool,
    /// Last modification, in milliseconds since the Unix epoch.
    pub updated_at: u64,
    /// Device that made the last change.
    pub origin: String,
    /// Payload, lossily decoded as UTF-8.
    pub payload: String,
}

impl From<&Record> for RecordRow {
    fn from(record: &Record) -> Self {
        Self {
            id: record.id.to_string(),
            local_version: record.local_version,
            remote_version: record.remote_version,
            pending: record.is_pending(),
            deleted: record.deleted,
            updated_at: record.updated_at.as_millis(),
            origin: record.origin.clone(),
            payload: String::from_utf8_lossy(&record.payload).into_owned(),
        }
    }
}

/// Runs the dump-records command.
pub async fn run(
    path: &Path,
    collection: &str,
    include_tombstones: bool,
    format: &str,
) -> CommandResult<()> {
    let storage = open_storage(path).await?;
    let store = open_collection(storage, collection).await?;
    let rows = rows(&store.all(), include_tombstones);

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&rows)?),
        _ => {
            println!("Collection {collection}: {} records", rows.len());
            for row in &rows {
                print_row(row);
            }
        }
    }
    Ok(())
}

fn rows(records: &[Record], include_tombstones: bool) -> Vec<RecordRow> {
    records
        .iter()
        .filter(|r| include_tombstones || !r.deleted)
        .map(RecordRow::from)
        .collect()
}

fn print_row(row: &RecordRow) {
    let remote = row
        .remote_version
        .map_or_else(|| "-".to_string(), |v| v.to_string());
    let mut flags = Vec::new();
    if row.pending {
        flags.push("pending");
    }
    if row.deleted {
        flags.push("deleted");
    }
    println!(
        "[{}] v{} remote={} at={}ms by={} {}",
        row.id,
        row.local_version,
        remote,
        row.updated_at,
        row.origin,
        flags.join(",")
    );
    if !row.deleted {
        println!("    {}", row.payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, deleted: bool) -> Record {
        let mut record = Record::new(id, b"text".to_vec());
        record.local_version = 2;
        record.synced_local_version = 1;
        record.deleted = deleted;
        record
    }

    #[test]
    fn tombstones_are_hidden_unless_requested() {
        let records = vec![record("a", false), record("b", true)];

        let live = rows(&records, false);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, "a");
        assert!(live[0].pending);
        assert_eq!(live[0].payload, "text");

        assert_eq!(rows(&records, true).len(), 2);
    }
}
