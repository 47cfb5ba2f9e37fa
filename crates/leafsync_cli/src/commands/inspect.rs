//! Inspect command implementation.

use super::{discover_collections, open_collection, open_storage, CommandResult};
use leafsync_sync_engine::CursorStore;
use serde::Serialize;
use std::path::Path;

/// Data directory inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Data directory path.
    pub path: String,
    /// Per-collection statistics.
    pub collections: Vec<CollectionStats>,
    /// Cursors stored for collections without records.
    pub orphan_cursors: Vec<String>,
}

/// Statistics for a single collection.
#[derive(Debug, Serialize)]
pub struct CollectionStats {
    /// Collection name.
    pub name: String,
    /// Records that aren't deleted.
    pub live: usize,
    /// Tombstones.
    pub tombstones: usize,
    /// Records with changes not yet acknowledged by the remote.
    pub pending: usize,
    /// Total payload size in bytes.
    pub payload_bytes: usize,
    /// Pull cursor, if the collection has pulled before.
    pub cursor: Option<String>,
}

/// Runs the inspect command.
pub async fn run(path: &Path, format: &str) -> CommandResult<()> {
    let result = inspect(path).await?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }
    Ok(())
}

async fn inspect(path: &Path) -> CommandResult<InspectResult> {
    let storage = open_storage(path).await?;
    let cursors = CursorStore::new(storage.clone());
    let names = discover_collections(storage.as_ref()).await?;

    let mut collections = Vec::with_capacity(names.len());
    for name in &names {
        let store = open_collection(storage.clone(), name).await?;
        let records = store.all();
        collections.push(CollectionStats {
            name: name.clone(),
            live: records.iter().filter(|r| !r.deleted).count(),
            tombstones: records.iter().filter(|r| r.deleted).count(),
            pending: records.iter().filter(|r| r.is_pending()).count(),
            payload_bytes: records.iter().map(|r| r.payload.len()).sum(),
            cursor: cursors.get(name).await?.map(|c| c.to_string()),
        });
    }

    let orphan_cursors = cursors
        .collections()
        .await?
        .into_iter()
        .filter(|c| !names.contains(c))
        .collect();

    Ok(InspectResult {
        path: path.display().to_string(),
        collections,
        orphan_cursors,
    })
}

fn print_text_output(result: &InspectResult) {
    println!("LeafSync Data Inspection");
    println!("========================");
    println!();
    println!("Path: {}", result.path);
    println!();

    if result.collections.is_empty() {
        println!("No collections.");
    }
    for col in &result.collections {
        println!("Collection {}:", col.name);
        println!("  Live records:  {}", col.live);
        println!("  Tombstones:    {}", col.tombstones);
        println!("  Pending:       {}", col.pending);
        println!("  Payload size:  {}", format_size(col.payload_bytes as u64));
        println!(
            "  Cursor:        {}",
            col.cursor.as_deref().unwrap_or("(never pulled)")
        );
    }

    if !result.orphan_cursors.is_empty() {
        println!();
        println!("Cursors without records: {}", result.orphan_cursors.join(", "));
    }
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} bytes")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
