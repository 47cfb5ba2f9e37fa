//! # LeafSync Sync Engine
//!
//! Keeps [`leafsync_core::RecordStore`] collections in sync with a remote
//! record store reached through a [`RemoteClient`].
//!
//! This crate provides:
//! - Per-collection state machine (idle → pulling → resolving → pushing → idle)
//! - Cursor persistence so restarts resume incrementally
//! - Deterministic last-writer-wins conflict resolution
//! - Periodic, debounced and explicit scheduling
//! - Retry with exponential backoff and per-call timeouts
//! - [`MemoryRemote`], an in-process remote with fault injection
//!
//! ## Architecture
//!
//! Each pass is **pull-then-push**:
//! 1. Pull remote changes in batches, advancing the cursor after each batch
//!    is applied
//! 2. Resolve conflicts against pending local changes
//! 3. Push pending local changes; stale pushes come back as conflicts and
//!    are resolved and re-pushed
//!
//! ## Key Invariants
//!
//! - At most one pass per collection runs at a time
//! - A cursor never moves past changes that weren't applied
//! - Applying a batch twice has no further effect
//! - Background failures are reported as events, never to the trigger caller

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod conflict;
mod cursor;
mod error;
mod manager;
mod remote;
mod state;

pub use config::{RetryConfig, SyncConfig};
pub use conflict::{last_writer_wins, ConflictPolicy};
pub use cursor::{CursorStore, CURSOR_PREFIX};
pub use error::{SyncError, SyncResult};
pub use manager::SyncManager;
pub use remote::{
    Fault, MemoryRemote, PullBatch, PushAck, PushRecord, RemoteClient, RemoteOp, SyncCursor,
};
pub use state::{SyncState, SyncStats, SyncStatus};
