//! Reports produced by sync passes.

use crate::record::RecordValue;
use crate::types::{RecordId, Timestamp};
use std::time::Duration;

/// Which side of a conflict was kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    /// The local record was kept and will be pushed.
    LocalWins,
    /// The remote record replaced the local one.
    RemoteWins,
}

/// A conflict that was resolved during a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictReport {
    /// The conflicting record.
    pub id: RecordId,
    /// The side that was kept.
    pub resolution: Resolution,
    /// The side that was thrown away.
    pub discarded: RecordValue,
}

/// A failure recorded in an outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFailure {
    /// The record concerned, or `None` for a pass-level failure.
    pub id: Option<RecordId>,
    /// Human-readable cause.
    pub cause: String,
}

impl SyncFailure {
    /// A failure affecting a single record.
    pub fn record(id: RecordId, cause: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            cause: cause.into(),
        }
    }

    /// A failure affecting the whole pass.
    pub fn pass(cause: impl Into<String>) -> Self {
        Self {
            id: None,
            cause: cause.into(),
        }
    }
}

/// Immutable report of one sync pass over a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    /// The collection that was synced.
    pub collection: String,
    /// Pass number, starting at 1 per collection.
    pub pass: u64,
    /// Remote records applied locally.
    pub pulled: usize,
    /// Local records accepted by the remote.
    pub pushed: usize,
    /// Conflicts resolved during the pass.
    pub conflicts: Vec<ConflictReport>,
    /// Per-record failures.
    pub failures: Vec<SyncFailure>,
    /// When the pass started.
    pub started_at: Timestamp,
    /// How long the pass took.
    pub duration: Duration,
}

impl SyncOutcome {
    /// Creates an empty outcome for a pass starting now.
    pub fn new(collection: impl Into<String>, pass: u64, started_at: Timestamp) -> Self {
        Self {
            collection: collection.into(),
            pass,
            pulled: 0,
            pushed: 0,
            conflicts: Vec::new(),
            failures: Vec::new(),
            started_at,
            duration: Duration::ZERO,
        }
    }
}
