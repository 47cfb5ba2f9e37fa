//! Per-collection sync state.

use leafsync_core::{SyncOutcome, Timestamp};
use std::sync::Arc;
use std::time::Duration;

/// Where a collection is in the sync cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    /// Not syncing.
    Idle,
    /// Fetching remote changes.
    Pulling,
    /// Applying remote changes and settling conflicts.
    Resolving,
    /// Sending local changes.
    Pushing,
    /// The last pass failed.
    Failed {
        /// Display form of the error.
        reason: String,
        /// True if no automatic retry is scheduled.
        fatal: bool,
    },
}

impl SyncState {
    /// Returns true while a pass is running.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncState::Pulling | SyncState::Resolving | SyncState::Pushing
        )
    }

    /// Returns true if timer- and write-driven passes may start.
    ///
    /// A failed collection waits for its backoff timer or an explicit
    /// trigger instead.
    pub fn accepts_background_sync(&self) -> bool {
        matches!(self, SyncState::Idle)
    }
}

/// Statistics about sync passes of one collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Passes that completed.
    pub passes: u64,
    /// Passes that failed as a whole.
    pub failed_passes: u64,
    /// Remote records applied.
    pub pulled: u64,
    /// Local records accepted by the remote.
    pub pushed: u64,
    /// Conflicts resolved.
    pub conflicts: u64,
    /// Records the remote rejected.
    pub record_failures: u64,
}

impl SyncStats {
    pub(crate) fn record_success(&mut self, outcome: &SyncOutcome) {
        self.passes += 1;
        self.pulled += outcome.pulled as u64;
        self.pushed += outcome.pushed as u64;
        self.conflicts += outcome.conflicts.len() as u64;
        self.record_failures += outcome.failures.iter().filter(|f| f.id.is_some()).count() as u64;
    }
}

/// A snapshot for "last synced …, retrying in …" indicators.
#[derive(Debug, Clone)]
pub struct SyncStatus {
    /// Current state.
    pub state: SyncState,
    /// When the last successful pass finished.
    pub last_success_at: Option<Timestamp>,
    /// The last successful pass.
    pub last_outcome: Option<Arc<SyncOutcome>>,
    /// Failed passes since the last success.
    pub consecutive_failures: u32,
    /// Time until the scheduled retry, if one is pending.
    pub next_retry_in: Option<Duration>,
    /// Running totals.
    pub stats: SyncStats,
}
