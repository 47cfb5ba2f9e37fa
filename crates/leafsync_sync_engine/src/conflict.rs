//! Deterministic conflict resolution.
//!
//! Every device must pick the same winner for the same pair of writes,
//! whichever side it sees as "local", or replicas never converge.

use leafsync_core::{RecordValue, Resolution};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// How conflicting local and remote writes are settled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// The later `updated_at` wins; see [`last_writer_wins`].
    #[default]
    LastWriterWins,
    /// The remote always wins.
    RemoteWins,
    /// The local write always wins.
    LocalWins,
}

impl ConflictPolicy {
    /// Picks the side to keep.
    pub fn resolve(&self, local: &RecordValue, remote: &RecordValue) -> Resolution {
        match self {
            ConflictPolicy::LastWriterWins => last_writer_wins(local, remote),
            ConflictPolicy::RemoteWins => Resolution::RemoteWins,
            ConflictPolicy::LocalWins => Resolution::LocalWins,
        }
    }
}

/// Last-writer-wins with a total tie-break order.
///
/// Compares `updated_at`, then the writer's device id, then the payload
/// bytes, then the tombstone flag; the greater value wins. Two identical
/// writes resolve to the remote.
pub fn last_writer_wins(local: &RecordValue, remote: &RecordValue) -> Resolution {
    let order = local
        .updated_at
        .cmp(&remote.updated_at)
        .then_with(|| local.origin.cmp(&remote.origin))
        .then_with(|| local.payload.cmp(&remote.payload))
        .then_with(|| local.deleted.cmp(&remote.deleted));
    match order {
        Ordering::Greater => Resolution::LocalWins,
        Ordering::Less | Ordering::Equal => Resolution::RemoteWins,
    }
}
