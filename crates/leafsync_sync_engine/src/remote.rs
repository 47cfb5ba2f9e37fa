//! The remote store contract and an in-process implementation.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use bytes::Bytes;
use leafsync_core::{Record, RecordId, RemoteRecord, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Opaque position in a collection's remote change stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncCursor(String);

impl SyncCursor {
    /// Wraps a token issued by the remote.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SyncCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One page of remote changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullBatch {
    /// Changed records, oldest change first.
    pub records: Vec<RemoteRecord>,
    /// Cursor to resume after this batch; `None` leaves the cursor unchanged.
    pub cursor: Option<SyncCursor>,
    /// True if more changes are waiting.
    pub has_more: bool,
}

/// A local change offered to the remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRecord {
    /// Record id.
    pub id: RecordId,
    /// The remote version this change was made on top of.
    pub base_version: Option<u64>,
    /// The local version being pushed.
    pub local_version: u64,
    /// Payload bytes. Empty for tombstones.
    pub payload: Bytes,
    /// Tombstone flag.
    pub deleted: bool,
    /// When the change was made.
    pub updated_at: Timestamp,
    /// Device that made the change.
    pub origin: String,
}

impl PushRecord {
    /// Builds the push form of a pending record.
    pub fn from_record(record: &Record) -> Self {
        Self {
            id: record.id.clone(),
            base_version: record.remote_version,
            local_version: record.local_version,
            payload: record.payload.clone(),
            deleted: record.deleted,
            updated_at: record.updated_at,
            origin: record.origin.clone(),
        }
    }
}

/// The remote's verdict on one pushed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushAck {
    /// Stored as `version`.
    Accepted {
        /// Record id.
        id: RecordId,
        /// Version assigned by the remote.
        version: u64,
    },
    /// The base version was stale; `current` is what the remote holds.
    Conflict {
        /// Record id.
        id: RecordId,
        /// The remote's current record.
        current: RemoteRecord,
    },
    /// Refused for a reason retrying won't fix.
    Rejected {
        /// Record id.
        id: RecordId,
        /// Why the remote refused it.
        reason: String,
    },
}

impl PushAck {
    /// Returns the id this acknowledgement is for.
    pub fn id(&self) -> &RecordId {
        match self {
            PushAck::Accepted { id, .. }
            | PushAck::Conflict { id, .. }
            | PushAck::Rejected { id, .. } => id,
        }
    }
}

/// Client for the remote record store.
///
/// Implementations handle transport and authentication; the sync manager
/// adds timeouts and retries around every call.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Fetches up to `limit` records changed after `cursor`.
    async fn pull(
        &self,
        collection: &str,
        cursor: Option<&SyncCursor>,
        limit: usize,
    ) -> SyncResult<PullBatch>;

    /// Offers local changes; returns one acknowledgement per record.
    async fn push(&self, collection: &str, records: Vec<PushRecord>) -> SyncResult<Vec<PushAck>>;
}

/// A failure [`MemoryRemote`] can be told to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Transient transport failure.
    Unavailable,
    /// The call never completes.
    Hang,
    /// Credentials refused.
    Unauthorized,
    /// The collection doesn't exist remotely.
    CollectionNotFound,
}

/// Which remote call a fault applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    /// [`RemoteClient::pull`].
    Pull,
    /// [`RemoteClient::push`].
    Push,
}

#[derive(Debug, Default)]
struct RemoteCollection {
    records: BTreeMap<RecordId, RemoteRecord>,
    next_version: u64,
}

impl RemoteCollection {
    fn store(&mut self, mut record: RemoteRecord) -> RemoteRecord {
        self.next_version += 1;
        record.version = self.next_version;
        if record.deleted {
            record.payload = Bytes::new();
        }
        self.records.insert(record.id.clone(), record.clone());
        record
    }
}

#[derive(Debug)]
struct FaultPlan {
    fault: Fault,
    remaining: Option<usize>,
}

/// An in-process remote store.
///
/// Versions come from a per-collection counter, so they increase per id
/// and double as the change-stream position behind each [`SyncCursor`].
/// Pushes are checked against the base version and answered with
/// [`PushAck::Conflict`] when stale.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    collections: Mutex<HashMap<String, RemoteCollection>>,
    faults: Mutex<HashMap<RemoteOp, FaultPlan>>,
    rejected: Mutex<HashMap<RecordId, String>>,
    latency: Mutex<Duration>,
    pulls: AtomicU64,
    pushes: AtomicU64,
}

impl MemoryRemote {
    /// Creates an empty remote.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every `op` call fail with `fault` until cleared.
    pub fn inject(&self, op: RemoteOp, fault: Fault) {
        self.faults.lock().insert(
            op,
            FaultPlan {
                fault,
                remaining: None,
            },
        );
    }

    /// Makes the next `times` calls of `op` fail with `fault`.
    pub fn inject_times(&self, op: RemoteOp, fault: Fault, times: usize) {
        self.faults.lock().insert(
            op,
            FaultPlan {
                fault,
                remaining: Some(times),
            },
        );
    }

    /// Removes all injected faults.
    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Answers pushes of `id` with [`PushAck::Rejected`].
    pub fn reject(&self, id: impl Into<RecordId>, reason: impl Into<String>) {
        self.rejected.lock().insert(id.into(), reason.into());
    }

    /// Writes a record as another device would, bypassing conflict checks.
    pub fn write(
        &self,
        collection: &str,
        id: impl Into<RecordId>,
        payload: impl Into<Bytes>,
        updated_at: Timestamp,
        origin: &str,
    ) -> RemoteRecord {
        self.store_direct(collection, id.into(), payload.into(), false, updated_at, origin)
    }

    /// Deletes a record as another device would.
    pub fn delete(
        &self,
        collection: &str,
        id: impl Into<RecordId>,
        updated_at: Timestamp,
        origin: &str,
    ) -> RemoteRecord {
        self.store_direct(collection, id.into(), Bytes::new(), true, updated_at, origin)
    }

    /// Returns the remote's copy of a record.
    pub fn get(&self, collection: &str, id: &RecordId) -> Option<RemoteRecord> {
        self.collections
            .lock()
            .get(collection)
            .and_then(|c| c.records.get(id).cloned())
    }

    /// Returns every record of a collection, ordered by id.
    pub fn records(&self, collection: &str) -> Vec<RemoteRecord> {
        self.collections
            .lock()
            .get(collection)
            .map(|c| c.records.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of pull calls received.
    pub fn pull_count(&self) -> u64 {
        self.pulls.load(Ordering::SeqCst)
    }

    /// Number of push calls received.
    pub fn push_count(&self) -> u64 {
        self.pushes.load(Ordering::SeqCst)
    }

    fn store_direct(
        &self,
        collection: &str,
        id: RecordId,
        payload: Bytes,
        deleted: bool,
        updated_at: Timestamp,
        origin: &str,
    ) -> RemoteRecord {
        let mut collections = self.collections.lock();
        collections
            .entry(collection.to_string())
            .or_default()
            .store(RemoteRecord {
                id,
                version: 0,
                payload,
                deleted,
                updated_at,
                origin: origin.to_string(),
            })
    }

    async fn enter(&self, op: RemoteOp, collection: &str) -> SyncResult<()> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let fault = {
            let mut faults = self.faults.lock();
            let (fault, exhausted) = match faults.get_mut(&op) {
                Some(plan) => {
                    if let Some(remaining) = plan.remaining.as_mut() {
                        *remaining = remaining.saturating_sub(1);
                    }
                    (Some(plan.fault), plan.remaining == Some(0))
                }
                None => (None, false),
            };
            if exhausted {
                faults.remove(&op);
            }
            fault
        };

        match fault {
            None => Ok(()),
            Some(Fault::Unavailable) => Err(SyncError::transport_retryable("remote unavailable")),
            Some(Fault::Unauthorized) => Err(SyncError::AuthenticationFailed(
                "token rejected".to_string(),
            )),
            Some(Fault::CollectionNotFound) => {
                Err(SyncError::CollectionNotFound(collection.to_string()))
            }
            Some(Fault::Hang) => {
                debug!(?op, collection, "remote call hanging");
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}

fn parse_cursor(cursor: Option<&SyncCursor>) -> SyncResult<u64> {
    match cursor {
        None => Ok(0),
        Some(cursor) => cursor
            .as_str()
            .parse()
            .map_err(|_| SyncError::Protocol(format!("malformed cursor {cursor}"))),
    }
}

#[async_trait]
impl RemoteClient for MemoryRemote {
    async fn pull(
        &self,
        collection: &str,
        cursor: Option<&SyncCursor>,
        limit: usize,
    ) -> SyncResult<PullBatch> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        self.enter(RemoteOp::Pull, collection).await?;
        let after = parse_cursor(cursor)?;

        let collections = self.collections.lock();
        let mut changed: Vec<&RemoteRecord> = collections
            .get(collection)
            .map(|c| c.records.values().filter(|r| r.version > after).collect())
            .unwrap_or_default();
        changed.sort_by_key(|r| r.version);

        let has_more = changed.len() > limit;
        let records: Vec<RemoteRecord> = changed.into_iter().take(limit).cloned().collect();
        let cursor = records
            .last()
            .map(|r| SyncCursor::new(r.version.to_string()));
        Ok(PullBatch {
            records,
            cursor,
            has_more,
        })
    }

    async fn push(&self, collection: &str, records: Vec<PushRecord>) -> SyncResult<Vec<PushAck>> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        self.enter(RemoteOp::Push, collection).await?;

        let rejected = self.rejected.lock().clone();
        let mut seen = HashSet::new();
        let mut collections = self.collections.lock();
        let target = collections.entry(collection.to_string()).or_default();

        let mut acks = Vec::with_capacity(records.len());
        for record in records {
            if !seen.insert(record.id.clone()) {
                return Err(SyncError::Protocol(format!(
                    "record {} pushed twice in one batch",
                    record.id
                )));
            }
            if let Some(reason) = rejected.get(&record.id) {
                acks.push(PushAck::Rejected {
                    id: record.id,
                    reason: reason.clone(),
                });
                continue;
            }
            if let Some(current) = target.records.get(&record.id) {
                if Some(current.version) != record.base_version {
                    acks.push(PushAck::Conflict {
                        id: record.id,
                        current: current.clone(),
                    });
                    continue;
                }
            }
            let stored = target.store(RemoteRecord {
                id: record.id.clone(),
                version: 0,
                payload: record.payload,
                deleted: record.deleted,
                updated_at: record.updated_at,
                origin: record.origin,
            });
            acks.push(PushAck::Accepted {
                id: record.id,
                version: stored.version,
            });
        }
        Ok(acks)
    }
}
