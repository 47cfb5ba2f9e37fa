//! The durable, versioned record store.

use crate::clock::{Clock, SystemClock};
use crate::codec::{from_cbor, to_cbor};
use crate::error::{CoreError, CoreResult};
use crate::events::{ChangeOrigin, EventNotifier, SyncEvent};
use crate::outcome::{ConflictReport, Resolution};
use crate::record::{Record, RecordValue, RemoteRecord};
use crate::types::RecordId;
use bytes::Bytes;
use leafsync_storage::{PrefixedStorage, Storage};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Settings for a [`RecordStore`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Identifies this device as the writer of local changes.
    pub device_id: String,
    /// Source of `updated_at` stamps.
    pub clock: Arc<dyn Clock>,
}

impl StoreOptions {
    /// Creates options for the given device using the system clock.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Sets the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::new("local")
    }
}

/// Result of applying one remote record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The remote record was stored; there was nothing local to protect.
    Applied(Record),
    /// The remote version was already known.
    Skipped,
    /// Local and remote both changed; `conflict` says which side won.
    Resolved {
        /// The record as stored after resolution.
        record: Record,
        /// What was kept and what was thrown away.
        conflict: ConflictReport,
    },
}

/// Key prefix under which every collection's records are stored.
pub const RECORD_PREFIX: &str = "records/";
/// Key prefix for the last local version of purged records.
const PURGED_PREFIX: &str = "purged/";

/// Durable mapping from record id to the latest local record of one collection.
///
/// Records live under `records/<collection>/` in the backing storage and are
/// mirrored in memory, so reads never touch storage. All writes, local and
/// remote, go through one async mutex.
///
/// Purging a tombstone leaves its last `local_version` behind under
/// `purged/<collection>/`, so a record re-created under the same id keeps
/// counting up from there.
pub struct RecordStore {
    collection: String,
    storage: PrefixedStorage,
    records: RwLock<BTreeMap<RecordId, Record>>,
    purged: PrefixedStorage,
    version_floors: RwLock<BTreeMap<RecordId, u64>>,
    write_lock: tokio::sync::Mutex<()>,
    notifier: EventNotifier,
    options: StoreOptions,
}

impl RecordStore {
    /// Opens the store for `collection`, loading every persisted record.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection name is invalid, storage fails,
    /// or a persisted record can't be decoded.
    pub async fn open(
        collection: impl Into<String>,
        storage: Arc<dyn Storage>,
        notifier: EventNotifier,
        options: StoreOptions,
    ) -> CoreResult<Self> {
        let collection = collection.into();
        validate_collection(&collection)?;
        let purged = PrefixedStorage::new(storage.clone(), format!("{PURGED_PREFIX}{collection}/"));
        let storage = PrefixedStorage::new(storage, format!("{RECORD_PREFIX}{collection}/"));

        let mut records = BTreeMap::new();
        for key in storage.keys("").await? {
            let Some(bytes) = storage.get(&key).await? else {
                continue;
            };
            let record: Record = from_cbor(&bytes)
                .map_err(|e| CoreError::Codec(format!("record {key:?} in {collection}: {e}")))?;
            records.insert(record.id.clone(), record);
        }
        let mut version_floors = BTreeMap::new();
        for key in purged.keys("").await? {
            let Some(bytes) = purged.get(&key).await? else {
                continue;
            };
            let floor: u64 = from_cbor(&bytes)
                .map_err(|e| CoreError::Codec(format!("purged {key:?} in {collection}: {e}")))?;
            version_floors.insert(RecordId::from(key), floor);
        }
        debug!(
            %collection,
            records = records.len(),
            purged = version_floors.len(),
            "opened record store"
        );

        Ok(Self {
            collection,
            storage,
            records: RwLock::new(records),
            purged,
            version_floors: RwLock::new(version_floors),
            write_lock: tokio::sync::Mutex::new(()),
            notifier,
            options,
        })
    }

    /// Returns the collection name.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Returns the device id stamped on local writes.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.options.device_id
    }

    /// Returns the notifier this store publishes to.
    #[must_use]
    pub fn notifier(&self) -> &EventNotifier {
        &self.notifier
    }

    /// Writes a record on behalf of the local user.
    ///
    /// The version fields, `updated_at` and `origin` of `record` are
    /// ignored: `local_version` becomes the previous version plus one (or 1),
    /// `updated_at` comes from the clock and `origin` is this device. A
    /// tombstone's payload is cleared.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is invalid or storage fails. Nothing is
    /// changed in that case.
    pub async fn upsert(&self, record: Record) -> CoreResult<Record> {
        let _guard = self.write_lock.lock().await;
        let previous = self.get(&record.id);
        self.write_local(previous, record).await
    }

    /// Writes `payload` under `id`.
    ///
    /// # Errors
    ///
    /// See [`upsert`](Self::upsert).
    pub async fn put(&self, id: impl Into<RecordId>, payload: impl Into<Bytes>) -> CoreResult<Record> {
        self.upsert(Record::new(id, payload)).await
    }

    /// Replaces the record with a tombstone.
    ///
    /// Returns `None` if the id is unknown. Deleting a tombstone again
    /// returns it unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn soft_delete(&self, id: &RecordId) -> CoreResult<Option<Record>> {
        let _guard = self.write_lock.lock().await;
        let Some(previous) = self.get(id) else {
            return Ok(None);
        };
        if previous.deleted {
            return Ok(Some(previous));
        }
        let mut tombstone = Record::new(id.clone(), Bytes::new());
        tombstone.deleted = true;
        self.write_local(Some(previous), tombstone).await.map(Some)
    }

    /// Returns the record stored under `id`, tombstones included.
    #[must_use]
    pub fn get(&self, id: &RecordId) -> Option<Record> {
        self.records.read().get(id).cloned()
    }

    /// Returns records whose `local_version` is greater than `local_version`,
    /// ordered by version then id.
    #[must_use]
    pub fn pending_since(&self, local_version: u64) -> Vec<Record> {
        self.collect_sorted(|r| r.local_version > local_version)
    }

    /// Returns records with changes the remote hasn't acknowledged, ordered
    /// by version then id.
    #[must_use]
    pub fn pending(&self) -> Vec<Record> {
        self.collect_sorted(Record::is_pending)
    }

    /// Returns every record that isn't a tombstone, ordered by id.
    #[must_use]
    pub fn all_live(&self) -> Vec<Record> {
        self.records
            .read()
            .values()
            .filter(|r| !r.deleted)
            .cloned()
            .collect()
    }

    /// Returns every record including tombstones, ordered by id.
    #[must_use]
    pub fn all(&self) -> Vec<Record> {
        self.records.read().values().cloned().collect()
    }

    /// Number of records including tombstones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Returns true if the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Applies a record received from the remote.
    ///
    /// A remote version at or below the one already known is skipped, so
    /// applying the same batch twice is harmless. If the local record has
    /// unacknowledged changes, `resolve(local, remote)` picks the winner:
    /// a remote win overwrites the local record, a local win keeps it
    /// pending but remembers the remote version as the new push base.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails. Nothing is changed in that case.
    pub async fn merge_remote<F>(&self, remote: &RemoteRecord, resolve: F) -> CoreResult<MergeOutcome>
    where
        F: Fn(&RecordValue, &RecordValue) -> Resolution,
    {
        let _guard = self.write_lock.lock().await;
        let stored = self.get(&remote.id);

        match stored {
            Some(local) if local.remote_version.is_some_and(|known| remote.version <= known) => {
                trace!(
                    collection = %self.collection,
                    id = %remote.id,
                    version = remote.version,
                    "remote version already applied"
                );
                Ok(MergeOutcome::Skipped)
            }
            Some(local) if local.is_pending() => {
                let resolution = resolve(&local.value(), &remote.value());
                debug!(
                    collection = %self.collection,
                    id = %remote.id,
                    local_version = local.local_version,
                    remote_version = remote.version,
                    ?resolution,
                    "resolved conflict"
                );
                match resolution {
                    Resolution::RemoteWins => {
                        let discarded = local.value();
                        let record = self.apply_remote(Some(&local), remote).await?;
                        Ok(MergeOutcome::Resolved {
                            record,
                            conflict: ConflictReport {
                                id: remote.id.clone(),
                                resolution,
                                discarded,
                            },
                        })
                    }
                    Resolution::LocalWins => {
                        let mut record = local;
                        record.remote_version = Some(remote.version);
                        self.persist(&record).await?;
                        Ok(MergeOutcome::Resolved {
                            record,
                            conflict: ConflictReport {
                                id: remote.id.clone(),
                                resolution,
                                discarded: remote.value(),
                            },
                        })
                    }
                }
            }
            stored => {
                let record = self.apply_remote(stored.as_ref(), remote).await?;
                Ok(MergeOutcome::Applied(record))
            }
        }
    }

    /// Records that the remote accepted `pushed_local_version` of `id` as
    /// `remote_version`.
    ///
    /// The record stays pending if it was written again after the push
    /// started. Returns false if the id is unknown.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn mark_pushed(
        &self,
        id: &RecordId,
        pushed_local_version: u64,
        remote_version: u64,
    ) -> CoreResult<bool> {
        let _guard = self.write_lock.lock().await;
        let Some(mut record) = self.get(id) else {
            return Ok(false);
        };
        record.synced_local_version = record
            .synced_local_version
            .max(pushed_local_version.min(record.local_version));
        record.remote_version = Some(record.remote_version.unwrap_or(0).max(remote_version));
        self.persist(&record).await?;
        trace!(
            collection = %self.collection,
            %id,
            pushed_local_version,
            remote_version,
            "marked pushed"
        );
        Ok(true)
    }

    /// Returns the ids of acknowledged tombstones older than `retention`,
    /// which [`purge_tombstones`](Self::purge_tombstones) would remove.
    pub fn expired_tombstones(&self, retention: Duration) -> Vec<RecordId> {
        let now = self.options.clock.now();
        self.records
            .read()
            .values()
            .filter(|r| {
                r.deleted
                    && !r.is_pending()
                    && r.remote_version.is_some()
                    && r.updated_at.elapsed_until(now) >= retention
            })
            .map(|r| r.id.clone())
            .collect()
    }

    /// Deletes acknowledged tombstones older than `retention`.
    ///
    /// Tombstones still waiting to be pushed are kept regardless of age.
    /// Returns the number of records removed.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails; tombstones removed before the
    /// failure stay removed.
    pub async fn purge_tombstones(&self, retention: Duration) -> CoreResult<usize> {
        let _guard = self.write_lock.lock().await;
        let expired = self.expired_tombstones(retention);

        for id in &expired {
            let Some(last) = self.get(id).map(|r| r.local_version) else {
                continue;
            };
            self.purged.set(id.as_str(), &to_cbor(&last)?).await?;
            self.version_floors.write().insert(id.clone(), last);
            self.storage.delete(id.as_str()).await?;
            self.records.write().remove(id);
        }
        if !expired.is_empty() {
            info!(collection = %self.collection, purged = expired.len(), "purged tombstones");
        }
        Ok(expired.len())
    }

    async fn write_local(&self, previous: Option<Record>, mut record: Record) -> CoreResult<Record> {
        validate_id(&record.id)?;
        let now = self.options.clock.now();
        match previous {
            Some(previous) => {
                record.local_version = previous.local_version + 1;
                record.remote_version = previous.remote_version;
                record.synced_local_version = previous.synced_local_version;
                record.updated_at = now.max(previous.updated_at);
            }
            None => {
                record.local_version = self.version_floor(&record.id) + 1;
                record.remote_version = None;
                record.synced_local_version = 0;
                record.updated_at = now;
            }
        }
        record.origin.clone_from(&self.options.device_id);
        if record.deleted {
            record.payload = Bytes::new();
        }

        self.persist(&record).await?;
        debug!(
            collection = %self.collection,
            id = %record.id,
            local_version = record.local_version,
            deleted = record.deleted,
            "local write"
        );
        self.publish_change(&record.id, ChangeOrigin::Local);
        Ok(record)
    }

    async fn apply_remote(&self, previous: Option<&Record>, remote: &RemoteRecord) -> CoreResult<Record> {
        let local_version = previous.map_or_else(|| self.version_floor(&remote.id), |p| p.local_version);
        let record = Record {
            id: remote.id.clone(),
            payload: if remote.deleted {
                Bytes::new()
            } else {
                remote.payload.clone()
            },
            local_version,
            remote_version: Some(remote.version),
            synced_local_version: local_version,
            updated_at: remote.updated_at,
            deleted: remote.deleted,
            origin: remote.origin.clone(),
        };
        self.persist(&record).await?;
        debug!(
            collection = %self.collection,
            id = %record.id,
            remote_version = remote.version,
            deleted = record.deleted,
            "applied remote record"
        );
        self.publish_change(&record.id, ChangeOrigin::Remote);
        Ok(record)
    }

    async fn persist(&self, record: &Record) -> CoreResult<()> {
        let bytes = to_cbor(record)?;
        self.storage.set(record.id.as_str(), &bytes).await?;
        self.records.write().insert(record.id.clone(), record.clone());
        // The live record now carries the version forward.
        let floor = self.version_floors.write().remove(&record.id);
        if floor.is_some() {
            self.purged.delete(record.id.as_str()).await?;
        }
        Ok(())
    }

    fn version_floor(&self, id: &RecordId) -> u64 {
        self.version_floors.read().get(id).copied().unwrap_or(0)
    }

    fn publish_change(&self, id: &RecordId, origin: ChangeOrigin) {
        self.notifier.publish(SyncEvent::RecordChanged {
            collection: self.collection.clone(),
            id: id.clone(),
            origin,
        });
    }

    fn collect_sorted(&self, keep: impl Fn(&Record) -> bool) -> Vec<Record> {
        let mut out: Vec<Record> = self
            .records
            .read()
            .values()
            .filter(|r| keep(r))
            .cloned()
            .collect();
        out.sort_by(|a, b| (a.local_version, &a.id).cmp(&(b.local_version, &b.id)));
        out
    }
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore")
            .field("collection", &self.collection)
            .field("device_id", &self.options.device_id)
            .field("records", &self.len())
            .finish_non_exhaustive()
    }
}

fn validate_collection(name: &str) -> CoreResult<()> {
    let reason = if name.is_empty() {
        "collection name must not be empty"
    } else if name.contains('/') {
        "collection name must not contain '/'"
    } else {
        return Ok(());
    };
    Err(CoreError::InvalidRecord {
        id: name.to_string(),
        reason: reason.to_string(),
    })
}

fn validate_id(id: &RecordId) -> CoreResult<()> {
    if id.as_str().is_empty() {
        return Err(CoreError::InvalidRecord {
            id: String::new(),
            reason: "id must not be empty".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::types::Timestamp;
    use leafsync_storage::MemoryStorage;

    struct Fixture {
        store: RecordStore,
        storage: Arc<MemoryStorage>,
        clock: Arc<ManualClock>,
        notifier: EventNotifier,
    }

    async fn fixture() -> Fixture {
        let storage = Arc::new(MemoryStorage::new());
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000)));
        let notifier = EventNotifier::new();
        let store = RecordStore::open(
            "books",
            storage.clone(),
            notifier.clone(),
            StoreOptions::new("phone").with_clock(clock.clone()),
        )
        .await
        .unwrap();
        Fixture {
            store,
            storage,
            clock,
            notifier,
        }
    }

    fn remote(id: &str, version: u64, payload: &'static [u8], at: u64) -> RemoteRecord {
        RemoteRecord {
            id: id.into(),
            version,
            payload: Bytes::from_static(payload),
            deleted: false,
            updated_at: Timestamp::from_millis(at),
            origin: "laptop".into(),
        }
    }

    fn remote_wins(_: &RecordValue, _: &RecordValue) -> Resolution {
        Resolution::RemoteWins
    }

    fn local_wins(_: &RecordValue, _: &RecordValue) -> Resolution {
        Resolution::LocalWins
    }

    #[tokio::test]
    async fn upsert_assigns_versions_and_stamps() {
        let f = fixture().await;
        let first = f.store.put("b1", b"draft".to_vec()).await.unwrap();
        assert_eq!(first.local_version, 1);
        assert_eq!(first.updated_at, Timestamp::from_millis(1_000));
        assert_eq!(first.origin, "phone");
        assert!(first.is_pending());

        f.clock.advance(Duration::from_secs(1));
        let second = f.store.put("b1", b"final".to_vec()).await.unwrap();
        assert_eq!(second.local_version, 2);
        assert_eq!(second.updated_at, Timestamp::from_millis(2_000));
    }

    #[tokio::test]
    async fn caller_supplied_version_fields_are_ignored() {
        let f = fixture().await;
        f.store.put("b1", b"v1".to_vec()).await.unwrap();

        let mut forged = Record::new("b1", b"v2".to_vec());
        forged.local_version = 100;
        forged.remote_version = Some(100);
        forged.origin = "someone-else".into();
        let stored = f.store.upsert(forged).await.unwrap();

        assert_eq!(stored.local_version, 2);
        assert_eq!(stored.remote_version, None);
        assert_eq!(stored.origin, "phone");
    }

    #[tokio::test]
    async fn updated_at_never_moves_backwards() {
        let f = fixture().await;
        f.store.put("b1", b"v1".to_vec()).await.unwrap();
        f.clock.set(Timestamp::from_millis(10));
        let second = f.store.put("b1", b"v2".to_vec()).await.unwrap();
        assert_eq!(second.updated_at, Timestamp::from_millis(1_000));
    }

    #[tokio::test]
    async fn empty_id_is_rejected() {
        let f = fixture().await;
        let err = f.store.put("", b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidRecord { .. }));
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn invalid_collection_names_are_rejected() {
        for name in ["", "a/b"] {
            let err = RecordStore::open(
                name,
                Arc::new(MemoryStorage::new()),
                EventNotifier::new(),
                StoreOptions::default(),
            )
            .await
            .unwrap_err();
            assert!(matches!(err, CoreError::InvalidRecord { .. }));
        }
    }

    #[tokio::test]
    async fn soft_delete_writes_a_pending_tombstone() {
        let f = fixture().await;
        f.store.put("b1", b"text".to_vec()).await.unwrap();

        let tombstone = f.store.soft_delete(&"b1".into()).await.unwrap().unwrap();
        assert!(tombstone.deleted);
        assert!(tombstone.payload.is_empty());
        assert_eq!(tombstone.local_version, 2);
        assert!(tombstone.is_pending());
        assert!(f.store.all_live().is_empty());
        assert_eq!(f.store.get(&"b1".into()), Some(tombstone.clone()));

        let again = f.store.soft_delete(&"b1".into()).await.unwrap().unwrap();
        assert_eq!(again, tombstone);
    }

    #[tokio::test]
    async fn soft_delete_of_unknown_id_is_none() {
        let f = fixture().await;
        assert!(f.store.soft_delete(&"ghost".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pending_since_orders_by_version_then_id() {
        let f = fixture().await;
        f.store.put("b", b"1".to_vec()).await.unwrap();
        f.store.put("a", b"1".to_vec()).await.unwrap();
        f.store.put("b", b"2".to_vec()).await.unwrap();

        let ids: Vec<_> = f
            .store
            .pending_since(0)
            .into_iter()
            .map(|r| (r.id.to_string(), r.local_version))
            .collect();
        assert_eq!(ids, vec![("a".into(), 1), ("b".into(), 2)]);
        assert_eq!(f.store.pending_since(1).len(), 1);
    }

    #[tokio::test]
    async fn remote_records_apply_without_becoming_pending() {
        let f = fixture().await;
        let outcome = f
            .store
            .merge_remote(&remote("b1", 5, b"from laptop", 500), remote_wins)
            .await
            .unwrap();

        let MergeOutcome::Applied(record) = outcome else {
            panic!("expected applied, got {outcome:?}");
        };
        assert_eq!(record.remote_version, Some(5));
        assert_eq!(record.origin, "laptop");
        assert!(!record.is_pending());
        assert!(f.store.pending().is_empty());
    }

    #[tokio::test]
    async fn merging_the_same_version_twice_is_skipped() {
        let f = fixture().await;
        let incoming = remote("b1", 5, b"x", 500);
        f.store.merge_remote(&incoming, remote_wins).await.unwrap();
        let snapshot = f.store.get(&"b1".into());

        let again = f.store.merge_remote(&incoming, remote_wins).await.unwrap();
        assert_eq!(again, MergeOutcome::Skipped);
        let older = f
            .store
            .merge_remote(&remote("b1", 4, b"old", 400), remote_wins)
            .await
            .unwrap();
        assert_eq!(older, MergeOutcome::Skipped);
        assert_eq!(f.store.get(&"b1".into()), snapshot);
    }

    #[tokio::test]
    async fn remote_win_replaces_pending_local_change() {
        let f = fixture().await;
        f.store
            .merge_remote(&remote("b1", 1, b"base", 500), remote_wins)
            .await
            .unwrap();
        let local = f.store.put("b1", b"mine".to_vec()).await.unwrap();

        let outcome = f
            .store
            .merge_remote(&remote("b1", 2, b"theirs", 5_000), remote_wins)
            .await
            .unwrap();

        let MergeOutcome::Resolved { record, conflict } = outcome else {
            panic!("expected conflict, got {outcome:?}");
        };
        assert_eq!(conflict.resolution, Resolution::RemoteWins);
        assert_eq!(&conflict.discarded.payload[..], b"mine");
        assert_eq!(&record.payload[..], b"theirs");
        assert_eq!(record.local_version, local.local_version);
        assert!(!record.is_pending());
    }

    #[tokio::test]
    async fn local_win_keeps_change_pending_on_new_base() {
        let f = fixture().await;
        f.store
            .merge_remote(&remote("b1", 1, b"base", 500), remote_wins)
            .await
            .unwrap();
        f.store.put("b1", b"mine".to_vec()).await.unwrap();

        let outcome = f
            .store
            .merge_remote(&remote("b1", 2, b"theirs", 600), local_wins)
            .await
            .unwrap();

        let MergeOutcome::Resolved { record, conflict } = outcome else {
            panic!("expected conflict, got {outcome:?}");
        };
        assert_eq!(conflict.resolution, Resolution::LocalWins);
        assert_eq!(&conflict.discarded.payload[..], b"theirs");
        assert_eq!(&record.payload[..], b"mine");
        assert_eq!(record.remote_version, Some(2));
        assert!(record.is_pending());
    }

    #[tokio::test]
    async fn mark_pushed_acknowledges_only_what_was_pushed() {
        let f = fixture().await;
        let v1 = f.store.put("b1", b"v1".to_vec()).await.unwrap();
        f.store.put("b1", b"v2".to_vec()).await.unwrap();

        assert!(f.store.mark_pushed(&"b1".into(), v1.local_version, 7).await.unwrap());
        let record = f.store.get(&"b1".into()).unwrap();
        assert_eq!(record.remote_version, Some(7));
        assert!(record.is_pending());

        f.store.mark_pushed(&"b1".into(), 2, 8).await.unwrap();
        assert!(f.store.pending().is_empty());
        assert!(!f.store.mark_pushed(&"ghost".into(), 1, 1).await.unwrap());
    }

    #[tokio::test]
    async fn purge_removes_only_old_acknowledged_tombstones() {
        let f = fixture().await;
        f.store.put("old", b"x".to_vec()).await.unwrap();
        f.store.put("unsynced", b"x".to_vec()).await.unwrap();
        f.store.soft_delete(&"old".into()).await.unwrap();
        f.store.soft_delete(&"unsynced".into()).await.unwrap();
        f.store.mark_pushed(&"old".into(), 2, 3).await.unwrap();

        f.clock.advance(Duration::from_secs(60));
        assert_eq!(f.store.purge_tombstones(Duration::from_secs(120)).await.unwrap(), 0);
        assert_eq!(f.store.purge_tombstones(Duration::from_secs(30)).await.unwrap(), 1);

        assert!(f.store.get(&"old".into()).is_none());
        assert!(f.store.get(&"unsynced".into()).is_some());
        assert!(f.storage.snapshot("records/books/old").is_none());

        // A purged id keeps counting from its last version.
        assert!(f.storage.snapshot("purged/books/old").is_some());
        let reborn = f.store.put("old", b"again".to_vec()).await.unwrap();
        assert_eq!(reborn.local_version, 3);
        assert_eq!(reborn.remote_version, None);
        assert!(reborn.is_pending());
        assert!(f.storage.snapshot("purged/books/old").is_none());
    }

    #[tokio::test]
    async fn version_floor_survives_reopen() {
        let f = fixture().await;
        f.store.put("gone", b"x".to_vec()).await.unwrap();
        f.store.put("gone", b"y".to_vec()).await.unwrap();
        f.store.soft_delete(&"gone".into()).await.unwrap();
        f.store.mark_pushed(&"gone".into(), 3, 9).await.unwrap();
        f.clock.advance(Duration::from_secs(60));
        assert_eq!(f.store.purge_tombstones(Duration::from_secs(1)).await.unwrap(), 1);

        let reopened = RecordStore::open(
            "books",
            f.storage.clone(),
            EventNotifier::new(),
            StoreOptions::new("phone"),
        )
        .await
        .unwrap();
        assert!(reopened.get(&"gone".into()).is_none());
        assert!(reopened.is_empty());

        let applied = reopened
            .merge_remote(&remote("gone", 12, b"from laptop", 5_000), remote_wins)
            .await
            .unwrap();
        let MergeOutcome::Applied(record) = applied else {
            panic!("expected applied, got {applied:?}");
        };
        assert_eq!(record.local_version, 3);
        assert!(!record.is_pending());

        let local = reopened.put("gone", b"mine".to_vec()).await.unwrap();
        assert_eq!(local.local_version, 4);
    }

    #[tokio::test]
    async fn reopening_restores_records() {
        let f = fixture().await;
        f.store.put("b1", b"kept".to_vec()).await.unwrap();
        f.store.soft_delete(&"b1".into()).await.unwrap();
        f.store.put("b2", b"also kept".to_vec()).await.unwrap();

        let reopened = RecordStore::open(
            "books",
            f.storage.clone(),
            EventNotifier::new(),
            StoreOptions::new("phone"),
        )
        .await
        .unwrap();
        assert_eq!(reopened.all(), f.store.all());
        assert_eq!(reopened.put("b2", b"next".to_vec()).await.unwrap().local_version, 2);
    }

    #[tokio::test]
    async fn corrupt_record_fails_open() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set("records/books/b1", b"\xff").await.unwrap();
        let err = RecordStore::open("books", storage, EventNotifier::new(), StoreOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Codec(_)));
    }

    #[tokio::test]
    async fn collections_do_not_see_each_other() {
        let f = fixture().await;
        let other = RecordStore::open(
            "notes",
            f.storage.clone(),
            f.notifier.clone(),
            StoreOptions::new("phone"),
        )
        .await
        .unwrap();
        f.store.put("same-id", b"book".to_vec()).await.unwrap();
        other.put("same-id", b"note".to_vec()).await.unwrap();

        assert_eq!(&f.store.get(&"same-id".into()).unwrap().payload[..], b"book");
        assert_eq!(&other.get(&"same-id".into()).unwrap().payload[..], b"note");
    }

    #[tokio::test]
    async fn writes_publish_change_events() {
        let f = fixture().await;
        let mut events = f.notifier.subscribe();

        f.store.put("b1", b"x".to_vec()).await.unwrap();
        f.store
            .merge_remote(&remote("b2", 1, b"y", 1), remote_wins)
            .await
            .unwrap();
        f.store.mark_pushed(&"b1".into(), 1, 1).await.unwrap();

        let mut seen = Vec::new();
        while let Some(event) = events.try_recv() {
            if let SyncEvent::RecordChanged { id, origin, .. } = event {
                seen.push((id.to_string(), origin));
            }
        }
        assert_eq!(
            seen,
            vec![
                ("b1".to_string(), ChangeOrigin::Local),
                ("b2".to_string(), ChangeOrigin::Remote),
            ]
        );
    }
}
