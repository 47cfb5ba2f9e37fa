//! The record model shared by the store and the sync engine.

use crate::types::{RecordId, Timestamp};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A locally stored record.
///
/// Version fields are owned by the store: values supplied by callers of
/// [`RecordStore::upsert`](crate::RecordStore::upsert) are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Stable identifier.
    pub id: RecordId,
    /// Opaque application payload. Empty for tombstones.
    pub payload: Bytes,
    /// Incremented on every local mutation; never decreases.
    pub local_version: u64,
    /// Last version seen from the remote, `None` if never synced.
    pub remote_version: Option<u64>,
    /// The `local_version` last acknowledged by the remote.
    pub synced_local_version: u64,
    /// Wall-clock time of the last write.
    pub updated_at: Timestamp,
    /// Tombstone flag.
    pub deleted: bool,
    /// Device id of the last writer.
    pub origin: String,
}

impl Record {
    /// Creates an unsaved record with the given payload.
    pub fn new(id: impl Into<RecordId>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
            local_version: 0,
            remote_version: None,
            synced_local_version: 0,
            updated_at: Timestamp::ZERO,
            deleted: false,
            origin: String::new(),
        }
    }

    /// Returns true if this record has local changes the remote hasn't acknowledged.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.local_version > self.synced_local_version
    }

    /// Returns the conflict-relevant view of this record.
    #[must_use]
    pub fn value(&self) -> RecordValue {
        RecordValue {
            payload: self.payload.clone(),
            deleted: self.deleted,
            updated_at: self.updated_at,
            origin: self.origin.clone(),
        }
    }
}

/// A record as the remote store knows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRecord {
    /// Stable identifier.
    pub id: RecordId,
    /// Server-assigned version, strictly increasing per id.
    pub version: u64,
    /// Opaque application payload. Empty for tombstones.
    pub payload: Bytes,
    /// Tombstone flag.
    pub deleted: bool,
    /// Wall-clock time of the write, as stamped by the writer.
    pub updated_at: Timestamp,
    /// Device id of the writer.
    pub origin: String,
}

impl RemoteRecord {
    /// Returns the conflict-relevant view of this record.
    #[must_use]
    pub fn value(&self) -> RecordValue {
        RecordValue {
            payload: self.payload.clone(),
            deleted: self.deleted,
            updated_at: self.updated_at,
            origin: self.origin.clone(),
        }
    }
}

/// One side of a conflict: everything but the version bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordValue {
    /// Payload bytes. Empty for tombstones.
    pub payload: Bytes,
    /// Tombstone flag.
    pub deleted: bool,
    /// Wall-clock time of the write.
    pub updated_at: Timestamp,
    /// Device id of the writer.
    pub origin: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{from_cbor, to_cbor};

    #[test]
    fn pending_tracks_acknowledged_version() {
        let mut record = Record::new("r1", b"x".to_vec());
        assert!(!record.is_pending());
        record.local_version = 3;
        record.synced_local_version = 2;
        assert!(record.is_pending());
        record.synced_local_version = 3;
        assert!(!record.is_pending());
    }

    #[test]
    fn record_survives_cbor() {
        let mut record = Record::new("chapter-9", b"It was a dark and stormy night".to_vec());
        record.local_version = 4;
        record.remote_version = Some(17);
        record.updated_at = Timestamp::from_millis(1_700_000_000_000);
        record.origin = "tablet".into();

        let decoded: Record = from_cbor(&to_cbor(&record).unwrap()).unwrap();
        assert_eq!(decoded, record);
    }
}
