//! Cache entries and their durable encoding.

use crate::error::{CacheError, CacheResult};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A cached value together with its bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// The cache key.
    pub key: String,
    /// The cached bytes.
    pub value: Bytes,
    /// When the entry was first cached (ms since the Unix epoch).
    pub inserted_at: u64,
    /// When the entry was last read (ms since the Unix epoch).
    pub last_accessed_at: u64,
    /// Size accounted against the byte bounds.
    pub size_hint: usize,
}

impl CacheEntry {
    /// Creates an entry inserted at `at`.
    pub fn new(key: impl Into<String>, value: Bytes, at: u64) -> Self {
        Self {
            key: key.into(),
            size_hint: value.len(),
            value,
            inserted_at: at,
            last_accessed_at: at,
        }
    }

    /// Marks the entry as read at `at`.
    pub fn touch(&mut self, at: u64) {
        self.last_accessed_at = at.max(self.last_accessed_at);
    }
}

/// The on-disk form of an entry in the durable tier.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct StoredEntry {
    pub inserted_at: u64,
    pub last_accessed_at: u64,
    pub value: Bytes,
}

impl StoredEntry {
    pub fn from_entry(entry: &CacheEntry) -> Self {
        Self {
            inserted_at: entry.inserted_at,
            last_accessed_at: entry.last_accessed_at,
            value: entry.value.clone(),
        }
    }

    pub fn into_entry(self, key: &str) -> CacheEntry {
        CacheEntry {
            key: key.to_string(),
            size_hint: self.value.len(),
            value: self.value,
            inserted_at: self.inserted_at,
            last_accessed_at: self.last_accessed_at,
        }
    }

    pub fn encode(&self) -> CacheResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.value.len() + 32);
        ciborium::into_writer(self, &mut buf).map_err(|e| CacheError::Codec(e.to_string()))?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> CacheResult<Self> {
        ciborium::from_reader(bytes).map_err(|e| CacheError::Codec(e.to_string()))
    }
}
