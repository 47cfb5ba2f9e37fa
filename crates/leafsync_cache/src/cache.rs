//! The two-tier bounded cache.

use crate::config::CacheConfig;
use crate::entry::{CacheEntry, StoredEntry};
use crate::error::{CacheError, CacheResult, LoaderError};
use crate::lru_tier::BoundedLru;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use leafsync_storage::Storage;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

type LoadFuture = Shared<BoxFuture<'static, CacheResult<Bytes>>>;

/// Counters describing cache effectiveness.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups served by the memory tier.
    pub memory_hits: u64,
    /// Lookups served by the durable tier.
    pub durable_hits: u64,
    /// Loader invocations.
    pub loads: u64,
    /// Loader invocations that failed.
    pub load_failures: u64,
    /// Entries evicted from the memory tier.
    pub evictions: u64,
    /// Entries evicted from the durable tier.
    pub durable_evictions: u64,
    /// Entries currently in the memory tier.
    pub memory_entries: usize,
    /// Bytes currently in the memory tier.
    pub memory_bytes: usize,
    /// Bytes currently in the durable tier.
    pub durable_bytes: usize,
}

#[derive(Default)]
struct Counters {
    memory_hits: AtomicU64,
    durable_hits: AtomicU64,
    loads: AtomicU64,
    load_failures: AtomicU64,
    evictions: AtomicU64,
    durable_evictions: AtomicU64,
}

struct Inner {
    memory: Mutex<BoundedLru<CacheEntry>>,
    durable: Arc<dyn Storage>,
    /// Sizes of the values in `durable`, in durable LRU order.
    durable_index: Mutex<BoundedLru<()>>,
    /// Loads in progress. Invalidation removes a key's entry, which stops
    /// its load from caching the result.
    in_flight: Mutex<HashMap<String, (u64, LoadFuture)>>,
    next_generation: AtomicU64,
    /// Last access stamp handed out. Stamps are wall-clock milliseconds
    /// bumped to stay unique, so they order accesses across restarts.
    last_stamp: AtomicU64,
    counters: Counters,
}

enum Lookup {
    Hit(Bytes, Option<CacheEntry>),
    Load(u64, LoadFuture),
}

/// A capacity-limited cache with a memory tier and a durable tier.
///
/// Cloning is cheap; clones share the same tiers.
///
/// # Single-flight
///
/// Concurrent [`fetch_or_load`](Self::fetch_or_load) calls for a key that is
/// not in memory register in an in-flight table; the first caller's load
/// checks the durable tier, runs its loader only on a miss there, and every
/// caller awaits the result.
///
/// # Access order
///
/// Reads that change a key's position in the durable LRU order write the
/// new access time back to the durable tier, so the order survives a
/// restart. Repeated reads of the most recent key write nothing.
#[derive(Clone)]
pub struct BoundedCache {
    inner: Arc<Inner>,
}

impl BoundedCache {
    /// Opens a cache whose durable tier lives in `durable`.
    ///
    /// `durable` should be dedicated to the cache (typically a
    /// [`leafsync_storage::PrefixedStorage`]); entries already present are
    /// indexed in last-access order and trimmed to the durable byte bound.
    ///
    /// # Errors
    ///
    /// Returns an error if the durable tier can't be listed or read.
    pub async fn open(config: CacheConfig, durable: Arc<dyn Storage>) -> CacheResult<Self> {
        let mut found = Vec::new();
        for key in durable.keys("").await? {
            let Some(bytes) = durable.get(&key).await? else {
                continue;
            };
            match StoredEntry::decode(&bytes) {
                Ok(stored) => found.push((key, stored)),
                Err(err) => {
                    warn!(%key, error = %err, "dropping unreadable cache entry");
                    durable.delete(&key).await?;
                }
            }
        }
        found.sort_by_key(|(_, s)| (s.last_accessed_at, s.inserted_at));
        let last_stamp = found
            .iter()
            .map(|(_, s)| s.last_accessed_at.max(s.inserted_at))
            .max()
            .unwrap_or(0);

        let mut index = BoundedLru::new(usize::MAX, config.durable_max_bytes);
        let mut overflow = Vec::new();
        for (key, stored) in found {
            overflow.extend(index.put(key, (), stored.value.len()));
        }
        for (key, ()) in &overflow {
            durable.delete(key).await?;
        }
        debug!(
            entries = index.len(),
            bytes = index.bytes(),
            trimmed = overflow.len(),
            "opened cache"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                memory: Mutex::new(BoundedLru::new(config.max_entries, config.max_bytes)),
                durable,
                durable_index: Mutex::new(index),
                in_flight: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                last_stamp: AtomicU64::new(last_stamp),
                counters: Counters::default(),
            }),
        })
    }

    /// Returns the cached value for `key`, loading it on a miss.
    ///
    /// The memory tier is checked first, then the durable tier, then
    /// `loader` runs and its value is written to both tiers. `loader` is
    /// dropped without being called if the value is cached or another
    /// caller is already loading the same key.
    ///
    /// Durable-tier failures are logged and treated as misses.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Load`] if the loader fails; all coalesced
    /// callers receive the same error.
    pub async fn fetch_or_load<F, Fut, V, E>(&self, key: &str, loader: F) -> CacheResult<Bytes>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        V: Into<Bytes> + Send + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>> + Send + 'static,
    {
        if let Some((value, reordered)) = self.inner.memory_hit(key) {
            self.inner.persist_access(reordered).await;
            return Ok(value);
        }

        let lookup = {
            let mut table = self.inner.in_flight.lock();
            if let Some((generation, load)) = table.get(key) {
                debug!(%key, "joining in-flight load");
                Lookup::Load(*generation, load.clone())
            } else if let Some((value, reordered)) = self.inner.memory_hit(key) {
                // A load finished between the first check and taking the lock.
                Lookup::Hit(value, reordered)
            } else {
                let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                let inner = Arc::clone(&self.inner);
                let owned_key = key.to_string();
                let load = async move {
                    let produce = move || async move {
                        loader().await.map(Into::into).map_err(|e| {
                            let boxed: Box<dyn std::error::Error + Send + Sync> = e.into();
                            LoaderError::from(boxed)
                        })
                    };
                    inner.load_through(owned_key, generation, produce).await
                }
                .boxed()
                .shared();
                table.insert(key.to_string(), (generation, load.clone()));
                Lookup::Load(generation, load)
            }
        };

        let (generation, load) = match lookup {
            Lookup::Hit(value, reordered) => {
                self.inner.persist_access(reordered).await;
                return Ok(value);
            }
            Lookup::Load(generation, load) => (generation, load),
        };

        let result = load.await;

        let mut table = self.inner.in_flight.lock();
        if matches!(table.get(key), Some((g, _)) if *g == generation) {
            table.remove(key);
        }
        result
    }

    /// Removes `key` from both tiers.
    ///
    /// Callers already waiting on a load of `key` still receive its result,
    /// but the result isn't cached; later callers start a fresh load.
    ///
    /// # Errors
    ///
    /// Returns an error if the durable tier fails.
    pub async fn invalidate(&self, key: &str) -> CacheResult<()> {
        self.inner.in_flight.lock().remove(key);
        self.inner.memory.lock().pop(key);
        self.inner.durable_index.lock().pop(key);
        self.inner.durable.delete(key).await?;
        Ok(())
    }

    /// Removes every entry from both tiers and detaches in-flight loads as
    /// [`invalidate`](Self::invalidate) does.
    ///
    /// # Errors
    ///
    /// Returns an error if the durable tier fails.
    pub async fn invalidate_all(&self) -> CacheResult<()> {
        self.inner.in_flight.lock().clear();
        self.inner.memory.lock().clear();
        self.inner.durable_index.lock().clear();
        for key in self.inner.durable.keys("").await? {
            self.inner.durable.delete(&key).await?;
        }
        Ok(())
    }

    /// Changes the memory tier bounds, evicting immediately if needed.
    pub fn configure(&self, max_entries: usize, max_bytes: usize) {
        let evicted = self.inner.memory.lock().set_bounds(max_entries, max_bytes);
        self.inner
            .counters
            .evictions
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        debug!(max_entries, max_bytes, evicted = evicted.len(), "reconfigured cache");
    }

    /// Returns true if `key` is currently held in the memory tier.
    ///
    /// Does not count as an access.
    #[must_use]
    pub fn contains_in_memory(&self, key: &str) -> bool {
        self.inner.memory.lock().contains(key)
    }

    /// Returns a snapshot of the cache counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        let (memory_entries, memory_bytes) = {
            let memory = self.inner.memory.lock();
            (memory.len(), memory.bytes())
        };
        CacheStats {
            memory_hits: c.memory_hits.load(Ordering::Relaxed),
            durable_hits: c.durable_hits.load(Ordering::Relaxed),
            loads: c.loads.load(Ordering::Relaxed),
            load_failures: c.load_failures.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            durable_evictions: c.durable_evictions.load(Ordering::Relaxed),
            memory_entries,
            memory_bytes,
            durable_bytes: self.inner.durable_index.lock().bytes(),
        }
    }
}

impl std::fmt::Debug for BoundedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedCache")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn stamp(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let bump = |last: u64| now.max(last.saturating_add(1));
        match self
            .last_stamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(bump(last)))
        {
            Ok(last) | Err(last) => bump(last),
        }
    }

    /// Serves `key` from memory. The entry is returned alongside the value
    /// when the read moved it up the durable order.
    fn memory_hit(&self, key: &str) -> Option<(Bytes, Option<CacheEntry>)> {
        let stamp = self.stamp();
        let entry = {
            let mut memory = self.memory.lock();
            let entry = memory.get(key)?;
            entry.touch(stamp);
            entry.clone()
        };
        let reordered = {
            let mut index = self.durable_index.lock();
            let reordered = index.contains(key) && !index.is_newest(key);
            index.get(key);
            reordered
        };
        self.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
        Some((entry.value.clone(), reordered.then_some(entry)))
    }

    async fn load_through<L, P>(&self, key: String, generation: u64, loader: L) -> CacheResult<Bytes>
    where
        L: FnOnce() -> P,
        P: Future<Output = Result<Bytes, LoaderError>>,
    {
        if let Some(entry) = self.durable_lookup(&key).await {
            self.counters.durable_hits.fetch_add(1, Ordering::Relaxed);
            let value = entry.value.clone();
            self.persist_access(Some(entry.clone())).await;
            self.settle(&key, generation, entry, true).await;
            return Ok(value);
        }

        self.counters.loads.fetch_add(1, Ordering::Relaxed);
        let value = match loader().await {
            Ok(value) => value,
            Err(source) => {
                self.counters.load_failures.fetch_add(1, Ordering::Relaxed);
                warn!(%key, error = %source, "cache loader failed");
                return Err(CacheError::Load { key, source });
            }
        };

        let entry = CacheEntry::new(key.clone(), value.clone(), self.stamp());
        let wrote = self.is_current(&key, generation) && self.store_durable(&entry).await;
        self.settle(&key, generation, entry, wrote).await;
        Ok(value)
    }

    fn is_current(&self, key: &str, generation: u64) -> bool {
        matches!(self.in_flight.lock().get(key), Some((g, _)) if *g == generation)
    }

    /// Puts a fetched entry in memory unless `key` was invalidated while it
    /// was being fetched. In that case a durable copy this load `wrote` is
    /// removed, unless a newer load already owns the key.
    async fn settle(&self, key: &str, generation: u64, entry: CacheEntry, wrote: bool) {
        let current = {
            let table = self.in_flight.lock();
            let current = matches!(table.get(key), Some((g, _)) if *g == generation);
            if current {
                self.insert_memory(entry);
            }
            current
        };
        if current {
            return;
        }
        debug!(%key, "load invalidated while in flight, not caching");
        let reloading = self.in_flight.lock().contains_key(key);
        let superseded = reloading || self.memory.lock().contains(key);
        if wrote && !superseded {
            self.forget_durable(key).await;
        }
    }

    async fn durable_lookup(&self, key: &str) -> Option<CacheEntry> {
        let bytes = match self.durable.get(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(err) => {
                warn!(%key, error = %err, "durable cache read failed");
                return None;
            }
        };
        match StoredEntry::decode(&bytes) {
            Ok(stored) => {
                let mut entry = stored.into_entry(key);
                entry.touch(self.stamp());
                self.track_durable(key.to_string(), entry.size_hint).await;
                Some(entry)
            }
            Err(err) => {
                warn!(%key, error = %err, "discarding unreadable durable cache entry");
                self.forget_durable(key).await;
                None
            }
        }
    }

    async fn write_durable(&self, entry: &CacheEntry) -> bool {
        let encoded = match StoredEntry::from_entry(entry).encode() {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(key = %entry.key, error = %err, "cache entry encode failed");
                return false;
            }
        };
        if let Err(err) = self.durable.set(&entry.key, &encoded).await {
            warn!(key = %entry.key, error = %err, "durable cache write failed");
            return false;
        }
        true
    }

    async fn store_durable(&self, entry: &CacheEntry) -> bool {
        if !self.write_durable(entry).await {
            return false;
        }
        self.track_durable(entry.key.clone(), entry.size_hint).await;
        true
    }

    /// Rewrites an indexed durable entry with its new access time.
    async fn persist_access(&self, entry: Option<CacheEntry>) {
        let Some(entry) = entry else {
            return;
        };
        if !self.write_durable(&entry).await {
            return;
        }
        // Evicted or invalidated during the write: don't resurrect it.
        let still_indexed = self.durable_index.lock().contains(&entry.key);
        if !still_indexed {
            self.forget_durable(&entry.key).await;
        }
    }

    async fn forget_durable(&self, key: &str) {
        self.durable_index.lock().pop(key);
        if let Err(err) = self.durable.delete(key).await {
            warn!(%key, error = %err, "durable cache delete failed");
        }
    }

    /// Records `key` in the durable index and deletes whatever it pushes out.
    async fn track_durable(&self, key: String, size: usize) {
        let evicted = self.durable_index.lock().put(key, (), size);
        self.counters
            .durable_evictions
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        for (key, ()) in evicted {
            debug!(%key, "evicting from durable cache");
            if let Err(err) = self.durable.delete(&key).await {
                warn!(%key, error = %err, "durable cache delete failed");
            }
        }
    }

    fn insert_memory(&self, entry: CacheEntry) {
        let size = entry.size_hint;
        let evicted = self.memory.lock().put(entry.key.clone(), entry, size);
        if !evicted.is_empty() {
            self.counters
                .evictions
                .fetch_add(evicted.len() as u64, Ordering::Relaxed);
            debug!(
                evicted = ?evicted.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
                "evicted from memory cache"
            );
        }
    }
}
