//! Size-accounted LRU used by both cache tiers.

use lru::LruCache;

/// An LRU map bounded by entry count and by the sum of per-entry sizes.
///
/// Insertion counts as an access, so entries that were never read are
/// evicted in insertion order.
pub(crate) struct BoundedLru<V> {
    entries: LruCache<String, (V, usize)>,
    bytes: usize,
    max_entries: usize,
    max_bytes: usize,
}

impl<V> BoundedLru<V> {
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            entries: LruCache::unbounded(),
            bytes: 0,
            max_entries,
            max_bytes,
        }
    }

    /// Looks up `key` and marks it most recently used.
    pub fn get(&mut self, key: &str) -> Option<&mut V> {
        self.entries.get_mut(key).map(|(v, _)| v)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains(key)
    }

    /// Returns true if `key` is the most recently used entry.
    pub fn is_newest(&self, key: &str) -> bool {
        self.entries.iter().next().is_some_and(|(k, _)| k == key)
    }

    /// Inserts or replaces `key`, then evicts until within bounds.
    ///
    /// Returns the evicted entries, least recently used first. An entry
    /// larger than the byte bound evicts everything, itself included.
    pub fn put(&mut self, key: String, value: V, size: usize) -> Vec<(String, V)> {
        if let Some((_, old_size)) = self.entries.put(key, (value, size)) {
            self.bytes -= old_size;
        }
        self.bytes += size;
        self.evict_overflow()
    }

    pub fn pop(&mut self, key: &str) -> Option<V> {
        self.entries.pop(key).map(|(v, size)| {
            self.bytes -= size;
            v
        })
    }

    pub fn set_bounds(&mut self, max_entries: usize, max_bytes: usize) -> Vec<(String, V)> {
        self.max_entries = max_entries;
        self.max_bytes = max_bytes;
        self.evict_overflow()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Keys from least to most recently used.
    #[cfg(test)]
    pub fn keys_lru_first(&self) -> Vec<String> {
        self.entries.iter().rev().map(|(k, _)| k.clone()).collect()
    }

    fn evict_overflow(&mut self) -> Vec<(String, V)> {
        let mut evicted = Vec::new();
        while self.entries.len() > self.max_entries || self.bytes > self.max_bytes {
            let Some((key, (value, size))) = self.entries.pop_lru() else {
                break;
            };
            self.bytes -= size;
            evicted.push((key, value));
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(evicted: &[(String, u8)]) -> Vec<&str> {
        evicted.iter().map(|(k, _)| k.as_str()).collect()
    }

    #[test]
    fn evicts_in_insertion_order_when_untouched() {
        let mut lru = BoundedLru::new(2, usize::MAX);
        assert!(lru.put("a".into(), 1, 1).is_empty());
        assert!(lru.put("b".into(), 2, 1).is_empty());
        let evicted = lru.put("c".into(), 3, 1);
        assert_eq!(keys(&evicted), vec!["a"]);
        assert_eq!(lru.keys_lru_first(), vec!["b", "c"]);
    }

    #[test]
    fn access_protects_from_eviction() {
        let mut lru = BoundedLru::new(2, usize::MAX);
        lru.put("a".into(), 1, 1);
        lru.put("b".into(), 2, 1);
        assert!(lru.is_newest("b"));
        lru.get("a");
        assert!(lru.is_newest("a"));
        let evicted = lru.put("c".into(), 3, 1);
        assert_eq!(keys(&evicted), vec!["b"]);
        assert!(lru.contains("a"));
    }

    #[test]
    fn byte_bound_evicts_several() {
        let mut lru = BoundedLru::new(100, 10);
        lru.put("a".into(), 1, 4);
        lru.put("b".into(), 2, 4);
        let evicted = lru.put("c".into(), 3, 8);
        assert_eq!(keys(&evicted), vec!["a", "b"]);
        assert_eq!(lru.bytes(), 8);
    }

    #[test]
    fn replacing_adjusts_bytes() {
        let mut lru = BoundedLru::new(10, 100);
        lru.put("a".into(), 1, 40);
        lru.put("a".into(), 2, 10);
        assert_eq!(lru.bytes(), 10);
        assert_eq!(lru.len(), 1);
        assert_eq!(lru.get("a").copied(), Some(2));
    }

    #[test]
    fn oversized_entry_is_not_kept() {
        let mut lru = BoundedLru::new(10, 5);
        let evicted = lru.put("huge".into(), 1, 6);
        assert_eq!(keys(&evicted), vec!["huge"]);
        assert_eq!(lru.len(), 0);
        assert_eq!(lru.bytes(), 0);
    }

    #[test]
    fn shrinking_bounds_evicts() {
        let mut lru = BoundedLru::new(3, usize::MAX);
        lru.put("a".into(), 1, 1);
        lru.put("b".into(), 2, 1);
        lru.put("c".into(), 3, 1);
        let evicted = lru.set_bounds(1, usize::MAX);
        assert_eq!(keys(&evicted), vec!["a", "b"]);
    }

    #[test]
    fn pop_and_clear() {
        let mut lru = BoundedLru::new(3, 100);
        lru.put("a".into(), 1, 5);
        assert_eq!(lru.pop("a"), Some(1));
        assert_eq!(lru.bytes(), 0);
        lru.put("b".into(), 2, 5);
        lru.clear();
        assert_eq!(lru.len(), 0);
        assert_eq!(lru.bytes(), 0);
    }
}
