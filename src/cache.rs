//! Bounded caches: insertion-order (LRU) eviction with an optional per-entry TTL.
//!
//! Two instances exist in the engine: the grammar cache (no TTL, capacity = language count,
//! see `chunker.rs`) and the query-embedding cache (modest TTL, see `retrieval.rs`).

use std::hash::Hash;
use std::time::{Duration, Instant};

use lru::LruCache;
use std::num::NonZeroUsize;

struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
}

/// An `lru::LruCache` wrapper that also expires entries after an optional TTL.
///
/// `lru` gives us the move-to-front-on-access/evict-least-recent-at-capacity discipline for
/// free; the TTL wrapper on top is this module's own addition (`lru` itself has no notion of
/// expiry).
pub struct TtlLruCache<K: Hash + Eq, V> {
    inner: LruCache<K, Entry<V>>,
    ttl: Option<Duration>,
}

impl<K: Hash + Eq, V> TtlLruCache<K, V> {
    /// `capacity` must be at least 1. `ttl = None` means entries never expire on their own
    /// (only eviction at capacity removes them) — used for the grammar cache.
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self {
            inner: LruCache::new(capacity),
            ttl,
        }
    }

    /// Returns `None` for a missing or expired key. A hit refreshes the key's recency.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let expired = matches!(
            self.inner.peek(key),
            Some(entry) if entry.expires_at.is_some_and(|at| Instant::now() >= at)
        );
        if expired {
            self.inner.pop(key);
            return None;
        }
        self.inner.get(key).map(|entry| &entry.value)
    }

    /// Insert or replace `key`. Evicts the least-recently-used entry if at capacity and
    /// `key` is new.
    pub fn put(&mut self, key: K, value: V) {
        let expires_at = self.ttl.map(|ttl| Instant::now() + ttl);
        self.inner.put(key, Entry { value, expires_at });
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.inner.pop(key).map(|entry| entry.value)
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lru_eviction_discipline() {
        let mut cache: TtlLruCache<&str, i32> = TtlLruCache::new(2, None);
        cache.put("a", 1);
        cache.put("b", 2);
        cache.put("c", 3); // evicts "a", the least-recently-used
        assert!(cache.get(&"a").is_none());
        assert_eq!(cache.get(&"b"), Some(&2));
        assert_eq!(cache.get(&"c"), Some(&3));
    }

    #[test]
    fn get_protects_from_eviction() {
        let mut cache: TtlLruCache<&str, i32> = TtlLruCache::new(2, None);
        cache.put("a", 1);
        cache.put("b", 2);
        cache.get(&"a"); // "a" is now most-recently-used
        cache.put("c", 3); // evicts "b", not "a"
        assert_eq!(cache.get(&"a"), Some(&1));
        assert!(cache.get(&"b").is_none());
    }

    #[test]
    fn ttl_expiry() {
        let mut cache: TtlLruCache<&str, i32> =
            TtlLruCache::new(4, Some(Duration::from_millis(10)));
        cache.put("a", 1);
        assert_eq!(cache.get(&"a"), Some(&1));
        std::thread::sleep(Duration::from_millis(25));
        assert!(cache.get(&"a").is_none());
    }

    #[test]
    fn clear_and_remove() {
        let mut cache: TtlLruCache<&str, i32> = TtlLruCache::new(4, None);
        cache.put("a", 1);
        cache.put("b", 2);
        assert_eq!(cache.remove(&"a"), Some(1));
        assert!(cache.get(&"a").is_none());
        cache.clear();
        assert!(cache.is_empty());
    }
}
