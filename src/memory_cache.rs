//! In-memory tier: bounded LRU with per-entry TTL.
//!
//! Modeled on the teacher's `CacheBackend`/`CacheStats` pair
//! (`examples/Heyoub-caliber/caliber-storage/src/cache/traits.rs`), but
//! backed by the `lru` crate instead of a hand-rolled intrusive list —
//! eviction order and O(1) get/put are exactly what that crate is for.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use std::num::NonZeroUsize;
use tracing::trace;

use crate::error::ConfigError;
use crate::key::CacheKey;

struct Entry<V> {
    value: V,
    written_at: Instant,
}

/// Point-in-time counters for a [`MemoryCache`], mirroring the teacher's
/// `CacheStats` (hit/miss/entry_count/evictions plus a derived hit rate).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions_capacity: u64,
    pub evictions_ttl: u64,
    pub entry_count: usize,
}

impl MemoryCacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Inner<K, V> {
    entries: LruCache<K, Entry<V>>,
    stats: MemoryCacheStats,
}

/// Bounded, TTL-aware in-memory cache tier.
///
/// `get` treats an entry older than `ttl` as a miss and evicts it; `put`
/// always refreshes `written_at`. Internal state is guarded by a
/// synchronous `Mutex` since no branch ever awaits while holding it.
pub struct MemoryCache<K, V>
where
    K: CacheKey,
    V: Clone + Send + Sync + 'static,
{
    inner: Mutex<Inner<K, V>>,
    ttl: Duration,
}

impl<K, V> MemoryCache<K, V>
where
    K: CacheKey,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(capacity: usize, ttl: Duration) -> Result<Self, ConfigError> {
        let capacity = NonZeroUsize::new(capacity).ok_or(ConfigError::ZeroMemoryCapacity(capacity))?;
        if ttl.is_zero() {
            return Err(ConfigError::NonPositiveMemoryTtl);
        }
        Ok(Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                stats: MemoryCacheStats::default(),
            }),
            ttl,
        })
    }

    /// Returns the value and its age if present and not expired.
    pub fn get(&self, key: &K) -> Option<(V, Duration)> {
        let mut inner = self.inner.lock().expect("memory cache mutex poisoned");
        let ttl = self.ttl;
        let expired = match inner.entries.peek(key) {
            Some(entry) => entry.written_at.elapsed() > ttl,
            None => {
                inner.stats.misses += 1;
                return None;
            }
        };
        if expired {
            inner.entries.pop(key);
            inner.stats.misses += 1;
            inner.stats.evictions_ttl += 1;
            inner.stats.entry_count = inner.entries.len();
            trace!(namespace = key.namespace(), key_hash = key.stable_hash(), reason = "ttl", "memory cache entry evicted");
            return None;
        }
        let entry = inner.entries.get(key).expect("checked above");
        let age = entry.written_at.elapsed();
        let value = entry.value.clone();
        inner.stats.hits += 1;
        Some((value, age))
    }

    pub fn put(&self, key: K, value: V) {
        let mut inner = self.inner.lock().expect("memory cache mutex poisoned");
        let evicted = inner.entries.put(
            key,
            Entry {
                value,
                written_at: Instant::now(),
            },
        );
        if evicted.is_some() {
            inner.stats.evictions_capacity += 1;
            trace!(reason = "capacity", "memory cache entry evicted");
        }
        inner.stats.entry_count = inner.entries.len();
    }

    pub fn remove(&self, key: &K) {
        let mut inner = self.inner.lock().expect("memory cache mutex poisoned");
        inner.entries.pop(key);
        inner.stats.entry_count = inner.entries.len();
    }

    /// Evict every entry whose key belongs to `namespace`, for scoped
    /// invalidation (spec §4.8 `invalidateNamespace`).
    pub fn remove_namespace(&self, namespace: &str) {
        let mut inner = self.inner.lock().expect("memory cache mutex poisoned");
        let stale: Vec<K> = inner
            .entries
            .iter()
            .filter(|(k, _)| k.namespace() == namespace)
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            inner.entries.pop(&key);
        }
        inner.stats.entry_count = inner.entries.len();
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("memory cache mutex poisoned");
        inner.entries.clear();
        inner.stats.entry_count = 0;
    }

    pub fn stats(&self) -> MemoryCacheStats {
        self.inner.lock().expect("memory cache mutex poisoned").stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Key;
    use std::thread::sleep;

    #[test]
    fn miss_then_hit() {
        let cache: MemoryCache<Key, i32> = MemoryCache::new(4, Duration::from_secs(60)).unwrap();
        let k = Key::by_id("ns", "T", "1");
        assert!(cache.get(&k).is_none());
        cache.put(k.clone(), 7);
        let (v, age) = cache.get(&k).unwrap();
        assert_eq!(v, 7);
        assert!(age < Duration::from_secs(1));
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn ttl_expiry_evicts() {
        let cache: MemoryCache<Key, i32> = MemoryCache::new(4, Duration::from_millis(10)).unwrap();
        let k = Key::by_id("ns", "T", "1");
        cache.put(k.clone(), 1);
        sleep(Duration::from_millis(30));
        assert!(cache.get(&k).is_none());
        assert_eq!(cache.stats().evictions_ttl, 1);
    }

    #[test]
    fn capacity_eviction_is_lru() {
        let cache: MemoryCache<Key, i32> = MemoryCache::new(2, Duration::from_secs(60)).unwrap();
        let k1 = Key::by_id("ns", "T", "1");
        let k2 = Key::by_id("ns", "T", "2");
        let k3 = Key::by_id("ns", "T", "3");
        cache.put(k1.clone(), 1);
        cache.put(k2.clone(), 2);
        cache.put(k3.clone(), 3);
        assert!(cache.get(&k1).is_none(), "k1 should have been evicted as least recently used");
        assert!(cache.get(&k2).is_some());
        assert!(cache.get(&k3).is_some());
        assert_eq!(cache.stats().evictions_capacity, 1);
    }

    #[test]
    fn remove_namespace_evicts_only_matching_keys() {
        let cache: MemoryCache<Key, i32> = MemoryCache::new(8, Duration::from_secs(60)).unwrap();
        let users1 = Key::by_id("users", "T", "1");
        let users2 = Key::by_id("users", "T", "2");
        let posts1 = Key::by_id("posts", "T", "1");
        cache.put(users1.clone(), 1);
        cache.put(users2.clone(), 2);
        cache.put(posts1.clone(), 3);

        cache.remove_namespace("users");

        assert!(cache.get(&users1).is_none());
        assert!(cache.get(&users2).is_none());
        assert!(cache.get(&posts1).is_some());
    }

    #[test]
    fn rejects_zero_capacity_and_ttl() {
        assert!(MemoryCache::<Key, i32>::new(0, Duration::from_secs(1)).is_err());
        assert!(MemoryCache::<Key, i32>::new(1, Duration::ZERO).is_err());
    }
}
