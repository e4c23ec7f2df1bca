//! Bounded per-key async mutex registry.
//!
//! Mirrors the get-or-create pattern the teacher uses for per-client rate
//! limiters (`examples/Heyoub-caliber/caliber-api/src/middleware/auth.rs`,
//! `RateLimitState` over `DashMap::entry().or_insert_with`), but the LRU
//! bound here needs exclusive access to reshuffle recency order on every
//! lookup, so it is kept behind a plain `std::sync::Mutex` rather than
//! `DashMap`.
//!
//! Evicting a key from the registry only drops the registry's own `Arc`
//! reference to that key's mutex; a caller already holding an
//! `OwnedMutexGuard` keeps the mutex alive independently via its own `Arc`
//! clone, so eviction never invalidates a lock someone is holding.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::ConfigError;
use crate::key::CacheKey;

pub struct KeyMutex<K: CacheKey> {
    locks: Mutex<LruCache<K, Arc<AsyncMutex<()>>>>,
}

impl<K: CacheKey> KeyMutex<K> {
    pub fn new(capacity: usize) -> Result<Self, ConfigError> {
        let capacity = NonZeroUsize::new(capacity).ok_or(ConfigError::ZeroKeyMutexCapacity(capacity))?;
        Ok(Self {
            locks: Mutex::new(LruCache::new(capacity)),
        })
    }

    fn handle(&self, key: &K) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().expect("key mutex registry poisoned");
        if let Some(existing) = locks.get(key) {
            return Arc::clone(existing);
        }
        let fresh = Arc::new(AsyncMutex::new(()));
        locks.put(key.clone(), Arc::clone(&fresh));
        fresh
    }

    /// Acquire the mutex for `key`, creating its entry if needed.
    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        let mutex = self.handle(key);
        mutex.lock_owned().await
    }

    pub fn live_count(&self) -> usize {
        self.locks.lock().expect("key mutex registry poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Key;

    #[tokio::test]
    async fn serializes_access_to_the_same_key() {
        let registry: KeyMutex<Key> = KeyMutex::new(8).unwrap();
        let k = Key::by_id("ns", "T", "1");
        let guard = registry.lock(&k).await;
        assert_eq!(registry.live_count(), 1);
        drop(guard);
        let _guard2 = registry.lock(&k).await;
    }

    #[tokio::test]
    async fn eviction_does_not_invalidate_a_held_guard() {
        let registry: KeyMutex<Key> = KeyMutex::new(1).unwrap();
        let k1 = Key::by_id("ns", "T", "1");
        let k2 = Key::by_id("ns", "T", "2");
        let guard1 = registry.lock(&k1).await;
        // Evicts k1's registry entry, but `guard1` still owns its Arc.
        let _guard2 = registry.lock(&k2).await;
        assert_eq!(registry.live_count(), 1);
        drop(guard1);
    }

    #[test]
    fn rejects_zero_capacity() {
        assert!(KeyMutex::<Key>::new(0).is_err());
    }
}
