//! TTL map with background eviction.
//!
//! `put` stamps each entry with `now + ttl`; a background worker wakes
//! every `ttl` and removes entries a full ttl past their stamp. The worker
//! is the sole deletion authority: `get` may return a past-due entry
//! between sweeps, and `keys()` lists exactly the keys still in the map.
//! The worker holds a weak reference, so dropping the last cache handle
//! ends it.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use tracing::debug;

struct CacheEntry<T> {
    expires_at: Instant,
    value: T,
}

type Shard<T> = RwLock<HashMap<String, CacheEntry<T>>>;

pub struct Cache<T> {
    ttl: Duration,
    map: Arc<Shard<T>>,
}

impl<T: Clone + Send + Sync + 'static> Cache<T> {
    /// Create a cache and launch its eviction worker.
    pub fn new(ttl: Duration) -> Self {
        let map: Arc<Shard<T>> = Arc::new(RwLock::new(HashMap::new()));
        let cache = Cache { ttl, map };
        cache.spawn_evictor();
        cache
    }

    pub fn put(&self, key: &str, value: T) {
        let entry = CacheEntry {
            expires_at: Instant::now() + self.ttl,
            value,
        };
        self.map
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), entry);
    }

    /// Lookup by key. Whatever is still in the map is returned; expiry is
    /// the eviction worker's business.
    pub fn get(&self, key: &str) -> Option<T> {
        self.map
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|entry| entry.value.clone())
    }

    pub fn remove(&self, key: &str) -> Option<T> {
        self.map
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .map(|entry| entry.value)
    }

    /// Keys currently in the map.
    pub fn keys(&self) -> Vec<String> {
        self.map
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.map.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn spawn_evictor(&self) {
        let ttl = self.ttl;
        let map: Weak<Shard<T>> = Arc::downgrade(&self.map);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(ttl).await;
                let Some(map) = map.upgrade() else {
                    return; // cache dropped
                };
                let cutoff = Instant::now();
                let mut map = map.write().unwrap_or_else(PoisonError::into_inner);
                let before = map.len();
                map.retain(|_, entry| entry.expires_at + ttl > cutoff);
                let evicted = before - map.len();
                if evicted > 0 {
                    debug!(evicted, "cache eviction pass");
                }
            }
        });
    }
}

impl<T: Clone + Send + Sync + 'static> Clone for Cache<T> {
    fn clone(&self) -> Self {
        Cache {
            ttl: self.ttl,
            map: self.map.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_within_ttl_returns_the_value() {
        let cache: Cache<String> = Cache::new(Duration::from_millis(200));
        cache.put("k", "v".to_string());
        assert_eq!(cache.get("k").unwrap(), "v");
        assert_eq!(cache.keys(), vec!["k"]);
    }

    #[tokio::test]
    async fn eviction_removes_entries_after_two_ttls() {
        let cache: Cache<u32> = Cache::new(Duration::from_millis(40));
        cache.put("gone", 1);
        tokio::time::sleep(Duration::from_millis(140)).await;
        assert!(cache.get("gone").is_none());
        assert!(cache.keys().is_empty());
    }

    #[tokio::test]
    async fn refreshing_a_key_restarts_its_clock() {
        let cache: Cache<u32> = Cache::new(Duration::from_millis(60));
        cache.put("k", 1);
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cache.put("k", 2);
        }
        assert_eq!(cache.get("k").unwrap(), 2);
    }

    #[tokio::test]
    async fn keys_only_lists_entries_still_in_the_map() {
        let cache: Cache<u32> = Cache::new(Duration::from_millis(40));
        cache.put("a", 1);
        tokio::time::sleep(Duration::from_millis(60)).await;
        cache.put("b", 2);
        // "a" is past due but unswept or swept; either way keys() and the
        // map agree
        let keys = cache.keys();
        for key in &keys {
            assert!(cache.get(key).is_some());
        }
        assert!(keys.contains(&"b".to_string()));
    }

    #[tokio::test]
    async fn dropping_the_cache_stops_the_evictor() {
        let cache: Cache<u32> = Cache::new(Duration::from_millis(10));
        let weak = Arc::downgrade(&cache.map);
        drop(cache);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(weak.upgrade().is_none());
    }
}
