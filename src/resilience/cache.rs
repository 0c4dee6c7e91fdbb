//! TTL + LRU cache policy unit, keyed by the fingerprint
//! computed in [`crate::fingerprint`].

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

struct Entry {
    value: Value,
    expires_at: Instant,
}

/// Cache configuration (spec §3 policy state, §4.B cache unit).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub max_size: usize,
    pub ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_size: 1024, ttl_ms: 60_000 }
    }
}

/// Derived metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheMetrics {
    pub fn network_requests_saved(&self) -> u64 {
        self.hits
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn cache_efficiency(&self) -> f64 {
        let total = self.sets + self.hits;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// LRU cache with uniform entry TTL, safe for concurrent use.
pub struct Cache {
    config: CacheConfig,
    store: Mutex<LruCache<String, Entry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl Cache {
    pub fn new(config: CacheConfig) -> Arc<Self> {
        let cap = NonZeroUsize::new(config.max_size.max(1)).unwrap();
        Arc::new(Self {
            config,
            store: Mutex::new(LruCache::new(cap)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        })
    }

    /// Returns `Some(value)` on a hit, removing expired entries on access.
    pub fn get(&self, fingerprint: &str) -> Option<Value> {
        let mut store = self.store.lock();
        let hit = match store.get(fingerprint) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => None,
            None => None,
        };
        match hit {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::AcqRel);
                Some(value)
            }
            None => {
                if store.contains(fingerprint) {
                    store.pop(fingerprint);
                    self.expirations.fetch_add(1, Ordering::AcqRel);
                }
                self.misses.fetch_add(1, Ordering::AcqRel);
                None
            }
        }
    }

    /// Stores `value` under `fingerprint`, evicting the LRU entry if full.
    pub fn set(&self, fingerprint: String, value: Value) {
        let mut store = self.store.lock();
        let was_full = store.len() >= store.cap().get() && !store.contains(&fingerprint);
        let evicted = store.put(
            fingerprint,
            Entry { value, expires_at: Instant::now() + Duration::from_millis(self.config.ttl_ms) },
        );
        self.sets.fetch_add(1, Ordering::AcqRel);
        if was_full && evicted.is_none() {
            self.evictions.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.hits.load(Ordering::Acquire),
            misses: self.misses.load(Ordering::Acquire),
            sets: self.sets.load(Ordering::Acquire),
            evictions: self.evictions.load(Ordering::Acquire),
            expirations: self.expirations.load(Ordering::Acquire),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_then_miss_after_ttl() {
        let cache = Cache::new(CacheConfig { max_size: 8, ttl_ms: 10 });
        cache.set("k".to_string(), serde_json::json!({"v": 1}));
        assert!(cache.get("k").is_some());
        assert_eq!(cache.metrics().hits, 1);

        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get("k").is_none());
        assert_eq!(cache.metrics().expirations, 1);
    }

    #[test]
    fn evicts_lru_when_full() {
        let cache = Cache::new(CacheConfig { max_size: 2, ttl_ms: 60_000 });
        cache.set("a".to_string(), serde_json::json!(1));
        cache.set("b".to_string(), serde_json::json!(2));
        cache.set("c".to_string(), serde_json::json!(3));
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.metrics().evictions, 1);
    }

    #[test]
    fn repeated_hit_increments_hits_by_one() {
        let cache = Cache::new(CacheConfig::default());
        cache.set("k".to_string(), serde_json::json!(42));
        let before = cache.metrics().hits;
        cache.get("k");
        assert_eq!(cache.metrics().hits, before + 1);
    }
}
