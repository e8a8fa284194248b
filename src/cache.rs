//! Process-local and cluster-wide cache capabilities (`SrvCache`/`WanCache`).
//! Both are external collaborators whose concrete implementations
//! (memcached, an in-process LRU, etc.) are out of scope; this module
//! defines the seam plus a TTL-aware in-memory implementation of each,
//! grounded in pgdog's `backend::pool::dns_cache` (a
//! `parking_lot::RwLock<HashMap<..>>` with manual TTL bookkeeping).

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

/// Single-writer, single-reader-per-instance cache. Used for the
/// "last known reached position" table and the short-TTL read-only flag.
pub trait SrvCache: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn put(&self, key: &str, value: String, ttl: Duration);
}

/// Cluster-wide cache. May race across concurrent instances; callers that
/// need to avoid a stampede use [`WanCache::get_or_lock`], which returns a
/// "busy value" to any concurrent reader while the first caller refreshes.
pub trait WanCache: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn put(&self, key: &str, value: String, ttl: Duration);

    /// Atomically read the cached value, or, on miss, stake a claim by
    /// writing `busy_value` with `claim_ttl` and returning `None` so the
    /// caller knows it must compute and [`WanCache::put`] the real value.
    /// A concurrent racer sees the busy value and treats it as a normal hit.
    fn get_or_lock(&self, key: &str, busy_value: &str, claim_ttl: Duration) -> Option<String>;
}

struct Entry {
    value: String,
    expires_at: Instant,
}

/// In-memory TTL cache, process-local. Not shared across instances.
#[derive(Default)]
pub struct InMemorySrvCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemorySrvCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SrvCache for InMemorySrvCache {
    fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock();
        entries.get(key).and_then(|entry| {
            if entry.expires_at > Instant::now() {
                Some(entry.value.clone())
            } else {
                None
            }
        })
    }

    fn put(&self, key: &str, value: String, ttl: Duration) {
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }
}

/// In-memory TTL cache shared behind an `Arc`, standing in for a
/// cluster-wide cache in tests. Real deployments inject a networked
/// implementation (memcached, Redis, etc.) behind the same trait.
#[derive(Default, Clone)]
pub struct InMemoryWanCache {
    inner: Arc<Mutex<HashMap<String, Entry>>>,
}

impl InMemoryWanCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WanCache for InMemoryWanCache {
    fn get(&self, key: &str) -> Option<String> {
        let entries = self.inner.lock();
        entries.get(key).and_then(|entry| {
            if entry.expires_at > Instant::now() {
                Some(entry.value.clone())
            } else {
                None
            }
        })
    }

    fn put(&self, key: &str, value: String, ttl: Duration) {
        self.inner.lock().insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    fn get_or_lock(&self, key: &str, busy_value: &str, claim_ttl: Duration) -> Option<String> {
        let mut entries = self.inner.lock();
        if let Some(entry) = entries.get(key) {
            if entry.expires_at > Instant::now() {
                return Some(entry.value.clone());
            }
        }

        entries.insert(
            key.to_string(),
            Entry {
                value: busy_value.to_string(),
                expires_at: Instant::now() + claim_ttl,
            },
        );
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_srv_cache_hit_and_expiry() {
        let cache = InMemorySrvCache::new();
        cache.put("k", "v".into(), Duration::from_secs(60));
        assert_eq!(cache.get("k"), Some("v".to_string()));

        cache.put("expired", "v".into(), Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("expired"), None);
    }

    #[test]
    fn test_wan_cache_get_or_lock_busy_value() {
        let cache = InMemoryWanCache::new();
        let first = cache.get_or_lock("read_only:primary", "false", Duration::from_secs(5));
        assert_eq!(first, None);

        // A concurrent racer now sees the busy value as a normal hit.
        let racer = cache.get_or_lock("read_only:primary", "false", Duration::from_secs(5));
        assert_eq!(racer, Some("false".to_string()));
    }

    #[test]
    fn test_wan_cache_put_overrides_busy_value() {
        let cache = InMemoryWanCache::new();
        cache.get_or_lock("k", "false", Duration::from_secs(5));
        cache.put("k", "true".into(), Duration::from_secs(60));
        assert_eq!(cache.get("k"), Some("true".to_string()));
    }
}
