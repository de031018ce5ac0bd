use crate::metrics;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

struct CacheEntry {
    bytes: Arc<Vec<u8>>,
    last_access: Instant,
}

struct CacheInner {
    entries: HashMap<Uuid, CacheEntry>,
    total_bytes: u64,
}

/// In-memory byte cache for small downloads, keyed by canonical file id.
///
/// Entries expire on a sliding TTL: every hit renews the entry. When an
/// insert would push the cache past its byte budget, the least recently
/// accessed entries are evicted first.
pub struct ByteCache {
    inner: Mutex<CacheInner>,
    ttl: Duration,
    budget_bytes: u64,
}

impl ByteCache {
    pub fn new(ttl: Duration, budget_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                total_bytes: 0,
            }),
            ttl,
            budget_bytes,
        }
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<Vec<u8>>> {
        let mut inner = self.lock();
        let expired = match inner.entries.get_mut(&id) {
            None => return None,
            Some(entry) => {
                if entry.last_access.elapsed() < self.ttl {
                    entry.last_access = Instant::now();
                    return Some(entry.bytes.clone());
                }
                true
            }
        };
        if expired {
            if let Some(entry) = inner.entries.remove(&id) {
                inner.total_bytes -= entry.bytes.len() as u64;
                metrics::CACHE_SIZE_BYTES.set(inner.total_bytes as f64);
            }
        }
        None
    }

    /// Caches `bytes` under `id`, evicting least recently used entries to
    /// stay within the byte budget. Oversized payloads are not cached.
    pub fn insert(&self, id: Uuid, bytes: Arc<Vec<u8>>) {
        let size = bytes.len() as u64;
        if size > self.budget_bytes {
            return;
        }

        let mut inner = self.lock();
        if let Some(previous) = inner.entries.remove(&id) {
            inner.total_bytes -= previous.bytes.len() as u64;
        }

        while inner.total_bytes + size > self.budget_bytes {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(id, _)| *id);
            let Some(oldest) = oldest else {
                break;
            };
            if let Some(evicted) = inner.entries.remove(&oldest) {
                inner.total_bytes -= evicted.bytes.len() as u64;
            }
        }

        inner.total_bytes += size;
        inner.entries.insert(
            id,
            CacheEntry {
                bytes,
                last_access: Instant::now(),
            },
        );
        metrics::CACHE_SIZE_BYTES.set(inner.total_bytes as f64);
    }

    pub fn total_bytes(&self) -> u64 {
        self.lock().total_bytes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(size: usize) -> Arc<Vec<u8>> {
        Arc::new(vec![0u8; size])
    }

    #[test]
    fn test_hit_and_miss() {
        let cache = ByteCache::new(Duration::from_secs(60), 1024);
        let id = Uuid::now_v7();

        assert!(cache.get(id).is_none());
        cache.insert(id, payload(100));
        assert_eq!(cache.get(id).unwrap().len(), 100);
        assert_eq!(cache.total_bytes(), 100);
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let cache = ByteCache::new(Duration::ZERO, 1024);
        let id = Uuid::now_v7();

        cache.insert(id, payload(100));
        assert!(cache.get(id).is_none());
        assert_eq!(cache.total_bytes(), 0);
    }

    #[test]
    fn test_budget_eviction_prefers_least_recently_used() {
        let cache = ByteCache::new(Duration::from_secs(60), 250);
        let old = Uuid::now_v7();
        let fresh = Uuid::now_v7();

        cache.insert(old, payload(100));
        std::thread::sleep(Duration::from_millis(5));
        cache.insert(fresh, payload(100));
        std::thread::sleep(Duration::from_millis(5));
        // Renew the older entry so the other becomes the eviction candidate.
        cache.get(old).unwrap();

        cache.insert(Uuid::now_v7(), payload(100));

        assert!(cache.get(old).is_some());
        assert!(cache.get(fresh).is_none());
        assert!(cache.total_bytes() <= 250);
    }

    #[test]
    fn test_oversized_payload_is_not_cached() {
        let cache = ByteCache::new(Duration::from_secs(60), 100);
        let id = Uuid::now_v7();

        cache.insert(id, payload(200));

        assert!(cache.get(id).is_none());
        assert_eq!(cache.total_bytes(), 0);
    }

    #[test]
    fn test_reinsert_replaces_previous_entry() {
        let cache = ByteCache::new(Duration::from_secs(60), 1024);
        let id = Uuid::now_v7();

        cache.insert(id, payload(100));
        cache.insert(id, payload(50));

        assert_eq!(cache.get(id).unwrap().len(), 50);
        assert_eq!(cache.total_bytes(), 50);
    }
}
