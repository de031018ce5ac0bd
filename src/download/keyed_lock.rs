use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

struct LockEntry {
    lock: Arc<tokio::sync::Mutex<()>>,
    waiters: usize,
}

/// Per-key async mutexes with reference-counted teardown: an entry exists
/// only while at least one task holds or waits for its lock, so the map
/// never grows with dead keys.
pub struct KeyedLocks<K: Eq + Hash + Clone> {
    entries: Arc<Mutex<HashMap<K, LockEntry>>>,
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Acquires the lock for `key`, waiting if another task holds it.
    /// Cancel-safe: a waiter dropped mid-wait releases its reference, so
    /// abandoned downloads never pin an entry in the map.
    pub async fn acquire(&self, key: K) -> KeyedGuard<K> {
        let lock = {
            let mut entries = match self.entries.lock() {
                Ok(entries) => entries,
                Err(poisoned) => poisoned.into_inner(),
            };
            let entry = entries.entry(key.clone()).or_insert_with(|| LockEntry {
                lock: Arc::new(tokio::sync::Mutex::new(())),
                waiters: 0,
            });
            entry.waiters += 1;
            entry.lock.clone()
        };

        // Holds our waiter reference across the await; the KeyedGuard takes
        // it over once the lock is ours.
        let mut pending = PendingWaiter {
            entries: self.entries.clone(),
            key: Some(key.clone()),
        };
        let guard = lock.lock_owned().await;
        pending.key = None;

        KeyedGuard {
            entries: self.entries.clone(),
            key,
            _guard: guard,
        }
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

fn release_waiter<K: Eq + Hash + Clone>(entries: &Mutex<HashMap<K, LockEntry>>, key: &K) {
    let mut entries = match entries.lock() {
        Ok(entries) => entries,
        Err(poisoned) => poisoned.into_inner(),
    };
    if let Some(entry) = entries.get_mut(key) {
        entry.waiters -= 1;
        if entry.waiters == 0 {
            entries.remove(key);
        }
    }
}

/// Waiter reference that has not acquired the lock yet. Dropping it while
/// `key` is still set means the wait was cancelled.
struct PendingWaiter<K: Eq + Hash + Clone> {
    entries: Arc<Mutex<HashMap<K, LockEntry>>>,
    key: Option<K>,
}

impl<K: Eq + Hash + Clone> Drop for PendingWaiter<K> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            release_waiter(&self.entries, &key);
        }
    }
}

/// Held lock for one key. Dropping it releases the lock and removes the
/// key's entry once no other task is waiting.
pub struct KeyedGuard<K: Eq + Hash + Clone> {
    entries: Arc<Mutex<HashMap<K, LockEntry>>>,
    key: K,
    _guard: OwnedMutexGuard<()>,
}

impl<K: Eq + Hash + Clone> Drop for KeyedGuard<K> {
    fn drop(&mut self) {
        release_waiter(&self.entries, &self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let locks = Arc::new(KeyedLocks::new());
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let locks = locks.clone();
            let concurrent = concurrent.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("key").await;
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block_each_other() {
        let locks = KeyedLocks::new();
        let _a = locks.acquire("a").await;
        // Must not deadlock.
        let _b = locks.acquire("b").await;
    }

    #[tokio::test]
    async fn test_entries_are_removed_when_released() {
        let locks = KeyedLocks::new();
        {
            let _guard = locks.acquire("a").await;
            assert_eq!(locks.tracked_keys(), 1);
        }
        assert_eq!(locks.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_releases_its_entry() {
        let locks = Arc::new(KeyedLocks::new());
        let guard = locks.acquire("a").await;

        let locks_clone = locks.clone();
        let waiter = tokio::spawn(async move {
            let _guard = locks_clone.acquire("a").await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(locks.tracked_keys(), 1);

        // A client giving up mid-wait must not pin the entry forever.
        waiter.abort();
        let _ = waiter.await;

        drop(guard);
        assert_eq!(locks.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn test_entry_survives_while_another_task_waits() {
        let locks = Arc::new(KeyedLocks::new());
        let guard = locks.acquire("a").await;

        let locks_clone = locks.clone();
        let waiter = tokio::spawn(async move {
            let _guard = locks_clone.acquire("a").await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(locks.tracked_keys(), 1);

        drop(guard);
        waiter.await.unwrap();
        assert_eq!(locks.tracked_keys(), 0);
    }
}
