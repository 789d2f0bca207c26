use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// A mutex map keyed by session id: concurrent lockers of the same key
/// serialize, different keys proceed in parallel, and an entry is removed
/// once its last guard is released. There is no global lock on the hot path.
pub struct KeyedLocks {
    locks: Mutex<HashMap<u64, Arc<AsyncMutex<()>>>>,
}

pub struct KeyedGuard<'a> {
    owner: &'a KeyedLocks,
    key: u64,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn lock(&self, key: u64) -> KeyedGuard<'_> {
        let entry = {
            let mut locks = self.locks.lock();
            Arc::clone(
                locks
                    .entry(key)
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        let guard = entry.lock_owned().await;
        KeyedGuard {
            owner: self,
            key,
            guard: Some(guard),
        }
    }

    fn release(&self, key: u64) {
        let mut locks = self.locks.lock();
        if let Some(entry) = locks.get(&key) {
            // Only the map itself still references the mutex
            if Arc::strong_count(entry) == 1 {
                locks.remove(&key);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

impl Default for KeyedLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        // The inner guard (and its Arc) must go before the refcount check
        self.guard.take();
        self.owner.release(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_serializes() {
        let locks = Arc::new(KeyedLocks::new());
        let in_flight = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let in_flight = Arc::clone(&in_flight);
                let max_seen = Arc::clone(&max_seen);
                tokio::spawn(async move {
                    let _guard = locks.lock(7).await;
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_keys_run_in_parallel() {
        let locks = KeyedLocks::new();
        let a = locks.lock(1).await;
        // Would deadlock if keys shared a lock
        let b = locks.lock(2).await;
        drop(a);
        drop(b);
    }

    #[tokio::test]
    async fn test_entries_removed_after_release() {
        let locks = KeyedLocks::new();
        {
            let _a = locks.lock(1).await;
            let _b = locks.lock(2).await;
            assert_eq!(locks.len(), 2);
        }
        assert_eq!(locks.len(), 0);
    }
}
