use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::hash::Hash;
use std::time::{Duration, Instant};

/// A concurrent map whose entries expire after a period of inactivity.
///
/// Every `get` refreshes the entry's last-access stamp; `contains_key` does
/// not. The eviction timeout can be changed at runtime and applies to all
/// entries immediately. Expired entries are dropped lazily on access and in
/// bulk by `cleanup`.
pub struct TimeoutMap<K, V> {
    entries: DashMap<K, TimedEntry<V>>,
    timeout: RwLock<Duration>,
    last_sweep: Mutex<Instant>,
}

struct TimedEntry<V> {
    value: V,
    last_access: Instant,
}

impl<K, V> TimeoutMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            timeout: RwLock::new(timeout),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    pub fn timeout(&self) -> Duration {
        *self.timeout.read()
    }

    pub fn set_timeout(&self, timeout: Duration) {
        *self.timeout.write() = timeout;
    }

    /// Get a live entry, refreshing its last-access stamp.
    pub fn get(&self, key: &K) -> Option<V> {
        let timeout = self.timeout();
        let mut expired = false;
        let mut value = None;

        if let Some(mut entry) = self.entries.get_mut(key) {
            if entry.last_access.elapsed() >= timeout {
                expired = true;
            } else {
                entry.last_access = Instant::now();
                value = Some(entry.value.clone());
            }
        }

        // The shard guard must be released before removal.
        if expired {
            self.entries.remove(key);
        }
        value
    }

    /// Check for a live entry without refreshing it.
    pub fn contains_key(&self, key: &K) -> bool {
        match self.entries.get(key) {
            Some(entry) => entry.last_access.elapsed() < self.timeout(),
            None => false,
        }
    }

    pub fn insert(&self, key: K, value: V) {
        self.maybe_cleanup();
        self.entries.insert(
            key,
            TimedEntry {
                value,
                last_access: Instant::now(),
            },
        );
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(_, entry)| entry.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Drop every entry older than the timeout.
    pub fn cleanup(&self) {
        let timeout = self.timeout();
        self.entries
            .retain(|_, entry| entry.last_access.elapsed() < timeout);
    }

    /// Interval-gated `cleanup`; cheap enough for write paths.
    fn maybe_cleanup(&self) {
        let due = {
            let Some(mut last) = self.last_sweep.try_lock() else {
                return;
            };
            if last.elapsed() < self.timeout() {
                return;
            }
            *last = Instant::now();
            true
        };
        if due {
            self.cleanup();
        }
    }
}

/// A set of keys with the same expiry semantics as [`TimeoutMap`].
pub struct TimeoutSet<K> {
    inner: TimeoutMap<K, ()>,
}

impl<K> TimeoutSet<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: TimeoutMap::new(timeout),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout()
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.inner.set_timeout(timeout);
    }

    /// Add or refresh a key. Returns true when the key was not already live.
    pub fn try_insert(&self, key: K) -> bool {
        if self.inner.get(&key).is_some() {
            return false;
        }
        self.inner.insert(key, ());
        true
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn clear(&self) {
        self.inner.clear();
    }

    pub fn cleanup(&self) {
        self.inner.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_get_refreshes_entry() {
        let map = TimeoutMap::new(Duration::from_millis(80));
        map.insert("a", 1u32);

        // Keep touching it past the original deadline
        for _ in 0..4 {
            sleep(Duration::from_millis(30));
            assert_eq!(map.get(&"a"), Some(1));
        }

        sleep(Duration::from_millis(100));
        assert_eq!(map.get(&"a"), None);
        assert!(map.is_empty());
    }

    #[test]
    fn test_contains_does_not_refresh() {
        let map = TimeoutMap::new(Duration::from_millis(60));
        map.insert("a", 1u32);

        sleep(Duration::from_millis(40));
        assert!(map.contains_key(&"a"));

        sleep(Duration::from_millis(40));
        assert!(!map.contains_key(&"a"));
    }

    #[test]
    fn test_set_timeout_applies_to_existing_entries() {
        let map = TimeoutMap::new(Duration::from_secs(3600));
        map.insert("a", 1u32);

        map.set_timeout(Duration::from_millis(10));
        assert_eq!(map.timeout(), Duration::from_millis(10));

        sleep(Duration::from_millis(30));
        assert_eq!(map.get(&"a"), None);
    }

    #[test]
    fn test_cleanup_drops_expired() {
        let map = TimeoutMap::new(Duration::from_millis(30));
        map.insert("a", 1u32);
        map.insert("b", 2u32);

        sleep(Duration::from_millis(50));
        map.insert("c", 3u32);

        map.cleanup();
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&"c"), Some(3));
    }

    #[test]
    fn test_set_try_insert_reports_new_keys() {
        let set = TimeoutSet::new(Duration::from_millis(50));
        assert!(set.try_insert("x"));
        assert!(!set.try_insert("x"));

        sleep(Duration::from_millis(70));
        assert!(set.try_insert("x"));
    }
}
