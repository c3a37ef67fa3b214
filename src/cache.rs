use std::collections::HashMap;
use std::hash::Hash;
use std::sync::RwLock;
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// TtlCache — expiring keyed snapshots behind a readers-writer lock
// ---------------------------------------------------------------------------

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// A small expiring cache. Entries are immutable snapshots: readers
/// always receive a copy and may mutate it freely.
///
/// Reads take the shared lock, writes the exclusive one;
/// [`TtlCache::invalidate`] clears the whole map atomically.
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: RwLock<HashMap<K, Entry<V>>>,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Copy of the stored value, or `None` when missing or expired.
    pub fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.read().unwrap();
        entries.get(key).and_then(|entry| {
            if entry.expires_at > Instant::now() {
                Some(entry.value.clone())
            } else {
                None
            }
        })
    }

    /// Store a value with a fresh expiry.
    pub fn put(&self, key: K, value: V) {
        let mut entries = self.entries.write().unwrap();
        entries.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Replace the value of an existing live entry without touching its
    /// expiry. Used when a reader prunes vanished items from a snapshot.
    /// Returns false when the entry is missing or already expired.
    pub fn replace(&self, key: &K, value: V) -> bool {
        let mut entries = self.entries.write().unwrap();
        match entries.get_mut(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                entry.value = value;
                true
            }
            _ => false,
        }
    }

    /// Drop every entry.
    pub fn invalidate(&self) {
        self.entries.write().unwrap().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_returns_copy() {
        let cache: TtlCache<&str, Vec<u32>> = TtlCache::new(Duration::from_secs(60));
        cache.put("k", vec![1, 2, 3]);

        let mut copy = cache.get(&"k").unwrap();
        copy.push(4);

        // The stored value is unaffected by mutations of the copy.
        assert_eq!(cache.get(&"k").unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn expired_entries_miss() {
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::from_millis(10));
        cache.put("k", 1);
        assert_eq!(cache.get(&"k"), Some(1));

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.get(&"k"), None);
    }

    #[test]
    fn invalidate_clears_everything() {
        let cache: TtlCache<u32, u32> = TtlCache::new(Duration::from_secs(60));
        cache.put(1, 1);
        cache.put(2, 2);
        cache.invalidate();
        assert!(cache.is_empty());
        assert_eq!(cache.get(&1), None);
    }

    #[test]
    fn replace_keeps_live_entry_and_rejects_missing() {
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::from_secs(60));
        cache.put("k", 1);
        assert!(cache.replace(&"k", 2));
        assert_eq!(cache.get(&"k"), Some(2));

        assert!(!cache.replace(&"missing", 3));
        assert_eq!(cache.get(&"missing"), None);
    }

    #[test]
    fn replace_rejects_expired_entry() {
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::from_millis(10));
        cache.put("k", 1);
        std::thread::sleep(Duration::from_millis(20));
        assert!(!cache.replace(&"k", 2));
    }
}
