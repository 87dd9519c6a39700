//! In-process TTL cache.
//!
//! Hot read-through entries (speed-node endpoints, README cards, named locks)
//! all live in instances of [`TtlCache`]. Expiry is lazy: a stale entry is
//! dropped on the access that finds it, and `purge` sweeps leftovers.

use std::time::{Duration, Instant};

use dashmap::DashMap;

struct Entry<V> {
    value: V,
    ttl: Duration,
    expires_at: Instant,
}

pub struct TtlCache<V: Clone> {
    entries: DashMap<String, Entry<V>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn insert(&self, key: impl Into<String>, value: V, ttl: Duration) {
        self.entries.insert(
            key.into(),
            Entry {
                value,
                ttl,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Returns the live value for `key` and pushes its expiry out by the
    /// entry's original TTL.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        if let Some(mut entry) = self.entries.get_mut(key) {
            if entry.expires_at > now {
                let ttl = entry.ttl;
                entry.expires_at = now + ttl;
                return Some(entry.value.clone());
            }
        }
        // Stale or missing; drop a stale entry if one is still around.
        self.entries.remove_if(key, |_, e| e.expires_at <= now);
        None
    }

    /// Peek without refreshing the TTL.
    pub fn peek(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.value.clone())
    }

    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Drops every expired entry. Called opportunistically; correctness never
    /// depends on it running.
    pub fn purge(&self) {
        let now = Instant::now();
        self.entries.retain(|_, e| e.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl<V: Clone> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

pub fn speed_key(instance_id: &str, online: bool) -> String {
    format!("speed:{instance_id}:{online}")
}

pub fn card_key(instance_id: &str, repo_id: i64) -> String {
    format!("card:{instance_id}:{repo_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get() {
        let cache: TtlCache<i32> = TtlCache::new();
        cache.insert("a", 1, Duration::from_secs(60));
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("b"), None);
    }

    #[test]
    fn test_expiry() {
        let cache: TtlCache<i32> = TtlCache::new();
        cache.insert("a", 1, Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_refresh_on_access() {
        let cache: TtlCache<i32> = TtlCache::new();
        cache.insert("a", 1, Duration::from_millis(80));
        std::thread::sleep(Duration::from_millis(50));
        // Access pushes the expiry out past the original deadline.
        assert_eq!(cache.get("a"), Some(1));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(cache.get("a"), Some(1));
    }

    #[test]
    fn test_purge() {
        let cache: TtlCache<i32> = TtlCache::new();
        cache.insert("a", 1, Duration::from_millis(0));
        cache.insert("b", 2, Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(5));
        cache.purge();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.peek("b"), Some(2));
    }

    #[test]
    fn test_keys() {
        assert_eq!(speed_key("i1", true), "speed:i1:true");
        assert_eq!(card_key("i1", 7), "card:i1:7");
    }
}
