//! Size-bounded, time-expiring map.
//!
//! Not synchronized: owners wrap it in their own mutex so that a compound
//! operation (insert, then look something up elsewhere) stays atomic.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::time::Instant;

/// Occupancy, in percent of capacity, above which inserts sweep expired
/// entries first.
const SWEEP_THRESHOLD_PERCENT: usize = 75;

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

/// A map whose entries expire `ttl` after insertion and whose size never
/// exceeds `capacity`.
pub struct ExpiringCache<K, V> {
    entries: HashMap<K, Entry<V>>,
    capacity: usize,
    ttl: Duration,
}

impl<K: Eq + Hash + Clone, V> ExpiringCache<K, V> {
    /// Create an empty cache. A zero capacity is treated as one.
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: HashMap::with_capacity(capacity.min(1024)),
            capacity,
            ttl,
        }
    }

    /// Insert or replace `key`, stamping it with `now`.
    ///
    /// When occupancy reaches 75% of capacity, expired entries are swept
    /// first. If the cache is still full, the oldest entry is evicted.
    pub fn insert(&mut self, key: K, value: V, now: Instant) {
        if self.entries.len() * 100 >= self.capacity * SWEEP_THRESHOLD_PERCENT {
            self.sweep(now);
        }
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            self.evict_oldest();
        }
        self.entries.insert(
            key,
            Entry {
                value,
                inserted_at: now,
            },
        );
    }

    /// The live value for `key`, if any.
    #[must_use]
    pub fn get(&self, key: &K, now: Instant) -> Option<&V> {
        self.entries
            .get(key)
            .filter(|entry| !self.is_expired(entry, now))
            .map(|entry| &entry.value)
    }

    /// Remove `key`, returning its live value.
    pub fn remove(&mut self, key: &K, now: Instant) -> Option<V> {
        let entry = self.entries.remove(key)?;
        (!self.is_expired(&entry, now)).then_some(entry.value)
    }

    /// Drop every expired entry. Returns how many were dropped.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.inserted_at) < ttl);
        before - self.entries.len()
    }

    /// Live entries, in arbitrary order.
    pub fn iter(&self, now: Instant) -> impl Iterator<Item = (&K, &V)> {
        self.entries
            .iter()
            .filter(move |(_, entry)| !self.is_expired(entry, now))
            .map(|(key, entry)| (key, &entry.value))
    }

    /// Number of stored entries, expired or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Configured capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    fn is_expired(&self, entry: &Entry<V>, now: Instant) -> bool {
        now.saturating_duration_since(entry.inserted_at) >= self.ttl
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.inserted_at)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(10);

    #[test]
    fn test_get_before_and_after_expiry() {
        let start = Instant::now();
        let mut cache = ExpiringCache::new(4, TTL);
        cache.insert("a", 1, start);
        assert_eq!(cache.get(&"a", start + Duration::from_secs(9)), Some(&1));
        assert_eq!(cache.get(&"a", start + TTL), None);
    }

    #[test]
    fn test_last_write_wins() {
        let now = Instant::now();
        let mut cache = ExpiringCache::new(4, TTL);
        cache.insert("a", 1, now);
        cache.insert("a", 2, now);
        assert_eq!(cache.get(&"a", now), Some(&2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let now = Instant::now();
        let mut cache = ExpiringCache::new(3, TTL);
        for i in 0..10 {
            cache.insert(i, i, now + Duration::from_millis(i));
            assert!(cache.len() <= 3);
        }
        // Oldest entries were evicted first.
        assert!(cache.get(&9, now + Duration::from_millis(9)).is_some());
        assert!(cache.get(&0, now + Duration::from_millis(9)).is_none());
    }

    #[test]
    fn test_sweep_only_above_threshold() {
        let start = Instant::now();
        let mut cache = ExpiringCache::new(8, TTL);
        cache.insert(1, (), start);
        cache.insert(2, (), start);
        // 2/8 = 25% occupancy: the expired entries are left in place.
        cache.insert(3, (), start + TTL * 2);
        assert_eq!(cache.len(), 3);

        let mut cache = ExpiringCache::new(4, TTL);
        cache.insert(1, (), start);
        cache.insert(2, (), start);
        cache.insert(3, (), start);
        // 3/4 = 75% occupancy: the insert sweeps first.
        cache.insert(4, (), start + TTL * 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_remove_returns_live_value_only() {
        let start = Instant::now();
        let mut cache = ExpiringCache::new(4, TTL);
        cache.insert("a", 1, start);
        cache.insert("b", 2, start);
        assert_eq!(cache.remove(&"a", start), Some(1));
        assert_eq!(cache.remove(&"b", start + TTL), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_iter_skips_expired() {
        let start = Instant::now();
        let mut cache = ExpiringCache::new(10, TTL);
        cache.insert("old", 1, start);
        cache.insert("new", 2, start + Duration::from_secs(5));
        let live: Vec<_> = cache.iter(start + Duration::from_secs(12)).collect();
        assert_eq!(live, vec![(&"new", &2)]);
    }
}
