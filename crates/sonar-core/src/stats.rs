//! Per-peer exchange statistics.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::cache::ExpiringCache;
use crate::types::DeviceIdentity;

/// Exchange history of one logical peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceStats {
    /// Successful exchanges.
    pub success_count: u32,
    /// Failed exchanges.
    pub failure_count: u32,
    /// Failures since the last success.
    pub successive_failure_count: u32,
    /// When the last successful exchange completed.
    pub last_success_time: Option<Instant>,
    /// The peer is not worth servicing (no exchange service).
    pub should_ignore: bool,
}

impl DeviceStats {
    /// `success_count - failure_count`, unclamped.
    #[must_use]
    pub fn confidence_score(&self) -> i64 {
        i64::from(self.success_count) - i64::from(self.failure_count)
    }
}

/// Statistics of every recently observed peer.
///
/// Every mutation re-inserts the entry, so the TTL counts from the last
/// observation and peers that are no longer seen eventually expire.
pub struct DeviceStatsRegistry {
    entries: Mutex<ExpiringCache<DeviceIdentity, DeviceStats>>,
}

impl DeviceStatsRegistry {
    /// Create a registry holding at most `capacity` peers.
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(ExpiringCache::new(capacity, ttl)),
        }
    }

    /// Record a successful exchange completed at `now`.
    pub fn record_success(&self, identity: DeviceIdentity, now: Instant) {
        self.update(identity, now, |stats| {
            stats.success_count = stats.success_count.saturating_add(1);
            stats.successive_failure_count = 0;
            stats.last_success_time = Some(now);
        });
    }

    /// Record a failed exchange.
    pub fn record_failure(&self, identity: DeviceIdentity) {
        self.update(identity, Instant::now(), |stats| {
            stats.failure_count = stats.failure_count.saturating_add(1);
            stats.successive_failure_count = stats.successive_failure_count.saturating_add(1);
        });
    }

    /// Stop servicing this peer until its statistics expire.
    pub fn mark_ignored(&self, identity: DeviceIdentity) {
        self.update(identity, Instant::now(), |stats| stats.should_ignore = true);
    }

    /// Current statistics of `identity`, if it was observed recently.
    #[must_use]
    pub fn get(&self, identity: DeviceIdentity) -> Option<DeviceStats> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(&identity, Instant::now()).copied()
    }

    /// Every live entry, sorted by identity.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(DeviceIdentity, DeviceStats)> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<_> = entries
            .iter(Instant::now())
            .map(|(identity, stats)| (*identity, *stats))
            .collect();
        all.sort_by_key(|(identity, _)| *identity);
        all
    }

    fn update(&self, identity: DeviceIdentity, now: Instant, f: impl FnOnce(&mut DeviceStats)) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stats = entries.get(&identity, now).copied().unwrap_or_default();
        f(&mut stats);
        entries.insert(identity, stats, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> DeviceStatsRegistry {
        DeviceStatsRegistry::new(16, Duration::from_secs(60))
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_successive_failures() {
        let stats = registry();
        let id = DeviceIdentity(1);
        stats.record_failure(id);
        stats.record_failure(id);
        assert_eq!(stats.get(id).unwrap().successive_failure_count, 2);

        stats.record_success(id, Instant::now());
        let current = stats.get(id).unwrap();
        assert_eq!(current.successive_failure_count, 0);
        assert_eq!(current.failure_count, 2);
        assert_eq!(current.success_count, 1);
        assert!(current.last_success_time.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_confidence_score_is_unclamped() {
        let stats = registry();
        let id = DeviceIdentity(2);
        for _ in 0..5 {
            stats.record_failure(id);
        }
        stats.record_success(id, Instant::now());
        assert_eq!(stats.get(id).unwrap().confidence_score(), -4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_ignored() {
        let stats = registry();
        let id = DeviceIdentity(3);
        assert!(stats.get(id).is_none());
        stats.mark_ignored(id);
        assert!(stats.get(id).unwrap().should_ignore);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_counts_from_last_update() {
        let stats = DeviceStatsRegistry::new(16, Duration::from_secs(10));
        let id = DeviceIdentity(4);
        stats.record_failure(id);
        tokio::time::advance(Duration::from_secs(8)).await;
        stats.record_failure(id);
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(stats.get(id).unwrap().failure_count, 2);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(stats.get(id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_is_sorted() {
        let stats = registry();
        stats.record_failure(DeviceIdentity(9));
        stats.record_failure(DeviceIdentity(1));
        stats.record_failure(DeviceIdentity(5));
        let ids: Vec<_> = stats.snapshot().into_iter().map(|(id, _)| id.0).collect();
        assert_eq!(ids, vec![1, 5, 9]);
    }
}
