//! Candidate ranking for the discovery-only strategy.
//!
//! Scans accumulate between servicing passes. [`DeviceSelector::select`]
//! drains them and returns one scan per logical peer, best candidate first:
//!
//! 1. Deduplicate rotating addresses per identity
//! 2. Drop peers that should not be serviced now
//! 3. Group by identity and score
//! 4. Sort by signal bracket, confidence, recency, volume and raw values

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::config::EngineConfig;
use crate::stats::DeviceStatsRegistry;
use crate::transport::IdentityResolver;
use crate::types::{DeviceAddress, DeviceIdentity, ScannedDevice};

/// Width of a recency bracket.
const TIMESTAMP_BRACKET_MS: i64 = 200;

/// Filters applied before ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectorSettings {
    /// Peers failing this many times in a row are skipped.
    pub max_successive_failures: u32,
    /// Peers exchanged with successfully within this delay are skipped.
    pub max_delay_between_success: Duration,
    /// Prefer recently seen peers within a signal bracket.
    pub recency_sensitive: bool,
}

impl From<&EngineConfig> for SelectorSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_successive_failures: config.max_successive_failures,
            max_delay_between_success: config.max_delay_between_success(),
            recency_sensitive: config.recency_sensitive,
        }
    }
}

struct Scored {
    rssi_bracket: i64,
    confidence: i64,
    rssi_average: f64,
    scans_count: usize,
    timestamp_bracket: i64,
    most_recent: ScannedDevice,
}

/// Ranks the peers discovered since the last servicing pass.
pub struct DeviceSelector {
    pending: Mutex<Vec<ScannedDevice>>,
    resolver: Arc<dyn IdentityResolver>,
    settings: SelectorSettings,
}

impl DeviceSelector {
    /// Create an empty selector.
    #[must_use]
    pub fn new(resolver: Arc<dyn IdentityResolver>, settings: SelectorSettings) -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            resolver,
            settings,
        }
    }

    /// Buffer scans until the next [`select`](Self::select).
    pub fn add(&self, scans: &[ScannedDevice]) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(scans);
    }

    /// Number of buffered scans.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Logical identity of a scan: resolved from its payload when it carries
    /// a decodable one, derived from its address otherwise.
    #[must_use]
    pub fn identity_of(&self, scan: &ScannedDevice) -> DeviceIdentity {
        scan.decoded_payload()
            .and_then(|payload| self.resolver.resolve(&payload))
            .unwrap_or_else(|| DeviceIdentity::from_address(&scan.address))
    }

    /// Drain the buffer and return the ranked candidates, best first.
    ///
    /// Same buffer and same statistics always give the same order.
    pub fn select(&self, now: Instant, stats: &DeviceStatsRegistry) -> Vec<ScannedDevice> {
        let scans = std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner));
        let total = scans.len();

        let tagged = self.deduplicate(scans);
        let relevant: Vec<_> = tagged
            .into_iter()
            .filter(|(identity, _)| self.is_relevant(*identity, now, stats))
            .collect();

        let mut groups: BTreeMap<DeviceIdentity, Vec<ScannedDevice>> = BTreeMap::new();
        for (identity, scan) in relevant {
            groups.entry(identity).or_default().push(scan);
        }

        let mut scored: Vec<Scored> = groups
            .into_iter()
            .filter_map(|(identity, scans)| {
                let confidence = stats.get(identity).map_or(0, |s| s.confidence_score());
                self.score(confidence, scans)
            })
            .collect();

        scored.sort_by(|a, b| {
            b.rssi_bracket
                .cmp(&a.rssi_bracket)
                .then_with(|| b.confidence.cmp(&a.confidence))
                .then_with(|| b.timestamp_bracket.cmp(&a.timestamp_bracket))
                .then_with(|| b.scans_count.cmp(&a.scans_count))
                .then_with(|| b.rssi_average.total_cmp(&a.rssi_average))
                .then_with(|| b.most_recent.timestamp.cmp(&a.most_recent.timestamp))
        });

        debug!(scans = total, candidates = scored.len(), "selection complete");
        scored.into_iter().map(|s| s.most_recent).collect()
    }

    /// Keep payload-less scans as they are; for identified peers keep only
    /// the scans from their most recently seen address.
    fn deduplicate(&self, scans: Vec<ScannedDevice>) -> Vec<(DeviceIdentity, ScannedDevice)> {
        let tagged: Vec<_> = scans
            .into_iter()
            .map(|scan| {
                let identified = scan.decoded_payload().is_some();
                (self.identity_of(&scan), identified, scan)
            })
            .collect();

        let mut latest: HashMap<DeviceIdentity, (DeviceAddress, chrono::DateTime<chrono::Utc>)> =
            HashMap::new();
        for (identity, identified, scan) in &tagged {
            if !identified {
                continue;
            }
            latest
                .entry(*identity)
                .and_modify(|(address, seen)| {
                    if scan.timestamp >= *seen {
                        *address = scan.address;
                        *seen = scan.timestamp;
                    }
                })
                .or_insert((scan.address, scan.timestamp));
        }

        tagged
            .into_iter()
            .filter(|(identity, identified, scan)| {
                !identified || latest.get(identity).is_some_and(|(a, _)| *a == scan.address)
            })
            .map(|(identity, _, scan)| (identity, scan))
            .collect()
    }

    fn is_relevant(&self, identity: DeviceIdentity, now: Instant, stats: &DeviceStatsRegistry) -> bool {
        let Some(stats) = stats.get(identity) else {
            return true;
        };
        if stats.should_ignore {
            debug!(%identity, "skipping ignored peer");
            return false;
        }
        if stats.successive_failure_count >= self.settings.max_successive_failures {
            debug!(%identity, failures = stats.successive_failure_count, "skipping failing peer");
            return false;
        }
        let recently_serviced = stats.last_success_time.is_some_and(|at| {
            now.saturating_duration_since(at) < self.settings.max_delay_between_success
        });
        if recently_serviced {
            debug!(%identity, "skipping recently serviced peer");
        }
        !recently_serviced
    }

    fn score(&self, confidence: i64, scans: Vec<ScannedDevice>) -> Option<Scored> {
        let scans_count = scans.len();
        let rssi_sum: i64 = scans.iter().map(|s| i64::from(s.rssi)).sum();
        #[allow(clippy::cast_precision_loss)]
        let rssi_average = rssi_sum as f64 / scans_count as f64;
        // Halves round away from zero: an average of exactly -55 joins -56..-64.
        #[allow(clippy::cast_possible_truncation)]
        let rssi_bracket = (rssi_average / 10.0).round() as i64;

        let most_recent = scans.into_iter().max_by_key(|s| s.timestamp)?;
        let timestamp_bracket = if self.settings.recency_sensitive {
            most_recent.timestamp.timestamp_millis() / TIMESTAMP_BRACKET_MS
        } else {
            0
        };

        Some(Scored {
            rssi_bracket,
            confidence,
            rssi_average,
            scans_count,
            timestamp_bracket,
            most_recent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::Payload;
    use crate::transport::PayloadHashResolver;
    use crate::types::IdentityPayload;
    use chrono::{DateTime, TimeZone, Utc};

    fn settings() -> SelectorSettings {
        SelectorSettings {
            max_successive_failures: 3,
            max_delay_between_success: Duration::from_secs(60),
            recency_sensitive: false,
        }
    }

    fn selector() -> DeviceSelector {
        DeviceSelector::new(Arc::new(PayloadHashResolver), settings())
    }

    fn stats() -> DeviceStatsRegistry {
        DeviceStatsRegistry::new(100, Duration::from_secs(600))
    }

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    fn address(last: u8) -> DeviceAddress {
        DeviceAddress::new([0x10, 0x20, 0x30, 0x40, 0x50, last])
    }

    fn payload_bytes(seed: u8) -> Vec<u8> {
        Payload::new(IdentityPayload([seed; 16]), -8).encode()
    }

    fn scan(last: u8, rssi: i32, ms: i64) -> ScannedDevice {
        ScannedDevice::new(address(last), rssi, at(ms))
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_identified_device() {
        let selector = selector();
        let mut identity = [0u8; 16];
        for (i, b) in identity.iter_mut().enumerate() {
            *b = u8::try_from(i + 1).unwrap();
        }
        let bytes = Payload::new(IdentityPayload(identity), -8).encode();
        let device = scan(1, -60, 0).with_payload(bytes);
        selector.add(&[device.clone()]);

        let selected = selector.select(Instant::now(), &stats());
        assert_eq!(selected, vec![device]);
        assert_eq!(selector.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_select_clears_buffer() {
        let selector = selector();
        selector.add(&[scan(1, -60, 0)]);
        assert_eq!(selector.select(Instant::now(), &stats()).len(), 1);
        assert!(selector.select(Instant::now(), &stats()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotated_address_keeps_newest_only() {
        let selector = selector();
        let old = scan(1, -40, 0).with_payload(payload_bytes(7));
        let new = scan(2, -80, 1_000).with_payload(payload_bytes(7));
        selector.add(&[old, new.clone()]);

        let selected = selector.select(Instant::now(), &stats());
        assert_eq!(selected, vec![new]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_payloadless_scans_grouped_by_address() {
        let selector = selector();
        selector.add(&[scan(1, -60, 0), scan(1, -62, 10), scan(2, -70, 5)]);
        let selected = selector.select(Instant::now(), &stats());
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].address, address(1));
        assert_eq!(selected[0].timestamp, at(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_successive_failure_threshold() {
        let selector = selector();
        let stats = stats();
        let at_limit = scan(1, -60, 0);
        let below = scan(2, -60, 0);
        for _ in 0..3 {
            stats.record_failure(selector.identity_of(&at_limit));
        }
        for _ in 0..2 {
            stats.record_failure(selector.identity_of(&below));
        }
        selector.add(&[at_limit, below.clone()]);
        assert_eq!(selector.select(Instant::now(), &stats), vec![below]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recent_success_and_ignored_are_filtered() {
        let selector = selector();
        let stats = stats();
        let recent = scan(1, -60, 0);
        let ignored = scan(2, -60, 0);
        let stale = scan(3, -60, 0);
        stats.record_success(selector.identity_of(&recent), Instant::now());
        stats.mark_ignored(selector.identity_of(&ignored));
        stats.record_success(selector.identity_of(&stale), Instant::now());

        tokio::time::advance(Duration::from_secs(30)).await;
        selector.add(&[recent.clone(), ignored.clone(), stale.clone()]);
        assert!(selector.select(Instant::now(), &stats).is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;
        selector.add(&[recent.clone(), ignored, stale.clone()]);
        let selected = selector.select(Instant::now(), &stats);
        assert_eq!(selected.len(), 2);
        assert!(selected.contains(&recent));
        assert!(selected.contains(&stale));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rssi_bracket_dominates() {
        let selector = selector();
        // -54.x rounds into bracket -5, -56 into bracket -6.
        selector.add(&[scan(1, -56, 0), scan(2, -54, 0), scan(2, -55, 1), scan(3, -71, 0)]);
        let order: Vec<_> = selector
            .select(Instant::now(), &stats())
            .into_iter()
            .map(|s| s.address)
            .collect();
        assert_eq!(order, vec![address(2), address(1), address(3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_bracket_rounds_away_from_zero() {
        let selector = selector();
        // -55 lands in bracket -6 with the two -64 scans, where scan count
        // decides. Were it bracket -5 it would lead.
        selector.add(&[
            scan(1, -55, 0),
            scan(2, -64, 0),
            scan(2, -64, 1),
            scan(3, -54, 0),
        ]);
        let order: Vec<_> = selector
            .select(Instant::now(), &stats())
            .into_iter()
            .map(|s| s.address)
            .collect();
        assert_eq!(order, vec![address(3), address(2), address(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confidence_breaks_bracket_ties() {
        let selector = selector();
        let stats = stats();
        let trusted = scan(1, -61, 0);
        let unknown = scan(2, -60, 0);
        stats.record_failure(selector.identity_of(&unknown));
        stats.record_success(selector.identity_of(&trusted), Instant::now());

        tokio::time::advance(Duration::from_secs(120)).await;
        selector.add(&[unknown, trusted.clone()]);
        let selected = selector.select(Instant::now(), &stats);
        assert_eq!(selected[0], trusted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_count_then_average_break_ties() {
        let selector = selector();
        selector.add(&[
            scan(1, -60, 0),
            scan(2, -61, 0),
            scan(2, -61, 1),
            scan(3, -58, 0),
        ]);
        let order: Vec<_> = selector
            .select(Instant::now(), &stats())
            .into_iter()
            .map(|s| s.address)
            .collect();
        assert_eq!(order, vec![address(2), address(3), address(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recency_only_when_sensitive() {
        let batch = [scan(1, -60, 0), scan(2, -60, 1_000)];

        let plain = selector();
        plain.add(&batch);
        let stats = stats();
        // Same bracket, confidence, count and average: raw timestamp decides.
        assert_eq!(plain.select(Instant::now(), &stats)[0].address, address(2));

        let sensitive = DeviceSelector::new(
            Arc::new(PayloadHashResolver),
            SelectorSettings {
                recency_sensitive: true,
                ..settings()
            },
        );
        sensitive.add(&[scan(1, -59, 0), scan(2, -60, 1_000)]);
        // Bracket equal (-6); the newer timestamp bracket outranks the
        // stronger average.
        assert_eq!(sensitive.select(Instant::now(), &stats)[0].address, address(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_selection_is_deterministic() {
        let batch: Vec<_> = (0..20u8)
            .map(|i| scan(i % 7, -50 - i32::from(i % 5), i64::from(i % 3)))
            .collect();
        let stats = stats();
        let first = {
            let selector = selector();
            selector.add(&batch);
            selector.select(Instant::now(), &stats)
        };
        for _ in 0..5 {
            let selector = selector();
            selector.add(&batch);
            assert_eq!(selector.select(Instant::now(), &stats), first);
        }
    }
}
