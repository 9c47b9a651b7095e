//! Record correlation.
//!
//! A peer is usually seen twice, asynchronously: once by discovery (which
//! gives us its signal strength) and once by the exchange responder (which
//! gives us its payload). The correlator keeps the last occurrence of each
//! side per address and builds a [`Record`] as soon as both are known.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::cache::ExpiringCache;
use crate::payload::Payload;
use crate::types::{DeviceAddress, Record, ScannedDevice};

struct Maps {
    payloads: ExpiringCache<DeviceAddress, Payload>,
    scans: ExpiringCache<DeviceAddress, ScannedDevice>,
}

/// Merges "payload received" and "device seen" events into records.
///
/// Both maps live under one lock so that "insert, then look up the other
/// side" is atomic.
pub struct RecordCorrelator {
    maps: Mutex<Maps>,
}

impl RecordCorrelator {
    /// Create a correlator whose maps hold at most `capacity` entries each,
    /// expiring `ttl` after insertion.
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            maps: Mutex::new(Maps {
                payloads: ExpiringCache::new(capacity, ttl),
                scans: ExpiringCache::new(capacity, ttl),
            }),
        }
    }

    /// Store a payload received from `address` and correlate it with the
    /// last scan of that address.
    pub fn record_from_payload(&self, address: DeviceAddress, payload: Payload) -> Option<Record> {
        let now = Instant::now();
        let mut maps = self.maps.lock().unwrap_or_else(PoisonError::into_inner);
        maps.payloads.insert(address, payload, now);
        let record = maps
            .scans
            .get(&address, now)
            .map(|scan| Record::measured(payload, scan.rssi, scan.timestamp));
        if record.is_none() {
            debug!(address = %address, "payload stored, waiting for a scan");
        }
        record
    }

    /// Store a scan and correlate it with the last payload received from the
    /// same address. Records are stamped with the scan time.
    pub fn record_from_scan(&self, scan: &ScannedDevice) -> Option<Record> {
        let now = Instant::now();
        let mut maps = self.maps.lock().unwrap_or_else(PoisonError::into_inner);
        maps.scans.insert(scan.address, scan.clone(), now);
        maps.payloads
            .get(&scan.address, now)
            .map(|payload| Record::measured(*payload, scan.rssi, scan.timestamp))
    }

    /// Single-event path: the scan carries its payload inline, so no
    /// correlation is needed. The scan is still stored for later payloads.
    pub fn record_from_scan_with_payload(
        &self,
        scan: &ScannedDevice,
        payload: Payload,
    ) -> Record {
        let now = Instant::now();
        let mut maps = self.maps.lock().unwrap_or_else(PoisonError::into_inner);
        maps.scans.insert(scan.address, scan.clone(), now);
        Record::measured(payload, scan.rssi, scan.timestamp)
    }

    /// Number of stored (payloads, scans), expired entries included.
    #[must_use]
    pub fn occupancy(&self) -> (usize, usize) {
        let maps = self.maps.lock().unwrap_or_else(PoisonError::into_inner);
        (maps.payloads.len(), maps.scans.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IdentityPayload;
    use chrono::Utc;

    fn address(last: u8) -> DeviceAddress {
        DeviceAddress::new([0xAA, 0, 0, 0, 0, last])
    }

    fn payload(seed: u8) -> Payload {
        Payload::new(IdentityPayload([seed; 16]), -8)
    }

    fn correlator() -> RecordCorrelator {
        RecordCorrelator::new(100, Duration::from_secs(60))
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_then_payload() {
        let correlator = correlator();
        let scan = ScannedDevice::new(address(1), -55, Utc::now());
        assert!(correlator.record_from_scan(&scan).is_none());

        let record = correlator.record_from_payload(address(1), payload(7)).unwrap();
        assert_eq!(record.payload, payload(7));
        assert_eq!(record.rssi, -55);
        assert!(!record.is_rssi_calibrated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_payload_then_scan() {
        let correlator = correlator();
        assert!(correlator
            .record_from_payload(address(1), payload(7))
            .is_none());

        let scan = ScannedDevice::new(address(1), -61, Utc::now());
        let record = correlator.record_from_scan(&scan).unwrap();
        assert_eq!(record.payload, payload(7));
        assert_eq!(record.rssi, -61);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_side_only_yields_nothing() {
        let correlator = correlator();
        assert!(correlator
            .record_from_payload(address(1), payload(1))
            .is_none());
        let scan = ScannedDevice::new(address(2), -61, Utc::now());
        assert!(correlator.record_from_scan(&scan).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let correlator = RecordCorrelator::new(100, Duration::from_secs(5));
        let scan = ScannedDevice::new(address(1), -55, Utc::now());
        correlator.record_from_scan(&scan);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(correlator
            .record_from_payload(address(1), payload(7))
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inline_payload_builds_record_directly() {
        let correlator = correlator();
        let scan = ScannedDevice::new(address(3), -70, Utc::now());
        let record = correlator.record_from_scan_with_payload(&scan, payload(3));
        assert_eq!(record.rssi, -70);
        assert_eq!(correlator.occupancy(), (0, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_bounds_both_maps() {
        let correlator = RecordCorrelator::new(4, Duration::from_secs(60));
        for i in 0..20 {
            correlator.record_from_payload(address(i), payload(i));
            correlator.record_from_scan(&ScannedDevice::new(address(100 + i), -50, Utc::now()));
        }
        let (payloads, scans) = correlator.occupancy();
        assert!(payloads <= 4);
        assert!(scans <= 4);
    }
}
