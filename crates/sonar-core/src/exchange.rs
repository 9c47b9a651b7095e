//! Exchange session with one candidate.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, instrument};

use crate::calibration::calibrate_partial;
use crate::config::EngineConfig;
use crate::discovery::DiscoveryBridge;
use crate::error::{Result, SonarError, Subsystem};
use crate::payload::Payload;
use crate::transport::{ConnectionTransport, PayloadSource};
use crate::types::{DeviceAddress, Record, ScannedDevice};

/// What one exchange brought back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExchangeResult {
    /// RSSI of the peer measured during the session.
    pub remote_rssi: Option<i32>,
    /// The peer's payload, when it was read and decoded.
    pub remote_payload: Option<Payload>,
}

impl ExchangeResult {
    /// Build the record for `candidate`, preferring what the session
    /// returned over what discovery saw. `None` if no payload is known.
    #[must_use]
    pub fn record_for(&self, candidate: &ScannedDevice) -> Option<(ScannedDevice, Payload)> {
        let payload = self.remote_payload.or_else(|| candidate.decoded_payload())?;
        let scan = ScannedDevice {
            rssi: self.remote_rssi.unwrap_or(candidate.rssi),
            ..candidate.clone()
        };
        Some((scan, payload))
    }

    /// Shorthand for a measured [`Record`] built by [`record_for`](Self::record_for).
    #[must_use]
    pub fn to_record(&self, candidate: &ScannedDevice) -> Option<Record> {
        self.record_for(candidate)
            .map(|(scan, payload)| Record::measured(payload, scan.rssi, scan.timestamp))
    }
}

struct SessionSlot<'a> {
    open: &'a Mutex<HashSet<DeviceAddress>>,
    address: DeviceAddress,
}

impl Drop for SessionSlot<'_> {
    fn drop(&mut self) {
        self.open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.address);
    }
}

/// Opens bounded exchange sessions, at most one per address at a time.
pub struct ExchangeSession {
    connection: Arc<dyn ConnectionTransport>,
    discovery: Arc<DiscoveryBridge>,
    payload_source: Arc<dyn PayloadSource>,
    open: Mutex<HashSet<DeviceAddress>>,
    tx_compensation: i8,
    rx_compensation: i8,
    timeout: Duration,
}

impl ExchangeSession {
    /// Create a session factory.
    #[must_use]
    pub fn new(
        connection: Arc<dyn ConnectionTransport>,
        discovery: Arc<DiscoveryBridge>,
        payload_source: Arc<dyn PayloadSource>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            connection,
            discovery,
            payload_source,
            open: Mutex::new(HashSet::new()),
            tx_compensation: config.tx_compensation,
            rx_compensation: config.rx_compensation,
            timeout: config.connection_timeout(),
        }
    }

    /// Exchange payloads with `candidate`.
    ///
    /// Writes our payload stamped with the candidate's partially calibrated
    /// RSSI. The peer's payload is read back only when discovery did not
    /// already carry a decodable one.
    ///
    /// # Errors
    ///
    /// - [`SonarError::SessionBusy`] if a session with this address is open
    /// - [`SonarError::Timeout`] if the session exceeded the connection
    ///   timeout
    /// - any error of the connection transport
    #[instrument(skip_all, fields(address = %candidate.address, rssi = candidate.rssi))]
    pub async fn exchange(&self, candidate: &ScannedDevice) -> Result<ExchangeResult> {
        let address = candidate.address;
        let _slot = self.claim(address)?;

        self.discovery.cancel_pending();

        let local = Payload::new(self.payload_source.current(), self.tx_compensation);
        let stamp = calibrate_partial(candidate.rssi, i32::from(self.rx_compensation));
        let read_remote = candidate.decoded_payload().is_none();

        let outcome = tokio::time::timeout(
            self.timeout,
            self.connection
                .exchange(address, local.encode_stamped(stamp), read_remote),
        )
        .await
        .map_err(|_| SonarError::Timeout {
            subsystem: Subsystem::Connection,
            after: self.timeout,
        })??;

        let remote_payload = outcome.payload.as_deref().and_then(|bytes| {
            Payload::decode(bytes)
                .map_err(|err| debug!(error = %err, "dropping remote payload"))
                .ok()
        });
        debug!(remote_rssi = ?outcome.rssi, read_remote, "exchange complete");

        Ok(ExchangeResult {
            remote_rssi: outcome.rssi,
            remote_payload,
        })
    }

    /// Whether a session with `address` is open.
    #[must_use]
    pub fn is_open(&self, address: DeviceAddress) -> bool {
        self.open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&address)
    }

    fn claim(&self, address: DeviceAddress) -> Result<SessionSlot<'_>> {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        if !open.insert(address) {
            return Err(SonarError::SessionBusy(address));
        }
        Ok(SessionSlot {
            open: &self.open,
            address,
        })
    }
}
