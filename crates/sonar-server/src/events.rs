//! Recent engine output, kept for the API.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sonar_core::{ProximityCallback, ProximityEvent, SonarError};
use tracing::{error, info};
use utoipa::ToSchema;
use uuid::Uuid;

/// A proximity event as served by the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "id": "01927c1e-8a2b-7cc3-9a4e-2f1d6b0c3e11",
    "identity": "00112233445566778899aabbccddeeff",
    "version": 1,
    "tx_power": -8,
    "raw_rssi": -62,
    "calibrated_rssi": -54,
    "observed_at_utc": "2025-01-15T03:30:00Z"
}))]
pub struct ProximityEventView {
    /// Unique id of this event.
    pub id: Uuid,
    /// The peer's identity payload, hex-encoded.
    pub identity: String,
    /// Payload format version.
    pub version: u8,
    /// Transmit compensation advertised by the peer.
    pub tx_power: i8,
    /// RSSI as measured (dBm).
    pub raw_rssi: i32,
    /// RSSI after calibration (dBm).
    pub calibrated_rssi: i32,
    /// When the peer was observed.
    pub observed_at_utc: DateTime<Utc>,
}

impl From<&ProximityEvent> for ProximityEventView {
    fn from(event: &ProximityEvent) -> Self {
        Self {
            id: Uuid::now_v7(),
            identity: hex::encode(event.payload.identity.as_bytes()),
            version: event.payload.version,
            tx_power: event.metadata.tx_power,
            raw_rssi: event.metadata.raw_rssi,
            calibrated_rssi: event.metadata.calibrated_rssi,
            observed_at_utc: event.timestamp,
        }
    }
}

/// An error the engine reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "id": "01927c1e-8a2b-7cc3-9a4e-2f1d6b0c3e12",
    "error_code": "CONNECTION_ERROR",
    "subsystem": "connection",
    "platform_code": 133,
    "message": "connection error (code 133)",
    "fatal": false,
    "reported_at_utc": "2025-01-15T03:30:00Z"
}))]
pub struct ReportedError {
    /// Unique id of this report.
    pub id: Uuid,
    /// Machine-readable error code.
    pub error_code: String,
    /// Radio subsystem involved, if any.
    pub subsystem: Option<String>,
    /// Platform error code, if the radio gave one.
    pub platform_code: Option<i32>,
    /// Human-readable message.
    pub message: String,
    /// Whether the error ended the engine run.
    pub fatal: bool,
    /// When the error was reported.
    pub reported_at_utc: DateTime<Utc>,
}

impl From<&SonarError> for ReportedError {
    fn from(err: &SonarError) -> Self {
        Self {
            id: Uuid::now_v7(),
            error_code: err.error_code().to_string(),
            subsystem: err.subsystem().map(|s| s.to_string()),
            platform_code: err.platform_code(),
            message: err.to_string(),
            fatal: err.is_fatal(),
            reported_at_utc: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
struct Buffers {
    events: VecDeque<ProximityEventView>,
    errors: VecDeque<ReportedError>,
}

/// Bounded memory of the latest events and errors, newest last.
#[derive(Debug)]
pub struct EventLog {
    buffers: Mutex<Buffers>,
    capacity: usize,
}

impl EventLog {
    /// Remember at most `capacity` events and `capacity` errors.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: Mutex::new(Buffers::default()),
            capacity: capacity.max(1),
        }
    }

    /// Up to `limit` most recent events, newest first.
    #[must_use]
    pub fn recent_events(&self, limit: usize) -> Vec<ProximityEventView> {
        self.lock().events.iter().rev().take(limit).cloned().collect()
    }

    /// Up to `limit` most recent errors, newest first.
    #[must_use]
    pub fn recent_errors(&self, limit: usize) -> Vec<ReportedError> {
        self.lock().errors.iter().rev().take(limit).cloned().collect()
    }

    /// Number of remembered events.
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.lock().events.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Buffers> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push<T>(queue: &mut VecDeque<T>, item: T, capacity: usize) {
        if queue.len() == capacity {
            queue.pop_front();
        }
        queue.push_back(item);
    }
}

impl ProximityCallback for EventLog {
    fn on_proximity(&self, event: ProximityEvent) {
        let view = ProximityEventView::from(&event);
        info!(
            identity = %view.identity,
            raw_rssi = view.raw_rssi,
            calibrated_rssi = view.calibrated_rssi,
            "proximity"
        );
        let mut buffers = self.lock();
        Self::push(&mut buffers.events, view, self.capacity);
    }

    fn on_error(&self, err: SonarError) {
        if err.is_fatal() {
            error!(code = err.error_code(), error = %err, "engine stopped on fatal error");
        }
        let mut buffers = self.lock();
        Self::push(&mut buffers.errors, ReportedError::from(&err), self.capacity);
    }
}
