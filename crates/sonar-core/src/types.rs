//! Shared domain types.
//!
//! Addresses, identities, scans and records flow through every stage of the
//! engine: discovery produces [`ScannedDevice`]s, correlation and exchange
//! produce [`Record`]s, and the reporter turns records into
//! [`ProximityEvent`]s for the host.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use xxhash_rust::xxh64::xxh64;

use crate::payload::Payload;

/// Size in bytes of the rotating identity carried in every payload.
pub const IDENTITY_PAYLOAD_SIZE: usize = 16;

static ADDRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9A-Fa-f]{2}:){5}[0-9A-Fa-f]{2}$").expect("address pattern is valid")
});

const IDENTITY_SEED: u64 = 0x736f_6e61_725f_6964;

// =============================================================================
// ADDRESSES & IDENTITIES
// =============================================================================

/// Transport-level address of a discovered device.
///
/// Addresses rotate over time for the same logical peer; use
/// [`DeviceIdentity`] to correlate them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceAddress([u8; 6]);

impl DeviceAddress {
    /// Build an address from its six octets.
    #[must_use]
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// The raw octets.
    #[must_use]
    pub const fn octets(&self) -> &[u8; 6] {
        &self.0
    }
}

/// Returns `true` if `s` is a colon-separated hexadecimal address
/// (`AA:BB:CC:DD:EE:FF`).
#[must_use]
pub fn is_valid_address(s: &str) -> bool {
    ADDRESS_RE.is_match(s)
}

/// Error returned when parsing a [`DeviceAddress`] fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid device address: '{0}'. Expected format AA:BB:CC:DD:EE:FF")]
pub struct InvalidAddress(pub String);

impl FromStr for DeviceAddress {
    type Err = InvalidAddress;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !is_valid_address(s) {
            return Err(InvalidAddress(s.to_string()));
        }
        let mut octets = [0u8; 6];
        for (slot, part) in octets.iter_mut().zip(s.split(':')) {
            *slot = u8::from_str_radix(part, 16).map_err(|_| InvalidAddress(s.to_string()))?;
        }
        Ok(Self(octets))
    }
}

impl TryFrom<String> for DeviceAddress {
    type Error = InvalidAddress;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceAddress> for String {
    fn from(value: DeviceAddress) -> Self {
        value.to_string()
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

/// Stable logical identity of a peer.
///
/// Derived from the decoded payload's identity bytes when available, and
/// from the device address otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceIdentity(pub u64);

impl DeviceIdentity {
    /// Identity of a decoded payload (hash of its identity bytes).
    #[must_use]
    pub fn from_payload(payload: &Payload) -> Self {
        Self(xxh64(payload.identity.as_bytes(), IDENTITY_SEED))
    }

    /// Fallback identity derived from the transport address.
    #[must_use]
    pub fn from_address(address: &DeviceAddress) -> Self {
        Self(xxh64(address.octets(), IDENTITY_SEED))
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// The rotating identity produced by the outer cryptographic layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct IdentityPayload(pub [u8; IDENTITY_PAYLOAD_SIZE]);

impl IdentityPayload {
    /// The raw identity bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; IDENTITY_PAYLOAD_SIZE] {
        &self.0
    }

    /// Build an identity payload from a slice of exactly
    /// [`IDENTITY_PAYLOAD_SIZE`] bytes.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; IDENTITY_PAYLOAD_SIZE]>::try_from(bytes).ok().map(Self)
    }
}

// =============================================================================
// SCANS, RECORDS, EVENTS
// =============================================================================

/// One discovery observation of a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedDevice {
    /// Transport address the observation came from.
    pub address: DeviceAddress,
    /// Service data broadcast by the peer, if it advertises one.
    pub identity_payload: Option<Vec<u8>>,
    /// Received signal strength in dBm.
    pub rssi: i32,
    /// When the observation was made.
    pub timestamp: DateTime<Utc>,
}

impl ScannedDevice {
    /// Create a scan without service data.
    #[must_use]
    pub const fn new(address: DeviceAddress, rssi: i32, timestamp: DateTime<Utc>) -> Self {
        Self {
            address,
            identity_payload: None,
            rssi,
            timestamp,
        }
    }

    /// Attach broadcast service data to this scan.
    #[must_use]
    pub fn with_payload(mut self, bytes: Vec<u8>) -> Self {
        self.identity_payload = Some(bytes);
        self
    }

    /// Decode the broadcast service data, dropping malformed bytes.
    #[must_use]
    pub fn decoded_payload(&self) -> Option<Payload> {
        self.identity_payload
            .as_deref()
            .and_then(|bytes| Payload::decode(bytes).ok())
    }
}

/// A correlated observation ready for calibration.
///
/// Immutable once built. `is_rssi_calibrated` is set when the RSSI was
/// measured and partially calibrated by the peer rather than locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// The peer's payload.
    pub payload: Payload,
    /// Signal strength in dBm.
    pub rssi: i32,
    /// When the observation was made.
    pub timestamp: DateTime<Utc>,
    /// Whether `rssi` was already partially calibrated by the peer.
    pub is_rssi_calibrated: bool,
}

impl Record {
    /// Record whose RSSI was measured locally.
    #[must_use]
    pub const fn measured(payload: Payload, rssi: i32, timestamp: DateTime<Utc>) -> Self {
        Self {
            payload,
            rssi,
            timestamp,
            is_rssi_calibrated: false,
        }
    }

    /// Record carrying an RSSI the peer measured and stamped.
    #[must_use]
    pub const fn stamped(payload: Payload, rssi: i32, timestamp: DateTime<Utc>) -> Self {
        Self {
            payload,
            rssi,
            timestamp,
            is_rssi_calibrated: true,
        }
    }
}

/// Signal metadata attached to a proximity event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ProximityMetadata {
    /// RSSI as carried by the record (dBm).
    #[schema(example = -62)]
    pub raw_rssi: i32,
    /// RSSI after transmit/receive compensation (dBm).
    #[schema(example = -70)]
    pub calibrated_rssi: i32,
    /// Transmit compensation advertised by the peer.
    #[schema(example = -8)]
    pub tx_power: i8,
}

/// What the host receives for every detected peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProximityEvent {
    /// The peer's payload.
    pub payload: Payload,
    /// Calibrated signal information.
    pub metadata: ProximityMetadata,
    /// When the observation was made.
    pub timestamp: DateTime<Utc>,
}

/// Platform capabilities, probed once by the host at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    /// The radio can broadcast our payload.
    pub can_broadcast: bool,
    /// The radio stack is known to misbehave under session churn.
    pub legacy_radio_stack: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_roundtrip_display() {
        let address: DeviceAddress = "aa:bb:cc:01:02:03".parse().unwrap();
        assert_eq!(address.octets(), &[0xAA, 0xBB, 0xCC, 0x01, 0x02, 0x03]);
        assert_eq!(address.to_string(), "AA:BB:CC:01:02:03");
    }

    #[test]
    fn test_invalid_addresses_rejected() {
        assert!("".parse::<DeviceAddress>().is_err());
        assert!("AA:BB:CC:DD:EE".parse::<DeviceAddress>().is_err());
        assert!("AA-BB-CC-DD-EE-FF".parse::<DeviceAddress>().is_err());
        assert!("GG:BB:CC:DD:EE:FF".parse::<DeviceAddress>().is_err());
    }

    #[test]
    fn test_address_serde_as_string() {
        let address = DeviceAddress::new([1, 2, 3, 4, 5, 6]);
        let json = serde_json::to_string(&address).unwrap();
        assert_eq!(json, "\"01:02:03:04:05:06\"");
        let back: DeviceAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, address);
    }

    #[test]
    fn test_identity_from_address_is_stable() {
        let address = DeviceAddress::new([1, 2, 3, 4, 5, 6]);
        assert_eq!(
            DeviceIdentity::from_address(&address),
            DeviceIdentity::from_address(&address)
        );
        assert_ne!(
            DeviceIdentity::from_address(&address),
            DeviceIdentity::from_address(&DeviceAddress::new([1, 2, 3, 4, 5, 7]))
        );
    }

    #[test]
    fn test_identity_payload_from_slice() {
        assert!(IdentityPayload::from_slice(&[0u8; IDENTITY_PAYLOAD_SIZE]).is_some());
        assert!(IdentityPayload::from_slice(&[0u8; 3]).is_none());
    }

    #[test]
    fn test_malformed_service_data_is_dropped() {
        let scan = ScannedDevice::new(DeviceAddress::new([0; 6]), -50, Utc::now())
            .with_payload(vec![1, 2, 3]);
        assert!(scan.decoded_payload().is_none());
    }
}
