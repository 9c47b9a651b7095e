//! Fixed-size payload codec.
//!
//! Layout:
//!
//! ```text
//! +----------------------+---------+----------+---------------------+
//! | identity (16 bytes)  | version | tx_power | calibrated rssi (?) |
//! +----------------------+---------+----------+---------------------+
//!   0..16                  16        17         18 (stamped form only)
//! ```
//!
//! The stamped form is what a discovery-only device writes during an
//! exchange session: the 18-byte envelope followed by the RSSI it measured,
//! already corrected for its own receive gain.

use crate::types::{IdentityPayload, IDENTITY_PAYLOAD_SIZE};

/// Size of the encoded envelope.
pub const PAYLOAD_SIZE: usize = IDENTITY_PAYLOAD_SIZE + 2;

/// Size of the stamped exchange form.
pub const STAMPED_PAYLOAD_SIZE: usize = PAYLOAD_SIZE + 1;

/// Protocol version written into every payload.
pub const PAYLOAD_VERSION: u8 = 1;

const VERSION_OFFSET: usize = IDENTITY_PAYLOAD_SIZE;
const TX_POWER_OFFSET: usize = IDENTITY_PAYLOAD_SIZE + 1;
const RSSI_OFFSET: usize = PAYLOAD_SIZE;

/// The identity record exchanged between peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Payload {
    /// Rotating identity from the outer cryptographic layer.
    pub identity: IdentityPayload,
    /// Payload format version.
    pub version: u8,
    /// Transmit compensation of the sender, in dB.
    pub tx_power: i8,
}

/// Error decoding a payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    /// Fewer bytes than the envelope requires.
    #[error("malformed payload: expected at least {expected} bytes, got {actual}")]
    Malformed {
        /// Minimum number of bytes.
        expected: usize,
        /// Number of bytes supplied.
        actual: usize,
    },
}

impl Payload {
    /// Build a payload with the current protocol version.
    #[must_use]
    pub const fn new(identity: IdentityPayload, tx_power: i8) -> Self {
        Self {
            identity,
            version: PAYLOAD_VERSION,
            tx_power,
        }
    }

    /// Decode the envelope from the front of `bytes`.
    ///
    /// Trailing bytes are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::Malformed`] if fewer than [`PAYLOAD_SIZE`]
    /// bytes are supplied.
    pub fn decode(bytes: &[u8]) -> Result<Self, PayloadError> {
        if bytes.len() < PAYLOAD_SIZE {
            return Err(PayloadError::Malformed {
                expected: PAYLOAD_SIZE,
                actual: bytes.len(),
            });
        }
        let mut identity = [0u8; IDENTITY_PAYLOAD_SIZE];
        identity.copy_from_slice(&bytes[..IDENTITY_PAYLOAD_SIZE]);
        Ok(Self {
            identity: IdentityPayload(identity),
            version: bytes[VERSION_OFFSET],
            tx_power: i8::from_ne_bytes([bytes[TX_POWER_OFFSET]]),
        })
    }

    /// Encode into exactly [`PAYLOAD_SIZE`] bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PAYLOAD_SIZE);
        out.extend_from_slice(self.identity.as_bytes());
        out.push(self.version);
        out.extend_from_slice(&self.tx_power.to_ne_bytes());
        out
    }

    /// Encode with a trailing calibrated RSSI, clamped to the `i8` range.
    #[must_use]
    pub fn encode_stamped(&self, calibrated_rssi: i32) -> Vec<u8> {
        let mut out = self.encode();
        let clamped = i8::try_from(calibrated_rssi.clamp(i32::from(i8::MIN), i32::from(i8::MAX)))
            .unwrap_or(i8::MIN);
        out.extend_from_slice(&clamped.to_ne_bytes());
        out
    }

    /// Decode the stamped exchange form.
    ///
    /// The RSSI is `None` when only the plain envelope was sent.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::Malformed`] if fewer than [`PAYLOAD_SIZE`]
    /// bytes are supplied.
    pub fn decode_stamped(bytes: &[u8]) -> Result<(Self, Option<i32>), PayloadError> {
        let payload = Self::decode(bytes)?;
        let rssi = bytes
            .get(RSSI_OFFSET)
            .map(|b| i32::from(i8::from_ne_bytes([*b])));
        Ok((payload, rssi))
    }
}
