//! RSSI calibration.
//!
//! Radios differ in how loud they transmit and how sensitive they receive.
//! Each device knows its own gains; subtracting both from a raw reading gives
//! a value comparable across device models.

use crate::config::EngineConfig;
use crate::types::{ProximityMetadata, Record};

/// Apply transmit and receive compensation to a raw RSSI.
///
/// Saturates at the `i32` bounds; readings come from the transport unchecked.
#[inline]
#[must_use]
pub const fn calibrate(rssi: i32, tx_compensation: i32, rx_compensation: i32) -> i32 {
    rssi.saturating_sub(tx_compensation).saturating_sub(rx_compensation)
}

/// Partial calibration applied by the measuring side before it knows the
/// peer's transmit gain.
#[inline]
#[must_use]
pub const fn calibrate_partial(rssi: i32, local_rx_compensation: i32) -> i32 {
    calibrate(rssi, 0, local_rx_compensation)
}

/// Finish calibration of a record on the receiving side.
///
/// Locally measured records are compensated with the peer's advertised
/// transmit gain and our receive gain. Records stamped by the peer already
/// carry its receive correction and only lack our transmit gain.
#[must_use]
pub fn metadata_for(record: &Record, config: &EngineConfig) -> ProximityMetadata {
    let calibrated_rssi = if record.is_rssi_calibrated {
        calibrate(record.rssi, i32::from(config.tx_compensation), 0)
    } else {
        calibrate(
            record.rssi,
            i32::from(record.payload.tx_power),
            i32::from(config.rx_compensation),
        )
    };
    ProximityMetadata {
        raw_rssi: record.rssi,
        calibrated_rssi,
        tx_power: record.payload.tx_power,
    }
}
