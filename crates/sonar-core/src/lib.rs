//! # sonar-core
//!
//! Proximity exchange engine: devices discover each other over a short-range
//! radio, exchange a small identity payload, and report calibrated signal
//! strength to the host.
//!
//! The host provides the radio transports ([`transport`]), its rotating
//! identity ([`PayloadSource`]) and a result sink ([`ProximityCallback`]),
//! then drives the [`Engine`] through `set_up`, `start` and `stop`.
//!
//! ## Architecture
//!
//! - [`engine`] - lifecycle and the long-lived shared state
//! - [`strategy`] - broadcast and discovery-only exchange loops
//! - [`discovery`] - time-boxed, cancellable discovery sessions
//! - [`exchange`] - one bounded exchange session per candidate
//! - [`selector`] - candidate filtering and ranking
//! - [`correlation`] - merges scans and received payloads into records
//! - [`health`] / [`stats`] - radio health and per-peer statistics
//! - [`payload`] / [`calibration`] - wire envelope and RSSI calibration
//! - [`radio`] - the single controlling radio thread
//! - [`config`] / [`error`] / [`types`] - configuration, errors, shared types

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod cache;
pub mod calibration;
pub mod config;
pub mod correlation;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod health;
#[cfg(any(test, feature = "mock-radio"))]
pub mod mock;
pub mod payload;
pub mod radio;
pub mod selector;
pub mod stats;
pub mod strategy;
pub mod transport;
pub mod types;

// Re-export primary types for convenience
pub use config::{ConfigError, ConfigResult, EngineConfig, PlatformProfile};
pub use engine::Engine;
pub use error::{Result, SonarError, Subsystem};
pub use health::HealthSnapshot;
#[cfg(any(test, feature = "mock-radio"))]
pub use mock::{CollectingCallback, SimulatedPeer, SimulatedRadio, StaticPayloadSource};
pub use payload::{Payload, PayloadError, PAYLOAD_SIZE, PAYLOAD_VERSION};
pub use radio::RadioExecutor;
pub use stats::DeviceStats;
pub use strategy::StrategyKind;
pub use transport::{
    BroadcastTransport, ConnectionTransport, DiscoveryTransport, IdentityResolver,
    PayloadHashResolver, PayloadSource, ProximityCallback, Transports,
};
pub use types::{
    Capabilities, DeviceAddress, DeviceIdentity, IdentityPayload, ProximityEvent,
    ProximityMetadata, ScannedDevice, IDENTITY_PAYLOAD_SIZE,
};
