//! Collaborator interfaces.
//!
//! The engine never touches radio hardware or identity cryptography
//! directly. Hosts plug those in through the traits below:
//!
//! | Trait | Role |
//! |---|---|
//! | [`DiscoveryTransport`] | passive scanning |
//! | [`BroadcastTransport`] | advertising our payload |
//! | [`ConnectionTransport`] | exchange sessions and the local responder |
//! | [`PayloadSource`] | current rotating identity |
//! | [`IdentityResolver`] | payload to logical peer |
//! | [`ProximityCallback`] | where results and errors go |
//!
//! `start`/`stop` methods are synchronous and always invoked on the
//! [`RadioExecutor`](crate::radio::RadioExecutor). Callbacks may fire from
//! any thread.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Result, SonarError};
use crate::payload::Payload;
use crate::types::{
    Capabilities, DeviceAddress, DeviceIdentity, IdentityPayload, ProximityEvent, ScannedDevice,
};

// =============================================================================
// DISCOVERY
// =============================================================================

/// Delivered by a running discovery session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A batch of observations, in arrival order.
    Batch(Vec<ScannedDevice>),
    /// The session failed, with the platform error code if any.
    Failed(Option<i32>),
}

/// Receives discovery events.
pub type DiscoveryCallback = Arc<dyn Fn(DiscoveryEvent) + Send + Sync>;

/// Passive scanning for peers.
pub trait DiscoveryTransport: Send + Sync {
    /// Start a session. Returns `false` if the platform refused.
    fn start(&self, callback: DiscoveryCallback) -> bool;

    /// Stop the current session. Must tolerate being called when idle.
    fn stop(&self);
}

// =============================================================================
// BROADCAST
// =============================================================================

/// Receives broadcast errors, with the platform error code if any.
pub type BroadcastCallback = Arc<dyn Fn(Option<i32>) + Send + Sync>;

/// Advertising of the local payload.
pub trait BroadcastTransport: Send + Sync {
    /// Start broadcasting `payload`. Returns `false` if the platform refused.
    fn start(&self, payload: Vec<u8>, callback: BroadcastCallback) -> bool;

    /// Stop broadcasting.
    fn stop(&self);
}

// =============================================================================
// CONNECTION
// =============================================================================

/// Delivered by the local exchange responder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A peer wrote its payload to us.
    PayloadReceived {
        /// Address of the writing peer.
        address: DeviceAddress,
        /// Bytes written, possibly the stamped form.
        bytes: Vec<u8>,
    },
    /// The responder failed, with the platform error code if any.
    Failed(Option<i32>),
}

/// Receives responder events.
pub type ConnectionCallback = Arc<dyn Fn(ConnectionEvent) + Send + Sync>;

/// What an exchange session brought back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExchangeOutcome {
    /// RSSI of the peer measured during the session.
    pub rssi: Option<i32>,
    /// The peer's payload, when it was read.
    pub payload: Option<Vec<u8>>,
}

/// Exchange sessions with peers, and the local responder.
#[async_trait]
pub trait ConnectionTransport: Send + Sync {
    /// Start the local responder. Returns `false` if the platform refused.
    fn start(&self, callback: ConnectionCallback) -> bool;

    /// Stop the local responder.
    fn stop(&self);

    /// Read the current RSSI of a connected peer.
    async fn request_remote_rssi(&self, address: DeviceAddress) -> Result<i32>;

    /// Connect to `address`, write `payload`, and read the peer's payload
    /// back when `read_remote` is set.
    ///
    /// Implementations return [`SonarError::ServiceNotFound`] when the peer
    /// does not expose the exchange service.
    async fn exchange(
        &self,
        address: DeviceAddress,
        payload: Vec<u8>,
        read_remote: bool,
    ) -> Result<ExchangeOutcome>;
}

// =============================================================================
// HOST COLLABORATORS
// =============================================================================

/// The outer cryptographic layer's current identity.
pub trait PayloadSource: Send + Sync {
    /// Identity to advertise and exchange right now.
    fn current(&self) -> IdentityPayload;
}

/// Maps a decoded payload to a logical peer.
pub trait IdentityResolver: Send + Sync {
    /// `None` falls back to the address hash.
    fn resolve(&self, payload: &Payload) -> Option<DeviceIdentity>;
}

/// Default resolver: a stable hash of the identity bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct PayloadHashResolver;

impl IdentityResolver for PayloadHashResolver {
    fn resolve(&self, payload: &Payload) -> Option<DeviceIdentity> {
        Some(DeviceIdentity::from_payload(payload))
    }
}

/// Where the engine reports to.
pub trait ProximityCallback: Send + Sync {
    /// A peer was detected.
    fn on_proximity(&self, event: ProximityEvent);

    /// Something went wrong. Fatal errors end the run loop.
    fn on_error(&self, error: SonarError);
}

/// The radio transports of one platform.
#[derive(Clone)]
pub struct Transports {
    /// What the platform can do.
    pub capabilities: Capabilities,
    /// Passive scanning.
    pub discovery: Arc<dyn DiscoveryTransport>,
    /// Advertising, when the platform can broadcast.
    pub broadcast: Option<Arc<dyn BroadcastTransport>>,
    /// Exchange sessions and the responder.
    pub connection: Arc<dyn ConnectionTransport>,
}

impl Transports {
    /// Whether the broadcast strategy can run.
    #[must_use]
    pub fn can_broadcast(&self) -> bool {
        self.capabilities.can_broadcast && self.broadcast.is_some()
    }
}
