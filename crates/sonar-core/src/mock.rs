//! In-memory radio for tests and hardware-less hosts.
//!
//! [`SimulatedRadio`] implements every transport over a set of
//! [`SimulatedPeer`]s. It counts session starts and stops so tests can assert
//! that nothing leaks, and it can be told to fail.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{Result, SonarError, Subsystem};
use crate::payload::Payload;
use crate::transport::{
    BroadcastCallback, BroadcastTransport, ConnectionCallback, ConnectionEvent,
    ConnectionTransport, DiscoveryCallback, DiscoveryEvent, DiscoveryTransport, ExchangeOutcome,
    PayloadSource, ProximityCallback, Transports,
};
use crate::types::{Capabilities, DeviceAddress, IdentityPayload, ProximityEvent, ScannedDevice};

/// Platform code reported for simulated link failures.
pub const SIMULATED_LINK_ERROR: i32 = 133;

/// A peer within simulated radio range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedPeer {
    /// Current address.
    pub address: DeviceAddress,
    /// The peer's payload.
    pub payload: Payload,
    /// Signal strength at which it is heard.
    pub rssi: i32,
    /// Whether scans carry its payload as service data.
    pub broadcasts_payload: bool,
    /// Whether it exposes the exchange service.
    pub exposes_service: bool,
    /// How long one exchange session takes.
    pub exchange_latency: Duration,
}

impl SimulatedPeer {
    /// A broadcasting peer with a short exchange latency.
    #[must_use]
    pub const fn new(address: DeviceAddress, payload: Payload, rssi: i32) -> Self {
        Self {
            address,
            payload,
            rssi,
            broadcasts_payload: true,
            exposes_service: true,
            exchange_latency: Duration::from_millis(50),
        }
    }

    /// Scans of this peer carry no service data.
    #[must_use]
    pub const fn silent(mut self) -> Self {
        self.broadcasts_payload = false;
        self
    }

    /// The peer does not expose the exchange service.
    #[must_use]
    pub const fn without_service(mut self) -> Self {
        self.exposes_service = false;
        self
    }

    /// Set the exchange latency.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.exchange_latency = latency;
        self
    }

    fn scan(&self) -> ScannedDevice {
        let scan = ScannedDevice::new(self.address, self.rssi, Utc::now());
        if self.broadcasts_payload {
            scan.with_payload(self.payload.encode())
        } else {
            scan
        }
    }
}

/// Counters of transport calls.
#[derive(Debug, Default)]
pub struct RadioCounters {
    /// Accepted discovery starts.
    pub discovery_starts: AtomicUsize,
    /// Discovery stops.
    pub discovery_stops: AtomicUsize,
    /// Accepted broadcast starts.
    pub broadcast_starts: AtomicUsize,
    /// Broadcast stops.
    pub broadcast_stops: AtomicUsize,
    /// Accepted responder starts.
    pub responder_starts: AtomicUsize,
    /// Responder stops.
    pub responder_stops: AtomicUsize,
    /// Exchange sessions attempted.
    pub exchanges: AtomicUsize,
    /// Exchange sessions currently open.
    pub open_exchanges: AtomicUsize,
    /// Highest number of simultaneously open sessions.
    pub max_open_exchanges: AtomicUsize,
}

impl RadioCounters {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct RadioState {
    peers: Vec<SimulatedPeer>,
    discovery_task: Option<JoinHandle<()>>,
    responder: Option<ConnectionCallback>,
    broadcasting: Option<Vec<u8>>,
    broadcast_callback: Option<BroadcastCallback>,
    refuse_discovery_starts: u32,
    discovery_error: Option<Option<i32>>,
    refuse_broadcast_starts: u32,
    failing_exchanges: u32,
    written: Vec<(DeviceAddress, Vec<u8>)>,
}

/// In-memory implementation of every radio transport.
#[derive(Clone)]
pub struct SimulatedRadio {
    handle: Handle,
    state: Arc<Mutex<RadioState>>,
    counters: Arc<RadioCounters>,
    discovery_interval: Duration,
}

impl SimulatedRadio {
    /// Create a radio bound to the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    #[must_use]
    pub fn new() -> Self {
        Self::with_handle(Handle::current())
    }

    /// Create a radio whose discovery tasks run on `handle`.
    #[must_use]
    pub fn with_handle(handle: Handle) -> Self {
        Self {
            handle,
            state: Arc::new(Mutex::new(RadioState::default())),
            counters: Arc::new(RadioCounters::default()),
            discovery_interval: Duration::from_millis(100),
        }
    }

    /// Period between two discovery batches.
    #[must_use]
    pub const fn with_discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval = interval;
        self
    }

    /// Transports of a platform with the given capabilities.
    #[must_use]
    pub fn transports(&self, capabilities: Capabilities) -> Transports {
        let radio = Arc::new(self.clone());
        Transports {
            capabilities,
            discovery: radio.clone(),
            broadcast: capabilities
                .can_broadcast
                .then(|| radio.clone() as Arc<dyn BroadcastTransport>),
            connection: radio,
        }
    }

    /// Bring a peer into range, replacing any peer at the same address.
    pub fn add_peer(&self, peer: SimulatedPeer) {
        let mut state = self.lock();
        state.peers.retain(|p| p.address != peer.address);
        state.peers.push(peer);
    }

    /// Take a peer out of range.
    pub fn remove_peer(&self, address: DeviceAddress) {
        self.lock().peers.retain(|p| p.address != address);
    }

    /// Refuse the next `count` discovery starts.
    pub fn refuse_discovery_starts(&self, count: u32) {
        self.lock().refuse_discovery_starts = count;
    }

    /// Make the next accepted discovery session report an error instead of
    /// results.
    pub fn fail_next_discovery(&self, code: Option<i32>) {
        self.lock().discovery_error = Some(code);
    }

    /// Refuse the next `count` broadcast starts.
    pub fn refuse_broadcast_starts(&self, count: u32) {
        self.lock().refuse_broadcast_starts = count;
    }

    /// Fail the next `count` exchange sessions with a link error.
    pub fn fail_exchanges(&self, count: u32) {
        self.lock().failing_exchanges = count;
    }

    /// Play a peer writing `bytes` to the local responder.
    ///
    /// Returns `false` if the responder is not running.
    pub fn inject_incoming(&self, address: DeviceAddress, bytes: Vec<u8>) -> bool {
        let responder = self.lock().responder.clone();
        responder.is_some_and(|callback| {
            callback(ConnectionEvent::PayloadReceived { address, bytes });
            true
        })
    }

    /// Play the responder failing.
    pub fn inject_responder_error(&self, code: Option<i32>) -> bool {
        let responder = self.lock().responder.clone();
        responder.is_some_and(|callback| {
            callback(ConnectionEvent::Failed(code));
            true
        })
    }

    /// Play the broadcaster failing.
    pub fn inject_broadcast_error(&self, code: Option<i32>) -> bool {
        let callback = self.lock().broadcast_callback.clone();
        callback.is_some_and(|callback| {
            callback(code);
            true
        })
    }

    /// Bytes currently being broadcast.
    #[must_use]
    pub fn broadcasting(&self) -> Option<Vec<u8>> {
        self.lock().broadcasting.clone()
    }

    /// Whether a discovery session is running.
    #[must_use]
    pub fn is_discovering(&self) -> bool {
        self.lock().discovery_task.is_some()
    }

    /// Whether the responder is running.
    #[must_use]
    pub fn is_responding(&self) -> bool {
        self.lock().responder.is_some()
    }

    /// Every payload written to a peer, in order.
    #[must_use]
    pub fn written_payloads(&self) -> Vec<(DeviceAddress, Vec<u8>)> {
        self.lock().written.clone()
    }

    /// Call counters.
    #[must_use]
    pub fn counters(&self) -> &RadioCounters {
        &self.counters
    }

    /// Shorthand for reading one counter.
    #[must_use]
    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RadioState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn peer(&self, address: DeviceAddress) -> Option<SimulatedPeer> {
        self.lock()
            .peers
            .iter()
            .find(|p| p.address == address)
            .cloned()
    }
}

impl Default for SimulatedRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscoveryTransport for SimulatedRadio {
    fn start(&self, callback: DiscoveryCallback) -> bool {
        let mut state = self.lock();
        if state.refuse_discovery_starts > 0 {
            state.refuse_discovery_starts -= 1;
            debug!("simulated discovery start refused");
            return false;
        }
        if let Some(task) = state.discovery_task.take() {
            task.abort();
        }
        RadioCounters::bump(&self.counters.discovery_starts);

        let failure = state.discovery_error.take();
        let shared = self.state.clone();
        let interval = self.discovery_interval;
        state.discovery_task = Some(self.handle.spawn(async move {
            if let Some(code) = failure {
                tokio::time::sleep(interval).await;
                callback(DiscoveryEvent::Failed(code));
                return;
            }
            loop {
                tokio::time::sleep(interval).await;
                let batch: Vec<_> = shared
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .peers
                    .iter()
                    .map(SimulatedPeer::scan)
                    .collect();
                if !batch.is_empty() {
                    callback(DiscoveryEvent::Batch(batch));
                }
            }
        }));
        true
    }

    fn stop(&self) {
        RadioCounters::bump(&self.counters.discovery_stops);
        if let Some(task) = self.lock().discovery_task.take() {
            task.abort();
        }
    }
}

impl BroadcastTransport for SimulatedRadio {
    fn start(&self, payload: Vec<u8>, callback: BroadcastCallback) -> bool {
        let mut state = self.lock();
        if state.refuse_broadcast_starts > 0 {
            state.refuse_broadcast_starts -= 1;
            return false;
        }
        RadioCounters::bump(&self.counters.broadcast_starts);
        state.broadcasting = Some(payload);
        state.broadcast_callback = Some(callback);
        true
    }

    fn stop(&self) {
        RadioCounters::bump(&self.counters.broadcast_stops);
        let mut state = self.lock();
        state.broadcasting = None;
        state.broadcast_callback = None;
    }
}

struct OpenSession<'a>(&'a RadioCounters);

impl<'a> OpenSession<'a> {
    fn open(counters: &'a RadioCounters) -> Self {
        let open = counters.open_exchanges.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_open_exchanges.fetch_max(open, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for OpenSession<'_> {
    fn drop(&mut self) {
        self.0.open_exchanges.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectionTransport for SimulatedRadio {
    fn start(&self, callback: ConnectionCallback) -> bool {
        RadioCounters::bump(&self.counters.responder_starts);
        self.lock().responder = Some(callback);
        true
    }

    fn stop(&self) {
        RadioCounters::bump(&self.counters.responder_stops);
        self.lock().responder = None;
    }

    async fn request_remote_rssi(&self, address: DeviceAddress) -> Result<i32> {
        let peer = self.peer(address).ok_or(SonarError::TransportRuntime {
            subsystem: Subsystem::Connection,
            code: Some(SIMULATED_LINK_ERROR),
        })?;
        tokio::time::sleep(peer.exchange_latency).await;
        Ok(peer.rssi)
    }

    async fn exchange(
        &self,
        address: DeviceAddress,
        payload: Vec<u8>,
        read_remote: bool,
    ) -> Result<ExchangeOutcome> {
        RadioCounters::bump(&self.counters.exchanges);
        let _session = OpenSession::open(&self.counters);
        let link_error = SonarError::TransportRuntime {
            subsystem: Subsystem::Connection,
            code: Some(SIMULATED_LINK_ERROR),
        };

        let peer = self.peer(address).ok_or_else(|| link_error.clone())?;
        tokio::time::sleep(peer.exchange_latency).await;

        {
            let mut state = self.lock();
            if state.failing_exchanges > 0 {
                state.failing_exchanges -= 1;
                return Err(link_error);
            }
            if !peer.exposes_service {
                return Err(SonarError::ServiceNotFound(address));
            }
            state.written.push((address, payload));
        }

        Ok(ExchangeOutcome {
            rssi: Some(peer.rssi),
            payload: read_remote.then(|| peer.payload.encode()),
        })
    }
}

/// A payload source returning a settable identity.
#[derive(Debug, Default)]
pub struct StaticPayloadSource {
    identity: Mutex<IdentityPayload>,
}

impl StaticPayloadSource {
    /// Source returning `identity`.
    #[must_use]
    pub const fn new(identity: IdentityPayload) -> Self {
        Self {
            identity: Mutex::new(identity),
        }
    }

    /// Replace the identity.
    pub fn set(&self, identity: IdentityPayload) {
        *self.identity.lock().unwrap_or_else(PoisonError::into_inner) = identity;
    }
}

impl PayloadSource for StaticPayloadSource {
    fn current(&self) -> IdentityPayload {
        *self.identity.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A callback that keeps everything it receives.
#[derive(Debug, Default)]
pub struct CollectingCallback {
    events: Mutex<Vec<ProximityEvent>>,
    errors: Mutex<Vec<SonarError>>,
    notify: Notify,
}

impl CollectingCallback {
    /// Empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Events received so far.
    #[must_use]
    pub fn events(&self) -> Vec<ProximityEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Errors received so far.
    #[must_use]
    pub fn errors(&self) -> Vec<SonarError> {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wait until at least `count` events have arrived.
    pub async fn wait_for_events(&self, count: usize) -> Vec<ProximityEvent> {
        loop {
            let notified = self.notify.notified();
            let events = self.events();
            if events.len() >= count {
                return events;
            }
            notified.await;
        }
    }

    /// Wait until at least `count` errors have arrived.
    pub async fn wait_for_errors(&self, count: usize) -> Vec<SonarError> {
        loop {
            let notified = self.notify.notified();
            let errors = self.errors();
            if errors.len() >= count {
                return errors;
            }
            notified.await;
        }
    }
}

impl ProximityCallback for CollectingCallback {
    fn on_proximity(&self, event: ProximityEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
        self.notify.notify_waiters();
    }

    fn on_error(&self, error: SonarError) {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(error);
        self.notify.notify_waiters();
    }
}
