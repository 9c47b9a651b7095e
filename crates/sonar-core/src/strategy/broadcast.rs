//! Broadcast-capable strategy.
//!
//! Runs three radio subsystems side by side: the exchange responder, the
//! broadcaster and continuous discovery. They start in that order and stop in
//! the reverse one. Peers connect to us, so every discovered device is
//! handled passively through the correlator.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use super::StrategyContext;
use crate::error::{Result, SonarError, Subsystem};
use crate::payload::Payload;
use crate::radio::StopGuard;
use crate::transport::{BroadcastTransport, ConnectionEvent};
use crate::types::{DeviceAddress, IdentityPayload, Record, ScannedDevice};

/// Broadcasts our payload and lets peers come to us.
pub struct BroadcastStrategy {
    ctx: Arc<StrategyContext>,
    broadcast: Arc<dyn BroadcastTransport>,
}

impl BroadcastStrategy {
    /// Create the strategy over a shared context.
    #[must_use]
    pub fn new(ctx: Arc<StrategyContext>, broadcast: Arc<dyn BroadcastTransport>) -> Self {
        Self { ctx, broadcast }
    }

    /// Run until `shutdown` fires or a fatal error occurs.
    ///
    /// # Errors
    ///
    /// Returns [`SonarError::UnstablePlatform`] or
    /// [`SonarError::RadioExecutorStopped`].
    #[instrument(name = "broadcast", skip_all)]
    pub async fn run(
        &self,
        mut payload_updates: watch::Receiver<IdentityPayload>,
        mut shutdown: oneshot::Receiver<()>,
    ) -> Result<()> {
        info!("broadcast strategy running");

        let (responder_tx, mut responder_events) = mpsc::unbounded_channel();
        let responder = self.start_responder(responder_tx).await?;

        let (broadcast_tx, mut broadcast_errors) = mpsc::unbounded_channel();
        let identity = *payload_updates.borrow_and_update();
        let mut broadcaster = Some(self.start_broadcast(identity, broadcast_tx.clone()).await?);

        let mut discovery = Box::pin(self.discover_continuously());

        let mut rssi_requests: JoinSet<Option<Record>> = JoinSet::new();
        let mut updates_live = true;

        let outcome = loop {
            tokio::select! {
                _ = &mut shutdown => break Ok(()),
                result = discovery.as_mut() => break result,
                changed = payload_updates.changed(), if updates_live => {
                    if changed.is_err() {
                        updates_live = false;
                        continue;
                    }
                    let identity = *payload_updates.borrow_and_update();
                    debug!("payload updated, restarting broadcast");
                    if let Some(previous) = broadcaster.take() {
                        previous.finish().await;
                    }
                    match self.start_broadcast(identity, broadcast_tx.clone()).await {
                        Ok(guard) => broadcaster = Some(guard),
                        Err(err) => break Err(err),
                    }
                }
                Some(event) = responder_events.recv() => {
                    self.on_responder_event(event, &mut rssi_requests);
                }
                Some(code) = broadcast_errors.recv() => {
                    self.ctx.reporter.error(SonarError::TransportRuntime {
                        subsystem: Subsystem::Broadcast,
                        code,
                    });
                }
                Some(joined) = rssi_requests.join_next() => {
                    if let Ok(Some(record)) = joined {
                        self.ctx.reporter.report(&record);
                    }
                }
            }
        };

        rssi_requests.abort_all();
        // Dropping the discovery loop queues its stop first; the radio context
        // then runs the remaining stops in order.
        drop(discovery);
        if let Some(broadcaster) = broadcaster {
            broadcaster.finish().await;
        }
        responder.finish().await;
        info!("broadcast strategy stopped");
        outcome
    }

    async fn start_responder(
        &self,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<StopGuard> {
        let connection = self.ctx.transports.connection.clone();
        let guard = StopGuard::new(self.ctx.radio.clone(), move || connection.stop());

        let connection = self.ctx.transports.connection.clone();
        let started = self
            .ctx
            .radio
            .run(move || {
                connection.start(Arc::new(move |event| {
                    let _ = events.send(event);
                }))
            })
            .await?;
        if !started {
            self.ctx.reporter.error(SonarError::TransportStart {
                subsystem: Subsystem::Connection,
                code: None,
            });
        }
        Ok(guard)
    }

    async fn start_broadcast(
        &self,
        identity: IdentityPayload,
        errors: mpsc::UnboundedSender<Option<i32>>,
    ) -> Result<StopGuard> {
        let broadcast = self.broadcast.clone();
        let guard = StopGuard::new(self.ctx.radio.clone(), move || broadcast.stop());

        let bytes = Payload::new(identity, self.ctx.config.tx_compensation).encode();
        let broadcast = self.broadcast.clone();
        let started = self
            .ctx
            .radio
            .run(move || {
                broadcast.start(
                    bytes,
                    Arc::new(move |code| {
                        let _ = errors.send(code);
                    }),
                )
            })
            .await?;
        if !started {
            self.ctx.reporter.error(SonarError::TransportStart {
                subsystem: Subsystem::Broadcast,
                code: None,
            });
        }
        Ok(guard)
    }

    /// Keep a discovery session open, one window at a time, backing off
    /// after failures. Only returns on a fatal error.
    async fn discover_continuously(&self) -> Result<()> {
        let config = &self.ctx.config;
        let mut failures = 0u32;
        loop {
            let result = self
                .ctx
                .discovery
                .discover(
                    config.continuous_discovery_window(),
                    |batch| self.on_scans(batch),
                    |_| None::<()>,
                )
                .await;
            match result {
                Ok(_) | Err(SonarError::Timeout { .. }) => failures = 0,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    failures = failures.saturating_add(1);
                    self.ctx.reporter.error(err);
                    self.ctx.check_health()?;
                    let delay = config.discovery_backoff(failures);
                    debug!(failures, ?delay, "discovery backoff");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn on_scans(&self, batch: &[ScannedDevice]) {
        for scan in batch {
            let record = match scan.decoded_payload() {
                Some(payload) => Some(self.ctx.correlator.record_from_scan_with_payload(scan, payload)),
                None => self.ctx.correlator.record_from_scan(scan),
            };
            if let Some(record) = record {
                self.ctx.reporter.report(&record);
            }
        }
    }

    fn on_responder_event(&self, event: ConnectionEvent, rssi_requests: &mut JoinSet<Option<Record>>) {
        match event {
            ConnectionEvent::PayloadReceived { address, bytes } => {
                match Payload::decode_stamped(&bytes) {
                    Ok((payload, stamp)) => self.on_payload(address, payload, stamp, rssi_requests),
                    Err(err) => debug!(%address, error = %err, "dropping malformed payload"),
                }
            }
            ConnectionEvent::Failed(code) => {
                self.ctx.reporter.error(SonarError::TransportRuntime {
                    subsystem: Subsystem::Connection,
                    code,
                });
            }
        }
    }

    /// A peer wrote its payload to us. Use the scan we correlate it with,
    /// else the RSSI it stamped, else ask the radio for its current RSSI.
    fn on_payload(
        &self,
        address: DeviceAddress,
        payload: Payload,
        stamp: Option<i32>,
        rssi_requests: &mut JoinSet<Option<Record>>,
    ) {
        if let Some(record) = self.ctx.correlator.record_from_payload(address, payload) {
            self.ctx.reporter.report(&record);
            return;
        }
        if let Some(rssi) = stamp {
            self.ctx.reporter.report(&Record::stamped(payload, rssi, Utc::now()));
            return;
        }

        let connection = self.ctx.transports.connection.clone();
        let reporter = self.ctx.reporter.clone();
        let timeout = self.ctx.config.connection_timeout();
        rssi_requests.spawn(async move {
            match tokio::time::timeout(timeout, connection.request_remote_rssi(address)).await {
                Ok(Ok(rssi)) => Some(Record::measured(payload, rssi, Utc::now())),
                Ok(Err(err)) => {
                    reporter.error(err);
                    None
                }
                Err(_) => {
                    warn!(%address, "remote rssi request timed out");
                    reporter.error(SonarError::Timeout {
                        subsystem: Subsystem::Connection,
                        after: timeout,
                    });
                    None
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{context, LOCAL_IDENTITY};
    use super::*;
    use crate::config::EngineConfig;
    use crate::mock::{CollectingCallback, SimulatedPeer, SimulatedRadio};
    use crate::types::Capabilities;
    use std::time::Duration;
    use tokio::task::JoinHandle;

    const BROADCASTING: Capabilities = Capabilities {
        can_broadcast: true,
        legacy_radio_stack: false,
    };

    struct Running {
        shutdown: oneshot::Sender<()>,
        updates: watch::Sender<IdentityPayload>,
        task: JoinHandle<Result<()>>,
        callback: Arc<CollectingCallback>,
    }

    fn address(last: u8) -> DeviceAddress {
        DeviceAddress::new([0xB0, 0, 0, 0, 0, last])
    }

    fn remote(seed: u8) -> Payload {
        Payload::new(IdentityPayload([seed; 16]), -6)
    }

    async fn launch(radio: &SimulatedRadio, config: EngineConfig) -> Running {
        let (ctx, callback) = context(radio, BROADCASTING, config);
        let strategy = BroadcastStrategy::new(ctx.clone(), Arc::new(radio.clone()));
        let (shutdown, shutdown_rx) = oneshot::channel();
        let (updates, updates_rx) = watch::channel(LOCAL_IDENTITY);
        let task = tokio::spawn(async move { strategy.run(updates_rx, shutdown_rx).await });
        tokio::time::sleep(Duration::from_millis(1)).await;
        Running {
            shutdown,
            updates,
            task,
            callback,
        }
    }

    async fn stop(running: Running) {
        let _ = running.shutdown.send(());
        running.task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_starts_all_subsystems_and_stops_them() {
        let radio = SimulatedRadio::new();
        let running = launch(&radio, EngineConfig::default()).await;

        assert!(radio.is_responding());
        assert!(radio.is_discovering());
        assert_eq!(
            radio.broadcasting(),
            Some(Payload::new(LOCAL_IDENTITY, 0).encode())
        );

        stop(running).await;
        assert!(!radio.is_responding());
        assert!(!radio.is_discovering());
        assert_eq!(radio.broadcasting(), None);
        let counters = radio.counters();
        assert_eq!(SimulatedRadio::count(&counters.responder_stops), 1);
        assert_eq!(SimulatedRadio::count(&counters.broadcast_stops), 1);
        assert_eq!(
            SimulatedRadio::count(&counters.discovery_starts),
            SimulatedRadio::count(&counters.discovery_stops)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_payload_update_restarts_broadcast() {
        let radio = SimulatedRadio::new();
        let running = launch(&radio, EngineConfig::default()).await;

        let next = IdentityPayload([0x77; 16]);
        running.updates.send_replace(next);
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(radio.broadcasting(), Some(Payload::new(next, 0).encode()));
        assert_eq!(SimulatedRadio::count(&radio.counters().broadcast_starts), 2);
        assert_eq!(SimulatedRadio::count(&radio.counters().broadcast_stops), 1);
        stop(running).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_broadcast_restart_keeps_running() {
        let radio = SimulatedRadio::new();
        let running = launch(&radio, EngineConfig::default()).await;

        radio.refuse_broadcast_starts(1);
        running.updates.send_replace(IdentityPayload([0x11; 16]));
        let errors = running.callback.wait_for_errors(1).await;
        assert!(matches!(
            errors[0],
            SonarError::TransportStart {
                subsystem: Subsystem::Broadcast,
                code: None
            }
        ));
        assert_eq!(radio.broadcasting(), None);
        assert!(!running.task.is_finished());

        let next = IdentityPayload([0x22; 16]);
        running.updates.send_replace(next);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(radio.broadcasting(), Some(Payload::new(next, 0).encode()));

        stop(running).await;
        // One stop per armed session: the first, the refused one and the last.
        assert_eq!(SimulatedRadio::count(&radio.counters().broadcast_starts), 2);
        assert_eq!(SimulatedRadio::count(&radio.counters().broadcast_stops), 3);
        assert_eq!(radio.broadcasting(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_then_incoming_payload_correlates() {
        let radio = SimulatedRadio::new();
        radio.add_peer(SimulatedPeer::new(address(1), remote(1), -58).silent());
        let running = launch(&radio, EngineConfig::default()).await;

        // Let discovery see the silent peer.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(running.callback.events().is_empty());

        assert!(radio.inject_incoming(address(1), remote(1).encode()));
        tokio::time::sleep(Duration::from_millis(1)).await;
        let events = running.callback.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload, remote(1));
        assert_eq!(events[0].metadata.raw_rssi, -58);
        stop(running).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_incoming_payload_then_scan_correlates() {
        let radio = SimulatedRadio::new().with_discovery_interval(Duration::from_secs(1));
        let running = launch(&radio, EngineConfig::default()).await;

        // No scan and no stamp yet: the rssi is requested, which fails for an
        // unknown peer.
        assert!(radio.inject_incoming(address(2), remote(2).encode()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(running.callback.events().is_empty());
        assert_eq!(running.callback.errors().len(), 1);

        radio.add_peer(SimulatedPeer::new(address(2), remote(2), -66).silent());
        let events = running.callback.wait_for_events(1).await;
        assert_eq!(events[0].payload, remote(2));
        assert_eq!(events[0].metadata.raw_rssi, -66);
        stop(running).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stamped_payload_reported_as_calibrated() {
        let radio = SimulatedRadio::new();
        let config = EngineConfig {
            tx_compensation: -4,
            ..EngineConfig::default()
        };
        let running = launch(&radio, config).await;

        assert!(radio.inject_incoming(address(3), remote(3).encode_stamped(-70)));
        let events = running.callback.wait_for_events(1).await;
        assert_eq!(events[0].metadata.raw_rssi, -70);
        assert_eq!(events[0].metadata.calibrated_rssi, -66);
        stop(running).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unstamped_payload_requests_remote_rssi() {
        let radio = SimulatedRadio::new().with_discovery_interval(Duration::from_secs(3_600));
        radio.add_peer(SimulatedPeer::new(address(4), remote(4), -49).silent());
        let running = launch(&radio, EngineConfig::default()).await;

        assert!(radio.inject_incoming(address(4), remote(4).encode()));
        let events = running.callback.wait_for_events(1).await;
        assert_eq!(events[0].metadata.raw_rssi, -49);
        stop(running).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcasting_peers_reported_from_scans() {
        let radio = SimulatedRadio::new();
        radio.add_peer(SimulatedPeer::new(address(5), remote(5), -52));
        let running = launch(&radio, EngineConfig::default()).await;

        let events = running.callback.wait_for_events(2).await;
        assert!(events.iter().all(|e| e.payload == remote(5)));
        stop(running).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_incoming_payload_dropped() {
        let radio = SimulatedRadio::new();
        let running = launch(&radio, EngineConfig::default()).await;

        assert!(radio.inject_incoming(address(6), vec![1, 2, 3]));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(running.callback.events().is_empty());
        assert!(running.callback.errors().is_empty());
        stop(running).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_failure_backs_off_and_retries() {
        let radio = SimulatedRadio::new();
        radio.refuse_discovery_starts(2);
        let config = EngineConfig {
            discovery_backoff_base_ms: 100,
            ..EngineConfig::default()
        };
        let running = launch(&radio, config).await;

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(radio.is_discovering());
        assert_eq!(running.callback.errors().len(), 2);
        stop(running).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_errors_reported() {
        let radio = SimulatedRadio::new();
        let running = launch(&radio, EngineConfig::default()).await;

        assert!(radio.inject_broadcast_error(Some(3)));
        assert!(radio.inject_responder_error(Some(4)));
        let errors = running.callback.wait_for_errors(2).await;
        let subsystems: Vec<_> = errors.iter().filter_map(SonarError::subsystem).collect();
        assert!(subsystems.contains(&Subsystem::Broadcast));
        assert!(subsystems.contains(&Subsystem::Connection));
        stop(running).await;
    }
}
