//! Application state shared across handlers.

use std::sync::Arc;
use std::time::Instant;

use sonar_core::{
    Engine, IdentityPayload, PayloadHashResolver, RadioExecutor, SimulatedRadio,
    StaticPayloadSource,
};
use tracing::info;
use uuid::Uuid;

use crate::events::EventLog;
use crate::settings::ServerConfig;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    engine: Engine,
    events: Arc<EventLog>,
    identity: Arc<StaticPayloadSource>,
    radio: SimulatedRadio,
    started_at: Instant,
}

impl AppState {
    /// Build the engine over the simulated radio described by `config`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the radio thread cannot be spawned or a simulated
    /// peer is misconfigured.
    pub fn new(config: &ServerConfig) -> anyhow::Result<Self> {
        let radio = SimulatedRadio::new();
        for peer in &config.simulated_peers {
            radio.add_peer(peer.to_peer()?);
        }

        let engine = Engine::new(
            config.engine_config(),
            radio.transports(config.capabilities),
            RadioExecutor::spawn()?,
        );

        // A fresh random identity until the host pushes one.
        let identity = Arc::new(StaticPayloadSource::new(IdentityPayload(
            Uuid::new_v4().into_bytes(),
        )));
        let events = Arc::new(EventLog::new(config.event_log_capacity));
        engine.set_up(identity.clone(), Arc::new(PayloadHashResolver), events.clone());

        info!(
            peers = config.simulated_peers.len(),
            strategy = ?engine.strategy_kind(),
            "engine ready"
        );

        Ok(Self {
            inner: Arc::new(AppStateInner {
                engine,
                events,
                identity,
                radio,
                started_at: Instant::now(),
            }),
        })
    }

    /// The proximity engine.
    #[must_use]
    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    /// Recent events and errors.
    #[must_use]
    pub fn events(&self) -> &EventLog {
        &self.inner.events
    }

    /// The identity the engine advertises.
    #[must_use]
    pub fn identity(&self) -> &StaticPayloadSource {
        &self.inner.identity
    }

    /// The simulated radio backing the engine.
    #[must_use]
    pub fn radio(&self) -> &SimulatedRadio {
        &self.inner.radio
    }

    /// Seconds since the state was built.
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.inner.started_at.elapsed().as_secs()
    }
}
