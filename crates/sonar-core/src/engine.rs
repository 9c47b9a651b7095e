//! The engine: one start/stop lifecycle over the platform's strategy.
//!
//! Long-lived state (health, per-peer statistics, correlation caches) belongs
//! to the engine and survives restarts. Each `start` builds a fresh strategy
//! over that state and runs it on its own task until `stop` or a fatal error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Instrument};

use crate::config::EngineConfig;
use crate::correlation::RecordCorrelator;
use crate::discovery::DiscoveryBridge;
use crate::error::{Result, SonarError};
use crate::health::{HealthMonitor, HealthSnapshot};
use crate::radio::RadioExecutor;
use crate::stats::{DeviceStats, DeviceStatsRegistry};
use crate::strategy::{Reporter, Strategy, StrategyContext, StrategyKind};
use crate::transport::{IdentityResolver, PayloadSource, ProximityCallback, Transports};
use crate::types::{DeviceIdentity, IdentityPayload};

#[derive(Clone)]
struct Host {
    payload_source: Arc<dyn PayloadSource>,
    resolver: Arc<dyn IdentityResolver>,
    callback: Arc<dyn ProximityCallback>,
}

struct RunHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Proximity exchange engine.
pub struct Engine {
    config: Arc<EngineConfig>,
    transports: Transports,
    radio: RadioExecutor,
    health: Arc<HealthMonitor>,
    stats: Arc<DeviceStatsRegistry>,
    correlator: Arc<RecordCorrelator>,
    discovery: Arc<DiscoveryBridge>,
    host: Mutex<Option<Host>>,
    payload_tx: watch::Sender<IdentityPayload>,
    running: Arc<AtomicBool>,
    run: tokio::sync::Mutex<Option<RunHandle>>,
}

impl Engine {
    /// Create an engine over the platform's transports.
    #[must_use]
    pub fn new(config: EngineConfig, transports: Transports, radio: RadioExecutor) -> Self {
        let health = Arc::new(HealthMonitor::from_config(&config));
        let discovery = Arc::new(DiscoveryBridge::new(
            transports.discovery.clone(),
            radio.clone(),
            health.clone(),
        ));
        let (payload_tx, _) = watch::channel(IdentityPayload::default());
        Self {
            stats: Arc::new(DeviceStatsRegistry::new(config.cache_capacity, config.stats_ttl())),
            correlator: Arc::new(RecordCorrelator::new(config.cache_capacity, config.cache_ttl())),
            config: Arc::new(config),
            transports,
            radio,
            health,
            discovery,
            host: Mutex::new(None),
            payload_tx,
            running: Arc::new(AtomicBool::new(false)),
            run: tokio::sync::Mutex::new(None),
        }
    }

    /// Attach the host collaborators. Takes effect on the next start.
    pub fn set_up(
        &self,
        payload_source: Arc<dyn PayloadSource>,
        resolver: Arc<dyn IdentityResolver>,
        callback: Arc<dyn ProximityCallback>,
    ) {
        *self.host.lock().unwrap_or_else(PoisonError::into_inner) = Some(Host {
            payload_source,
            resolver,
            callback,
        });
    }

    /// Start the strategy the platform supports.
    ///
    /// # Errors
    ///
    /// - [`SonarError::NotSetUp`] if [`set_up`](Self::set_up) was never called
    /// - [`SonarError::AlreadyRunning`] if a run is in progress
    pub async fn start(&self) -> Result<()> {
        let mut run = self.run.lock().await;
        if self.is_running() {
            return Err(SonarError::AlreadyRunning);
        }
        let host = self
            .host
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(SonarError::NotSetUp)?;

        // A previous run that ended on its own still has a handle.
        if let Some(previous) = run.take() {
            let _ = previous.task.await;
        }

        let reporter = Reporter::new(host.callback, self.config.clone());
        let context = Arc::new(StrategyContext {
            config: self.config.clone(),
            radio: self.radio.clone(),
            transports: self.transports.clone(),
            discovery: self.discovery.clone(),
            health: self.health.clone(),
            stats: self.stats.clone(),
            correlator: self.correlator.clone(),
            payload_source: host.payload_source.clone(),
            resolver: host.resolver,
            reporter: reporter.clone(),
        });
        let strategy = Strategy::select(context);
        let kind = strategy.kind();

        self.payload_tx.send_replace(host.payload_source.current());
        let updates = self.payload_tx.subscribe();
        let (shutdown, shutdown_rx) = oneshot::channel();

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let span = info_span!("engine", strategy = ?kind);
        let task = tokio::spawn(
            async move {
                match strategy.run(updates, shutdown_rx).await {
                    Ok(()) => info!("strategy stopped"),
                    Err(err) => reporter.error(err),
                }
                running.store(false, Ordering::SeqCst);
            }
            .instrument(span),
        );

        info!(strategy = ?kind, "engine started");
        *run = Some(RunHandle { shutdown, task });
        Ok(())
    }

    /// Stop the running strategy and wait until every radio session it
    /// opened has been stopped. Stopping an idle engine is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`SonarError::RadioExecutorStopped`] if the radio context is
    /// gone.
    pub async fn stop(&self) -> Result<()> {
        let Some(handle) = self.run.lock().await.take() else {
            return Ok(());
        };
        let _ = handle.shutdown.send(());
        if let Err(err) = handle.task.await {
            warn!(error = %err, "strategy task ended abnormally");
        }
        self.running.store(false, Ordering::SeqCst);
        self.radio.flush().await?;
        info!("engine stopped");
        Ok(())
    }

    /// The host rotated its identity. A running broadcast restarts with it.
    pub fn notify_payload_updated(&self, identity: IdentityPayload) {
        self.payload_tx.send_replace(identity);
    }

    /// Whether a strategy is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The strategy this platform runs.
    #[must_use]
    pub fn strategy_kind(&self) -> StrategyKind {
        StrategyKind::for_transports(&self.transports)
    }

    /// Current radio health.
    #[must_use]
    pub fn health(&self) -> HealthSnapshot {
        self.health.snapshot()
    }

    /// Per-peer statistics.
    #[must_use]
    pub fn device_stats(&self) -> Vec<(DeviceIdentity, DeviceStats)> {
        self.stats.snapshot()
    }

    /// The configuration the engine runs with.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
