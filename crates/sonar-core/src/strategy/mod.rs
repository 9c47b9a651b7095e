//! Exchange strategies.
//!
//! A platform either can broadcast our payload or cannot. The choice is made
//! once when the engine starts:
//!
//! - [`BroadcastStrategy`]: broadcast, respond and discover at the same time;
//!   peers come to us
//! - [`DiscoveryOnlyStrategy`]: discover in bursts, rank candidates and open
//!   one bounded exchange session per candidate

mod broadcast;
mod discovery_only;

pub use broadcast::BroadcastStrategy;
pub use discovery_only::DiscoveryOnlyStrategy;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tracing::{error, warn};
use utoipa::ToSchema;

use crate::calibration::metadata_for;
use crate::config::EngineConfig;
use crate::correlation::RecordCorrelator;
use crate::discovery::DiscoveryBridge;
use crate::error::{Result, SonarError};
use crate::health::HealthMonitor;
use crate::radio::RadioExecutor;
use crate::stats::DeviceStatsRegistry;
use crate::transport::{IdentityResolver, PayloadSource, ProximityCallback, Transports};
use crate::types::{IdentityPayload, ProximityEvent, Record};

/// Which strategy an engine runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Broadcast, respond and discover concurrently.
    Broadcast,
    /// Discover, rank and connect.
    DiscoveryOnly,
}

impl StrategyKind {
    /// The strategy a platform with these transports runs.
    #[must_use]
    pub fn for_transports(transports: &Transports) -> Self {
        if transports.can_broadcast() {
            Self::Broadcast
        } else {
            Self::DiscoveryOnly
        }
    }
}

/// Turns records into events for the host.
#[derive(Clone)]
pub struct Reporter {
    callback: Arc<dyn ProximityCallback>,
    config: Arc<EngineConfig>,
}

impl Reporter {
    /// Create a reporter calibrating with `config`.
    #[must_use]
    pub fn new(callback: Arc<dyn ProximityCallback>, config: Arc<EngineConfig>) -> Self {
        Self { callback, config }
    }

    /// Calibrate `record` and hand it to the host.
    pub fn report(&self, record: &Record) {
        self.callback.on_proximity(ProximityEvent {
            payload: record.payload,
            metadata: metadata_for(record, &self.config),
            timestamp: record.timestamp,
        });
    }

    /// Hand an error to the host.
    pub fn error(&self, err: SonarError) {
        if err.is_fatal() {
            error!(code = err.error_code(), error = %err, "fatal engine error");
        } else {
            warn!(code = err.error_code(), subsystem = ?err.subsystem(), error = %err, "engine error");
        }
        self.callback.on_error(err);
    }
}

/// Everything a strategy works with.
pub struct StrategyContext {
    /// Tuning values.
    pub config: Arc<EngineConfig>,
    /// The radio context.
    pub radio: RadioExecutor,
    /// The platform transports.
    pub transports: Transports,
    /// Discovery sessions.
    pub discovery: Arc<DiscoveryBridge>,
    /// Radio health.
    pub health: Arc<HealthMonitor>,
    /// Per-peer statistics.
    pub stats: Arc<DeviceStatsRegistry>,
    /// Scan/payload correlation.
    pub correlator: Arc<RecordCorrelator>,
    /// The host's identity.
    pub payload_source: Arc<dyn PayloadSource>,
    /// Payload to peer mapping.
    pub resolver: Arc<dyn IdentityResolver>,
    /// Result channel.
    pub reporter: Reporter,
}

impl StrategyContext {
    /// Check the radio stack before a cycle.
    ///
    /// An unhealthy stack is reported and tolerated, except on platforms
    /// whose stack needs an external restart, where it is fatal.
    pub(crate) fn check_health(&self) -> Result<()> {
        if !self.health.is_unhealthy() {
            return Ok(());
        }
        if self.config.unstable_radio_stack {
            error!("radio stack unhealthy on an unstable platform");
            return Err(SonarError::UnstablePlatform);
        }
        warn!(
            discovery_failures = self.health.discovery_failures(),
            "radio stack unhealthy"
        );
        self.reporter.error(SonarError::RadioStackUnhealthy);
        Ok(())
    }
}

/// The strategy chosen for this run.
pub enum Strategy {
    /// See [`BroadcastStrategy`].
    Broadcast(BroadcastStrategy),
    /// See [`DiscoveryOnlyStrategy`].
    DiscoveryOnly(DiscoveryOnlyStrategy),
}

impl Strategy {
    /// Pick the strategy the platform supports.
    #[must_use]
    pub fn select(context: Arc<StrategyContext>) -> Self {
        match (
            StrategyKind::for_transports(&context.transports),
            context.transports.broadcast.clone(),
        ) {
            (StrategyKind::Broadcast, Some(broadcast)) => {
                Self::Broadcast(BroadcastStrategy::new(context, broadcast))
            }
            _ => Self::DiscoveryOnly(DiscoveryOnlyStrategy::new(context)),
        }
    }

    /// Which variant this is.
    #[must_use]
    pub const fn kind(&self) -> StrategyKind {
        match self {
            Self::Broadcast(_) => StrategyKind::Broadcast,
            Self::DiscoveryOnly(_) => StrategyKind::DiscoveryOnly,
        }
    }

    /// Run until `shutdown` fires or a fatal error occurs.
    ///
    /// # Errors
    ///
    /// Returns the fatal error that ended the run.
    pub async fn run(
        &self,
        payload_updates: watch::Receiver<IdentityPayload>,
        mut shutdown: oneshot::Receiver<()>,
    ) -> Result<()> {
        match self {
            Self::Broadcast(strategy) => strategy.run(payload_updates, shutdown).await,
            Self::DiscoveryOnly(strategy) => {
                tokio::select! {
                    _ = &mut shutdown => Ok(()),
                    result = strategy.run() => result,
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::context;
    use super::*;
    use crate::mock::SimulatedRadio;
    use crate::types::Capabilities;

    #[tokio::test(start_paused = true)]
    async fn test_strategy_follows_capabilities() {
        let radio = SimulatedRadio::new();
        let broadcasting = Capabilities {
            can_broadcast: true,
            legacy_radio_stack: false,
        };
        let (ctx, _) = context(&radio, broadcasting, EngineConfig::default());
        assert_eq!(Strategy::select(ctx).kind(), StrategyKind::Broadcast);

        let (ctx, _) = context(&radio, Capabilities::default(), EngineConfig::default());
        assert_eq!(Strategy::select(ctx).kind(), StrategyKind::DiscoveryOnly);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_is_fatal_only_on_unstable_platforms() {
        let radio = SimulatedRadio::new();
        let config = EngineConfig {
            max_discovery_failures: 1,
            ..EngineConfig::default()
        };
        let (ctx, callback) = context(&radio, Capabilities::default(), config.clone());
        ctx.health.record_discovery_failure();
        assert!(ctx.check_health().is_ok());
        assert!(matches!(
            callback.errors().as_slice(),
            [SonarError::RadioStackUnhealthy]
        ));

        let unstable = EngineConfig {
            unstable_radio_stack: true,
            ..config
        };
        let (ctx, _) = context(&radio, Capabilities::default(), unstable);
        ctx.health.record_discovery_failure();
        assert!(matches!(ctx.check_health(), Err(SonarError::UnstablePlatform)));
    }
}
