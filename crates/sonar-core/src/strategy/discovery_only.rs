//! Discovery-only strategy.
//!
//! One cycle:
//!
//! 1. Check radio health (fatal on unstable platforms)
//! 2. Wait the pre-discovery delay
//! 3. Discovery burst feeding the selector, then a short settle delay
//! 4. Service the ranked candidates within a fixed budget

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, instrument};

use super::StrategyContext;
use crate::error::{Result, SonarError};
use crate::exchange::ExchangeSession;
use crate::selector::{DeviceSelector, SelectorSettings};
use crate::types::ScannedDevice;

/// Actively discovers peers and connects to the best ones.
pub struct DiscoveryOnlyStrategy {
    ctx: Arc<StrategyContext>,
    selector: Arc<DeviceSelector>,
    session: ExchangeSession,
}

impl DiscoveryOnlyStrategy {
    /// Create the strategy over a shared context.
    #[must_use]
    pub fn new(ctx: Arc<StrategyContext>) -> Self {
        let selector = Arc::new(DeviceSelector::new(
            ctx.resolver.clone(),
            SelectorSettings::from(ctx.config.as_ref()),
        ));
        let session = ExchangeSession::new(
            ctx.transports.connection.clone(),
            ctx.discovery.clone(),
            ctx.payload_source.clone(),
            &ctx.config,
        );
        Self {
            ctx,
            selector,
            session,
        }
    }

    /// Cycle until a fatal error.
    ///
    /// # Errors
    ///
    /// Returns [`SonarError::UnstablePlatform`] or
    /// [`SonarError::RadioExecutorStopped`].
    #[instrument(name = "discovery_only", skip_all)]
    pub async fn run(&self) -> Result<()> {
        info!("discovery-only strategy running");
        loop {
            self.cycle().await?;
        }
    }

    /// One health check, burst and servicing pass.
    pub(crate) async fn cycle(&self) -> Result<()> {
        self.ctx.check_health()?;
        tokio::time::sleep(self.pre_discovery_delay()).await;

        let config = &self.ctx.config;
        let burst = self
            .ctx
            .discovery
            .discover_until_volume(
                config.discovery_burst_timeout(),
                config.discovery_min_results,
                |batch| self.selector.add(batch),
            )
            .await;
        match burst {
            Ok(seen) => debug!(seen, "discovery burst complete"),
            Err(err) => return self.tolerate(err),
        }

        tokio::time::sleep(config.settle_delay()).await;
        if self.selector.pending_len() == 0 {
            return Ok(());
        }

        let candidates = self.rank().await;
        self.service(&candidates).await
    }

    /// Delay before the next burst. Throttled platforms space discovery
    /// starts by at least the window budget.
    fn pre_discovery_delay(&self) -> Duration {
        let config = &self.ctx.config;
        let floor = config.pre_discovery_floor();
        if !config.throttle_discovery_starts {
            return floor;
        }
        self.ctx.discovery.since_last_start().map_or(floor, |since| {
            config
                .discovery_window_budget()
                .saturating_sub(since)
                .max(floor)
        })
    }

    async fn rank(&self) -> Vec<ScannedDevice> {
        let selector = self.selector.clone();
        let stats = self.ctx.stats.clone();
        let now = Instant::now();
        tokio::task::spawn_blocking(move || selector.select(now, &stats))
            .await
            .unwrap_or_else(|err| {
                error!(error = %err, "candidate ranking failed");
                Vec::new()
            })
    }

    /// Service candidates in rank order within the processing budget.
    ///
    /// Stops early once the projected cost of one more candidate,
    /// `round(elapsed / serviced) * (serviced + 1)`, exceeds the budget.
    pub(crate) async fn service(&self, candidates: &[ScannedDevice]) -> Result<()> {
        let config = &self.ctx.config;
        let budget = config.advertise_process_timeout();
        let started = Instant::now();
        let mut serviced: u32 = 0;

        for (index, candidate) in candidates.iter().enumerate() {
            let elapsed = started.elapsed();
            if elapsed >= budget {
                debug!(serviced, remaining = candidates.len() - index, "servicing budget spent");
                break;
            }
            if serviced > 0 && projected_cost(elapsed, serviced) > budget {
                debug!(serviced, ?elapsed, "next candidate would overrun budget");
                break;
            }

            let candidate = if config.refresh_before_connect {
                match self.refresh(candidate).await? {
                    Some(fresh) => fresh,
                    None => continue,
                }
            } else {
                candidate.clone()
            };

            serviced += 1;
            self.exchange_with(&candidate).await;

            if index + 1 < candidates.len() {
                tokio::time::sleep(config.inter_candidate_delay()).await;
            }
        }
        debug!(serviced, elapsed = ?started.elapsed(), "servicing pass done");
        Ok(())
    }

    /// Rediscover `candidate` right before connecting. `None` skips it.
    async fn refresh(&self, candidate: &ScannedDevice) -> Result<Option<ScannedDevice>> {
        let found = self
            .ctx
            .discovery
            .discover_device(
                candidate.address,
                self.ctx.config.refresh_timeout(),
                |batch| self.selector.add(batch),
            )
            .await;
        match found {
            Ok(Some(mut fresh)) => {
                if fresh.identity_payload.is_none() {
                    fresh.identity_payload.clone_from(&candidate.identity_payload);
                }
                Ok(Some(fresh))
            }
            Ok(None) => Ok(None),
            Err(SonarError::RadioExecutorStopped) => Err(SonarError::RadioExecutorStopped),
            Err(err) => {
                debug!(address = %candidate.address, error = %err, "refresh failed, skipping");
                self.ctx.stats.record_failure(self.selector.identity_of(candidate));
                Ok(None)
            }
        }
    }

    async fn exchange_with(&self, candidate: &ScannedDevice) {
        let identity = self.selector.identity_of(candidate);
        match self.session.exchange(candidate).await {
            Ok(result) => {
                self.ctx.stats.record_success(identity, Instant::now());
                self.ctx.health.record_exchange_outcome(true);
                if let Some((scan, payload)) = result.record_for(candidate) {
                    let record = self.ctx.correlator.record_from_scan_with_payload(&scan, payload);
                    self.ctx.reporter.report(&record);
                } else {
                    debug!(address = %candidate.address, "exchange returned no payload");
                }
            }
            Err(SonarError::ServiceNotFound(address)) => {
                debug!(%address, "peer has no exchange service, ignoring it");
                self.ctx.stats.mark_ignored(identity);
            }
            Err(err) => {
                self.ctx.stats.record_failure(identity);
                self.ctx.health.record_exchange_outcome(false);
                self.ctx.reporter.error(err);
            }
        }
    }

    /// Report a non-fatal error and carry on with the next cycle.
    fn tolerate(&self, err: SonarError) -> Result<()> {
        if err.is_fatal() {
            return Err(err);
        }
        self.ctx.reporter.error(err);
        Ok(())
    }
}

fn projected_cost(elapsed: Duration, serviced: u32) -> Duration {
    let per_candidate = (elapsed.as_secs_f64() * 1_000.0 / f64::from(serviced)).round();
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let per_candidate = Duration::from_millis(per_candidate as u64);
    per_candidate * (serviced + 1)
}
