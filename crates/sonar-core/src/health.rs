//! Radio stack health monitor.
//!
//! Tracks a sliding window of exchange outcomes and a counter of consecutive
//! discovery start failures. Either one crossing its threshold marks the
//! stack unhealthy.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use tracing::warn;

use crate::config::EngineConfig;

#[derive(Debug, Default)]
struct HealthState {
    window: VecDeque<bool>,
    discovery_failures: u32,
}

/// Point-in-time view of the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HealthSnapshot {
    /// Consecutive discovery start failures.
    pub discovery_failures: u32,
    /// Outcomes currently held in the window.
    pub window_len: usize,
    /// Failed outcomes currently held in the window.
    pub window_failures: usize,
    /// Whether the stack was unhealthy when the snapshot was taken.
    pub unhealthy: bool,
}

/// Sliding-window success/failure tracker shared by every radio task.
///
/// All operations run in a single critical section.
#[derive(Debug)]
pub struct HealthMonitor {
    state: Mutex<HealthState>,
    window_size: usize,
    failure_ratio: f64,
    max_discovery_failures: u32,
}

impl HealthMonitor {
    /// Create a monitor with window size `window_size` (M), failure ratio
    /// `failure_ratio` (R) and discovery failure threshold
    /// `max_discovery_failures` (K).
    #[must_use]
    pub fn new(window_size: usize, failure_ratio: f64, max_discovery_failures: u32) -> Self {
        Self {
            state: Mutex::new(HealthState::default()),
            window_size: window_size.max(1),
            failure_ratio,
            max_discovery_failures,
        }
    }

    /// Create a monitor from engine configuration.
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.health_window_size,
            config.health_failure_ratio,
            config.max_discovery_failures,
        )
    }

    /// A discovery session started and delivered.
    pub fn record_discovery_success(&self) {
        self.lock().discovery_failures = 0;
    }

    /// A discovery session failed to start or errored.
    pub fn record_discovery_failure(&self) {
        let mut state = self.lock();
        state.discovery_failures = state.discovery_failures.saturating_add(1);
        if state.discovery_failures == self.max_discovery_failures {
            warn!(
                failures = state.discovery_failures,
                "discovery failure threshold reached"
            );
        }
    }

    /// Append one exchange outcome to the window.
    pub fn record_exchange_outcome(&self, success: bool) {
        self.lock().window.push_back(success);
    }

    /// Consecutive discovery failures so far.
    #[must_use]
    pub fn discovery_failures(&self) -> u32 {
        self.lock().discovery_failures
    }

    /// Whether the radio stack should be considered degraded.
    ///
    /// Once the window holds at least M outcomes it is truncated to its last
    /// M entries and the failure ratio over them is compared with R.
    #[must_use]
    pub fn is_unhealthy(&self) -> bool {
        let mut state = self.lock();
        self.evaluate(&mut state)
    }

    /// Evaluate health and capture the counters in one critical section.
    #[must_use]
    pub fn snapshot(&self) -> HealthSnapshot {
        let mut state = self.lock();
        let unhealthy = self.evaluate(&mut state);
        HealthSnapshot {
            discovery_failures: state.discovery_failures,
            window_len: state.window.len(),
            window_failures: state.window.iter().filter(|ok| !**ok).count(),
            unhealthy,
        }
    }

    fn evaluate(&self, state: &mut HealthState) -> bool {
        if state.discovery_failures >= self.max_discovery_failures {
            return true;
        }
        if state.window.len() < self.window_size {
            return false;
        }
        let excess = state.window.len() - self.window_size;
        state.window.drain(..excess);

        let failures = state.window.iter().filter(|ok| !**ok).count();
        #[allow(clippy::cast_precision_loss)]
        let ratio = failures as f64 / self.window_size as f64;
        ratio >= self.failure_ratio
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HealthState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
