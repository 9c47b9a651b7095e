//! Engine configuration.
//!
//! Handles defaults, platform profiles and validation of every tuning
//! constant the engine reads:
//! - Calibration gains
//! - Correlation and statistics cache bounds
//! - Health thresholds
//! - Selector filters
//! - Exchange loop timing
//!
//! Platform differences are plain field values chosen once at startup via
//! [`EngineConfig::for_profile`]; no call site branches on the platform.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Capabilities;

/// Error loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file does not exist.
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    /// The configuration file could not be read.
    #[error("Failed to read {path}: {source}")]
    ReadError {
        /// Path that failed.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] toml::de::Error),

    /// A single field is invalid.
    #[error("{field}: {message}")]
    ValidationError {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields are invalid.
    #[error("{} configuration errors", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),
}

/// Result alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Platform behaviour profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformProfile {
    /// Current radio stacks.
    #[default]
    Standard,
    /// Radio stacks that rate-limit discovery restarts and need a fresh scan
    /// right before connecting.
    Legacy,
}

impl PlatformProfile {
    /// Pick the profile matching probed capabilities.
    #[must_use]
    pub const fn from_capabilities(capabilities: &Capabilities) -> Self {
        if capabilities.legacy_radio_stack {
            Self::Legacy
        } else {
            Self::Standard
        }
    }
}

/// Every tuning value of the engine. Timing fields are milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Local transmit compensation (dB), advertised in our payload.
    pub tx_compensation: i8,
    /// Local receive compensation (dB).
    pub rx_compensation: i8,

    /// Capacity of each correlation map.
    pub cache_capacity: usize,
    /// Lifetime of correlation entries.
    pub cache_ttl_ms: u64,
    /// Lifetime of per-identity statistics since the last update.
    pub stats_ttl_ms: u64,

    /// Sliding window size M of exchange outcomes.
    pub health_window_size: usize,
    /// Failure ratio R over a full window that marks the stack unhealthy.
    pub health_failure_ratio: f64,
    /// Consecutive discovery start failures K that mark the stack unhealthy.
    pub max_discovery_failures: u32,

    /// Peers failing this many times in a row are skipped.
    pub max_successive_failures: u32,
    /// Peers exchanged with successfully within this delay are skipped.
    pub max_delay_between_success_ms: u64,
    /// Rank recently seen peers first among equal signal brackets.
    pub recency_sensitive: bool,

    /// Wall-clock budget for one servicing pass.
    pub advertise_process_timeout_ms: u64,
    /// Outer timeout of a discovery burst.
    pub discovery_burst_timeout_ms: u64,
    /// Results that end a discovery burst early.
    pub discovery_min_results: usize,
    /// Delay between the end of a burst and servicing.
    pub settle_delay_ms: u64,
    /// Delay between two candidates.
    pub inter_candidate_delay_ms: u64,
    /// Timeout of a single exchange session.
    pub connection_timeout_ms: u64,
    /// Timeout of the pre-connect rediscovery of one candidate.
    pub refresh_timeout_ms: u64,
    /// Minimum delay before each discovery burst.
    pub pre_discovery_floor_ms: u64,
    /// Minimum spacing between two discovery starts on throttled platforms.
    pub discovery_window_budget_ms: u64,
    /// Length of one continuous discovery session (broadcast mode).
    pub continuous_discovery_window_ms: u64,
    /// Initial retry delay after a failed discovery start.
    pub discovery_backoff_base_ms: u64,
    /// Upper bound of the discovery retry delay.
    pub discovery_backoff_max_ms: u64,

    /// An unhealthy radio stack is fatal and needs an external restart.
    pub unstable_radio_stack: bool,
    /// Rediscover each candidate right before connecting.
    pub refresh_before_connect: bool,
    /// Space discovery starts by `discovery_window_budget_ms`.
    pub throttle_discovery_starts: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tx_compensation: 0,
            rx_compensation: 0,
            cache_capacity: 1000,
            cache_ttl_ms: 60_000,
            stats_ttl_ms: 15 * 60_000,
            health_window_size: 20,
            health_failure_ratio: 0.9,
            max_discovery_failures: 5,
            max_successive_failures: 3,
            max_delay_between_success_ms: 60_000,
            recency_sensitive: false,
            advertise_process_timeout_ms: 20_000,
            discovery_burst_timeout_ms: 5_000,
            discovery_min_results: 50,
            settle_delay_ms: 500,
            inter_candidate_delay_ms: 300,
            connection_timeout_ms: 5_000,
            refresh_timeout_ms: 3_000,
            pre_discovery_floor_ms: 1_000,
            discovery_window_budget_ms: 6_000,
            continuous_discovery_window_ms: 10 * 60_000,
            discovery_backoff_base_ms: 1_000,
            discovery_backoff_max_ms: 60_000,
            unstable_radio_stack: false,
            refresh_before_connect: false,
            throttle_discovery_starts: false,
        }
    }
}

impl EngineConfig {
    /// Defaults for a platform profile.
    #[must_use]
    pub fn for_profile(profile: PlatformProfile) -> Self {
        match profile {
            PlatformProfile::Standard => Self::default(),
            PlatformProfile::Legacy => Self {
                advertise_process_timeout_ms: 15_000,
                connection_timeout_ms: 7_000,
                inter_candidate_delay_ms: 1_000,
                unstable_radio_stack: true,
                refresh_before_connect: true,
                throttle_discovery_starts: true,
                ..Self::default()
            },
        }
    }

    /// Defaults for probed capabilities.
    #[must_use]
    pub fn for_capabilities(capabilities: &Capabilities) -> Self {
        Self::for_profile(PlatformProfile::from_capabilities(capabilities))
    }

    /// Parse a TOML document; missing fields keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid TOML for this schema.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load and validate configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, unreadable, unparsable or
    /// invalid.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field, collecting all violations.
    ///
    /// # Errors
    ///
    /// Returns the single violation, or
    /// [`ConfigError::MultipleValidationErrors`] when there are several.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        let mut check = |ok: bool, field: &'static str, message: &str| {
            if !ok {
                errors.push(ConfigError::ValidationError {
                    field,
                    message: message.to_string(),
                });
            }
        };

        check(self.cache_capacity > 0, "cache_capacity", "must be positive");
        check(self.cache_ttl_ms > 0, "cache_ttl_ms", "must be positive");
        check(self.stats_ttl_ms > 0, "stats_ttl_ms", "must be positive");
        check(
            self.health_window_size > 0,
            "health_window_size",
            "must be positive",
        );
        check(
            self.health_failure_ratio > 0.0 && self.health_failure_ratio < 1.0,
            "health_failure_ratio",
            "must be strictly between 0 and 1",
        );
        check(
            self.max_discovery_failures > 0,
            "max_discovery_failures",
            "must be positive",
        );
        check(
            self.max_successive_failures > 0,
            "max_successive_failures",
            "must be positive",
        );
        check(
            self.advertise_process_timeout_ms > 0,
            "advertise_process_timeout_ms",
            "must be positive",
        );
        check(
            self.discovery_burst_timeout_ms > 0,
            "discovery_burst_timeout_ms",
            "must be positive",
        );
        check(
            self.connection_timeout_ms > 0,
            "connection_timeout_ms",
            "must be positive",
        );
        check(
            self.discovery_backoff_base_ms <= self.discovery_backoff_max_ms,
            "discovery_backoff_base_ms",
            "must not exceed discovery_backoff_max_ms",
        );

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }

    /// Lifetime of correlation entries.
    #[must_use]
    pub const fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    /// Lifetime of per-identity statistics.
    #[must_use]
    pub const fn stats_ttl(&self) -> Duration {
        Duration::from_millis(self.stats_ttl_ms)
    }

    /// Skip window after a successful exchange.
    #[must_use]
    pub const fn max_delay_between_success(&self) -> Duration {
        Duration::from_millis(self.max_delay_between_success_ms)
    }

    /// Budget of a servicing pass.
    #[must_use]
    pub const fn advertise_process_timeout(&self) -> Duration {
        Duration::from_millis(self.advertise_process_timeout_ms)
    }

    /// Outer timeout of a discovery burst.
    #[must_use]
    pub const fn discovery_burst_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_burst_timeout_ms)
    }

    /// Settle delay after a burst.
    #[must_use]
    pub const fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Delay between candidates.
    #[must_use]
    pub const fn inter_candidate_delay(&self) -> Duration {
        Duration::from_millis(self.inter_candidate_delay_ms)
    }

    /// Timeout of one exchange session.
    #[must_use]
    pub const fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Timeout of the pre-connect rediscovery.
    #[must_use]
    pub const fn refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_timeout_ms)
    }

    /// Floor of the pre-discovery delay.
    #[must_use]
    pub const fn pre_discovery_floor(&self) -> Duration {
        Duration::from_millis(self.pre_discovery_floor_ms)
    }

    /// Minimum spacing of discovery starts on throttled platforms.
    #[must_use]
    pub const fn discovery_window_budget(&self) -> Duration {
        Duration::from_millis(self.discovery_window_budget_ms)
    }

    /// Length of one continuous discovery session.
    #[must_use]
    pub const fn continuous_discovery_window(&self) -> Duration {
        Duration::from_millis(self.continuous_discovery_window_ms)
    }

    /// Retry delay after `failures` consecutive discovery failures.
    ///
    /// Doubles per failure from `discovery_backoff_base_ms`, capped at
    /// `discovery_backoff_max_ms`.
    #[must_use]
    pub fn discovery_backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        let delay = self
            .discovery_backoff_base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.discovery_backoff_max_ms);
        Duration::from_millis(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
        assert!(EngineConfig::for_profile(PlatformProfile::Legacy)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_profile_from_capabilities() {
        let legacy = Capabilities {
            can_broadcast: false,
            legacy_radio_stack: true,
        };
        let config = EngineConfig::for_capabilities(&legacy);
        assert!(config.unstable_radio_stack);
        assert!(config.refresh_before_connect);
        assert!(config.throttle_discovery_starts);

        let config = EngineConfig::for_capabilities(&Capabilities::default());
        assert!(!config.refresh_before_connect);
    }

    #[test]
    fn test_invalid_ratio_rejected() {
        for ratio in [0.0, 1.0, 1.5, -0.2] {
            let config = EngineConfig {
                health_failure_ratio: ratio,
                ..EngineConfig::default()
            };
            assert!(matches!(
                config.validate(),
                Err(ConfigError::ValidationError {
                    field: "health_failure_ratio",
                    ..
                })
            ));
        }
    }

    #[test]
    fn test_multiple_errors_collected() {
        let config = EngineConfig {
            cache_capacity: 0,
            health_window_size: 0,
            ..EngineConfig::default()
        };
        match config.validate() {
            Err(ConfigError::MultipleValidationErrors(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected multiple errors, got {other:?}"),
        }
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str("tx_compensation = -8\ncache_capacity = 10\n")
            .unwrap();
        assert_eq!(config.tx_compensation, -8);
        assert_eq!(config.cache_capacity, 10);
        assert_eq!(
            config.connection_timeout_ms,
            EngineConfig::default().connection_timeout_ms
        );
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "health_window_size = 4").unwrap();
        writeln!(file, "health_failure_ratio = 0.5").unwrap();
        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.health_window_size, 4);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = EngineConfig::load(dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "health_failure_ratio = 2.0").unwrap();
        assert!(EngineConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_discovery_backoff_doubles_and_caps() {
        let config = EngineConfig {
            discovery_backoff_base_ms: 100,
            discovery_backoff_max_ms: 1_000,
            ..EngineConfig::default()
        };
        assert_eq!(config.discovery_backoff(0), Duration::from_millis(100));
        assert_eq!(config.discovery_backoff(1), Duration::from_millis(100));
        assert_eq!(config.discovery_backoff(2), Duration::from_millis(200));
        assert_eq!(config.discovery_backoff(3), Duration::from_millis(400));
        assert_eq!(config.discovery_backoff(10), Duration::from_millis(1_000));
    }
}
