//! Unified error types for the sonar engine.
//!
//! [`SonarError`] covers every failure the engine reports to its host through
//! [`ProximityCallback::on_error`](crate::transport::ProximityCallback::on_error)
//! or returns from lifecycle calls. Module-specific errors
//! ([`ConfigError`], [`PayloadError`]) convert into it.
//!
//! # Taxonomy
//!
//! - **Transport start failure**: a discovery, broadcast or connection session
//!   refused to start
//! - **Transport runtime error**: an error code surfaced mid-session
//! - **Radio stack unhealthy**: derived from the health monitor, non-fatal
//! - **Unstable platform**: the unhealthy condition escalated on platforms
//!   whose radio stack needs an external restart; the only fatal error
//!
//! Malformed payloads are not errors: they are dropped where they are decoded.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::types::DeviceAddress;

/// Radio subsystem an error originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subsystem {
    /// Passive discovery of peers.
    Discovery,
    /// Broadcast of the local payload.
    Broadcast,
    /// Exchange sessions and the local responder.
    Connection,
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Discovery => "discovery",
            Self::Broadcast => "broadcast",
            Self::Connection => "connection",
        })
    }
}

/// The unified error type for all engine operations.
#[derive(Debug, Clone, Error)]
pub enum SonarError {
    // =========================================================================
    // TRANSPORT ERRORS
    // =========================================================================
    /// A radio session refused to start.
    #[error("{subsystem} failed to start{}", code_suffix(.code))]
    TransportStart {
        /// Failing subsystem.
        subsystem: Subsystem,
        /// Platform error code, when the platform reports one.
        code: Option<i32>,
    },

    /// A running radio session reported an error.
    #[error("{subsystem} error{}", code_suffix(.code))]
    TransportRuntime {
        /// Failing subsystem.
        subsystem: Subsystem,
        /// Platform error code, when the platform reports one.
        code: Option<i32>,
    },

    /// A bounded radio operation did not complete in time.
    #[error("{subsystem} timed out after {}ms", .after.as_millis())]
    Timeout {
        /// Subsystem of the operation.
        subsystem: Subsystem,
        /// The bound that elapsed.
        after: Duration,
    },

    /// An exchange session is already open with this address.
    #[error("An exchange session is already open with {0}")]
    SessionBusy(DeviceAddress),

    /// The peer does not expose the exchange service.
    #[error("Device {0} does not expose the exchange service")]
    ServiceNotFound(DeviceAddress),

    // =========================================================================
    // HEALTH ERRORS
    // =========================================================================
    /// Too many radio failures; the stack is degraded.
    #[error("Radio stack is unhealthy")]
    RadioStackUnhealthy,

    /// The radio stack is unhealthy on a platform known to need a restart.
    #[error("Radio stack is unhealthy and the platform is unstable. Restart the radio stack.")]
    UnstablePlatform,

    // =========================================================================
    // LIFECYCLE ERRORS
    // =========================================================================
    /// The radio context thread is gone.
    #[error("Radio executor has stopped")]
    RadioExecutorStopped,

    /// `start` was called before `set_up`.
    #[error("Engine is not set up. Call set_up before start.")]
    NotSetUp,

    /// `start` was called on a running engine.
    #[error("Engine is already running")]
    AlreadyRunning,

    /// Configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(String),
}

fn code_suffix(code: &Option<i32>) -> String {
    code.map(|c| format!(" (code {c})")).unwrap_or_default()
}

/// A specialized [`Result`] type for engine operations.
pub type Result<T> = std::result::Result<T, SonarError>;

impl SonarError {
    /// The radio subsystem this error is tagged with, if any.
    #[inline]
    #[must_use]
    pub const fn subsystem(&self) -> Option<Subsystem> {
        match self {
            Self::TransportStart { subsystem, .. }
            | Self::TransportRuntime { subsystem, .. }
            | Self::Timeout { subsystem, .. } => Some(*subsystem),
            Self::SessionBusy(_) | Self::ServiceNotFound(_) => Some(Subsystem::Connection),
            _ => None,
        }
    }

    /// The platform error code, if the platform reported one.
    #[inline]
    #[must_use]
    pub const fn platform_code(&self) -> Option<i32> {
        match self {
            Self::TransportStart { code, .. } | Self::TransportRuntime { code, .. } => *code,
            _ => None,
        }
    }

    /// Returns `true` if this error ends the engine's run loop.
    #[inline]
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::UnstablePlatform | Self::RadioExecutorStopped)
    }

    /// Returns `true` if this error originates from a radio transport.
    #[inline]
    #[must_use]
    pub const fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::TransportStart { .. }
                | Self::TransportRuntime { .. }
                | Self::Timeout { .. }
                | Self::SessionBusy(_)
                | Self::ServiceNotFound(_)
        )
    }

    /// Returns `true` if the engine is expected to recover on its own.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        self.is_transport_error() || matches!(self, Self::RadioStackUnhealthy)
    }

    /// Returns a machine-readable error code.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::TransportStart { subsystem, .. } => match subsystem {
                Subsystem::Discovery => "DISCOVERY_START_FAILED",
                Subsystem::Broadcast => "BROADCAST_START_FAILED",
                Subsystem::Connection => "CONNECTION_START_FAILED",
            },
            Self::TransportRuntime { subsystem, .. } => match subsystem {
                Subsystem::Discovery => "DISCOVERY_ERROR",
                Subsystem::Broadcast => "BROADCAST_ERROR",
                Subsystem::Connection => "CONNECTION_ERROR",
            },
            Self::Timeout { subsystem, .. } => match subsystem {
                Subsystem::Discovery => "DISCOVERY_TIMEOUT",
                Subsystem::Broadcast => "BROADCAST_TIMEOUT",
                Subsystem::Connection => "CONNECTION_TIMEOUT",
            },
            Self::SessionBusy(_) => "SESSION_BUSY",
            Self::ServiceNotFound(_) => "SERVICE_NOT_FOUND",
            Self::RadioStackUnhealthy => "RADIO_STACK_UNHEALTHY",
            Self::UnstablePlatform => "UNSTABLE_PLATFORM",
            Self::RadioExecutorStopped => "RADIO_EXECUTOR_STOPPED",
            Self::NotSetUp => "NOT_SET_UP",
            Self::AlreadyRunning => "ALREADY_RUNNING",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }
}

impl From<ConfigError> for SonarError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.into_iter().map(|e| e.to_string()).collect();
                Self::Config(messages.join("; "))
            }
            other => Self::Config(other.to_string()),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subsystem_tagging() {
        let err = SonarError::TransportStart {
            subsystem: Subsystem::Broadcast,
            code: Some(3),
        };
        assert_eq!(err.subsystem(), Some(Subsystem::Broadcast));
        assert_eq!(err.platform_code(), Some(3));
        assert_eq!(SonarError::UnstablePlatform.subsystem(), None);
        assert_eq!(
            SonarError::SessionBusy(DeviceAddress::new([0; 6])).subsystem(),
            Some(Subsystem::Connection)
        );
    }

    #[test]
    fn test_only_unstable_platform_and_lost_executor_are_fatal() {
        assert!(SonarError::UnstablePlatform.is_fatal());
        assert!(SonarError::RadioExecutorStopped.is_fatal());
        assert!(!SonarError::RadioStackUnhealthy.is_fatal());
        assert!(!SonarError::TransportRuntime {
            subsystem: Subsystem::Discovery,
            code: None
        }
        .is_fatal());
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(SonarError::RadioStackUnhealthy.is_recoverable());
        assert!(SonarError::Timeout {
            subsystem: Subsystem::Connection,
            after: Duration::from_secs(1)
        }
        .is_recoverable());
        assert!(!SonarError::NotSetUp.is_recoverable());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            SonarError::TransportStart {
                subsystem: Subsystem::Discovery,
                code: None
            }
            .error_code(),
            "DISCOVERY_START_FAILED"
        );
        assert_eq!(SonarError::UnstablePlatform.error_code(), "UNSTABLE_PLATFORM");
        assert_eq!(SonarError::NotSetUp.error_code(), "NOT_SET_UP");
    }

    #[test]
    fn test_error_display_messages() {
        let err = SonarError::TransportRuntime {
            subsystem: Subsystem::Connection,
            code: Some(133),
        };
        assert_eq!(err.to_string(), "connection error (code 133)");

        let err = SonarError::TransportStart {
            subsystem: Subsystem::Discovery,
            code: None,
        };
        assert_eq!(err.to_string(), "discovery failed to start");

        let err = SonarError::Timeout {
            subsystem: Subsystem::Discovery,
            after: Duration::from_millis(1500),
        };
        assert!(err.to_string().contains("1500ms"));
    }

    #[test]
    fn test_from_config_error() {
        let err: SonarError = ConfigError::MultipleValidationErrors(vec![
            ConfigError::ValidationError {
                field: "a",
                message: "bad".into(),
            },
            ConfigError::ValidationError {
                field: "b",
                message: "worse".into(),
            },
        ])
        .into();
        assert_eq!(err.to_string(), "Configuration error: a: bad; b: worse");
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<SonarError>();
        assert_sync::<SonarError>();
    }
}
