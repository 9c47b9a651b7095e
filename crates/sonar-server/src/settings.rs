//! Server configuration.
//!
//! Layered with the `config` crate: built-in defaults, then an optional TOML
//! file, then `SONAR__*` environment variables
//! (`SONAR__BIND_ADDRESS`, `SONAR__ENGINE__CONNECTION_TIMEOUT_MS`, ...).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sonar_core::{
    Capabilities, DeviceAddress, EngineConfig, IdentityPayload, Payload, SimulatedPeer,
};

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_ENV: &str = "SONAR_CONFIG";

/// A peer placed in range of the simulated radio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSettings {
    /// Transport address, `AA:BB:CC:DD:EE:FF`.
    pub address: DeviceAddress,
    /// Identity payload as 32 hex characters.
    pub identity: String,
    /// Transmit compensation the peer advertises.
    #[serde(default)]
    pub tx_power: i8,
    /// Signal strength at which the peer is heard.
    pub rssi: i32,
    /// Whether scans carry the payload.
    #[serde(default = "default_true")]
    pub broadcasts: bool,
    /// Exchange latency in milliseconds.
    #[serde(default = "default_latency_ms")]
    pub latency_ms: u64,
}

const fn default_true() -> bool {
    true
}

const fn default_latency_ms() -> u64 {
    50
}

impl PeerSettings {
    /// Build the simulated peer.
    ///
    /// # Errors
    ///
    /// Returns an error if `identity` is not 16 hex-encoded bytes.
    pub fn to_peer(&self) -> anyhow::Result<SimulatedPeer> {
        let identity = parse_identity(&self.identity)
            .with_context(|| format!("peer {}", self.address))?;
        let peer = SimulatedPeer::new(self.address, Payload::new(identity, self.tx_power), self.rssi)
            .with_latency(Duration::from_millis(self.latency_ms));
        Ok(if self.broadcasts { peer } else { peer.silent() })
    }
}

/// Everything the daemon reads at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address of the REST API.
    pub bind_address: SocketAddr,
    /// JSON file logging instead of pretty stdout.
    pub production: bool,
    /// Start the engine as soon as the server is up.
    pub auto_start: bool,
    /// How many events and errors the server remembers.
    pub event_log_capacity: usize,
    /// Capabilities of the (simulated) radio.
    pub capabilities: Capabilities,
    /// Engine tuning. When absent, the profile matching `capabilities`
    /// applies.
    pub engine: Option<EngineConfig>,
    /// Peers in range of the simulated radio.
    pub simulated_peers: Vec<PeerSettings>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 3000)),
            production: false,
            auto_start: false,
            event_log_capacity: 256,
            capabilities: Capabilities {
                can_broadcast: true,
                legacy_radio_stack: false,
            },
            engine: None,
            simulated_peers: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from `path` (if it exists) and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or the engine
    /// configuration is invalid.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let settings: Self = builder
            .add_source(
                config::Environment::with_prefix("SONAR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("reading configuration")?
            .try_deserialize()
            .context("parsing configuration")?;

        settings.engine_config().validate()?;
        Ok(settings)
    }

    /// Load from `SONAR_CONFIG`, else the platform config directory.
    ///
    /// # Errors
    ///
    /// See [`load`](Self::load).
    pub fn load_default() -> anyhow::Result<Self> {
        let path = std::env::var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .or_else(default_config_path);
        Self::load(path.as_deref())
    }

    /// The engine configuration to run with.
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        self.engine
            .clone()
            .unwrap_or_else(|| EngineConfig::for_capabilities(&self.capabilities))
    }
}

/// Parse a hex-encoded identity payload.
///
/// # Errors
///
/// Returns an error if `hex` is not valid hex or not exactly 16 bytes long.
pub fn parse_identity(hex: &str) -> anyhow::Result<IdentityPayload> {
    let bytes = hex::decode(hex.trim()).context("identity is not valid hex")?;
    IdentityPayload::from_slice(&bytes)
        .with_context(|| format!("identity must be 16 bytes, got {}", bytes.len()))
}

fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "sonar").map(|dirs| dirs.config_dir().join("config.toml"))
}
