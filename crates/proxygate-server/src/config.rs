use proxygate_admission::BlacklistConfig;
use proxygate_transport::{EstimatorConfig, ThrottleConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Top-level configuration of the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to accept client connections on.
    pub listen_addr: SocketAddr,
    /// `host:port` every admitted connection is relayed to.
    pub upstream_addr: String,
    /// Emit logs as JSON lines instead of human-readable text.
    pub log_json: bool,
    /// Start every admitted connection throttled.
    pub throttle_on_accept: bool,
    /// Per-IP blacklist settings.
    pub blacklist: BlacklistConfig,
    /// Rate ceiling for throttled connections.
    pub throttle: ThrottleConfig,
    /// Smoothing window for per-connection bandwidth samples.
    pub estimator: EstimatorConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            upstream_addr: String::from("127.0.0.1:3128"),
            log_json: false,
            throttle_on_accept: false,
            blacklist: BlacklistConfig::default(),
            throttle: ThrottleConfig::default(),
            estimator: EstimatorConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Loads a config from a `.toml` or `.json` file. Missing fields keep their defaults.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: ServerConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        Ok(config)
    }

    /// Checks every subsystem's settings.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.upstream_addr.is_empty() {
            anyhow::bail!("upstream_addr must not be empty");
        }
        self.blacklist.validate()?;
        self.throttle.validate()?;
        self.estimator.validate()?;
        Ok(())
    }
}
