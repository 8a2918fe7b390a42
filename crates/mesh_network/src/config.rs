//! Network configuration for a mesh node.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::NetworkError;
use crate::transport::TransportType;

/// Strategy governing discovery and routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyMode {
    /// One coordinator holds the authoritative registry.
    Centralized,
    /// Every node keeps its own best-effort table and gossips announcements.
    Decentralized,
}

impl TopologyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Centralized => "centralized",
            Self::Decentralized => "decentralized",
        }
    }
}

impl fmt::Display for TopologyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration accepted by a network launcher.
///
/// Only the keys below are accepted; anything else fails to deserialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    /// Topology strategy.
    pub mode: TopologyMode,

    /// Host to bind (coordinator / peer) or dial (client).
    pub host: String,

    /// Port to bind or dial. `0` asks the OS for an ephemeral port.
    pub port: u16,

    /// Whether this node is the coordinator in centralized mode.
    pub server_mode: bool,

    /// Preferred wire transport. Unavailable transports fall back to WebSocket.
    pub transport: TransportType,

    /// `host:port` (or `ws://` URL) of nodes to dial when joining a
    /// decentralized overlay.
    pub bootstrap_nodes: Vec<String>,

    /// Interval between discovery refreshes.
    #[serde(with = "duration_serde")]
    pub discovery_interval: Duration,

    /// Interval between heartbeat broadcasts.
    #[serde(with = "duration_serde")]
    pub heartbeat_interval: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mode: TopologyMode::Centralized,
            host: "0.0.0.0".to_string(),
            port: 8570,
            server_mode: true,
            transport: TransportType::WebSocket,
            bootstrap_nodes: Vec::new(),
            discovery_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

impl NetworkConfig {
    /// Config for a centralized coordinator on `host:port`.
    pub fn coordinator(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Config for a centralized client dialing the coordinator at `host:port`.
    pub fn client(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            server_mode: false,
            ..Self::default()
        }
    }

    /// Config for a decentralized peer listening on `host:port`.
    pub fn peer(host: impl Into<String>, port: u16, bootstrap_nodes: Vec<String>) -> Self {
        Self {
            mode: TopologyMode::Decentralized,
            host: host.into(),
            port,
            server_mode: false,
            bootstrap_nodes,
            ..Self::default()
        }
    }

    /// The `host:port` string this node binds or dials.
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check values that serde alone cannot reject.
    pub fn validate(&self) -> Result<(), NetworkError> {
        if self.host.trim().is_empty() {
            return Err(NetworkError::Config("host must not be empty".into()));
        }
        if self.discovery_interval.is_zero() {
            return Err(NetworkError::Config(
                "discovery_interval must be at least one second".into(),
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(NetworkError::Config(
                "heartbeat_interval must be at least one second".into(),
            ));
        }
        if self.bootstrap_nodes.iter().any(|n| n.trim().is_empty()) {
            return Err(NetworkError::Config("bootstrap node address is empty".into()));
        }
        Ok(())
    }

    /// Parse and validate a JSON config document.
    pub fn from_json(json: &str) -> Result<Self, NetworkError> {
        let config: NetworkConfig = serde_json::from_str(json)
            .map_err(|e| NetworkError::Config(format!("Invalid network config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), NetworkError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file, or return defaults if the file is
    /// missing or unusable.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match Self::from_json(&data) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Corrupt config file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read config file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
