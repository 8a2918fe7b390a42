//! Network error types.

use std::time::Duration;

use crate::transport::TransportType;

/// Errors that can occur in the mesh_network crate.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// A transport-level error (WebSocket connect/send/receive).
    #[error("Transport error: {0}")]
    Transport(String),

    /// No live connection exists for the requested peer.
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// The requested agent is not present in the registry.
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// An agent with this id is already registered.
    #[error("Agent already registered: {0}")]
    DuplicateAgent(String),

    /// The coordinator refused a registration.
    #[error("Registration rejected: {0}")]
    RegistrationRejected(String),

    /// The target is not adjacent and multi-hop routing is not implemented.
    #[error("No route to {0}")]
    RouteUnavailable(String),

    /// The transport cannot be initialized on this build.
    #[error("Transport {0} is not available")]
    TransportUnavailable(TransportType),

    /// A control-plane command name did not match any known command.
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// A frame could not be decoded or violated the wire protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An operation timed out.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// The component has not been initialized or was shut down.
    #[error("Not running")]
    NotRunning,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
