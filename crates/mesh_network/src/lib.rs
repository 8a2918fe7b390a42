//! Mesh Network — agent networking over pluggable topologies and transports.
//!
//! This crate lets independent agents join a named network, discover one
//! another by capability, and exchange direct and broadcast messages.
//!
//! # Architecture
//!
//! - **Transport**: WebSocket connections (via `tokio-tungstenite`) behind a
//!   [`Transport`](transport::Transport) trait; other transport kinds are
//!   declared and fall back to WebSocket.
//! - **Topology**: centralized (one coordinator relays and owns the
//!   registry) or decentralized (peers gossip announcements and heartbeats).
//! - **Control plane**: tagged JSON frames for registration and system
//!   commands, answered by [`AgentNetwork`].
//! - **Routing**: handler-based dispatch keyed by message type.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use mesh_network::{AgentClient, AgentNetwork, NetworkConfig};
//!
//! # async fn example() -> Result<(), mesh_network::NetworkError> {
//! let mut network = AgentNetwork::new("demo", NetworkConfig::coordinator("127.0.0.1", 8570))?;
//! network.start().await?;
//!
//! let mut alice = AgentClient::new("alice");
//! alice.connect_to_server("127.0.0.1", 8570).await?;
//! alice.register(vec!["chat".into()], Default::default()).await?;
//! alice.send_broadcast_message("text", serde_json::json!({"text": "hello"})).await?;
//!
//! alice.disconnect().await?;
//! network.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod identity;
pub mod logging;
pub mod message;
pub mod mods;
pub mod network;
pub mod routing;
pub mod system;
pub mod topology;
pub mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use agent::{AgentDirectory, AgentInfo};
pub use client::AgentClient;
pub use config::{NetworkConfig, TopologyMode};
pub use connection::{ConnectionHandle, ConnectionInfo, ConnectionState};
pub use error::NetworkError;
pub use identity::{AgentCertificate, IdentityManager, PeerId};
pub use message::Message;
pub use mods::{ModInfo, ModManifest, ModRegistry};
pub use network::{AgentNetwork, NetworkInfo};
pub use routing::{MessageRouter, ResponseRouter};
pub use system::{SystemCommand, SystemRequest, SystemResponse};
pub use topology::{CentralizedTopology, DecentralizedTopology, NetworkTopology, create_topology};
pub use transport::{Transport, TransportManager, TransportType, WebSocketTransport};
