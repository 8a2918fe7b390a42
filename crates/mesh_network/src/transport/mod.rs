//! Transport abstraction.
//!
//! A [`Transport`] moves framed messages over a connection-oriented medium
//! and owns the per-peer connection state. Its side effects surface only
//! through three callback sets:
//!
//! - message handlers, for decoded application [`Message`]s;
//! - connection-state handlers, for every [`ConnectionState`] change;
//! - system handlers, for raw control-plane frames plus the
//!   [`ConnectionHandle`] to answer on.
//!
//! Handlers run inline on the connection's read loop, so messages from one
//! connection reach them in arrival order.

pub mod manager;
pub mod unavailable;
pub mod websocket;

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::connection::{ConnectionHandle, ConnectionInfo, ConnectionState};
use crate::error::NetworkError;
use crate::identity::PeerId;
use crate::message::Message;

pub use manager::TransportManager;
pub use unavailable::UnavailableTransport;
pub use websocket::WebSocketTransport;

/// Boxed future returned by every handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Receives decoded application messages together with the peer they
/// arrived from.
pub type MessageHandler = Arc<dyn Fn(PeerId, Message) -> HandlerFuture + Send + Sync>;

/// Observes connection state changes.
pub type ConnectionHandler = Arc<dyn Fn(PeerId, ConnectionState) -> HandlerFuture + Send + Sync>;

/// Receives raw control-plane frames and the handle to reply on.
pub type SystemHandler =
    Arc<dyn Fn(PeerId, serde_json::Value, ConnectionHandle) -> HandlerFuture + Send + Sync>;

/// Maps a logical agent id to the peer connection that reaches it.
pub type AgentResolver = Arc<dyn Fn(&str) -> Option<PeerId> + Send + Sync>;

/// Build a [`MessageHandler`] from an async closure.
pub fn message_handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(PeerId, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |peer: PeerId, message: Message| -> HandlerFuture {
        Box::pin(f(peer, message))
    })
}

/// Build a [`ConnectionHandler`] from an async closure.
pub fn connection_handler<F, Fut>(f: F) -> ConnectionHandler
where
    F: Fn(PeerId, ConnectionState) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |peer: PeerId, state: ConnectionState| -> HandlerFuture {
        Box::pin(f(peer, state))
    })
}

/// Build a [`SystemHandler`] from an async closure.
pub fn system_handler<F, Fut>(f: F) -> SystemHandler
where
    F: Fn(PeerId, serde_json::Value, ConnectionHandle) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(
        move |peer: PeerId, raw: serde_json::Value, handle: ConnectionHandle| -> HandlerFuture {
            Box::pin(f(peer, raw, handle))
        },
    )
}

/// Wire transports known to the network, in no particular order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    WebSocket,
    Libp2p,
    Grpc,
    Webrtc,
}

impl TransportType {
    /// Every transport, highest negotiation priority first.
    pub const BY_PRIORITY: [TransportType; 4] = [
        TransportType::Libp2p,
        TransportType::Webrtc,
        TransportType::Grpc,
        TransportType::WebSocket,
    ];

    /// Negotiation priority; higher wins.
    pub fn priority(&self) -> u8 {
        match self {
            Self::Libp2p => 4,
            Self::Webrtc => 3,
            Self::Grpc => 2,
            Self::WebSocket => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebSocket => "websocket",
            Self::Libp2p => "libp2p",
            Self::Grpc => "grpc",
            Self::Webrtc => "webrtc",
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportType {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "websocket" => Ok(Self::WebSocket),
            "libp2p" => Ok(Self::Libp2p),
            "grpc" => Ok(Self::Grpc),
            "webrtc" => Ok(Self::Webrtc),
            other => Err(NetworkError::Config(format!("Unknown transport '{other}'"))),
        }
    }
}

/// A wire-level mechanism for exchanging framed messages with peers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which transport this is.
    fn transport_type(&self) -> TransportType;

    /// Prepare the transport for use. Fails if it cannot run on this build.
    async fn initialize(&self) -> Result<(), NetworkError>;

    /// Bind `address` (`host:port`) and accept inbound connections.
    /// Returns the bound address.
    async fn listen(&self, address: &str) -> Result<SocketAddr, NetworkError>;

    /// Dial `address` and track the connection under `peer_id`.
    async fn connect(&self, peer_id: &PeerId, address: &str) -> Result<(), NetworkError>;

    /// Close the connection to `peer_id`.
    async fn disconnect(&self, peer_id: &PeerId) -> Result<(), NetworkError>;

    /// Deliver `message`. Unicast targets are resolved by agent id first and
    /// by peer id second. Broadcasts go to every connection except the
    /// sender's. Returns the number of frames handed to connections.
    async fn send(&self, message: &Message) -> Result<usize, NetworkError>;

    /// Close every connection and stop every task the transport spawned.
    async fn shutdown(&self) -> Result<(), NetworkError>;

    /// Writer handle for a live connection.
    async fn connection(&self, peer_id: &PeerId) -> Option<ConnectionHandle>;

    /// Snapshot of tracked connections.
    async fn connections(&self) -> Vec<ConnectionInfo>;

    /// Address bound by [`listen`](Transport::listen), if any.
    fn local_addr(&self) -> Option<SocketAddr>;

    fn on_message(&self, handler: MessageHandler);

    fn on_connection_state(&self, handler: ConnectionHandler);

    fn on_system_message(&self, handler: SystemHandler);

    /// Install the agent-id → peer resolver consulted by [`send`](Transport::send).
    fn set_agent_resolver(&self, resolver: AgentResolver);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
