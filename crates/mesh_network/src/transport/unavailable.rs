//! Placeholder for transports this build cannot run.
//!
//! libp2p, gRPC and WebRTC are registered so negotiation can name them, but
//! their `initialize` always fails and callers fall back to WebSocket.

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::connection::{ConnectionHandle, ConnectionInfo};
use crate::error::NetworkError;
use crate::identity::PeerId;
use crate::message::Message;
use crate::transport::{
    AgentResolver, ConnectionHandler, MessageHandler, SystemHandler, Transport, TransportType,
};

/// Placeholder for a transport kind this build cannot run. Every
/// operation fails with [`NetworkError::TransportUnavailable`].
pub struct UnavailableTransport {
    kind: TransportType,
}

impl UnavailableTransport {
    pub fn new(kind: TransportType) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl Transport for UnavailableTransport {
    fn transport_type(&self) -> TransportType {
        self.kind
    }

    async fn initialize(&self) -> Result<(), NetworkError> {
        Err(NetworkError::TransportUnavailable(self.kind))
    }

    async fn listen(&self, _address: &str) -> Result<SocketAddr, NetworkError> {
        Err(NetworkError::TransportUnavailable(self.kind))
    }

    async fn connect(&self, _peer_id: &PeerId, _address: &str) -> Result<(), NetworkError> {
        Err(NetworkError::TransportUnavailable(self.kind))
    }

    async fn disconnect(&self, peer_id: &PeerId) -> Result<(), NetworkError> {
        Err(NetworkError::PeerNotFound(peer_id.to_string()))
    }

    async fn send(&self, _message: &Message) -> Result<usize, NetworkError> {
        Err(NetworkError::TransportUnavailable(self.kind))
    }

    async fn shutdown(&self) -> Result<(), NetworkError> {
        Ok(())
    }

    async fn connection(&self, _peer_id: &PeerId) -> Option<ConnectionHandle> {
        None
    }

    async fn connections(&self) -> Vec<ConnectionInfo> {
        Vec::new()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn on_message(&self, _handler: MessageHandler) {}

    fn on_connection_state(&self, _handler: ConnectionHandler) {}

    fn on_system_message(&self, _handler: SystemHandler) {}

    fn set_agent_resolver(&self, _resolver: AgentResolver) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initialize_fails() {
        let transport = UnavailableTransport::new(TransportType::Grpc);
        assert_eq!(transport.transport_type(), TransportType::Grpc);
        assert!(matches!(
            transport.initialize().await,
            Err(NetworkError::TransportUnavailable(TransportType::Grpc))
        ));
        assert!(transport.shutdown().await.is_ok());
    }
}
