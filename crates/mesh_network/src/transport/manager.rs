//! Transport registry and negotiation.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::NetworkError;
use crate::transport::{Transport, TransportType, UnavailableTransport, WebSocketTransport};

/// Pick the highest-priority transport both sides support.
pub fn negotiate(local: &[TransportType], peer: &[TransportType]) -> Option<TransportType> {
    TransportType::BY_PRIORITY
        .into_iter()
        .find(|t| local.contains(t) && peer.contains(t))
}

/// Holds every registered transport and tracks the single active one.
pub struct TransportManager {
    transports: HashMap<TransportType, Arc<dyn Transport>>,
    active: Option<TransportType>,
}

impl TransportManager {
    pub fn new() -> Self {
        Self {
            transports: HashMap::new(),
            active: None,
        }
    }

    /// WebSocket plus placeholders for the transports this build cannot run.
    pub fn with_defaults(node_id: &str) -> Self {
        let mut manager = Self::new();
        manager.register_transport(Arc::new(WebSocketTransport::new(node_id)));
        for kind in [TransportType::Libp2p, TransportType::Grpc, TransportType::Webrtc] {
            manager.register_transport(Arc::new(UnavailableTransport::new(kind)));
        }
        manager
    }

    /// Register a transport, replacing any previous one of the same type.
    pub fn register_transport(&mut self, transport: Arc<dyn Transport>) {
        let kind = transport.transport_type();
        if self.transports.insert(kind, transport).is_some() {
            warn!("Replaced registered {kind} transport");
        }
    }

    pub fn get(&self, kind: TransportType) -> Option<Arc<dyn Transport>> {
        self.transports.get(&kind).cloned()
    }

    /// Initialize `kind` and make it the active transport.
    pub async fn initialize_transport(
        &mut self,
        kind: TransportType,
    ) -> Result<Arc<dyn Transport>, NetworkError> {
        let transport = self
            .get(kind)
            .ok_or(NetworkError::TransportUnavailable(kind))?;
        transport.initialize().await?;
        self.active = Some(kind);
        info!("Activated {kind} transport");
        Ok(transport)
    }

    /// Initialize `preferred`, falling back to WebSocket if it cannot run.
    pub async fn initialize_preferred(
        &mut self,
        preferred: TransportType,
    ) -> Result<Arc<dyn Transport>, NetworkError> {
        match self.initialize_transport(preferred).await {
            Ok(transport) => Ok(transport),
            Err(e) if preferred != TransportType::WebSocket => {
                warn!("{preferred} transport unavailable ({e}), falling back to websocket");
                self.initialize_transport(TransportType::WebSocket).await
            }
            Err(e) => Err(e),
        }
    }

    pub fn active_type(&self) -> Option<TransportType> {
        self.active
    }

    /// The transport chosen by the last successful initialize call.
    pub fn active_transport(&self) -> Option<Arc<dyn Transport>> {
        self.active.and_then(|kind| self.get(kind))
    }

    /// Registered transport types, highest priority first.
    pub fn supported_types(&self) -> Vec<TransportType> {
        TransportType::BY_PRIORITY
            .into_iter()
            .filter(|t| self.transports.contains_key(t))
            .collect()
    }

    /// Best transport shared with a peer advertising `peer_supported`.
    pub fn negotiate_transport(&self, peer_supported: &[TransportType]) -> Option<TransportType> {
        negotiate(&self.supported_types(), peer_supported)
    }

    /// Shut down every registered transport. Failures are logged.
    pub async fn shutdown_all(&mut self) {
        for (kind, transport) in &self.transports {
            if let Err(e) = transport.shutdown().await {
                warn!("Shutting down {kind} transport failed: {e}");
            }
        }
        self.active = None;
    }
}

impl Default for TransportManager {
    fn default() -> Self {
        Self::new()
    }
}
