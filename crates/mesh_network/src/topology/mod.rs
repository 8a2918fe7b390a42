//! Network topologies — who holds the agent registry and how messages are
//! routed between nodes.
//!
//! - [`CentralizedTopology`]: one coordinator holds the authoritative
//!   registry; clients dial it, register through it and route through it.
//! - [`DecentralizedTopology`]: every node keeps its own best-effort table,
//!   fed by announcements and heartbeats from directly connected peers.

pub mod centralized;
pub mod decentralized;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::agent::{AgentInfo, SharedDirectory};
use crate::config::{NetworkConfig, TopologyMode};
use crate::connection::ConnectionState;
use crate::error::NetworkError;
use crate::identity::PeerId;
use crate::message::{BroadcastDeduplicator, Message};
use crate::transport::{ConnectionHandler, MessageHandler, SystemHandler, Transport};

pub use centralized::CentralizedTopology;
pub use decentralized::DecentralizedTopology;

/// Registry and routing strategy layered over a [`Transport`].
#[async_trait]
pub trait NetworkTopology: Send + Sync {
    fn mode(&self) -> TopologyMode;

    /// Name of this node.
    fn node_id(&self) -> &str;

    /// Bring up the transport and start background tasks.
    async fn initialize(&self) -> Result<(), NetworkError>;

    /// Stop background tasks, close the transport and clear the registry.
    async fn shutdown(&self) -> Result<(), NetworkError>;

    /// Register an agent hosted by this node. Duplicate ids are rejected.
    async fn register_agent(&self, info: AgentInfo) -> Result<(), NetworkError>;

    async fn unregister_agent(&self, agent_id: &str) -> Result<(), NetworkError>;

    /// Known agents holding every capability in `capabilities`.
    async fn discover_peers(&self, capabilities: &[String]) -> Vec<AgentInfo>;

    /// Deliver `message` according to the topology's routing policy.
    /// Returns the number of deliveries made.
    async fn route_message(&self, message: &Message) -> Result<usize, NetworkError>;

    /// Record a remote agent reachable through `via`. Replaces any routed
    /// entry with the same id.
    fn attach_agent(&self, info: AgentInfo, via: PeerId) -> Result<(), NetworkError>;

    /// Forget a remote agent, but only if it is reached through `via`.
    fn detach_agent(&self, agent_id: &str, via: &PeerId) -> Result<(), NetworkError>;

    /// The connection an agent is reached through; `None` for local or
    /// unknown agents.
    fn route_of(&self, agent_id: &str) -> Option<PeerId>;

    fn agent_count(&self) -> usize;

    /// Handlers for application messages addressed to this node's agents.
    fn on_message(&self, handler: MessageHandler);

    fn on_system_message(&self, handler: SystemHandler);

    fn on_connection_state(&self, handler: ConnectionHandler);

    /// The active transport, once initialized.
    fn transport(&self) -> Option<Arc<dyn Transport>>;

    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Build the topology `config.mode` asks for.
pub fn create_topology(
    node_id: impl Into<String>,
    config: NetworkConfig,
) -> Result<Arc<dyn NetworkTopology>, NetworkError> {
    config.validate()?;
    let node_id = node_id.into();
    Ok(match config.mode {
        TopologyMode::Centralized => Arc::new(CentralizedTopology::new(node_id, config)),
        TopologyMode::Decentralized => Arc::new(DecentralizedTopology::new(node_id, config)),
    })
}

// ---------------------------------------------------------------------------
// Shared plumbing
// ---------------------------------------------------------------------------

/// How long topology shutdown waits for background tasks.
const TASK_GRACE: Duration = Duration::from_secs(5);

/// Background tasks sharing one shutdown signal.
pub(crate) struct BackgroundTasks {
    shutdown_tx: broadcast::Sender<()>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundTasks {
    pub(crate) fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        Self {
            shutdown_tx,
            handles: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handles.lock().push(tokio::spawn(task));
    }

    /// Signal every task and wait for it to finish.
    pub(crate) async fn stop_all(&self) {
        let _ = self.shutdown_tx.send(());
        let mut handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        let joined =
            tokio::time::timeout(TASK_GRACE, futures::future::join_all(handles.iter_mut())).await;
        if joined.is_err() {
            warn!("Background tasks did not stop within {TASK_GRACE:?}, aborting");
            for handle in &handles {
                handle.abort();
            }
        }
    }
}

/// Handlers registered on a topology by its owner.
pub(crate) struct LocalHandlers {
    message: parking_lot::RwLock<Vec<MessageHandler>>,
    system: parking_lot::RwLock<Vec<SystemHandler>>,
    connection: parking_lot::RwLock<Vec<ConnectionHandler>>,
    dedup: parking_lot::Mutex<BroadcastDeduplicator>,
}

impl LocalHandlers {
    pub(crate) fn new() -> Self {
        Self {
            message: parking_lot::RwLock::new(Vec::new()),
            system: parking_lot::RwLock::new(Vec::new()),
            connection: parking_lot::RwLock::new(Vec::new()),
            dedup: parking_lot::Mutex::new(BroadcastDeduplicator::default()),
        }
    }

    pub(crate) fn add_message(&self, handler: MessageHandler) {
        self.message.write().push(handler);
    }

    pub(crate) fn add_system(&self, handler: SystemHandler) {
        self.system.write().push(handler);
    }

    pub(crate) fn add_connection(&self, handler: ConnectionHandler) {
        self.connection.write().push(handler);
    }

    /// Deliver to the message handlers, dropping repeated broadcasts.
    /// Returns whether the message was delivered.
    pub(crate) async fn deliver(&self, from: PeerId, message: Message) -> bool {
        if !self.dedup.lock().accept(&message) {
            debug!("Dropping repeated broadcast {:?}", message.broadcast_id);
            return false;
        }
        let handlers: Vec<MessageHandler> = self.message.read().clone();
        for handler in handlers {
            handler(from.clone(), message.clone()).await;
        }
        true
    }

    pub(crate) async fn deliver_system(
        &self,
        from: PeerId,
        raw: serde_json::Value,
        handle: crate::connection::ConnectionHandle,
    ) {
        let handlers: Vec<SystemHandler> = self.system.read().clone();
        for handler in handlers {
            handler(from.clone(), raw.clone(), handle.clone()).await;
        }
    }

    pub(crate) async fn notify(&self, peer: PeerId, state: ConnectionState) {
        let handlers: Vec<ConnectionHandler> = self.connection.read().clone();
        for handler in handlers {
            handler(peer.clone(), state).await;
        }
    }
}

/// Send a broadcast to every peer and to the agents hosted next to its
/// sender. The copy handed to local handlers carries the same
/// `broadcast_id` as the wire copies.
pub(crate) async fn fan_out(
    transport: &Arc<dyn Transport>,
    directory: &SharedDirectory,
    handlers: &LocalHandlers,
    node_id: &str,
    message: &Message,
) -> Result<usize, NetworkError> {
    let mut message = message.clone();
    if message.broadcast_id.is_none() {
        message.broadcast_id = Some(uuid::Uuid::new_v4().to_string());
    }

    let cohosted = directory
        .read()
        .local_agents()
        .iter()
        .any(|agent| agent.agent_id != message.sender_id);
    let mut delivered = 0;
    if cohosted && handlers.deliver(PeerId::from_string(node_id), message.clone()).await {
        delivered += 1;
    }

    Ok(delivered + transport.send(&message).await?)
}
