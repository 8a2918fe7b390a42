//! Decentralized topology — every node keeps its own agent table.
//!
//! Nodes listen on their own address and dial the configured bootstrap
//! nodes. Local registrations are announced to every connected peer, and
//! again to each peer as it connects. Peers gossip heartbeats listing their
//! hosted agents; remote entries that stop being refreshed are pruned.
//!
//! Only directly connected peers are reachable. Routing to an agent behind
//! another node fails with [`NetworkError::RouteUnavailable`].

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::agent::{AgentDirectory, AgentInfo, SharedDirectory};
use crate::config::{NetworkConfig, TopologyMode};
use crate::connection::{ConnectionHandle, ConnectionState};
use crate::error::NetworkError;
use crate::identity::PeerId;
use crate::message::{Message, RoutedEnvelope};
use crate::topology::{BackgroundTasks, LocalHandlers, NetworkTopology, fan_out};
use crate::transport::{
    ConnectionHandler, MessageHandler, SystemHandler, Transport, TransportManager,
    connection_handler, message_handler, system_handler,
};

/// Gossip message types exchanged between nodes.
pub mod gossip {
    pub const AGENT_ANNOUNCEMENT: &str = "agent_announcement";
    pub const AGENT_REMOVAL: &str = "agent_removal";
    pub const HEARTBEAT: &str = "heartbeat";

    pub fn is_gossip(message_type: &str) -> bool {
        matches!(message_type, AGENT_ANNOUNCEMENT | AGENT_REMOVAL | HEARTBEAT)
    }
}

/// Remote agents are pruned after this many missed heartbeats.
const MISSED_HEARTBEATS: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Announcement {
    node_id: String,
    agent: AgentInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Removal {
    node_id: String,
    agent_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Heartbeat {
    node_id: String,
    agents: Vec<String>,
}

/// Peer id used for the outbound link to a bootstrap node.
fn bootstrap_peer(address: &str) -> PeerId {
    PeerId::from_string(format!("bootstrap-{address}"))
}

/// One node of a peer-to-peer mesh.
pub struct DecentralizedTopology {
    inner: Arc<Inner>,
}

struct Inner {
    node_id: String,
    config: NetworkConfig,
    directory: SharedDirectory,
    connected_peers: parking_lot::RwLock<HashSet<PeerId>>,
    transports: tokio::sync::Mutex<TransportManager>,
    transport: parking_lot::RwLock<Option<Arc<dyn Transport>>>,
    handlers: LocalHandlers,
    tasks: BackgroundTasks,
}

impl DecentralizedTopology {
    pub fn new(node_id: impl Into<String>, config: NetworkConfig) -> Self {
        let node_id = node_id.into();
        Self {
            inner: Arc::new(Inner {
                transports: tokio::sync::Mutex::new(TransportManager::with_defaults(&node_id)),
                node_id,
                config,
                directory: AgentDirectory::shared(),
                connected_peers: parking_lot::RwLock::new(HashSet::new()),
                transport: parking_lot::RwLock::new(None),
                handlers: LocalHandlers::new(),
                tasks: BackgroundTasks::new(),
            }),
        }
    }

    /// Peers with a live connection.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.inner.connected_peers.read().iter().cloned().collect();
        peers.sort();
        peers
    }

    /// Dial a node and join through it.
    pub async fn connect_peer(&self, address: &str) -> Result<(), NetworkError> {
        let transport = self.inner.require_transport()?;
        transport.connect(&bootstrap_peer(address), address).await
    }
}

#[async_trait]
impl NetworkTopology for DecentralizedTopology {
    fn mode(&self) -> TopologyMode {
        TopologyMode::Decentralized
    }

    fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    async fn initialize(&self) -> Result<(), NetworkError> {
        let transport = self
            .inner
            .transports
            .lock()
            .await
            .initialize_preferred(self.inner.config.transport)
            .await?;
        self.inner.install_callbacks(&transport);
        *self.inner.transport.write() = Some(Arc::clone(&transport));

        match transport.listen(&self.inner.config.listen_address()).await {
            Ok(bound) => info!("Node '{}' listening on {bound}", self.inner.node_id),
            Err(e) => {
                self.inner.transports.lock().await.shutdown_all().await;
                *self.inner.transport.write() = None;
                return Err(e);
            }
        }

        for address in &self.inner.config.bootstrap_nodes {
            match transport.connect(&bootstrap_peer(address), address).await {
                Ok(()) => info!("Node '{}' joined via {address}", self.inner.node_id),
                Err(e) => warn!("Bootstrap node {address} unreachable: {e}"),
            }
        }

        let heartbeat = self.inner.config.heartbeat_interval;
        self.inner.tasks.spawn(heartbeat_loop(
            Arc::downgrade(&self.inner),
            self.inner.tasks.subscribe(),
            heartbeat,
        ));
        self.inner.tasks.spawn(discovery_loop(
            Arc::downgrade(&self.inner),
            self.inner.tasks.subscribe(),
            self.inner.config.discovery_interval,
        ));
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), NetworkError> {
        self.inner.tasks.stop_all().await;
        self.inner.transports.lock().await.shutdown_all().await;
        *self.inner.transport.write() = None;
        self.inner.connected_peers.write().clear();
        self.inner.directory.write().clear();
        info!("Decentralized topology '{}' shut down", self.inner.node_id);
        Ok(())
    }

    async fn register_agent(&self, info: AgentInfo) -> Result<(), NetworkError> {
        let agent_id = info.agent_id.clone();
        self.inner.directory.write().register(info.clone(), None)?;
        info!("Node '{}' registered agent '{agent_id}'", self.inner.node_id);

        let announcement = Announcement {
            node_id: self.inner.node_id.clone(),
            agent: info,
        };
        self.inner
            .gossip(gossip::AGENT_ANNOUNCEMENT, serde_json::to_value(announcement)?)
            .await;
        Ok(())
    }

    async fn unregister_agent(&self, agent_id: &str) -> Result<(), NetworkError> {
        {
            let mut directory = self.inner.directory.write();
            if !directory.is_local(agent_id) {
                return Err(NetworkError::AgentNotFound(agent_id.to_string()));
            }
            directory.remove(agent_id);
        }

        let removal = Removal {
            node_id: self.inner.node_id.clone(),
            agent_id: agent_id.to_string(),
        };
        self.inner
            .gossip(gossip::AGENT_REMOVAL, serde_json::to_value(removal)?)
            .await;
        Ok(())
    }

    async fn discover_peers(&self, capabilities: &[String]) -> Vec<AgentInfo> {
        self.inner.directory.read().discover(capabilities)
    }

    async fn route_message(&self, message: &Message) -> Result<usize, NetworkError> {
        let transport = self.inner.require_transport()?;

        let Some(target) = &message.target_id else {
            let inner = &self.inner;
            return fan_out(&transport, &inner.directory, &inner.handlers, &inner.node_id, message).await;
        };

        let (local, route) = {
            let directory = self.inner.directory.read();
            (directory.is_local(target), directory.route(target).cloned())
        };
        if local {
            let origin = PeerId::from_string(&self.inner.node_id);
            self.inner.handlers.deliver(origin, message.clone()).await;
            return Ok(1);
        }

        match route {
            Some(peer) if self.inner.connected_peers.read().contains(&peer) => {
                transport.send(message).await
            }
            _ => Err(NetworkError::RouteUnavailable(target.clone())),
        }
    }

    fn attach_agent(&self, info: AgentInfo, via: PeerId) -> Result<(), NetworkError> {
        let mut directory = self.inner.directory.write();
        if directory.is_local(&info.agent_id) {
            return Err(NetworkError::DuplicateAgent(info.agent_id));
        }
        directory.upsert(info, Some(via));
        Ok(())
    }

    fn detach_agent(&self, agent_id: &str, via: &PeerId) -> Result<(), NetworkError> {
        let mut directory = self.inner.directory.write();
        if directory.route(agent_id) != Some(via) {
            return Err(NetworkError::AgentNotFound(agent_id.to_string()));
        }
        directory.remove(agent_id);
        Ok(())
    }

    fn route_of(&self, agent_id: &str) -> Option<PeerId> {
        self.inner.directory.read().route(agent_id).cloned()
    }

    fn agent_count(&self) -> usize {
        self.inner.directory.read().len()
    }

    fn on_message(&self, handler: MessageHandler) {
        self.inner.handlers.add_message(handler);
    }

    fn on_system_message(&self, handler: SystemHandler) {
        self.inner.handlers.add_system(handler);
    }

    fn on_connection_state(&self, handler: ConnectionHandler) {
        self.inner.handlers.add_connection(handler);
    }

    fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.inner.transport.read().clone()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.transport().and_then(|t| t.local_addr())
    }
}

impl Inner {
    fn require_transport(&self) -> Result<Arc<dyn Transport>, NetworkError> {
        self.transport.read().clone().ok_or(NetworkError::NotRunning)
    }

    fn install_callbacks(self: &Arc<Self>, transport: &Arc<dyn Transport>) {
        let weak = Arc::downgrade(self);
        transport.on_message(message_handler(move |peer, message| {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_inbound(peer, message).await;
                }
            }
        }));

        let weak = Arc::downgrade(self);
        transport.on_system_message(system_handler(move |peer, raw, handle| {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.handlers.deliver_system(peer, raw, handle).await;
                }
            }
        }));

        let weak = Arc::downgrade(self);
        transport.on_connection_state(connection_handler(move |peer, state| {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_state(peer, state).await;
                }
            }
        }));

        let directory = Arc::clone(&self.directory);
        transport.set_agent_resolver(Arc::new(move |agent_id: &str| {
            directory.read().route(agent_id).cloned()
        }));
    }

    /// Broadcast a gossip message to every connected peer.
    async fn gossip(&self, message_type: &str, payload: serde_json::Value) {
        let Ok(transport) = self.require_transport() else {
            return;
        };
        let message = Message::broadcast(&self.node_id, message_type, payload);
        match transport.send(&message).await {
            Ok(sent) => debug!("Gossiped {message_type} to {sent} peers"),
            Err(e) => warn!("Gossiping {message_type} failed: {e}"),
        }
    }

    /// Send announcements for every local agent over one connection.
    fn announce_to(&self, handle: &ConnectionHandle) {
        let local = self.directory.read().local_agents();
        for agent in local {
            let announcement = Announcement {
                node_id: self.node_id.clone(),
                agent,
            };
            let sent = serde_json::to_value(&announcement)
                .map(|payload| Message::broadcast(&self.node_id, gossip::AGENT_ANNOUNCEMENT, payload))
                .map_err(NetworkError::from)
                .and_then(|message| {
                    let broadcast_id = uuid::Uuid::new_v4().to_string();
                    let frame = RoutedEnvelope::broadcast_copy(&message, &broadcast_id).to_json()?;
                    handle.send_text(frame)
                });
            if let Err(e) = sent {
                warn!("Announcing '{}' to {} failed: {e}", announcement.agent.agent_id, handle.peer_id());
            }
        }
    }

    async fn handle_inbound(&self, peer: PeerId, message: Message) {
        if gossip::is_gossip(&message.message_type) {
            if let Err(e) = self.handle_gossip(&peer, &message) {
                warn!("Bad {} from {peer}: {e}", message.message_type);
            }
            return;
        }

        match &message.target_id {
            Some(target) if !self.directory.read().is_local(target) => {
                warn!(
                    "Dropping message {} for '{target}': not hosted here and multi-hop routing is not supported",
                    message.message_id
                );
            }
            _ => {
                self.handlers.deliver(peer, message).await;
            }
        }
    }

    fn handle_gossip(&self, peer: &PeerId, message: &Message) -> Result<(), NetworkError> {
        match message.message_type.as_str() {
            gossip::AGENT_ANNOUNCEMENT => {
                let Announcement { node_id, mut agent } =
                    serde_json::from_value(message.payload.clone())?;
                let mut directory = self.directory.write();
                if directory.is_local(&agent.agent_id) {
                    debug!("Ignoring announcement of local agent '{}' from {node_id}", agent.agent_id);
                    return Ok(());
                }
                agent.last_seen = Utc::now();
                debug!("Learned agent '{}' from node '{node_id}'", agent.agent_id);
                directory.upsert(agent, Some(peer.clone()));
            }
            gossip::AGENT_REMOVAL => {
                let Removal { node_id, agent_id } = serde_json::from_value(message.payload.clone())?;
                let mut directory = self.directory.write();
                if directory.route(&agent_id) == Some(peer) {
                    directory.remove(&agent_id);
                    debug!("Node '{node_id}' removed agent '{agent_id}'");
                }
            }
            gossip::HEARTBEAT => {
                let Heartbeat { agents, .. } = serde_json::from_value(message.payload.clone())?;
                let mut directory = self.directory.write();
                for agent_id in agents {
                    if directory.route(&agent_id) == Some(peer) {
                        directory.touch(&agent_id);
                    }
                }
            }
            other => {
                return Err(NetworkError::Protocol(format!("Unknown gossip type '{other}'")));
            }
        }
        Ok(())
    }

    async fn handle_state(&self, peer: PeerId, state: ConnectionState) {
        match state {
            ConnectionState::Connected => {
                self.connected_peers.write().insert(peer.clone());
                if let Ok(transport) = self.require_transport() {
                    if let Some(handle) = transport.connection(&peer).await {
                        self.announce_to(&handle);
                    }
                }
            }
            ConnectionState::Disconnected | ConnectionState::Failed => {
                self.connected_peers.write().remove(&peer);
                let dropped = self.directory.write().remove_via(&peer);
                if !dropped.is_empty() {
                    info!("Peer {peer} gone; dropped {} agents", dropped.len());
                }
            }
            ConnectionState::Connecting => {}
        }
        self.handlers.notify(peer, state).await;
    }

    async fn send_heartbeat(&self) {
        let agents: Vec<String> = self
            .directory
            .read()
            .local_agents()
            .into_iter()
            .map(|a| a.agent_id)
            .collect();
        let heartbeat = Heartbeat {
            node_id: self.node_id.clone(),
            agents,
        };
        match serde_json::to_value(heartbeat) {
            Ok(payload) => self.gossip(gossip::HEARTBEAT, payload).await,
            Err(e) => warn!("Encoding heartbeat failed: {e}"),
        }
    }

    /// Prune silent remote agents and re-dial lost bootstrap nodes.
    async fn discover(&self) {
        let window = self.config.heartbeat_interval * MISSED_HEARTBEATS;
        let cutoff = match chrono::Duration::from_std(window) {
            Ok(window) => Utc::now() - window,
            Err(e) => {
                warn!("Heartbeat window out of range: {e}");
                return;
            }
        };
        let pruned = self.directory.write().prune_stale(cutoff);
        if !pruned.is_empty() {
            info!("Pruned silent agents {pruned:?}");
        }

        let Ok(transport) = self.require_transport() else {
            return;
        };
        for address in &self.config.bootstrap_nodes {
            let peer = bootstrap_peer(address);
            if self.connected_peers.read().contains(&peer) {
                continue;
            }
            match transport.connect(&peer, address).await {
                Ok(()) => info!("Reconnected to bootstrap node {address}"),
                Err(e) => debug!("Bootstrap node {address} still unreachable: {e}"),
            }
        }
    }
}

async fn heartbeat_loop(weak: Weak<Inner>, mut shutdown: broadcast::Receiver<()>, interval: Duration) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let Some(inner) = weak.upgrade() else { break };
                inner.send_heartbeat().await;
            }
            _ = shutdown.recv() => {
                debug!("Heartbeat loop stopping");
                break;
            }
        }
    }
}

async fn discovery_loop(weak: Weak<Inner>, mut shutdown: broadcast::Receiver<()>, interval: Duration) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let Some(inner) = weak.upgrade() else { break };
                inner.discover().await;
            }
            _ = shutdown.recv() => {
                debug!("Discovery loop stopping");
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
