//! Centralized topology — one coordinator, many clients.
//!
//! The coordinator (`server_mode = true`) listens and owns the
//! authoritative agent registry. It relays every message between clients
//! and refuses frames whose sender is registered on another connection.
//! Clients dial the coordinator, register through the `register` frame and
//! keep a best-effort cache of the registry, refreshed every
//! `discovery_interval`.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::agent::{AgentDirectory, AgentInfo, SharedDirectory};
use crate::config::{NetworkConfig, TopologyMode};
use crate::connection::ConnectionState;
use crate::error::NetworkError;
use crate::identity::{AgentCertificate, PeerId};
use crate::message::Message;
use crate::system::{
    ControlFrame, RegisterRequest, RegisterResponse, RequestTracker, SystemCommand, SystemRequest,
    SystemResponse,
};
use crate::topology::{BackgroundTasks, LocalHandlers, NetworkTopology, fan_out};
use crate::transport::{
    ConnectionHandler, MessageHandler, SystemHandler, Transport, TransportManager,
    connection_handler, message_handler, system_handler,
};

/// Peer id a client uses for its link to the coordinator.
pub const COORDINATOR_PEER: &str = "coordinator";

/// The [`PeerId`] of a client's coordinator link.
pub fn coordinator_peer() -> PeerId {
    PeerId::from_string(COORDINATOR_PEER)
}

/// Coordinator or client side of a hub-and-spoke network, selected by
/// `NetworkConfig::server_mode`.
pub struct CentralizedTopology {
    inner: Arc<Inner>,
}

struct Inner {
    node_id: String,
    config: NetworkConfig,
    directory: SharedDirectory,
    transports: tokio::sync::Mutex<TransportManager>,
    transport: parking_lot::RwLock<Option<Arc<dyn Transport>>>,
    handlers: LocalHandlers,
    tracker: RequestTracker,
    tasks: BackgroundTasks,
}

impl CentralizedTopology {
    pub fn new(node_id: impl Into<String>, config: NetworkConfig) -> Self {
        let node_id = node_id.into();
        Self {
            inner: Arc::new(Inner {
                transports: tokio::sync::Mutex::new(TransportManager::with_defaults(&node_id)),
                node_id,
                config,
                directory: AgentDirectory::shared(),
                transport: parking_lot::RwLock::new(None),
                handlers: LocalHandlers::new(),
                tracker: RequestTracker::new(),
                tasks: BackgroundTasks::new(),
            }),
        }
    }

    /// Whether this node is the coordinator.
    pub fn is_server(&self) -> bool {
        self.inner.config.server_mode
    }

    /// Register an agent, presenting a certificate or asking the
    /// coordinator to evict a live registration of the same id.
    ///
    /// On the coordinator this is a plain local registration.
    pub async fn register_with(
        &self,
        info: AgentInfo,
        certificate: Option<AgentCertificate>,
        force_reconnect: bool,
    ) -> Result<RegisterResponse, NetworkError> {
        if self.is_server() {
            let agent_id = info.agent_id.clone();
            self.inner.directory.write().register(info, None)?;
            info!("Coordinator registered local agent '{agent_id}'");
            return Ok(RegisterResponse {
                success: true,
                network_name: self.inner.node_id.clone(),
                error: None,
                request_id: None,
            });
        }
        self.inner.register_remote(info, certificate, force_reconnect).await
    }

    /// Send a control-plane request to the coordinator and wait for its
    /// reply. A reply with `success: false` is still returned as `Ok`.
    pub async fn system_request(
        &self,
        command: SystemCommand,
        params: Map<String, Value>,
    ) -> Result<SystemResponse, NetworkError> {
        self.inner.system_request(command, params).await
    }

    /// Re-read the coordinator's registry into the local cache now.
    pub async fn refresh_directory(&self) -> Result<usize, NetworkError> {
        self.inner.refresh_directory().await
    }
}

#[async_trait]
impl NetworkTopology for CentralizedTopology {
    fn mode(&self) -> TopologyMode {
        TopologyMode::Centralized
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

        let address = self.inner.config.listen_address();
        let started = if self.is_server() {
            transport.listen(&address).await.map(|bound| {
                info!("Coordinator '{}' listening on {bound}", self.inner.node_id);
            })
        } else {
            transport.connect(&coordinator_peer(), &address).await.map(|()| {
                info!("Client '{}' connected to coordinator at {address}", self.inner.node_id);
            })
        };

        if let Err(e) = started {
            self.inner.transports.lock().await.shutdown_all().await;
            *self.inner.transport.write() = None;
            return Err(e);
        }

        if !self.is_server() {
            let weak = Arc::downgrade(&self.inner);
            let shutdown = self.inner.tasks.subscribe();
            let interval = self.inner.config.discovery_interval;
            self.inner.tasks.spawn(discovery_loop(weak, shutdown, interval));
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), NetworkError> {
        self.inner.tasks.stop_all().await;
        self.inner.tracker.cancel_all();
        self.inner.transports.lock().await.shutdown_all().await;
        *self.inner.transport.write() = None;
        self.inner.directory.write().clear();
        info!("Centralized topology '{}' shut down", self.inner.node_id);
        Ok(())
    }

    async fn register_agent(&self, info: AgentInfo) -> Result<(), NetworkError> {
        self.register_with(info, None, false).await.map(|_| ())
    }

    /// Drop a local agent. A client also asks the coordinator to forget it,
    /// so the id is free for the rest of the network.
    async fn unregister_agent(&self, agent_id: &str) -> Result<(), NetworkError> {
        {
            let mut directory = self.inner.directory.write();
            if !directory.is_local(agent_id) {
                return Err(NetworkError::AgentNotFound(agent_id.to_string()));
            }
            directory.remove(agent_id);
        }
        debug!("Unregistered local agent '{agent_id}'");

        if !self.is_server() {
            let mut params = Map::new();
            params.insert("agent_id".into(), Value::String(agent_id.to_string()));
            self.inner
                .system_request(SystemCommand::UnregisterAgent, params)
                .await?
                .into_result()?;
        }
        Ok(())
    }

    async fn discover_peers(&self, capabilities: &[String]) -> Vec<AgentInfo> {
        self.inner.directory.read().discover(capabilities)
    }

    async fn route_message(&self, message: &Message) -> Result<usize, NetworkError> {
        let transport = self.inner.require_transport()?;

        if !self.inner.directory.read().is_local(&message.sender_id) {
            return Err(NetworkError::AgentNotFound(message.sender_id.clone()));
        }

        let Some(target) = &message.target_id else {
            let inner = &self.inner;
            return fan_out(&transport, &inner.directory, &inner.handlers, &inner.node_id, message).await;
        };

        if self.inner.directory.read().is_local(target) {
            let origin = PeerId::from_string(&self.inner.node_id);
            self.inner.handlers.deliver(origin, message.clone()).await;
            return Ok(1);
        }

        if self.is_server() {
            if self.inner.directory.read().route(target).is_none() {
                return Err(NetworkError::AgentNotFound(target.clone()));
            }
        } else if !self.inner.directory.read().contains(target) {
            // Cache miss: the agent may have joined since the last refresh.
            if let Err(e) = self.inner.refresh_directory().await {
                debug!("Directory refresh before sending to '{target}' failed: {e}");
            }
            if !self.inner.directory.read().contains(target) {
                return Err(NetworkError::AgentNotFound(target.clone()));
            }
        }
        transport.send(message).await
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
        info!("Agent '{agent_id}' unregistered by {via}");
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
    fn is_server(&self) -> bool {
        self.config.server_mode
    }

    fn require_transport(&self) -> Result<Arc<dyn Transport>, NetworkError> {
        self.transport.read().clone().ok_or(NetworkError::NotRunning)
    }

    /// Wire the transport callbacks back to this topology. The callbacks
    /// hold a weak reference so the transport never keeps us alive.
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
                    if !inner.is_server() {
                        inner.resolve_reply(&raw);
                    }
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
        if self.is_server() {
            transport.set_agent_resolver(Arc::new(move |agent_id: &str| {
                directory.read().route(agent_id).cloned()
            }));
        } else {
            transport.set_agent_resolver(Arc::new(move |agent_id: &str| {
                if directory.read().is_local(agent_id) {
                    None
                } else {
                    Some(coordinator_peer())
                }
            }));
        }
    }

    async fn handle_inbound(&self, peer: PeerId, message: Message) {
        if self.is_server() {
            self.relay(peer, message).await;
            return;
        }

        if let Some(target) = &message.target_id {
            if !self.directory.read().is_local(target) {
                debug!("Ignoring message {} for non-local agent '{target}'", message.message_id);
                return;
            }
        }
        // Handlers run on the read loop; a reply must not wait on a refresh.
        {
            let mut directory = self.directory.write();
            if !directory.contains(&message.sender_id) {
                directory.upsert(AgentInfo::new(message.sender_id.clone()), Some(coordinator_peer()));
            }
        }
        self.handlers.deliver(peer, message).await;
    }

    /// Coordinator side: check the sender, then deliver locally or relay.
    async fn relay(&self, peer: PeerId, message: Message) {
        let bound = self.directory.read().route(&message.sender_id).cloned();
        if bound.as_ref() != Some(&peer) {
            warn!(
                "Dropping message {} from {peer}: sender '{}' is not registered on this connection",
                message.message_id, message.sender_id
            );
            return;
        }
        self.directory.write().touch(&message.sender_id);

        let Ok(transport) = self.require_transport() else {
            return;
        };

        match message.target_id.clone() {
            None => {
                if self.handlers.deliver(peer, message.clone()).await {
                    match transport.send(&message).await {
                        Ok(sent) => debug!("Relayed broadcast from '{}' to {sent} peers", message.sender_id),
                        Err(e) => warn!("Relaying broadcast from '{}' failed: {e}", message.sender_id),
                    }
                }
            }
            Some(target) => {
                let (routed, local) = {
                    let directory = self.directory.read();
                    (directory.route(&target).is_some(), directory.is_local(&target))
                };
                if routed {
                    if let Err(e) = transport.send(&message).await {
                        warn!("Relaying {} to '{target}' failed: {e}", message.message_id);
                    }
                } else if local {
                    self.handlers.deliver(peer, message).await;
                } else {
                    warn!("Dropping message {} for unknown agent '{target}'", message.message_id);
                }
            }
        }
    }

    async fn handle_state(&self, peer: PeerId, state: ConnectionState) {
        if state.is_terminal() {
            let removed = self.directory.write().remove_via(&peer);
            if !removed.is_empty() {
                let ids: Vec<&str> = removed.iter().map(|a| a.agent_id.as_str()).collect();
                info!("Connection {peer} {state:?}; dropped agents {ids:?}");
            }
            if !self.is_server() && peer == coordinator_peer() {
                warn!("Lost connection to coordinator");
            }
        }
        self.handlers.notify(peer, state).await;
    }

    fn resolve_reply(&self, raw: &Value) {
        match ControlFrame::from_value(raw.clone()) {
            Ok(frame @ (ControlFrame::RegisterResponse(_) | ControlFrame::SystemResponse(_))) => {
                if !self.tracker.resolve(frame) {
                    debug!("Unsolicited control reply on '{}'", self.node_id);
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Dropping control frame: {e}"),
        }
    }

    /// Send `frame` to the coordinator and wait for the matching reply.
    async fn request(&self, build: impl FnOnce(String) -> ControlFrame) -> Result<ControlFrame, NetworkError> {
        if self.is_server() {
            return Err(NetworkError::Protocol(
                "the coordinator does not send control requests".into(),
            ));
        }
        let transport = self.require_transport()?;
        let handle = transport
            .connection(&coordinator_peer())
            .await
            .ok_or_else(|| NetworkError::PeerNotFound(COORDINATOR_PEER.to_string()))?;

        let (request_id, rx) = self.tracker.begin();
        if let Err(e) = handle.send_json(&build(request_id.clone())) {
            self.tracker.cancel(&request_id);
            return Err(e);
        }
        self.tracker.wait(&request_id, rx).await
    }

    async fn register_remote(
        &self,
        info: AgentInfo,
        certificate: Option<AgentCertificate>,
        force_reconnect: bool,
    ) -> Result<RegisterResponse, NetworkError> {
        if self.directory.read().is_local(&info.agent_id) {
            return Err(NetworkError::DuplicateAgent(info.agent_id));
        }

        let mut metadata = info.metadata.clone();
        metadata.insert("capabilities".into(), serde_json::json!(info.capabilities));
        let agent_id = info.agent_id.clone();

        let reply = self
            .request(|request_id| {
                ControlFrame::Register(RegisterRequest {
                    agent_id: agent_id.clone(),
                    metadata,
                    certificate,
                    force_reconnect,
                    request_id: Some(request_id),
                })
            })
            .await?;

        match reply {
            ControlFrame::RegisterResponse(response) if response.success => {
                self.directory.write().upsert(info, None);
                info!("Registered '{agent_id}' with network '{}'", response.network_name);
                Ok(response)
            }
            ControlFrame::RegisterResponse(response) => {
                let reason = response.error.unwrap_or_else(|| "no reason given".into());
                warn!("Registration of '{agent_id}' rejected: {reason}");
                Err(NetworkError::RegistrationRejected(reason))
            }
            other => Err(NetworkError::Protocol(format!(
                "Unexpected reply to register: {other:?}"
            ))),
        }
    }

    async fn system_request(
        &self,
        command: SystemCommand,
        params: Map<String, Value>,
    ) -> Result<SystemResponse, NetworkError> {
        let reply = self
            .request(|request_id| {
                let mut request = SystemRequest::new(command, params);
                request.request_id = Some(request_id);
                ControlFrame::SystemRequest(request)
            })
            .await?;
        match reply {
            ControlFrame::SystemResponse(response) => Ok(response),
            other => Err(NetworkError::Protocol(format!(
                "Unexpected reply to {command}: {other:?}"
            ))),
        }
    }

    /// Replace the cached remote agents with the coordinator's list.
    async fn refresh_directory(&self) -> Result<usize, NetworkError> {
        let response = self
            .system_request(SystemCommand::ListAgents, Map::new())
            .await?
            .into_result()?;
        let agents: Vec<AgentInfo> = serde_json::from_value(
            response.data.get("agents").cloned().unwrap_or(Value::Array(Vec::new())),
        )?;

        let coordinator = coordinator_peer();
        let mut directory = self.directory.write();
        directory.remove_via(&coordinator);
        let mut cached = 0;
        for agent in agents {
            if !directory.contains(&agent.agent_id) {
                directory.upsert(agent, Some(coordinator.clone()));
                cached += 1;
            }
        }
        debug!("Cached {cached} remote agents from coordinator");
        Ok(cached)
    }
}

async fn discovery_loop(weak: Weak<Inner>, mut shutdown: broadcast::Receiver<()>, interval: Duration) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let Some(inner) = weak.upgrade() else { break };
                if let Err(e) = inner.refresh_directory().await {
                    warn!("Directory refresh for '{}' failed: {e}", inner.node_id);
                }
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
