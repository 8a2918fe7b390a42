//! AgentNetwork — the node that hosts a network and serves its control plane.
//!
//! [`AgentNetwork`] owns a topology and answers every control frame that
//! reaches it:
//! - `register` frames and the `register_agent` command
//! - agent and mod listings
//! - ping, identity claims and certificate checks
//! - network info
//!
//! A registration whose `agent_id` is already held by a live connection is
//! refused unless it carries a valid certificate for that id or sets
//! `force_reconnect`; then the old connection is closed first. An entry
//! whose connection is gone is simply replaced, as is a re-registration from
//! the same connection.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::agent::AgentInfo;
use crate::config::{NetworkConfig, TopologyMode};
use crate::connection::ConnectionHandle;
use crate::error::NetworkError;
use crate::identity::{AgentCertificate, IdentityManager, PeerId};
use crate::message::Message;
use crate::mods::{ModInfo, ModManifest, ModRegistry};
use crate::system::{
    CommandRegistry, ControlFrame, RegisterRequest, RegisterResponse, SystemCommand,
    SystemRequest, SystemResponse, command_handler,
};
use crate::topology::{NetworkTopology, create_topology};
use crate::transport::{MessageHandler, TransportType, system_handler};

/// Snapshot returned by `get_network_info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub network_name: String,
    pub node_id: String,
    pub mode: TopologyMode,
    pub listen_address: String,
    pub transport: TransportType,
    pub agent_count: usize,
    pub mods: Vec<String>,
    pub uptime_seconds: i64,
}

/// A hosted agent network.
pub struct AgentNetwork {
    state: Arc<NetworkState>,
    topology: Arc<dyn NetworkTopology>,
    running: bool,
}

struct NetworkState {
    name: String,
    config: NetworkConfig,
    topology: Weak<dyn NetworkTopology>,
    identity: parking_lot::Mutex<IdentityManager>,
    mods: parking_lot::RwLock<ModRegistry>,
    started_at: DateTime<Utc>,
}

impl AgentNetwork {
    /// Create a network named `name`. The name doubles as the node id.
    pub fn new(name: impl Into<String>, config: NetworkConfig) -> Result<Self, NetworkError> {
        let name = name.into();
        let topology = create_topology(name.clone(), config.clone())?;
        let state = Arc::new(NetworkState {
            identity: parking_lot::Mutex::new(IdentityManager::new(name.clone())),
            name,
            config,
            topology: Arc::downgrade(&topology),
            mods: parking_lot::RwLock::new(ModRegistry::new()),
            started_at: Utc::now(),
        });

        let commands = Arc::new(build_commands(&state));
        let control_state = Arc::clone(&state);
        topology.on_system_message(system_handler(move |peer, raw, handle| {
            let commands = Arc::clone(&commands);
            let state = Arc::clone(&control_state);
            async move {
                match ControlFrame::from_value(raw) {
                    Ok(ControlFrame::Register(request)) => state.serve_register(peer, request, handle).await,
                    Ok(ControlFrame::SystemRequest(request)) => commands.serve(request, handle).await,
                    Ok(other) => debug!("Ignoring control frame from {peer}: {other:?}"),
                    Err(e) => warn!("Dropping control frame from {peer}: {e}"),
                }
            }
        }));

        Ok(Self {
            state,
            topology,
            running: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.state.config
    }

    /// The topology this network runs on.
    pub fn topology(&self) -> Arc<dyn NetworkTopology> {
        Arc::clone(&self.topology)
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Address the network is listening on, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.topology.local_addr()
    }

    /// Start listening (or dialing, for a client-mode topology).
    pub async fn start(&mut self) -> Result<(), NetworkError> {
        if self.running {
            return Ok(());
        }
        self.topology.initialize().await?;
        self.running = true;
        info!("Network '{}' started ({})", self.state.name, self.state.config.mode);
        Ok(())
    }

    /// Stop background tasks and close every connection. Registered
    /// agents are forgotten; stopping twice is a no-op.
    pub async fn stop(&mut self) -> Result<(), NetworkError> {
        if !self.running {
            return Ok(());
        }
        self.running = false;
        self.topology.shutdown().await?;
        info!("Network '{}' stopped", self.state.name);
        Ok(())
    }

    /// Advertise a mod through `list_mods`.
    pub fn register_mod(&self, info: ModInfo) {
        self.state.mods.write().register_mod(info);
    }

    /// Attach a manifest, overriding the fields derived from the mod info.
    pub fn register_manifest(&self, manifest: ModManifest) {
        self.state.mods.write().register_manifest(manifest);
    }

    /// Host an agent on this node.
    pub async fn register_agent(&self, info: AgentInfo) -> Result<(), NetworkError> {
        self.topology.register_agent(info).await
    }

    /// Remove an agent hosted on this node.
    pub async fn unregister_agent(&self, agent_id: &str) -> Result<(), NetworkError> {
        self.topology.unregister_agent(agent_id).await
    }

    /// Known agents holding every capability in `capabilities`. An empty
    /// filter lists them all.
    pub async fn discover_agents(&self, capabilities: &[String]) -> Vec<AgentInfo> {
        self.topology.discover_peers(capabilities).await
    }

    /// Route a message from one of this node's agents.
    pub async fn send_message(&self, message: &Message) -> Result<usize, NetworkError> {
        self.topology.route_message(message).await
    }

    /// Receive messages addressed to this node's agents.
    pub fn on_message(&self, handler: MessageHandler) {
        self.topology.on_message(handler);
    }

    /// Issue a certificate for `agent_id` directly.
    pub fn claim_agent_id(&self, agent_id: &str, force: bool) -> Result<AgentCertificate, NetworkError> {
        self.state.identity.lock().claim_agent_id(agent_id, force)
    }

    /// Snapshot served to `get_network_info`.
    pub fn network_info(&self) -> NetworkInfo {
        self.state.network_info()
    }
}

// ---------------------------------------------------------------------------
// Control plane
// ---------------------------------------------------------------------------

impl NetworkState {
    fn topology(&self) -> Result<Arc<dyn NetworkTopology>, NetworkError> {
        self.topology.upgrade().ok_or(NetworkError::NotRunning)
    }

    fn network_info(&self) -> NetworkInfo {
        let topology = self.topology.upgrade();
        NetworkInfo {
            network_name: self.name.clone(),
            node_id: topology
                .as_ref()
                .map(|t| t.node_id().to_string())
                .unwrap_or_else(|| self.name.clone()),
            mode: self.config.mode,
            listen_address: topology
                .as_ref()
                .and_then(|t| t.local_addr())
                .map(|a| a.to_string())
                .unwrap_or_else(|| self.config.listen_address()),
            transport: topology
                .as_ref()
                .and_then(|t| t.transport())
                .map(|t| t.transport_type())
                .unwrap_or(self.config.transport),
            agent_count: topology.as_ref().map(|t| t.agent_count()).unwrap_or(0),
            mods: self.mods.read().names(),
            uptime_seconds: (Utc::now() - self.started_at).num_seconds(),
        }
    }

    /// Admit `request` as an agent reached through `peer`.
    async fn admit(&self, peer: &PeerId, request: RegisterRequest) -> Result<(), NetworkError> {
        let agent_id = request.agent_id.trim();
        if agent_id.is_empty() {
            return Err(NetworkError::RegistrationRejected("agent_id is required".into()));
        }
        let topology = self.topology()?;

        if let Some(old) = topology.route_of(agent_id).filter(|old| old != peer) {
            let transport = topology.transport();
            let live = match &transport {
                Some(t) => t.connection(&old).await.is_some(),
                None => false,
            };

            if live {
                let certified = request
                    .certificate
                    .as_ref()
                    .is_some_and(|cert| self.identity.lock().validate_for(cert, agent_id));
                if !certified && !request.force_reconnect {
                    return Err(NetworkError::RegistrationRejected(format!(
                        "Agent '{agent_id}' is already connected"
                    )));
                }

                info!(
                    "Replacing connection {old} for '{agent_id}' ({})",
                    if certified { "certificate" } else { "force_reconnect" }
                );
                if let Some(t) = transport {
                    if let Err(e) = t.disconnect(&old).await {
                        warn!("Closing old connection {old} failed: {e}");
                    }
                }
            } else {
                debug!("Replacing stale registration of '{agent_id}'");
            }
        }

        let info = AgentInfo::from_registration(agent_id, request.metadata);
        topology.attach_agent(info, peer.clone())?;
        info!("Agent '{agent_id}' registered via {peer}");
        Ok(())
    }

    async fn serve_register(&self, peer: PeerId, request: RegisterRequest, handle: ConnectionHandle) {
        let request_id = request.request_id.clone();
        let agent_id = request.agent_id.clone();
        let result = self.admit(&peer, request).await;
        if let Err(e) = &result {
            warn!("Registration of '{agent_id}' from {peer} rejected: {e}");
        }

        let response = ControlFrame::RegisterResponse(RegisterResponse {
            success: result.is_ok(),
            network_name: self.name.clone(),
            error: result.err().map(|e| e.to_string()),
            request_id,
        });
        if let Err(e) = handle.send_json(&response) {
            warn!("Could not answer registration from {peer}: {e}");
        }
    }

    /// Forget an agent on behalf of the connection that registered it.
    fn unregister_agent(
        &self,
        peer: &PeerId,
        request: &SystemRequest,
    ) -> Result<Map<String, Value>, NetworkError> {
        let agent_id = request
            .param_str("agent_id")
            .ok_or_else(|| NetworkError::Protocol("agent_id is required".into()))?;
        self.topology()?.detach_agent(agent_id, peer)?;
        info!("Agent '{agent_id}' left via {peer}");
        Ok(data([("agent_id", Value::from(agent_id))]))
    }

    async fn list_agents(&self, request: &SystemRequest) -> Result<Map<String, Value>, NetworkError> {
        let capabilities: Vec<String> = match request.params.get("capabilities") {
            Some(value) => serde_json::from_value(value.clone())?,
            None => Vec::new(),
        };
        let agents = self.topology()?.discover_peers(&capabilities).await;
        Ok(data([("agents", serde_json::to_value(agents)?)]))
    }

    fn list_mods(&self) -> Result<Map<String, Value>, NetworkError> {
        let mods = self.mods.read().list_mods();
        Ok(data([("mods", serde_json::to_value(mods)?)]))
    }

    fn get_mod_manifest(&self, request: &SystemRequest) -> Result<Map<String, Value>, NetworkError> {
        let name = request
            .param_str("mod_name")
            .ok_or_else(|| NetworkError::Protocol("mod_name is required".into()))?;
        let manifest = self.mods.read().get_mod_manifest(name)?;
        Ok(data([("manifest", serde_json::to_value(manifest)?)]))
    }

    async fn ping(&self, request: &SystemRequest) -> Result<Map<String, Value>, NetworkError> {
        let timestamp = request
            .params
            .get("timestamp")
            .cloned()
            .unwrap_or_else(|| Value::from(Utc::now().timestamp_millis()));
        let mut reply = data([("timestamp", timestamp)]);
        if let Some(agent_id) = request.param_str("agent_id") {
            let known = self
                .topology()?
                .discover_peers(&[])
                .await
                .iter()
                .any(|agent| agent.agent_id == agent_id);
            reply.insert("agent_id".into(), agent_id.into());
            reply.insert("reachable".into(), known.into());
        }
        Ok(reply)
    }

    fn claim_agent_id(&self, request: &SystemRequest) -> Result<Map<String, Value>, NetworkError> {
        let agent_id = request
            .param_str("agent_id")
            .ok_or_else(|| NetworkError::Protocol("agent_id is required".into()))?;
        let force = request
            .params
            .get("force")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let certificate = self.identity.lock().claim_agent_id(agent_id, force)?;
        Ok(data([("certificate", serde_json::to_value(certificate)?)]))
    }

    fn validate_certificate(&self, request: &SystemRequest) -> Result<Map<String, Value>, NetworkError> {
        let raw = request
            .params
            .get("certificate")
            .cloned()
            .ok_or_else(|| NetworkError::Protocol("certificate is required".into()))?;
        let certificate: AgentCertificate = serde_json::from_value(raw)?;
        let valid = self.identity.lock().validate(&certificate);
        Ok(data([
            ("valid", Value::from(valid)),
            ("agent_id", Value::from(certificate.agent_id)),
        ]))
    }
}

fn data<const N: usize>(entries: [(&str, Value); N]) -> Map<String, Value> {
    entries
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

fn reply(command: SystemCommand, result: Result<Map<String, Value>, NetworkError>) -> SystemResponse {
    match result {
        Ok(data) => SystemResponse::ok(command.as_str(), data),
        Err(e) => SystemResponse::failure(command.as_str(), e.to_string()),
    }
}

/// The command table every network serves.
fn build_commands(state: &Arc<NetworkState>) -> CommandRegistry {
    let mut registry = CommandRegistry::new();

    let s = Arc::clone(state);
    registry.register(
        SystemCommand::RegisterAgent,
        command_handler(move |request: SystemRequest, handle: ConnectionHandle| {
            let state = Arc::clone(&s);
            async move {
                let parsed: Result<RegisterRequest, NetworkError> =
                    serde_json::from_value(Value::Object(request.params)).map_err(NetworkError::from);
                let result = match parsed {
                    Ok(register) => state.admit(handle.peer_id(), register).await.map(|()| {
                        data([("network_name", Value::from(state.name.clone()))])
                    }),
                    Err(e) => Err(e),
                };
                reply(SystemCommand::RegisterAgent, result)
            }
        }),
    );

    let s = Arc::clone(state);
    registry.register(
        SystemCommand::UnregisterAgent,
        command_handler(move |request: SystemRequest, handle: ConnectionHandle| {
            let state = Arc::clone(&s);
            async move {
                reply(SystemCommand::UnregisterAgent, state.unregister_agent(handle.peer_id(), &request))
            }
        }),
    );

    let s = Arc::clone(state);
    registry.register(
        SystemCommand::ListAgents,
        command_handler(move |request: SystemRequest, _handle| {
            let state = Arc::clone(&s);
            async move { reply(SystemCommand::ListAgents, state.list_agents(&request).await) }
        }),
    );

    let s = Arc::clone(state);
    registry.register(
        SystemCommand::ListMods,
        command_handler(move |_request, _handle| {
            let state = Arc::clone(&s);
            async move { reply(SystemCommand::ListMods, state.list_mods()) }
        }),
    );

    let s = Arc::clone(state);
    registry.register(
        SystemCommand::GetModManifest,
        command_handler(move |request: SystemRequest, _handle| {
            let state = Arc::clone(&s);
            async move { reply(SystemCommand::GetModManifest, state.get_mod_manifest(&request)) }
        }),
    );

    let s = Arc::clone(state);
    registry.register(
        SystemCommand::PingAgent,
        command_handler(move |request: SystemRequest, _handle| {
            let state = Arc::clone(&s);
            async move { reply(SystemCommand::PingAgent, state.ping(&request).await) }
        }),
    );

    let s = Arc::clone(state);
    registry.register(
        SystemCommand::ClaimAgentId,
        command_handler(move |request: SystemRequest, _handle| {
            let state = Arc::clone(&s);
            async move { reply(SystemCommand::ClaimAgentId, state.claim_agent_id(&request)) }
        }),
    );

    let s = Arc::clone(state);
    registry.register(
        SystemCommand::ValidateCertificate,
        command_handler(move |request: SystemRequest, _handle| {
            let state = Arc::clone(&s);
            async move {
                reply(SystemCommand::ValidateCertificate, state.validate_certificate(&request))
            }
        }),
    );

    let s = Arc::clone(state);
    registry.register(
        SystemCommand::GetNetworkInfo,
        command_handler(move |_request, _handle| {
            let state = Arc::clone(&s);
            async move {
                let result = serde_json::to_value(state.network_info())
                    .map_err(NetworkError::from)
                    .map(|info| match info {
                        Value::Object(map) => map,
                        _ => Map::new(),
                    });
                reply(SystemCommand::GetNetworkInfo, result)
            }
        }),
    );

    registry
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
