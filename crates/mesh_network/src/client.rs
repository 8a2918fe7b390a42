//! AgentClient — a single agent attached to a coordinator.
//!
//! The client owns a client-mode [`CentralizedTopology`], dispatches
//! incoming messages through a [`MessageRouter`] and system responses
//! through a [`ResponseRouter`], and wraps every control-plane command in a
//! typed request method.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::agent::AgentInfo;
use crate::config::NetworkConfig;
use crate::error::NetworkError;
use crate::identity::AgentCertificate;
use crate::message::Message;
use crate::mods::ModManifest;
use crate::network::NetworkInfo;
use crate::routing::{MessageRouter, ResponseHandler, ResponseRouter, RouteHandler};
use crate::system::{ControlFrame, RegisterResponse, SystemCommand, SystemResponse};
use crate::topology::NetworkTopology;
use crate::topology::centralized::CentralizedTopology;
use crate::transport::{message_handler, system_handler};

/// One agent's view of a centralized network.
///
/// ```no_run
/// # async fn run() -> Result<(), mesh_network::NetworkError> {
/// let mut client = mesh_network::AgentClient::new("worker-1");
/// client.connect_to_server("127.0.0.1", 8570).await?;
/// client.register(vec!["search".into()], Default::default()).await?;
/// client.send_direct_message("planner", "status", serde_json::json!({"ready": true})).await?;
/// # Ok(())
/// # }
/// ```
pub struct AgentClient {
    agent_id: String,
    topology: Option<Arc<CentralizedTopology>>,
    router: Arc<MessageRouter>,
    responses: Arc<ResponseRouter>,
    network_name: Option<String>,
}

impl AgentClient {
    /// A disconnected client for `agent_id`.
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            topology: None,
            router: Arc::new(MessageRouter::new()),
            responses: Arc::new(ResponseRouter::new()),
            network_name: None,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Name of the network, once registered.
    pub fn network_name(&self) -> Option<&str> {
        self.network_name.as_deref()
    }

    /// Whether a coordinator link is open.
    pub fn is_connected(&self) -> bool {
        self.topology.is_some()
    }

    /// Dial the coordinator at `host:port`. Reconnecting drops the
    /// previous link first.
    pub async fn connect_to_server(&mut self, host: &str, port: u16) -> Result<(), NetworkError> {
        self.disconnect().await?;

        let config = NetworkConfig::client(host, port);
        let topology = Arc::new(CentralizedTopology::new(self.agent_id.clone(), config));

        let router = Arc::clone(&self.router);
        topology.on_message(message_handler(move |_peer, message| {
            let router = Arc::clone(&router);
            async move {
                router.dispatch(message).await;
            }
        }));

        let responses = Arc::clone(&self.responses);
        topology.on_system_message(system_handler(move |_peer, raw, _handle| {
            let responses = Arc::clone(&responses);
            async move {
                match ControlFrame::from_value(raw) {
                    Ok(ControlFrame::SystemResponse(response)) => {
                        responses.dispatch(response).await;
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Dropping control frame: {e}"),
                }
            }
        }));

        topology.initialize().await?;
        info!("Agent '{}' connected to {host}:{port}", self.agent_id);
        self.topology = Some(topology);
        Ok(())
    }

    /// Close the coordinator link. The coordinator drops every agent
    /// registered over it. Disconnecting twice is a no-op.
    pub async fn disconnect(&mut self) -> Result<(), NetworkError> {
        if let Some(topology) = self.topology.take() {
            topology.shutdown().await?;
            self.network_name = None;
            info!("Agent '{}' disconnected", self.agent_id);
        }
        Ok(())
    }

    fn topology(&self) -> Result<&Arc<CentralizedTopology>, NetworkError> {
        self.topology.as_ref().ok_or(NetworkError::NotRunning)
    }

    /// Register this agent with the coordinator.
    pub async fn register(
        &mut self,
        capabilities: Vec<String>,
        metadata: Map<String, Value>,
    ) -> Result<RegisterResponse, NetworkError> {
        self.register_with_options(capabilities, metadata, None, false).await
    }

    /// Register, presenting a certificate or forcing out a live
    /// registration of the same id.
    pub async fn register_with_options(
        &mut self,
        capabilities: Vec<String>,
        metadata: Map<String, Value>,
        certificate: Option<AgentCertificate>,
        force_reconnect: bool,
    ) -> Result<RegisterResponse, NetworkError> {
        let info = AgentInfo::new(self.agent_id.clone())
            .with_capabilities(capabilities)
            .with_metadata(metadata);
        let response = self
            .topology()?
            .register_with(info, certificate, force_reconnect)
            .await?;
        self.network_name = Some(response.network_name.clone());
        Ok(response)
    }

    /// Leave the network without closing the link. The coordinator stops
    /// listing this agent and its id can be registered again.
    pub async fn unregister(&mut self) -> Result<(), NetworkError> {
        self.topology()?.unregister_agent(&self.agent_id).await?;
        self.network_name = None;
        info!("Agent '{}' unregistered", self.agent_id);
        Ok(())
    }

    /// Send to one agent through the coordinator. Fails with
    /// [`NetworkError::AgentNotFound`] when the coordinator does not know
    /// `target_id`.
    pub async fn send_direct_message(
        &self,
        target_id: &str,
        message_type: &str,
        payload: Value,
    ) -> Result<Message, NetworkError> {
        let message = Message::direct(self.agent_id.clone(), target_id, message_type, payload);
        self.topology()?.route_message(&message).await?;
        debug!("Sent {message_type} to '{target_id}'");
        Ok(message)
    }

    /// Send to every other agent on the network. The returned message
    /// carries the `broadcast_id` receivers will see.
    pub async fn send_broadcast_message(
        &self,
        message_type: &str,
        payload: Value,
    ) -> Result<Message, NetworkError> {
        let mut message = Message::broadcast(self.agent_id.clone(), message_type, payload);
        message.broadcast_id = Some(uuid::Uuid::new_v4().to_string());
        self.topology()?.route_message(&message).await?;
        Ok(message)
    }

    /// Handle incoming messages of `message_type`.
    pub fn register_message_handler(&self, message_type: &str, handler: RouteHandler) {
        self.router.register(message_type, handler);
    }

    /// Handle messages no type-specific handler claims.
    pub fn set_default_message_handler(&self, handler: RouteHandler) {
        self.router.set_default_handler(handler);
    }

    /// Observe every response to `command`, including ones answered
    /// through the request methods below.
    pub fn register_system_handler(&self, command: SystemCommand, handler: ResponseHandler) {
        self.responses.register(command.as_str(), handler);
    }

    /// Agents known to the coordinator.
    pub async fn request_list_agents(&self, capabilities: &[String]) -> Result<Vec<AgentInfo>, NetworkError> {
        let mut params = Map::new();
        if !capabilities.is_empty() {
            params.insert("capabilities".into(), serde_json::to_value(capabilities)?);
        }
        let response = self.request(SystemCommand::ListAgents, params).await?;
        field(response, "agents")
    }

    /// Manifests of every mod the network advertises.
    pub async fn request_list_mods(&self) -> Result<Vec<ModManifest>, NetworkError> {
        let response = self.request(SystemCommand::ListMods, Map::new()).await?;
        field(response, "mods")
    }

    /// One mod's manifest. Unknown mods come back as an error.
    pub async fn request_get_mod_manifest(&self, mod_name: &str) -> Result<ModManifest, NetworkError> {
        let mut params = Map::new();
        params.insert("mod_name".into(), mod_name.into());
        let response = self.request(SystemCommand::GetModManifest, params).await?;
        field(response, "manifest")
    }

    /// Ping the coordinator, optionally asking whether `agent_id` is known.
    pub async fn request_ping(&self, agent_id: Option<&str>) -> Result<SystemResponse, NetworkError> {
        let mut params = Map::new();
        params.insert("timestamp".into(), chrono::Utc::now().timestamp_millis().into());
        if let Some(agent_id) = agent_id {
            params.insert("agent_id".into(), agent_id.into());
        }
        self.request(SystemCommand::PingAgent, params).await
    }

    /// Ask the coordinator for a certificate binding this agent's id.
    /// Without `force`, an id already certified to someone else is refused.
    pub async fn request_claim_agent_id(&self, force: bool) -> Result<AgentCertificate, NetworkError> {
        let mut params = Map::new();
        params.insert("agent_id".into(), self.agent_id.clone().into());
        params.insert("force".into(), force.into());
        let response = self.request(SystemCommand::ClaimAgentId, params).await?;
        field(response, "certificate")
    }

    /// Whether the coordinator accepts `certificate` as one it issued.
    pub async fn request_validate_certificate(
        &self,
        certificate: &AgentCertificate,
    ) -> Result<bool, NetworkError> {
        let mut params = Map::new();
        params.insert("certificate".into(), serde_json::to_value(certificate)?);
        let response = self.request(SystemCommand::ValidateCertificate, params).await?;
        field(response, "valid")
    }

    /// Name, mode, address and population of the network.
    pub async fn request_network_info(&self) -> Result<NetworkInfo, NetworkError> {
        let response = self.request(SystemCommand::GetNetworkInfo, Map::new()).await?;
        Ok(serde_json::from_value(Value::Object(response.data))?)
    }

    async fn request(
        &self,
        command: SystemCommand,
        params: Map<String, Value>,
    ) -> Result<SystemResponse, NetworkError> {
        self.topology()?
            .system_request(command, params)
            .await?
            .into_result()
    }
}

fn field<T: serde::de::DeserializeOwned>(mut response: SystemResponse, key: &str) -> Result<T, NetworkError> {
    let value = response
        .data
        .remove(key)
        .ok_or_else(|| NetworkError::Protocol(format!("{} reply has no '{key}'", response.command)))?;
    Ok(serde_json::from_value(value)?)
}
