//! Control plane — registration and system commands.
//!
//! Control frames share the text channel with application envelopes and are
//! told apart by `type`. Requests may carry a `request_id`; every response
//! echoes it so callers can match replies through a [`RequestTracker`].

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::connection::ConnectionHandle;
use crate::error::NetworkError;
use crate::identity::AgentCertificate;

/// How long a caller waits for a control-plane reply.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Control-plane commands understood by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemCommand {
    RegisterAgent,
    UnregisterAgent,
    ListAgents,
    ListMods,
    GetModManifest,
    PingAgent,
    ClaimAgentId,
    ValidateCertificate,
    GetNetworkInfo,
}

impl SystemCommand {
    pub const ALL: [SystemCommand; 9] = [
        SystemCommand::RegisterAgent,
        SystemCommand::UnregisterAgent,
        SystemCommand::ListAgents,
        SystemCommand::ListMods,
        SystemCommand::GetModManifest,
        SystemCommand::PingAgent,
        SystemCommand::ClaimAgentId,
        SystemCommand::ValidateCertificate,
        SystemCommand::GetNetworkInfo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RegisterAgent => "register_agent",
            Self::UnregisterAgent => "unregister_agent",
            Self::ListAgents => "list_agents",
            Self::ListMods => "list_mods",
            Self::GetModManifest => "get_mod_manifest",
            Self::PingAgent => "ping_agent",
            Self::ClaimAgentId => "claim_agent_id",
            Self::ValidateCertificate => "validate_certificate",
            Self::GetNetworkInfo => "get_network_info",
        }
    }
}

impl fmt::Display for SystemCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SystemCommand {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| NetworkError::UnknownCommand(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// `{"type":"register", ...}` sent by a client to join the network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub agent_id: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<AgentCertificate>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub force_reconnect: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub success: bool,
    pub network_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// `{"type":"system_request","command":..., ...params}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemRequest {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl SystemRequest {
    pub fn new(command: SystemCommand, params: Map<String, Value>) -> Self {
        Self {
            command: command.as_str().to_string(),
            request_id: None,
            params,
        }
    }

    /// String parameter `key`, if present.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }
}

/// `{"type":"system_response","command":...,"success":...}` plus
/// command-specific fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemResponse {
    pub command: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl SystemResponse {
    pub fn ok(command: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            command: command.into(),
            success: true,
            request_id: None,
            error: None,
            data,
        }
    }

    pub fn failure(command: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            success: false,
            request_id: None,
            error: Some(error.into()),
            data: Map::new(),
        }
    }

    /// Convert a failed reply into an error.
    pub fn into_result(self) -> Result<Self, NetworkError> {
        if self.success {
            Ok(self)
        } else {
            Err(NetworkError::Protocol(format!(
                "{} failed: {}",
                self.command,
                self.error.as_deref().unwrap_or("no reason given")
            )))
        }
    }
}

/// Every control-plane frame, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    Register(RegisterRequest),
    RegisterResponse(RegisterResponse),
    SystemRequest(SystemRequest),
    SystemResponse(SystemResponse),
}

impl ControlFrame {
    /// Parse a decoded control frame by its `type` tag.
    pub fn from_value(raw: Value) -> Result<Self, NetworkError> {
        serde_json::from_value(raw)
            .map_err(|e| NetworkError::Protocol(format!("Bad control frame: {e}")))
    }

    /// The request id carried by the frame, if any.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Register(r) => r.request_id.as_deref(),
            Self::RegisterResponse(r) => r.request_id.as_deref(),
            Self::SystemRequest(r) => r.request_id.as_deref(),
            Self::SystemResponse(r) => r.request_id.as_deref(),
        }
    }
}

// ---------------------------------------------------------------------------
// Command registry
// ---------------------------------------------------------------------------

/// Future returned by a [`CommandHandler`].
pub type CommandFuture = Pin<Box<dyn Future<Output = SystemResponse> + Send>>;

/// Handles one command for the connection it arrived on.
pub type CommandHandler = Arc<dyn Fn(SystemRequest, ConnectionHandle) -> CommandFuture + Send + Sync>;

/// Build a [`CommandHandler`] from an async closure.
pub fn command_handler<F, Fut>(f: F) -> CommandHandler
where
    F: Fn(SystemRequest, ConnectionHandle) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SystemResponse> + Send + 'static,
{
    Arc::new(move |request: SystemRequest, handle: ConnectionHandle| -> CommandFuture {
        Box::pin(f(request, handle))
    })
}

/// Command → handler table, filled once at startup.
#[derive(Default, Clone)]
pub struct CommandRegistry {
    handlers: HashMap<SystemCommand, CommandHandler>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, command: SystemCommand, handler: CommandHandler) {
        debug!("Registering system command: {command}");
        self.handlers.insert(command, handler);
    }

    pub fn has_command(&self, command: SystemCommand) -> bool {
        self.handlers.contains_key(&command)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run the handler for `request`. Unknown or unregistered commands get a
    /// failure reply. The reply always echoes the command and request id.
    pub async fn dispatch(&self, request: SystemRequest, handle: ConnectionHandle) -> SystemResponse {
        let command_name = request.command.clone();
        let request_id = request.request_id.clone();

        let mut response = match command_name.parse::<SystemCommand>() {
            Ok(command) => match self.handlers.get(&command) {
                Some(handler) => handler(request, handle).await,
                None => SystemResponse::failure(&command_name, format!("Command not supported: {command}")),
            },
            Err(e) => {
                warn!("Rejecting system request from {}: {e}", handle.peer_id());
                SystemResponse::failure(&command_name, e.to_string())
            }
        };

        response.command = command_name;
        response.request_id = request_id;
        response
    }

    /// Dispatch and send the reply on `handle`.
    pub async fn serve(&self, request: SystemRequest, handle: ConnectionHandle) {
        let response = self.dispatch(request, handle.clone()).await;
        if let Err(e) = handle.send_json(&ControlFrame::SystemResponse(response)) {
            warn!("Could not reply to {}: {e}", handle.peer_id());
        }
    }
}

// ---------------------------------------------------------------------------
// Request tracking
// ---------------------------------------------------------------------------

/// Matches control-plane replies to the requests waiting on them.
pub struct RequestTracker {
    pending: parking_lot::Mutex<HashMap<String, oneshot::Sender<ControlFrame>>>,
    timeout: Duration,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::with_timeout(REQUEST_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            pending: parking_lot::Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Reserve a fresh request id.
    pub fn begin(&self) -> (String, oneshot::Receiver<ControlFrame>) {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), tx);
        (request_id, rx)
    }

    /// Wait for the reply to `request_id`.
    pub async fn wait(
        &self,
        request_id: &str,
        rx: oneshot::Receiver<ControlFrame>,
    ) -> Result<ControlFrame, NetworkError> {
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(NetworkError::Transport(format!(
                "Request {request_id} abandoned"
            ))),
            Err(_) => {
                self.pending.lock().remove(request_id);
                Err(NetworkError::Timeout(self.timeout))
            }
        }
    }

    /// Hand `frame` to its waiter. Returns `false` if nobody was waiting.
    pub fn resolve(&self, frame: ControlFrame) -> bool {
        let Some(request_id) = frame.request_id().map(str::to_string) else {
            return false;
        };
        match self.pending.lock().remove(&request_id) {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    /// Stop waiting for `request_id`.
    pub fn cancel(&self, request_id: &str) {
        self.pending.lock().remove(request_id);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Drop every waiter; they observe an abandoned request.
    pub fn cancel_all(&self) {
        self.pending.lock().clear();
    }
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::OutboundFrame;
    use crate::identity::PeerId;
    use tokio::sync::mpsc;

    fn test_handle() -> (ConnectionHandle, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionHandle::new(PeerId::from_string("p"), "c", tx), rx)
    }

    #[test]
    fn test_command_names() {
        for command in SystemCommand::ALL {
            assert_eq!(command.as_str().parse::<SystemCommand>().unwrap(), command);
            let json = serde_json::to_string(&command).unwrap();
            assert_eq!(json, format!("\"{command}\""));
        }
        assert!(matches!(
            "reboot_universe".parse::<SystemCommand>(),
            Err(NetworkError::UnknownCommand(_))
        ));
    }

    #[test]
    fn test_control_frame_wire_shape() {
        let mut params = Map::new();
        params.insert("mod_name".into(), "chat".into());
        let mut request = SystemRequest::new(SystemCommand::GetModManifest, params);
        request.request_id = Some("r-1".into());

        let wire = serde_json::to_value(ControlFrame::SystemRequest(request.clone())).unwrap();
        assert_eq!(wire["type"], "system_request");
        assert_eq!(wire["command"], "get_mod_manifest");
        assert_eq!(wire["mod_name"], "chat");
        assert_eq!(wire["request_id"], "r-1");

        match ControlFrame::from_value(wire).unwrap() {
            ControlFrame::SystemRequest(back) => {
                assert_eq!(back, request);
                assert!(!back.params.contains_key("type"));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_register_frame_parses_minimal_form() {
        let raw = serde_json::json!({"type": "register", "agent_id": "alice", "metadata": {"k": 1}});
        match ControlFrame::from_value(raw).unwrap() {
            ControlFrame::Register(req) => {
                assert_eq!(req.agent_id, "alice");
                assert!(!req.force_reconnect);
                assert!(req.certificate.is_none());
            }
            other => panic!("unexpected frame {other:?}"),
        }

        let response = ControlFrame::RegisterResponse(RegisterResponse {
            success: false,
            network_name: "net".into(),
            error: Some("taken".into()),
            request_id: None,
        });
        let wire = serde_json::to_value(&response).unwrap();
        assert_eq!(wire["type"], "register_response");
        assert_eq!(wire["success"], false);
        assert!(wire.get("request_id").is_none());
    }

    #[tokio::test]
    async fn test_dispatch_echoes_request_id() {
        let mut registry = CommandRegistry::new();
        registry.register(
            SystemCommand::PingAgent,
            command_handler(|_req, _handle| async {
                let mut data = Map::new();
                data.insert("pong".into(), true.into());
                SystemResponse::ok("ignored", data)
            }),
        );

        let (handle, mut rx) = test_handle();
        let mut request = SystemRequest::new(SystemCommand::PingAgent, Map::new());
        request.request_id = Some("abc".into());
        registry.serve(request, handle).await;

        let Some(OutboundFrame::Text(text)) = rx.recv().await else {
            panic!("expected a reply");
        };
        let reply: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(reply["type"], "system_response");
        assert_eq!(reply["command"], "ping_agent");
        assert_eq!(reply["request_id"], "abc");
        assert_eq!(reply["pong"], true);
    }

    #[tokio::test]
    async fn test_unknown_command_is_rejected() {
        let registry = CommandRegistry::new();
        let (handle, _rx) = test_handle();
        let request = SystemRequest {
            command: "self_destruct".into(),
            request_id: Some("x".into()),
            params: Map::new(),
        };
        let response = registry.dispatch(request, handle).await;
        assert!(!response.success);
        assert_eq!(response.command, "self_destruct");
        assert_eq!(response.request_id.as_deref(), Some("x"));
        assert!(response.error.unwrap().contains("Unknown command"));
    }

    #[tokio::test]
    async fn test_tracker_resolves_matching_reply() {
        let tracker = RequestTracker::new();
        let (id, rx) = tracker.begin();
        assert_eq!(tracker.pending_count(), 1);

        let mut reply = SystemResponse::ok("list_agents", Map::new());
        reply.request_id = Some(id.clone());
        assert!(tracker.resolve(ControlFrame::SystemResponse(reply)));
        assert!(!tracker.resolve(ControlFrame::SystemResponse(SystemResponse::ok("x", Map::new()))));

        let frame = tracker.wait(&id, rx).await.unwrap();
        assert_eq!(frame.request_id(), Some(id.as_str()));
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_tracker_times_out() {
        let tracker = RequestTracker::with_timeout(Duration::from_millis(30));
        let (id, rx) = tracker.begin();
        assert!(matches!(tracker.wait(&id, rx).await, Err(NetworkError::Timeout(_))));
        assert_eq!(tracker.pending_count(), 0);
    }
}
