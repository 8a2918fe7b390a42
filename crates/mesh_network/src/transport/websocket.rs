//! WebSocket transport — inbound and outbound connections over
//! `tokio-tungstenite`.
//!
//! `listen` accepts sockets and gives each a generated [`PeerId`]; `connect`
//! dials `ws://address` under a caller-chosen peer id. Either way the socket
//! is split: the write half goes to a writer task fed through a
//! [`ConnectionHandle`], the read half to a read-loop task that decodes
//! frames and invokes the registered handlers inline.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{accept_async, connect_async};
use tracing::{debug, error, info, warn};

use crate::connection::{
    ConnectionHandle, ConnectionInfo, ConnectionState, ConnectionTable, OutboundFrame,
};
use crate::error::NetworkError;
use crate::identity::PeerId;
use crate::message::{InboundFrame, Message, RoutedEnvelope, decode_frame};
use crate::transport::{
    AgentResolver, ConnectionHandler, MessageHandler, SystemHandler, Transport, TransportType,
};

/// Upper bound on a dial or an inbound handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `shutdown` waits for spawned tasks before aborting them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// WebSocket implementation of [`Transport`].
pub struct WebSocketTransport {
    inner: Arc<Inner>,
}

struct Inner {
    node_id: String,
    handles: RwLock<HashMap<PeerId, ConnectionHandle>>,
    table: RwLock<ConnectionTable>,
    message_handlers: parking_lot::RwLock<Vec<MessageHandler>>,
    connection_handlers: parking_lot::RwLock<Vec<ConnectionHandler>>,
    system_handlers: parking_lot::RwLock<Vec<SystemHandler>>,
    resolver: parking_lot::RwLock<Option<AgentResolver>>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    local_addr: parking_lot::RwLock<Option<SocketAddr>>,
    running: AtomicBool,
}

impl WebSocketTransport {
    /// Create a transport for the node named `node_id` (used in logs).
    pub fn new(node_id: impl Into<String>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(8);
        Self {
            inner: Arc::new(Inner {
                node_id: node_id.into(),
                handles: RwLock::new(HashMap::new()),
                table: RwLock::new(ConnectionTable::new()),
                message_handlers: parking_lot::RwLock::new(Vec::new()),
                connection_handlers: parking_lot::RwLock::new(Vec::new()),
                system_handlers: parking_lot::RwLock::new(Vec::new()),
                resolver: parking_lot::RwLock::new(None),
                shutdown_tx,
                tasks: parking_lot::Mutex::new(Vec::new()),
                local_addr: parking_lot::RwLock::new(None),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Whether `initialize` has run and `shutdown` has not.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<(), NetworkError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(NetworkError::NotRunning)
        }
    }
}

/// Normalize `host:port` or a `ws://` / `wss://` URL into a dialable URL.
fn ws_url(address: &str) -> Result<String, NetworkError> {
    let candidate = if address.starts_with("ws://") || address.starts_with("wss://") {
        address.to_string()
    } else {
        format!("ws://{address}")
    };
    let url = url::Url::parse(&candidate)
        .map_err(|e| NetworkError::Config(format!("Invalid address '{address}': {e}")))?;
    if url.host_str().is_none() || url.port_or_known_default().is_none() {
        return Err(NetworkError::Config(format!("Invalid address '{address}'")));
    }
    Ok(url.to_string())
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::WebSocket
    }

    async fn initialize(&self) -> Result<(), NetworkError> {
        self.inner.running.store(true, Ordering::SeqCst);
        debug!("WebSocket transport for '{}' initialized", self.inner.node_id);
        Ok(())
    }

    async fn listen(&self, address: &str) -> Result<SocketAddr, NetworkError> {
        self.ensure_running()?;

        let listener = TcpListener::bind(address).await?;
        let bound = listener.local_addr()?;
        *self.inner.local_addr.write() = Some(bound);
        info!("WebSocket transport '{}' listening on {bound}", self.inner.node_id);

        let inner = Arc::clone(&self.inner);
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, remote)) => {
                                let conn_inner = Arc::clone(&inner);
                                let task = tokio::spawn(async move {
                                    conn_inner.accept_connection(stream, remote).await;
                                });
                                inner.track(task);
                            }
                            Err(e) => {
                                error!("TCP accept failed: {e}");
                            }
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("WebSocket listener on {bound} shutting down");
                        break;
                    }
                }
            }
        });
        self.inner.track(task);

        Ok(bound)
    }

    async fn connect(&self, peer_id: &PeerId, address: &str) -> Result<(), NetworkError> {
        self.ensure_running()?;

        if self.inner.handles.read().await.contains_key(peer_id) {
            debug!("Already connected to {peer_id}");
            return Ok(());
        }

        let url = ws_url(address)?;
        let info = ConnectionInfo::new(peer_id.clone(), TransportType::WebSocket, Some(address.into()));
        let connection_id = self.inner.table.write().await.open(info);
        self.inner.emit_state(peer_id, ConnectionState::Connecting).await;

        let dial = tokio::time::timeout(HANDSHAKE_TIMEOUT, connect_async(url.as_str())).await;
        let ws_stream = match dial {
            Ok(Ok((ws_stream, _response))) => ws_stream,
            Ok(Err(e)) => {
                self.inner.connection_failed(peer_id, &connection_id).await;
                return Err(NetworkError::Transport(format!("Connect to {address} failed: {e}")));
            }
            Err(_) => {
                self.inner.connection_failed(peer_id, &connection_id).await;
                return Err(NetworkError::Timeout(HANDSHAKE_TIMEOUT));
            }
        };

        let (sink, stream) = ws_stream.split();
        let handle = self
            .inner
            .register_live(peer_id.clone(), connection_id, sink)
            .await?;

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            inner.read_loop(stream, handle).await;
        });
        self.inner.track(task);

        info!("Connected to {peer_id} at {address}");
        Ok(())
    }

    async fn disconnect(&self, peer_id: &PeerId) -> Result<(), NetworkError> {
        let handle = self
            .inner
            .handles
            .write()
            .await
            .remove(peer_id)
            .ok_or_else(|| NetworkError::PeerNotFound(peer_id.to_string()))?;

        handle.close();
        let closed = self.inner.table.write().await.close(handle.connection_id());
        if closed.is_some() {
            self.inner.emit_state(peer_id, ConnectionState::Disconnected).await;
        }
        info!("Disconnected from {peer_id}");
        Ok(())
    }

    async fn send(&self, message: &Message) -> Result<usize, NetworkError> {
        self.ensure_running()?;

        match &message.target_id {
            Some(target) => {
                let handle = self
                    .inner
                    .resolve(target)
                    .await
                    .ok_or_else(|| NetworkError::PeerNotFound(target.clone()))?;
                handle.send_text(RoutedEnvelope::direct(message).to_json()?)?;
                debug!("Sent {} to {target} via {}", message.message_id, handle.peer_id());
                Ok(1)
            }
            None => {
                let broadcast_id = message
                    .broadcast_id
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                let frame = RoutedEnvelope::broadcast_copy(message, &broadcast_id).to_json()?;
                let excluded = self.inner.resolve_peer(&message.sender_id).await;

                let handles: Vec<ConnectionHandle> =
                    self.inner.handles.read().await.values().cloned().collect();
                let mut sent = 0;
                for handle in handles {
                    if excluded.as_ref() == Some(handle.peer_id()) {
                        continue;
                    }
                    match handle.send_text(frame.clone()) {
                        Ok(()) => sent += 1,
                        Err(e) => warn!("Broadcast {broadcast_id} to {} failed: {e}", handle.peer_id()),
                    }
                }
                debug!("Broadcast {broadcast_id} from {} fanned out to {sent} peers", message.sender_id);
                Ok(sent)
            }
        }
    }

    async fn shutdown(&self) -> Result<(), NetworkError> {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.inner.shutdown_tx.send(());

        let handles: Vec<ConnectionHandle> = self
            .inner
            .handles
            .write()
            .await
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in &handles {
            handle.close();
        }

        let closed = self.inner.table.write().await.close_all();
        for info in closed {
            self.inner.emit_state(&info.peer_id, info.state).await;
        }

        let mut tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.tasks.lock());
        let drained =
            tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(tasks.iter_mut())).await;
        if drained.is_err() {
            warn!("Transport tasks did not stop within {SHUTDOWN_GRACE:?}, aborting");
            for task in &tasks {
                task.abort();
            }
        }

        *self.inner.local_addr.write() = None;
        info!("WebSocket transport '{}' shut down", self.inner.node_id);
        Ok(())
    }

    async fn connection(&self, peer_id: &PeerId) -> Option<ConnectionHandle> {
        self.inner.handles.read().await.get(peer_id).cloned()
    }

    async fn connections(&self) -> Vec<ConnectionInfo> {
        self.inner.table.read().await.list_all().into_iter().cloned().collect()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.read()
    }

    fn on_message(&self, handler: MessageHandler) {
        self.inner.message_handlers.write().push(handler);
    }

    fn on_connection_state(&self, handler: ConnectionHandler) {
        self.inner.connection_handlers.write().push(handler);
    }

    fn on_system_message(&self, handler: SystemHandler) {
        self.inner.system_handlers.write().push(handler);
    }

    fn set_agent_resolver(&self, resolver: AgentResolver) {
        *self.inner.resolver.write() = Some(resolver);
    }
}

// ---------------------------------------------------------------------------
// Connection tasks
// ---------------------------------------------------------------------------

impl Inner {
    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    /// Handshake an accepted socket and run its read loop until it closes.
    async fn accept_connection(self: Arc<Self>, stream: TcpStream, remote: SocketAddr) {
        let peer_id = PeerId::generate();
        let info = ConnectionInfo::new(peer_id.clone(), TransportType::WebSocket, Some(remote.to_string()));
        let connection_id = self.table.write().await.open(info);
        self.emit_state(&peer_id, ConnectionState::Connecting).await;

        let ws_stream = match tokio::time::timeout(HANDSHAKE_TIMEOUT, accept_async(stream)).await {
            Ok(Ok(ws_stream)) => ws_stream,
            Ok(Err(e)) => {
                warn!("WebSocket handshake with {remote} failed: {e}");
                self.connection_failed(&peer_id, &connection_id).await;
                return;
            }
            Err(_) => {
                warn!("WebSocket handshake with {remote} timed out");
                self.connection_failed(&peer_id, &connection_id).await;
                return;
            }
        };

        let (sink, stream) = ws_stream.split();
        match self.register_live(peer_id.clone(), connection_id, sink).await {
            Ok(handle) => {
                debug!("Accepted {remote} as {peer_id}");
                self.read_loop(stream, handle).await;
            }
            Err(e) => warn!("Dropping connection from {remote}: {e}"),
        }
    }

    /// Start the writer task, mark the connection live and publish its handle.
    async fn register_live<S>(
        &self,
        peer_id: PeerId,
        connection_id: String,
        sink: S,
    ) -> Result<ConnectionHandle, NetworkError>
    where
        S: Sink<WsMessage, Error = tungstenite::Error> + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle::new(peer_id.clone(), connection_id.clone(), tx);
        self.track(tokio::spawn(write_loop(sink, rx, peer_id.clone())));

        if let Err(e) = self.table.write().await.mark_connected(&connection_id) {
            handle.close();
            return Err(e);
        }

        let previous = self
            .handles
            .write()
            .await
            .insert(peer_id.clone(), handle.clone());
        if let Some(previous) = previous {
            debug!("Replacing existing connection for {peer_id}");
            previous.close();
        }

        self.emit_state(&peer_id, ConnectionState::Connected).await;
        Ok(handle)
    }

    async fn read_loop<S>(&self, mut stream: S, handle: ConnectionHandle)
    where
        S: Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
    {
        let mut shutdown = self.shutdown_tx.subscribe();
        let peer_id = handle.peer_id().clone();

        loop {
            tokio::select! {
                frame = stream.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            self.table.write().await.touch(handle.connection_id());
                            self.handle_text(&handle, text.as_str()).await;
                        }
                        Some(Ok(WsMessage::Close(_))) => {
                            debug!("Peer {peer_id} sent close");
                            break;
                        }
                        Some(Ok(_)) => {} // Binary/ping/pong
                        Some(Err(e)) => {
                            debug!("Read error from {peer_id}: {e}");
                            break;
                        }
                        None => break,
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Read loop for {peer_id} stopping on shutdown");
                    break;
                }
            }
        }

        self.connection_closed(&handle).await;
    }

    async fn handle_text(&self, handle: &ConnectionHandle, text: &str) {
        let peer_id = handle.peer_id();
        match decode_frame(text) {
            Ok(InboundFrame::Envelope(message)) => {
                let handlers: Vec<MessageHandler> = self.message_handlers.read().clone();
                if handlers.is_empty() {
                    debug!("No message handler for {} from {peer_id}", message.message_type);
                }
                for handler in handlers {
                    handler(peer_id.clone(), message.clone()).await;
                }
            }
            Ok(InboundFrame::Control(raw)) => {
                let handlers: Vec<SystemHandler> = self.system_handlers.read().clone();
                for handler in handlers {
                    handler(peer_id.clone(), raw.clone(), handle.clone()).await;
                }
            }
            Err(e) => {
                warn!("Dropping frame from {peer_id}: {e}");
            }
        }
    }

    async fn connection_closed(&self, handle: &ConnectionHandle) {
        let peer_id = handle.peer_id();
        {
            let mut handles = self.handles.write().await;
            let current = handles
                .get(peer_id)
                .is_some_and(|h| h.connection_id() == handle.connection_id());
            if current {
                handles.remove(peer_id);
            }
        }
        handle.close();

        let closed = self.table.write().await.close(handle.connection_id());
        if closed.is_some() {
            debug!("Connection to {peer_id} closed");
            self.emit_state(peer_id, ConnectionState::Disconnected).await;
        }
    }

    async fn connection_failed(&self, peer_id: &PeerId, connection_id: &str) {
        if self.table.write().await.fail(connection_id).is_some() {
            self.emit_state(peer_id, ConnectionState::Failed).await;
        }
    }

    async fn emit_state(&self, peer_id: &PeerId, state: ConnectionState) {
        let handlers: Vec<ConnectionHandler> = self.connection_handlers.read().clone();
        for handler in handlers {
            handler(peer_id.clone(), state).await;
        }
    }

    /// Resolve an agent id (or a raw peer id) to a connected peer.
    async fn resolve_peer(&self, target: &str) -> Option<PeerId> {
        let resolver = self.resolver.read().clone();
        if let Some(peer) = resolver.and_then(|resolve| resolve(target)) {
            return Some(peer);
        }
        let candidate = PeerId::from_string(target);
        if self.handles.read().await.contains_key(&candidate) {
            Some(candidate)
        } else {
            None
        }
    }

    async fn resolve(&self, target: &str) -> Option<ConnectionHandle> {
        let peer_id = self.resolve_peer(target).await?;
        self.handles.read().await.get(&peer_id).cloned()
    }
}

/// Drain queued frames into the socket until closed.
async fn write_loop<S>(mut sink: S, mut rx: mpsc::UnboundedReceiver<OutboundFrame>, peer_id: PeerId)
where
    S: Sink<WsMessage, Error = tungstenite::Error> + Unpin + Send + 'static,
{
    while let Some(frame) = rx.recv().await {
        match frame {
            OutboundFrame::Text(text) => {
                if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                    debug!("Send to {peer_id} failed: {e}");
                    break;
                }
            }
            OutboundFrame::Close => {
                let _ = sink.send(WsMessage::Close(None)).await;
                break;
            }
        }
    }
    rx.close();
    let _ = sink.close().await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{connection_handler, message_handler, system_handler};

    const WAIT: Duration = Duration::from_secs(2);

    async fn listening(name: &str) -> (WebSocketTransport, SocketAddr) {
        let transport = WebSocketTransport::new(name);
        transport.initialize().await.unwrap();
        let addr = transport.listen("127.0.0.1:0").await.unwrap();
        (transport, addr)
    }

    async fn dialing(name: &str, server: SocketAddr) -> WebSocketTransport {
        let transport = WebSocketTransport::new(name);
        transport.initialize().await.unwrap();
        transport
            .connect(&PeerId::from_string("server"), &server.to_string())
            .await
            .unwrap();
        transport
    }

    fn capture_messages(
        transport: &WebSocketTransport,
    ) -> mpsc::UnboundedReceiver<(PeerId, Message)> {
        let (tx, rx) = mpsc::unbounded_channel();
        transport.on_message(message_handler(move |peer, msg| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((peer, msg));
            }
        }));
        rx
    }

    async fn wait_for_connections(transport: &WebSocketTransport, count: usize) {
        for _ in 0..100 {
            if transport.inner.handles.read().await.len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("expected {count} connections");
    }

    #[test]
    fn test_ws_url_normalization() {
        assert_eq!(ws_url("127.0.0.1:9000").unwrap(), "ws://127.0.0.1:9000/");
        assert_eq!(ws_url("ws://example.org:80/x").unwrap(), "ws://example.org/x");
        assert!(ws_url("").is_err());
    }

    #[tokio::test]
    async fn test_listen_requires_initialize() {
        let transport = WebSocketTransport::new("cold");
        assert!(matches!(
            transport.listen("127.0.0.1:0").await,
            Err(NetworkError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_direct_message_by_peer_id() {
        let (server, addr) = listening("server").await;
        let mut inbox = capture_messages(&server);
        let client = dialing("client", addr).await;

        let msg = Message::direct("client-agent", "server", "chat", serde_json::json!({"text": "hi"}));
        assert_eq!(client.send(&msg).await.unwrap(), 1);

        let (_, received) = tokio::time::timeout(WAIT, inbox.recv()).await.unwrap().unwrap();
        assert_eq!(received.sender_id, "client-agent");
        assert_eq!(received.message_id, msg.message_id);
        assert_eq!(received.payload["text"], "hi");

        client.shutdown().await.unwrap();
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_to_unknown_target_fails() {
        let (server, _addr) = listening("lonely").await;
        let msg = Message::direct("me", "nobody", "chat", serde_json::Value::Null);
        assert!(matches!(server.send(&msg).await, Err(NetworkError::PeerNotFound(t)) if t == "nobody"));
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_resolver_routes_by_agent_id() {
        let (server, addr) = listening("server").await;
        let client = dialing("client", addr).await;
        let mut inbox = capture_messages(&client);
        wait_for_connections(&server, 1).await;

        let client_peer = server.connections().await[0].peer_id.clone();
        server.set_agent_resolver(Arc::new(move |agent: &str| {
            (agent == "bob").then(|| client_peer.clone())
        }));

        let msg = Message::direct("alice", "bob", "chat", serde_json::json!({"text": "hey bob"}));
        server.send(&msg).await.unwrap();

        let (_, received) = tokio::time::timeout(WAIT, inbox.recv()).await.unwrap().unwrap();
        assert_eq!(received.target_id.as_deref(), Some("bob"));

        client.shutdown().await.unwrap();
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender_and_shares_id() {
        let (server, addr) = listening("hub").await;
        let a = dialing("a", addr).await;
        let b = dialing("b", addr).await;
        let c = dialing("c", addr).await;
        let mut inbox_a = capture_messages(&a);
        let mut inbox_b = capture_messages(&b);
        let mut inbox_c = capture_messages(&c);
        wait_for_connections(&server, 3).await;

        // Pretend the broadcast originates from a's connection.
        let mut peers: Vec<ConnectionInfo> = server.connections().await;
        peers.sort_by_key(|c| c.opened_at);
        let a_peer = peers[0].peer_id.clone();

        let msg = Message::broadcast(a_peer.as_str(), "news", serde_json::json!({"n": 1}));
        assert_eq!(server.send(&msg).await.unwrap(), 2);

        let (_, from_b) = tokio::time::timeout(WAIT, inbox_b.recv()).await.unwrap().unwrap();
        let (_, from_c) = tokio::time::timeout(WAIT, inbox_c.recv()).await.unwrap().unwrap();
        assert!(from_b.broadcast_id.is_some());
        assert_eq!(from_b.broadcast_id, from_c.broadcast_id);
        assert!(
            tokio::time::timeout(Duration::from_millis(200), inbox_a.recv())
                .await
                .is_err()
        );

        for t in [a, b, c, server] {
            t.shutdown().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection() {
        let (server, addr) = listening("server").await;
        let mut inbox = capture_messages(&server);
        let client = dialing("client", addr).await;

        let handle = client.connection(&PeerId::from_string("server")).await.unwrap();
        handle.send_text("{{ definitely not json".into()).unwrap();
        handle.send_text("{\"type\":\"unheard_of\"}".into()).unwrap();

        let msg = Message::direct("client", "server", "chat", serde_json::json!({"ok": true}));
        client.send(&msg).await.unwrap();

        let (_, received) = tokio::time::timeout(WAIT, inbox.recv()).await.unwrap().unwrap();
        assert_eq!(received.message_id, msg.message_id);

        client.shutdown().await.unwrap();
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_system_frames_reach_system_handlers() {
        let (server, addr) = listening("server").await;
        let mut messages = capture_messages(&server);
        server.on_system_message(system_handler(|_peer, raw, handle| async move {
            let reply = serde_json::json!({
                "type": "system_response",
                "command": raw["command"],
                "success": true,
            });
            let _ = handle.send_json(&reply);
        }));

        let client = dialing("client", addr).await;
        let (tx, mut replies) = mpsc::unbounded_channel();
        client.on_system_message(system_handler(move |_peer, raw, _handle| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(raw);
            }
        }));

        let handle = client.connection(&PeerId::from_string("server")).await.unwrap();
        handle
            .send_json(&serde_json::json!({"type": "system_request", "command": "ping_agent"}))
            .unwrap();

        let reply = tokio::time::timeout(WAIT, replies.recv()).await.unwrap().unwrap();
        assert_eq!(reply["type"], "system_response");
        assert_eq!(reply["command"], "ping_agent");
        assert!(messages.try_recv().is_err());

        client.shutdown().await.unwrap();
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_state_machine_observed_on_both_sides() {
        let (server, addr) = listening("server").await;
        let (tx, mut states) = mpsc::unbounded_channel();
        server.on_connection_state(connection_handler(move |_peer, state| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(state);
            }
        }));

        let client = dialing("client", addr).await;
        wait_for_connections(&server, 1).await;
        client.shutdown().await.unwrap();

        let mut seen = Vec::new();
        while seen.len() < 3 {
            let state = tokio::time::timeout(WAIT, states.recv()).await.unwrap().unwrap();
            seen.push(state);
        }
        assert_eq!(
            seen,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected
            ]
        );
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_dial_is_terminal_failed() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let client = WebSocketTransport::new("client");
        client.initialize().await.unwrap();
        let (tx, mut states) = mpsc::unbounded_channel();
        client.on_connection_state(connection_handler(move |_peer, state| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(state);
            }
        }));

        let result = client
            .connect(&PeerId::from_string("ghost"), &format!("127.0.0.1:{port}"))
            .await;
        assert!(result.is_err());
        assert_eq!(states.recv().await, Some(ConnectionState::Connecting));
        assert_eq!(states.recv().await, Some(ConnectionState::Failed));
        assert!(client.connections().await.is_empty());
        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_remote_side() {
        let (server, addr) = listening("server").await;
        let client = dialing("client", addr).await;
        let (tx, mut states) = mpsc::unbounded_channel();
        client.on_connection_state(connection_handler(move |peer, state| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((peer, state));
            }
        }));
        wait_for_connections(&server, 1).await;

        server.shutdown().await.unwrap();
        assert!(server.connections().await.is_empty());
        assert!(server.local_addr().is_none());

        let (peer, state) = tokio::time::timeout(WAIT, states.recv()).await.unwrap().unwrap();
        assert_eq!(peer, PeerId::from_string("server"));
        assert_eq!(state, ConnectionState::Disconnected);
        assert!(client.connection(&peer).await.is_none());
        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_unknown_peer() {
        let (server, _) = listening("server").await;
        assert!(matches!(
            server.disconnect(&PeerId::from_string("nope")).await,
            Err(NetworkError::PeerNotFound(_))
        ));
        server.shutdown().await.unwrap();
    }
}
