//! Connection bookkeeping — per-link state and writer handles.
//!
//! Every physical link follows `Connecting → Connected → Disconnected`. A
//! link that never finishes its handshake ends in `Failed` instead; both
//! `Disconnected` and `Failed` are terminal, and a reconnect always opens a
//! fresh [`ConnectionInfo`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::NetworkError;
use crate::identity::PeerId;
use crate::transport::TransportType;

/// Lifecycle state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Dial or handshake in progress.
    Connecting,
    /// Link is live.
    Connected,
    /// Link was live and is now closed.
    Disconnected,
    /// Link never became live.
    Failed,
}

impl ConnectionState {
    /// `Disconnected` and `Failed` admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed)
    }

    /// Whether moving from `self` to `next` is allowed.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        matches!(
            (self, next),
            (Self::Connecting, Self::Connected)
                | (Self::Connecting, Self::Failed)
                | (Self::Connected, Self::Disconnected)
        )
    }
}

/// One physical link to a peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub connection_id: String,
    pub peer_id: PeerId,
    pub transport_type: TransportType,
    pub state: ConnectionState,
    /// Remote address, when the transport knows it.
    pub remote_addr: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl ConnectionInfo {
    pub fn new(peer_id: PeerId, transport_type: TransportType, remote_addr: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            connection_id: uuid::Uuid::new_v4().to_string(),
            peer_id,
            transport_type,
            state: ConnectionState::Connecting,
            remote_addr,
            opened_at: now,
            last_activity: now,
        }
    }

    /// Apply a state transition, refusing any the state machine forbids.
    pub fn transition(&mut self, next: ConnectionState) -> Result<(), NetworkError> {
        if !self.state.can_transition_to(next) {
            return Err(NetworkError::Protocol(format!(
                "Connection {} cannot move from {:?} to {next:?}",
                self.connection_id, self.state
            )));
        }
        self.state = next;
        self.last_activity = Utc::now();
        Ok(())
    }

    /// Record traffic on the link.
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

/// All connections owned by one transport instance, keyed by connection id.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    connections: HashMap<String, ConnectionInfo>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new connection in the `Connecting` state.
    pub fn open(&mut self, info: ConnectionInfo) -> String {
        let id = info.connection_id.clone();
        self.connections.insert(id.clone(), info);
        id
    }

    /// Finish the handshake of a pending connection.
    pub fn mark_connected(&mut self, connection_id: &str) -> Result<(), NetworkError> {
        self.connections
            .get_mut(connection_id)
            .ok_or_else(|| NetworkError::PeerNotFound(connection_id.to_string()))?
            .transition(ConnectionState::Connected)
    }

    /// Move a live connection to `Disconnected` and drop it from the table.
    ///
    /// Returns `None` if the connection was already gone, so callers can
    /// tell whether they were the ones to close it.
    pub fn close(&mut self, connection_id: &str) -> Option<ConnectionInfo> {
        let mut info = self.connections.remove(connection_id)?;
        match info.transition(ConnectionState::Disconnected) {
            Ok(()) => Some(info),
            Err(_) => None,
        }
    }

    /// Move a pending connection to `Failed` and drop it from the table.
    pub fn fail(&mut self, connection_id: &str) -> Option<ConnectionInfo> {
        let mut info = self.connections.remove(connection_id)?;
        match info.transition(ConnectionState::Failed) {
            Ok(()) => Some(info),
            Err(_) => None,
        }
    }

    /// Terminate every tracked connection: live ones become `Disconnected`,
    /// pending ones `Failed`. The table is left empty.
    pub fn close_all(&mut self) -> Vec<ConnectionInfo> {
        self.connections
            .drain()
            .filter_map(|(_, mut info)| {
                let next = match info.state {
                    ConnectionState::Connecting => ConnectionState::Failed,
                    _ => ConnectionState::Disconnected,
                };
                info.transition(next).ok().map(|_| info)
            })
            .collect()
    }

    /// Record traffic on `connection_id`. Unknown ids are ignored.
    pub fn touch(&mut self, connection_id: &str) {
        if let Some(info) = self.connections.get_mut(connection_id) {
            info.touch();
        }
    }

    pub fn get(&self, connection_id: &str) -> Option<&ConnectionInfo> {
        self.connections.get(connection_id)
    }

    /// The connected link for `peer_id`, if any.
    pub fn find_by_peer(&self, peer_id: &PeerId) -> Option<&ConnectionInfo> {
        self.connections
            .values()
            .find(|c| &c.peer_id == peer_id && c.state == ConnectionState::Connected)
    }

    /// Links past their handshake, in no particular order.
    pub fn list_connected(&self) -> Vec<&ConnectionInfo> {
        self.connections
            .values()
            .filter(|c| c.state == ConnectionState::Connected)
            .collect()
    }

    pub fn list_all(&self) -> Vec<&ConnectionInfo> {
        self.connections.values().collect()
    }

    pub fn connected_count(&self) -> usize {
        self.list_connected().len()
    }

    /// Ids of every tracked connection.
    pub fn ids(&self) -> Vec<String> {
        self.connections.keys().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Writer handle
// ---------------------------------------------------------------------------

/// A frame queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Close,
}

/// Cloneable handle for writing to one live connection.
///
/// The write half of the socket is owned by a writer task; the handle only
/// queues frames for it, so sending never blocks on the network.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    peer_id: PeerId,
    connection_id: String,
    tx: mpsc::UnboundedSender<OutboundFrame>,
}

impl ConnectionHandle {
    pub fn new(
        peer_id: PeerId,
        connection_id: impl Into<String>,
        tx: mpsc::UnboundedSender<OutboundFrame>,
    ) -> Self {
        Self {
            peer_id,
            connection_id: connection_id.into(),
            tx,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Queue a text frame.
    pub fn send_text(&self, text: String) -> Result<(), NetworkError> {
        self.tx
            .send(OutboundFrame::Text(text))
            .map_err(|_| NetworkError::PeerNotFound(self.peer_id.to_string()))
    }

    /// Serialize `value` and queue it as a text frame.
    pub fn send_json<T: Serialize>(&self, value: &T) -> Result<(), NetworkError> {
        self.send_text(serde_json::to_string(value)?)
    }

    /// Ask the writer to close the socket. Closing twice is harmless.
    pub fn close(&self) {
        let _ = self.tx.send(OutboundFrame::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
