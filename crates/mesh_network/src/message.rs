//! Message model and wire envelopes.
//!
//! Application messages never travel raw. On the wire each one is wrapped in
//! a [`RoutedEnvelope`] that carries routing metadata (source, optional
//! target, broadcast id) around the original message id, its declared
//! protocol and its payload. Control-plane frames (`register`,
//! `system_request`, ...) share the same text channel and are told apart by
//! their `type` field, see [`decode_frame`].

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::NetworkError;

/// Frame `type` values used on the wire.
pub mod frame_type {
    pub const MESSAGE: &str = "message";
    pub const BROADCAST: &str = "broadcast";
    pub const REGISTER: &str = "register";
    pub const REGISTER_RESPONSE: &str = "register_response";
    pub const SYSTEM_REQUEST: &str = "system_request";
    pub const SYSTEM_RESPONSE: &str = "system_response";
}

/// A routable unit of communication between agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier (UUID v4).
    pub message_id: String,
    /// Agent id of the sender.
    pub sender_id: String,
    /// Target agent. `None` means broadcast.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    /// Protocol or mod name the receiver dispatches on.
    pub message_type: String,
    /// Opaque payload.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// When the message was created.
    pub timestamp: DateTime<Utc>,
    /// Shared by every copy of one broadcast fan-out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast_id: Option<String>,
}

impl Message {
    /// Create a message addressed to one agent.
    pub fn direct(
        sender_id: impl Into<String>,
        target_id: impl Into<String>,
        message_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(sender_id.into(), Some(target_id.into()), message_type.into(), payload)
    }

    /// Create a message for every connected agent except the sender.
    pub fn broadcast(
        sender_id: impl Into<String>,
        message_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(sender_id.into(), None, message_type.into(), payload)
    }

    fn new(
        sender_id: String,
        target_id: Option<String>,
        message_type: String,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            sender_id,
            target_id,
            message_type,
            payload,
            timestamp: Utc::now(),
            broadcast_id: None,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.target_id.is_none()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

// ---------------------------------------------------------------------------
// Routed envelope
// ---------------------------------------------------------------------------

/// Whether an envelope is a unicast or one copy of a broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Message,
    Broadcast,
}

/// The original message carried inside a [`RoutedEnvelope`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeContent {
    pub original_message_id: String,
    pub original_protocol: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Transport envelope around an application [`Message`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutedEnvelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub source_agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast_id: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    pub content: EnvelopeContent,
}

impl RoutedEnvelope {
    /// Wrap a unicast message.
    pub fn direct(message: &Message) -> Self {
        Self::wrap(message, EnvelopeKind::Message, None)
    }

    /// Wrap one copy of a broadcast fan-out.
    pub fn broadcast_copy(message: &Message, broadcast_id: &str) -> Self {
        Self::wrap(message, EnvelopeKind::Broadcast, Some(broadcast_id.to_string()))
    }

    fn wrap(message: &Message, kind: EnvelopeKind, broadcast_id: Option<String>) -> Self {
        Self {
            kind,
            source_agent_id: message.sender_id.clone(),
            target_agent_id: match kind {
                EnvelopeKind::Message => message.target_id.clone(),
                EnvelopeKind::Broadcast => None,
            },
            broadcast_id,
            timestamp: message.timestamp,
            content: EnvelopeContent {
                original_message_id: message.message_id.clone(),
                original_protocol: message.message_type.clone(),
                payload: message.payload.clone(),
            },
        }
    }

    /// Recover the application message.
    pub fn into_message(self) -> Message {
        Message {
            message_id: self.content.original_message_id,
            sender_id: self.source_agent_id,
            target_id: match self.kind {
                EnvelopeKind::Message => self.target_agent_id,
                EnvelopeKind::Broadcast => None,
            },
            message_type: self.content.original_protocol,
            payload: self.content.payload,
            timestamp: self.timestamp,
            broadcast_id: self.broadcast_id,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ---------------------------------------------------------------------------
// Inbound frame decoding
// ---------------------------------------------------------------------------

/// A decoded inbound text frame.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    /// An application message for the message handlers.
    Envelope(Message),
    /// A control-plane frame for the system handlers, kept raw.
    Control(serde_json::Value),
}

/// Classify and decode one inbound text frame.
///
/// `message`/`broadcast` frames are routed envelopes, except that a
/// `message` frame with a `data` object is the connector wrapper carrying
/// the [`Message`] fields directly. Register and system frames are handed
/// on undecoded. Anything else is a protocol error.
pub fn decode_frame(text: &str) -> Result<InboundFrame, NetworkError> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| NetworkError::Protocol(format!("Undecodable frame: {e}")))?;

    let frame_type = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| NetworkError::Protocol("Frame has no type".into()))?;

    match frame_type {
        frame_type::MESSAGE if value.get("data").is_some_and(|d| d.is_object()) => {
            let data = value.get("data").cloned().unwrap_or_default();
            let message: Message = serde_json::from_value(data)
                .map_err(|e| NetworkError::Protocol(format!("Bad connector message: {e}")))?;
            Ok(InboundFrame::Envelope(message))
        }
        frame_type::MESSAGE | frame_type::BROADCAST => {
            let envelope: RoutedEnvelope = serde_json::from_value(value)
                .map_err(|e| NetworkError::Protocol(format!("Bad envelope: {e}")))?;
            Ok(InboundFrame::Envelope(envelope.into_message()))
        }
        frame_type::REGISTER
        | frame_type::REGISTER_RESPONSE
        | frame_type::SYSTEM_REQUEST
        | frame_type::SYSTEM_RESPONSE => Ok(InboundFrame::Control(value)),
        other => Err(NetworkError::Protocol(format!("Unknown frame type '{other}'"))),
    }
}

// ---------------------------------------------------------------------------
// Broadcast de-duplication
// ---------------------------------------------------------------------------

/// Remembers recently seen broadcast ids so repeated copies are dropped.
#[derive(Debug)]
pub struct BroadcastDeduplicator {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl BroadcastDeduplicator {
    pub const DEFAULT_CAPACITY: usize = 1024;

    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns `true` the first time `broadcast_id` is seen.
    pub fn first_sighting(&mut self, broadcast_id: &str) -> bool {
        if self.seen.contains(broadcast_id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(broadcast_id.to_string());
        self.order.push_back(broadcast_id.to_string());
        true
    }

    /// Whether `message` should be delivered. Unicasts always are.
    pub fn accept(&mut self, message: &Message) -> bool {
        match &message.broadcast_id {
            Some(id) => self.first_sighting(id),
            None => true,
        }
    }
}

impl Default for BroadcastDeduplicator {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_message_creation() {
        let msg = Message::direct("alice", "bob", "chat", serde_json::json!({"text": "hi"}));
        assert_eq!(msg.sender_id, "alice");
        assert_eq!(msg.target_id.as_deref(), Some("bob"));
        assert!(!msg.is_broadcast());
        assert!(!msg.message_id.is_empty());
    }

    #[test]
    fn test_envelope_wire_shape() {
        let msg = Message::direct("alice", "bob", "chat", serde_json::json!({"text": "hi"}));
        let wire: serde_json::Value =
            serde_json::from_str(&RoutedEnvelope::direct(&msg).to_json().unwrap()).unwrap();

        assert_eq!(wire["type"], "message");
        assert_eq!(wire["source_agent_id"], "alice");
        assert_eq!(wire["target_agent_id"], "bob");
        assert_eq!(wire["content"]["original_message_id"], msg.message_id.as_str());
        assert_eq!(wire["content"]["original_protocol"], "chat");
        assert_eq!(wire["content"]["payload"]["text"], "hi");
        assert!(wire.get("broadcast_id").is_none());
    }

    #[test]
    fn test_broadcast_copy_preserves_identity() {
        let msg = Message::broadcast("alice", "announce", serde_json::json!({"n": 1}));
        let json = RoutedEnvelope::broadcast_copy(&msg, "b-1").to_json().unwrap();

        match decode_frame(&json).unwrap() {
            InboundFrame::Envelope(decoded) => {
                assert!(decoded.is_broadcast());
                assert_eq!(decoded.broadcast_id.as_deref(), Some("b-1"));
                assert_eq!(decoded.message_id, msg.message_id);
                assert_eq!(decoded.message_type, "announce");
            }
            other => panic!("expected envelope, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_connector_wrapper() {
        let msg = Message::direct("alice", "bob", "chat", serde_json::json!({"text": "yo"}));
        let frame = serde_json::json!({"type": "message", "data": msg}).to_string();

        match decode_frame(&frame).unwrap() {
            InboundFrame::Envelope(decoded) => assert_eq!(decoded, msg),
            other => panic!("expected envelope, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_control_frames() {
        for kind in ["register", "register_response", "system_request", "system_response"] {
            let frame = serde_json::json!({"type": kind, "command": "ping_agent"}).to_string();
            assert!(matches!(decode_frame(&frame), Ok(InboundFrame::Control(_))));
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode_frame("not json"), Err(NetworkError::Protocol(_))));
        assert!(matches!(decode_frame("{\"x\":1}"), Err(NetworkError::Protocol(_))));
        assert!(matches!(
            decode_frame("{\"type\":\"mystery\"}"),
            Err(NetworkError::Protocol(_))
        ));
        assert!(matches!(
            decode_frame("{\"type\":\"message\",\"source_agent_id\":\"a\"}"),
            Err(NetworkError::Protocol(_))
        ));
    }

    #[test]
    fn test_deduplicator_window() {
        let mut dedup = BroadcastDeduplicator::new(2);
        assert!(dedup.first_sighting("a"));
        assert!(!dedup.first_sighting("a"));
        assert!(dedup.first_sighting("b"));
        assert!(dedup.first_sighting("c"));
        // "a" fell out of the window.
        assert!(dedup.first_sighting("a"));

        let unicast = Message::direct("x", "y", "t", serde_json::Value::Null);
        assert!(dedup.accept(&unicast));
        assert!(dedup.accept(&unicast));
    }
}
