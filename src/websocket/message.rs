use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope types understood by clients and the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    UserAuthentication,
    Ping,
    Pong,
    PeerLog,
    JoinRoom,
    LeaveRoom,
    RoomMembers,
    Failure,
    ServerClosing,
    UserAuthenticated,
    Unknown,
}

/// Error codes carried by FAILURE envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotAuthenticated,
    UnknownError,
}

/// Control envelopes a client may send
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Authenticate(Value),
    Ping,
    PeerLog(Value),
    JoinRoom,
    LeaveRoom,
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: MessageType,
    #[serde(default)]
    data: Value,
}

impl ClientMessage {
    /// Classify an inbound text frame. Returns `None` for anything that is not
    /// a recognised client control envelope; those frames are relay candidates.
    pub fn parse(text: &str) -> Option<Self> {
        let raw: RawEnvelope = serde_json::from_str(text).ok()?;
        match raw.kind {
            MessageType::UserAuthentication => Some(Self::Authenticate(raw.data)),
            MessageType::Ping => Some(Self::Ping),
            MessageType::PeerLog => Some(Self::PeerLog(raw.data)),
            MessageType::JoinRoom => Some(Self::JoinRoom),
            MessageType::LeaveRoom => Some(Self::LeaveRoom),
            _ => None,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Authenticate(_) => MessageType::UserAuthentication,
            Self::Ping => MessageType::Ping,
            Self::PeerLog(_) => MessageType::PeerLog,
            Self::JoinRoom => MessageType::JoinRoom,
            Self::LeaveRoom => MessageType::LeaveRoom,
        }
    }
}

/// Diagnostic payload of a PEER_LOG envelope
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerLog {
    #[serde(default)]
    pub peer_id: Value,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub objects: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureData {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub error: ErrorCode,
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    UserAuthenticated(String),
    Pong,
    RoomMembers(Vec<String>),
    Failure(FailureData),
    ServerClosing,
}

impl ServerMessage {
    pub fn failure(message_type: MessageType, error: ErrorCode) -> Self {
        Self::Failure(FailureData {
            message_type,
            error,
        })
    }

    pub fn not_authenticated() -> Self {
        Self::failure(MessageType::Unknown, ErrorCode::NotAuthenticated)
    }

    pub fn user_authenticated(user_id: impl Into<String>) -> Self {
        Self::UserAuthenticated(user_id.into())
    }

    pub fn room_members(members: Vec<String>) -> Self {
        Self::RoomMembers(members)
    }
}

/// A frame queued for a connection's writer task
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    /// Serialized when written to the socket
    Envelope(ServerMessage),
    /// Already-encoded text: fan-out snapshots and relayed peer payloads
    Preserialized(Arc<str>),
}

impl OutboundMessage {
    pub fn preserialize(message: &ServerMessage) -> Result<Self, serde_json::Error> {
        let text = serde_json::to_string(message)?;
        Ok(Self::Preserialized(Arc::from(text)))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::Envelope(message) => serde_json::to_string(message),
            Self::Preserialized(text) => Ok(text.to_string()),
        }
    }
}

impl From<ServerMessage> for OutboundMessage {
    fn from(message: ServerMessage) -> Self {
        Self::Envelope(message)
    }
}
