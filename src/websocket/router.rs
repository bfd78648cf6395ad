//! Inbound frame dispatch and peer relay.
//!
//! Frames from a pending connection must be USER_AUTHENTICATION envelopes.
//! Frames from an authenticated connection are either control envelopes or
//! relay payloads addressed by `from`/`to` user ids. Relay payloads are
//! forwarded as the exact text received.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::auth::{AuthCoordinator, AuthStatus};
use crate::connection_manager::ConnectionHandle;
use crate::hub::SignalingHub;
use crate::metrics::RelayMetrics;

use super::message::{ClientMessage, ErrorCode, MessageType, OutboundMessage, PeerLog, ServerMessage};

/// Outcome of relaying one payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Delivered,
    /// Not a relay envelope (no usable `from`/`to`)
    Malformed,
    /// `from` differs from the user bound to the sending connection
    Spoofed,
    /// Recipient has no live authenticated session
    Offline,
    /// Recipient's transport rejected the frame
    SendFailed,
}

impl RelayOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Malformed => "malformed",
            Self::Spoofed => "spoofed",
            Self::Offline => "offline",
            Self::SendFailed => "send_failed",
        }
    }
}

/// How an inbound frame was handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Authentication(AuthStatus),
    /// USER_AUTHENTICATION whose data is not a credential string
    MalformedAuthentication,
    /// Non-authentication frame on a pending connection
    NotAuthenticated,
    Pong,
    PeerLog,
    Room { changed: bool },
    Relay(RelayOutcome),
}

/// User ids appear as JSON strings or integers
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PeerId {
    Number(i64),
    Text(String),
}

impl PeerId {
    fn into_user_id(self) -> String {
        match self {
            Self::Number(n) => n.to_string(),
            Self::Text(s) => s,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RelayEnvelope {
    from: PeerId,
    to: PeerId,
}

pub struct PeerRouter {
    hub: Arc<SignalingHub>,
    coordinator: Arc<AuthCoordinator>,
}

impl PeerRouter {
    pub fn new(hub: Arc<SignalingHub>, coordinator: Arc<AuthCoordinator>) -> Self {
        Self { hub, coordinator }
    }

    /// Route one inbound text frame
    #[tracing::instrument(name = "ws.message", skip(self, handle, text), fields(connection_id = %handle.id))]
    pub async fn handle_text(&self, handle: &Arc<ConnectionHandle>, text: &str) -> Dispatch {
        let user_id = self.hub.registry.user_of(handle.id);
        let message = ClientMessage::parse(text);

        let Some(user_id) = user_id else {
            return match message {
                Some(ClientMessage::Authenticate(data)) => self.authenticate(handle, data).await,
                other => {
                    tracing::debug!(
                        message_type = ?other.as_ref().map(ClientMessage::message_type),
                        "Message from unauthenticated connection rejected"
                    );
                    send_or_log(handle, ServerMessage::not_authenticated()).await;
                    Dispatch::NotAuthenticated
                }
            };
        };

        match message {
            Some(ClientMessage::Ping) => {
                self.hub.registry.touch(handle.id);
                send_or_log(handle, ServerMessage::Pong).await;
                Dispatch::Pong
            }
            Some(ClientMessage::PeerLog(data)) => {
                log_peer_message(&user_id, data);
                Dispatch::PeerLog
            }
            Some(ClientMessage::JoinRoom) => Dispatch::Room {
                changed: self.hub.rooms.join(&user_id).await,
            },
            Some(ClientMessage::LeaveRoom) => Dispatch::Room {
                changed: self.hub.rooms.leave(&user_id).await,
            },
            // Re-authentication on a bound connection falls through to relay
            Some(ClientMessage::Authenticate(_)) | None => {
                Dispatch::Relay(self.relay(&user_id, text).await)
            }
        }
    }

    async fn authenticate(&self, handle: &ConnectionHandle, data: Value) -> Dispatch {
        match data {
            Value::String(credential) => {
                Dispatch::Authentication(self.coordinator.begin(handle, credential).await)
            }
            other => {
                tracing::warn!(data = %other, "Malformed authentication envelope");
                let failure = ServerMessage::failure(MessageType::UserAuthentication, ErrorCode::UnknownError);
                send_or_log(handle, failure).await;
                Dispatch::MalformedAuthentication
            }
        }
    }

    /// Forward `text` unchanged to the user named in its `to` field
    pub async fn relay(&self, sender_user_id: &str, text: &str) -> RelayOutcome {
        let outcome = self.forward(sender_user_id, text).await;
        RelayMetrics::record(outcome.as_str());
        outcome
    }

    async fn forward(&self, sender_user_id: &str, text: &str) -> RelayOutcome {
        let envelope: RelayEnvelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(user_id = %sender_user_id, error = %e, "Problem while handling peer event");
                return RelayOutcome::Malformed;
            }
        };

        let from = envelope.from.into_user_id();
        if from != sender_user_id {
            tracing::warn!(
                user_id = %sender_user_id,
                from = %from,
                "Origin user id is not equal to from field, skipping"
            );
            return RelayOutcome::Spoofed;
        }

        let to = envelope.to.into_user_id();
        let Some(destination) = self.hub.registry.session(&to) else {
            tracing::warn!(from = %from, to = %to, "Destination user is not connected, skipping");
            return RelayOutcome::Offline;
        };

        match destination
            .send(OutboundMessage::Preserialized(Arc::from(text)))
            .await
        {
            Ok(()) => {
                tracing::debug!(from = %from, to = %to, "Relayed peer event");
                RelayOutcome::Delivered
            }
            Err(e) => {
                tracing::error!(from = %from, to = %to, error = %e, "Fail to send message to client");
                RelayOutcome::SendFailed
            }
        }
    }
}

async fn send_or_log(handle: &ConnectionHandle, message: ServerMessage) {
    if let Err(e) = handle.send(message).await {
        tracing::debug!(connection_id = %handle.id, error = %e, "Failed to send envelope");
    }
}

/// Best-effort diagnostic sink; never surfaces errors
fn log_peer_message(user_id: &str, data: Value) {
    match serde_json::from_value::<PeerLog>(data) {
        Ok(log) => {
            tracing::info!(
                user_id = %user_id,
                peer_id = %log.peer_id,
                objects = ?log.objects,
                "Peer log: {}",
                log.message
            );
        }
        Err(e) => {
            tracing::warn!(user_id = %user_id, error = %e, "Unhandled peer log payload");
        }
    }
}
