//! Connection handle and related types

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use uuid::Uuid;

use crate::websocket::OutboundMessage;

/// Verified user identity bound to an authenticated connection
pub type UserId = String;

/// Opaque, stable identity of a transport connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Why an outbound frame could not be queued
#[derive(Debug, Error)]
pub enum SendError {
    #[error("connection is closed")]
    Closed,
    #[error("outbound buffer is full")]
    Full,
    #[error("send timed out after {0:?}")]
    Timeout(Duration),
}

/// Handle for a single signaling connection, independent of the socket library
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub remote_addr: Option<SocketAddr>,
    pub connected_at: DateTime<Utc>,
    sender: mpsc::Sender<OutboundMessage>,
    send_timeout: Duration,
    /// Last liveness event (Unix millis); only ever moves forward
    active_at: AtomicI64,
    closed: watch::Sender<bool>,
}

impl ConnectionHandle {
    pub fn new(
        remote_addr: Option<SocketAddr>,
        sender: mpsc::Sender<OutboundMessage>,
        send_timeout: Duration,
    ) -> Self {
        let now = Utc::now();
        let (closed, _) = watch::channel(false);
        Self {
            id: ConnectionId::new(),
            remote_addr,
            connected_at: now,
            sender,
            send_timeout,
            active_at: AtomicI64::new(now.timestamp_millis()),
            closed,
        }
    }

    /// Record a liveness event now
    pub fn touch(&self) {
        self.touch_at(Utc::now());
    }

    /// Record a liveness event at `at`. Earlier timestamps are ignored.
    pub fn touch_at(&self, at: DateTime<Utc>) {
        self.active_at
            .fetch_max(at.timestamp_millis(), Ordering::AcqRel);
    }

    pub fn active_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.active_at.load(Ordering::Acquire))
            .unwrap_or(self.connected_at)
    }

    /// True once `now - active_at` exceeds `limit`
    pub fn is_idle(&self, now: DateTime<Utc>, limit: Duration) -> bool {
        let idle_ms = now.timestamp_millis() - self.active_at.load(Ordering::Acquire);
        idle_ms > limit.as_millis() as i64
    }

    /// Queue a frame, waiting at most the configured send timeout for buffer space
    pub async fn send(&self, message: impl Into<OutboundMessage>) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        match timeout(self.send_timeout, self.sender.send(message.into())).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendError::Closed),
            Err(_) => Err(SendError::Timeout(self.send_timeout)),
        }
    }

    /// Queue a frame without waiting
    pub fn try_send(&self, message: impl Into<OutboundMessage>) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        self.sender.try_send(message.into()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Signal the transport to close. Returns true only for the call that closed it.
    pub fn close(&self) -> bool {
        !self.closed.send_replace(true)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once `close` has been called
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("active_at", &self.active_at())
            .field("closed", &self.is_closed())
            .finish()
    }
}
