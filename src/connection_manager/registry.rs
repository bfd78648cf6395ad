use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::metrics::ConnectionMetrics;
use crate::websocket::OutboundMessage;

use super::stats::RegistryStats;
use super::types::{ConnectionHandle, ConnectionId, UserId};

/// Result of admitting a freshly accepted transport
#[derive(Debug)]
pub enum Admission {
    Admitted(Arc<ConnectionHandle>),
    /// Capacity reached; nothing was registered
    Refused { open: usize, max: usize },
    /// The relay is shutting down; nothing stays registered
    Closing,
}

/// Result of binding a pending connection to a verified user
#[derive(Debug)]
pub enum Promotion {
    Promoted {
        handle: Arc<ConnectionHandle>,
        /// Previous session of the same user, already closed and unregistered
        evicted: Option<Arc<ConnectionHandle>>,
    },
    /// The connection disappeared before verification finished
    Vanished,
}

/// What `remove` took out of the registry
#[derive(Debug, Clone, PartialEq)]
pub enum RemovedConnection {
    Pending,
    Authenticated(UserId),
}

/// Point-in-time view of one authenticated session
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub user_id: UserId,
    pub handle: Arc<ConnectionHandle>,
}

/// Authoritative store of every live connection and its trust state.
///
/// A connection id lives in exactly one of `pending` or `user_by_connection`.
/// `sessions` is the primary authenticated index and holds at most one
/// connection per user; promotions for the same user are serialized through
/// the `sessions` entry lock. No method holds a guard of one map while
/// acquiring another, except `promote`, which always locks `sessions` first.
pub struct ConnectionRegistry {
    max_connections: usize,
    send_timeout: Duration,
    /// Pending + authenticated
    open: AtomicUsize,
    pending: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    /// Valid only while authenticated
    user_by_connection: DashMap<ConnectionId, UserId>,
    sessions: DashMap<UserId, Arc<ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize, send_timeout: Duration) -> Self {
        Self {
            max_connections,
            send_timeout,
            open: AtomicUsize::new(0),
            pending: DashMap::new(),
            user_by_connection: DashMap::new(),
            sessions: DashMap::new(),
        }
    }

    /// Register a newly accepted transport as pending, unless the registry is full
    pub fn admit_pending(
        &self,
        remote_addr: Option<SocketAddr>,
        sender: mpsc::Sender<OutboundMessage>,
    ) -> Admission {
        let max = self.max_connections;
        if let Err(open) = self
            .open
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| {
                (open < max).then_some(open + 1)
            })
        {
            ConnectionMetrics::record_refused();
            tracing::warn!(
                open = open,
                max = max,
                remote_addr = ?remote_addr,
                "Connection limit reached, refusing new connection"
            );
            return Admission::Refused { open, max };
        }

        let handle = Arc::new(ConnectionHandle::new(remote_addr, sender, self.send_timeout));
        self.pending.insert(handle.id, handle.clone());
        ConnectionMetrics::record_accepted();

        tracing::info!(
            connection_id = %handle.id,
            remote_addr = ?remote_addr,
            "Pending connection registered"
        );

        Admission::Admitted(handle)
    }

    /// Move a pending connection to the authenticated state.
    ///
    /// Any live session already owned by `user_id` is closed and unregistered
    /// inside the same critical section, so two sessions of one user are never
    /// observable together.
    pub fn promote(&self, connection_id: ConnectionId, user_id: &str) -> Promotion {
        let entry = self.sessions.entry(user_id.to_string());

        let Some((_, handle)) = self.pending.remove(&connection_id) else {
            tracing::info!(
                connection_id = %connection_id,
                user_id = %user_id,
                "Connection vanished before promotion, dropping authentication"
            );
            return Promotion::Vanished;
        };
        self.user_by_connection
            .insert(connection_id, user_id.to_string());

        // Closed while verification was in flight: the disconnect path may have
        // missed both maps, so undo the move here.
        if handle.is_closed() {
            if self.user_by_connection.remove(&connection_id).is_some() {
                self.release_slot();
            }
            tracing::info!(
                connection_id = %connection_id,
                user_id = %user_id,
                "Connection closed during authentication, dropping promotion"
            );
            return Promotion::Vanished;
        }

        let evicted = match entry {
            Entry::Occupied(mut occupied) => Some(occupied.insert(handle.clone())),
            Entry::Vacant(vacant) => {
                vacant.insert(handle.clone());
                None
            }
        };

        if let Some(previous) = &evicted {
            if self.user_by_connection.remove(&previous.id).is_some() {
                self.release_slot();
            }
            previous.close();
            ConnectionMetrics::record_eviction();
            tracing::info!(
                user_id = %user_id,
                evicted_connection_id = %previous.id,
                connection_id = %connection_id,
                "Evicted previous session for user"
            );
        }

        ConnectionMetrics::record_authenticated();
        tracing::info!(
            connection_id = %connection_id,
            user_id = %user_id,
            "Connection authenticated"
        );

        Promotion::Promoted { handle, evicted }
    }

    /// Record a liveness event for a connection in either state
    pub fn touch(&self, connection_id: ConnectionId) -> bool {
        match self.handle(connection_id) {
            Some(handle) => {
                handle.touch();
                true
            }
            None => false,
        }
    }

    /// Delete a connection from whichever index holds it.
    ///
    /// Callers close the handle first; a promotion racing with the removal
    /// then rolls itself back.
    pub fn remove(&self, connection_id: ConnectionId) -> Option<RemovedConnection> {
        if self.pending.remove(&connection_id).is_some() {
            self.release_slot();
            tracing::debug!(connection_id = %connection_id, "Pending connection removed");
            return Some(RemovedConnection::Pending);
        }

        let (_, user_id) = self.user_by_connection.remove(&connection_id)?;
        self.sessions
            .remove_if(&user_id, |_, handle| handle.id == connection_id);
        self.release_slot();
        tracing::debug!(
            connection_id = %connection_id,
            user_id = %user_id,
            "Authenticated connection removed"
        );
        Some(RemovedConnection::Authenticated(user_id))
    }

    /// Take a connection out of the pending index only. Returns None if it
    /// was promoted or removed in the meantime.
    pub fn expire_pending(&self, connection_id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        let (_, handle) = self.pending.remove(&connection_id)?;
        self.release_slot();
        Some(handle)
    }

    /// User bound to a connection, if it is authenticated
    pub fn user_of(&self, connection_id: ConnectionId) -> Option<UserId> {
        self.user_by_connection
            .get(&connection_id)
            .map(|user| user.value().clone())
    }

    /// Live session of a user
    pub fn session(&self, user_id: &str) -> Option<Arc<ConnectionHandle>> {
        self.sessions.get(user_id).map(|h| h.value().clone())
    }

    /// Look up a connection in either state
    pub fn handle(&self, connection_id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        if let Some(handle) = self.pending.get(&connection_id) {
            return Some(handle.value().clone());
        }
        let user_id = self.user_of(connection_id)?;
        self.session(&user_id)
            .filter(|handle| handle.id == connection_id)
    }

    pub fn is_pending(&self, connection_id: ConnectionId) -> bool {
        self.pending.contains_key(&connection_id)
    }

    /// Authenticated sessions at this instant
    pub fn snapshot(&self) -> Vec<SessionEntry> {
        self.sessions
            .iter()
            .map(|entry| SessionEntry {
                user_id: entry.key().clone(),
                handle: entry.value().clone(),
            })
            .collect()
    }

    /// Pending connections at this instant
    pub fn pending_snapshot(&self) -> Vec<Arc<ConnectionHandle>> {
        self.pending.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn open_count(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn authenticated_count(&self) -> usize {
        self.user_by_connection.len()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            open_connections: self.open_count(),
            pending_connections: self.pending_count(),
            authenticated_connections: self.authenticated_count(),
            max_connections: self.max_connections,
        }
    }

    fn release_slot(&self) {
        let _ = self
            .open
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| open.checked_sub(1));
    }
}
