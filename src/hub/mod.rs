//! Shared signaling state: registry, room and authenticator, plus the
//! closing flag consulted by every path that starts new work.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::auth::Authenticator;
use crate::config::SignalingConfig;
use crate::connection_manager::{Admission, ConnectionHandle, ConnectionRegistry, RemovedConnection};
use crate::metrics::ConnectionMetrics;
use crate::room::RoomTracker;
use crate::websocket::OutboundMessage;

pub struct SignalingHub {
    pub registry: Arc<ConnectionRegistry>,
    pub rooms: Arc<RoomTracker>,
    pub authenticator: Arc<dyn Authenticator>,
    closing: AtomicBool,
}

impl SignalingHub {
    pub fn new(config: &SignalingConfig, authenticator: Arc<dyn Authenticator>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(
            config.max_connections,
            config.send_timeout(),
        ));
        let rooms = Arc::new(RoomTracker::new(registry.clone()));
        Self {
            registry,
            rooms,
            authenticator,
            closing: AtomicBool::new(false),
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Raise the closing flag. Returns false if it was already raised.
    pub fn begin_closing(&self) -> bool {
        !self.closing.swap(true, Ordering::AcqRel)
    }

    /// Register a freshly accepted transport as pending. Refused while closing
    /// or at capacity.
    pub fn admit(
        &self,
        remote_addr: Option<SocketAddr>,
        sender: mpsc::Sender<OutboundMessage>,
    ) -> Admission {
        if self.is_closing() {
            tracing::info!(remote_addr = ?remote_addr, "Server closing, refusing new connection");
            return Admission::Closing;
        }

        let admission = self.registry.admit_pending(remote_addr, sender);
        if let Admission::Admitted(handle) = &admission {
            // Shutdown may have closed the pending set just before the insert
            if self.is_closing() {
                self.expire_pending(handle);
                tracing::info!(connection_id = %handle.id, "Server closing, dropped new connection");
                return Admission::Closing;
            }
        }
        admission
    }

    /// Close a connection and drop it from the registry, cascading to the
    /// authenticator (pending) or the room (authenticated). Idempotent.
    pub async fn disconnect(&self, handle: &ConnectionHandle) -> Option<RemovedConnection> {
        handle.close();
        let removed = self.registry.remove(handle.id);

        match &removed {
            Some(RemovedConnection::Pending) => {
                self.authenticator.invalidate(handle.id);
            }
            Some(RemovedConnection::Authenticated(user_id)) => {
                self.rooms.on_disconnect(user_id).await;
            }
            None => {}
        }

        if removed.is_some() {
            let duration = (chrono::Utc::now() - handle.connected_at)
                .to_std()
                .unwrap_or_default();
            ConnectionMetrics::record_closed(duration.as_secs_f64());
        }

        removed
    }

    /// Close a connection that is still pending. A connection promoted
    /// before this runs is left alone.
    pub fn expire_pending(&self, handle: &ConnectionHandle) -> bool {
        if self.registry.expire_pending(handle.id).is_none() {
            return false;
        }
        handle.close();
        self.authenticator.invalidate(handle.id);
        let duration = (chrono::Utc::now() - handle.connected_at)
            .to_std()
            .unwrap_or_default();
        ConnectionMetrics::record_closed(duration.as_secs_f64());
        true
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Helpers shared by unit tests across modules

    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::connection_manager::ConnectionId;
    use crate::error::AppError;

    /// Records calls and never reports success on its own
    #[derive(Default)]
    pub(crate) struct RecordingAuthenticator {
        pub(crate) attempts: Mutex<Vec<(ConnectionId, String)>>,
        pub(crate) invalidated: Mutex<Vec<ConnectionId>>,
        pub(crate) fail: bool,
    }

    #[async_trait]
    impl Authenticator for RecordingAuthenticator {
        async fn authenticate(&self, connection_id: ConnectionId, credential: String) -> Result<(), AppError> {
            if self.fail {
                return Err(AppError::Internal("identity provider unavailable".to_string()));
            }
            self.attempts.lock().unwrap().push((connection_id, credential));
            Ok(())
        }

        fn invalidate(&self, connection_id: ConnectionId) {
            self.invalidated.lock().unwrap().push(connection_id);
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    pub(crate) fn hub_with(config: SignalingConfig, authenticator: Arc<RecordingAuthenticator>) -> Arc<SignalingHub> {
        Arc::new(SignalingHub::new(&config, authenticator))
    }

    pub(crate) fn hub() -> (Arc<SignalingHub>, Arc<RecordingAuthenticator>) {
        let authenticator = Arc::new(RecordingAuthenticator::default());
        (hub_with(SignalingConfig::default(), authenticator.clone()), authenticator)
    }

    pub(crate) fn connect(hub: &SignalingHub) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(32);
        match hub.registry.admit_pending(None, tx) {
            Admission::Admitted(handle) => (handle, rx),
            other => panic!("admission refused: {:?}", other),
        }
    }

    pub(crate) fn sign_in(hub: &SignalingHub, user_id: &str) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundMessage>) {
        let (handle, rx) = connect(hub);
        hub.registry.promote(handle.id, user_id);
        (handle, rx)
    }

    pub(crate) fn drain(rx: &mut mpsc::Receiver<OutboundMessage>) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(message) = rx.try_recv() {
            frames.push(message.to_json().unwrap());
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[tokio::test]
    async fn test_disconnect_pending_invalidates_authenticator() {
        let (hub, authenticator) = hub();
        let (handle, _rx) = connect(&hub);

        assert_eq!(hub.disconnect(&handle).await, Some(RemovedConnection::Pending));
        assert!(handle.is_closed());
        assert_eq!(*authenticator.invalidated.lock().unwrap(), vec![handle.id]);
    }

    #[tokio::test]
    async fn test_disconnect_authenticated_leaves_room() {
        let (hub, _) = hub();
        let (leaving, _rl) = sign_in(&hub, "1");
        let (_observer, mut observer_rx) = sign_in(&hub, "2");
        hub.rooms.join("1").await;
        drain(&mut observer_rx);

        assert_eq!(
            hub.disconnect(&leaving).await,
            Some(RemovedConnection::Authenticated("1".to_string()))
        );
        assert!(hub.rooms.members().await.is_empty());
        assert_eq!(drain(&mut observer_rx).len(), 1);

        // Second close is a no-op
        assert_eq!(hub.disconnect(&leaving).await, None);
        assert!(drain(&mut observer_rx).is_empty());
    }

    #[tokio::test]
    async fn test_evicted_session_close_keeps_user_in_room() {
        let (hub, _) = hub();
        let (old, _ro) = sign_in(&hub, "42");
        hub.rooms.join("42").await;
        let (_new, _rn) = sign_in(&hub, "42");

        assert_eq!(hub.disconnect(&old).await, None);
        assert_eq!(hub.rooms.members().await, vec!["42".to_string()]);
    }

    #[tokio::test]
    async fn test_expire_pending_skips_promoted_connection() {
        let (hub, authenticator) = hub();
        let (waiting, _rw) = connect(&hub);
        let (promoted, _rp) = connect(&hub);
        hub.registry.promote(promoted.id, "7");

        assert!(hub.expire_pending(&waiting));
        assert!(waiting.is_closed());
        assert!(!hub.expire_pending(&promoted));
        assert!(!promoted.is_closed());
        assert_eq!(*authenticator.invalidated.lock().unwrap(), vec![waiting.id]);
        assert_eq!(hub.registry.open_count(), 1);
    }

    #[test]
    fn test_admit_refused_while_closing() {
        let (hub, _) = hub();
        let (tx, _rx) = mpsc::channel(4);
        assert!(matches!(hub.admit(None, tx), Admission::Admitted(_)));

        hub.begin_closing();
        let (tx, _rx) = mpsc::channel(4);
        assert!(matches!(hub.admit(None, tx), Admission::Closing));
        assert_eq!(hub.registry.pending_count(), 1);
        assert_eq!(hub.registry.open_count(), 1);
    }

    #[test]
    fn test_begin_closing_once() {
        let (hub, _) = hub();
        assert!(!hub.is_closing());
        assert!(hub.begin_closing());
        assert!(!hub.begin_closing());
        assert!(hub.is_closing());
    }
}
