use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use crate::connection_manager::{ConnectionHandle, Promotion};
use crate::hub::SignalingHub;
use crate::websocket::{ErrorCode, MessageType, ServerMessage};

use super::AuthOutcome;

/// What happened to an authentication request or result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStatus {
    /// Credential handed to the authenticator
    Started,
    /// Authenticator could not take the attempt; client got UNKNOWN_ERROR
    Failed,
    /// Promoted and acknowledged
    Authenticated { evicted: bool },
    /// Connection vanished or server closing; result dropped
    Dropped,
}

/// Bridges authenticator results into registry promotions
pub struct AuthCoordinator {
    hub: Arc<SignalingHub>,
}

impl AuthCoordinator {
    pub fn new(hub: Arc<SignalingHub>) -> Self {
        Self { hub }
    }

    /// Hand a pending connection's credential to the authenticator
    #[tracing::instrument(name = "auth.begin", skip(self, handle, credential), fields(connection_id = %handle.id))]
    pub async fn begin(&self, handle: &ConnectionHandle, credential: String) -> AuthStatus {
        match self.hub.authenticator.authenticate(handle.id, credential).await {
            Ok(()) => AuthStatus::Started,
            Err(e) => {
                tracing::warn!(error = %e, "Unhandled error while starting authentication");
                let failure = ServerMessage::failure(MessageType::UserAuthentication, ErrorCode::UnknownError);
                if let Err(e) = handle.send(failure).await {
                    tracing::debug!(error = %e, "Failed to send authentication failure");
                }
                AuthStatus::Failed
            }
        }
    }

    /// Apply one successful verification
    #[tracing::instrument(
        name = "auth.complete",
        skip(self, outcome),
        fields(connection_id = %outcome.connection_id, user_id = %outcome.user_id)
    )]
    pub async fn complete(&self, outcome: AuthOutcome) -> AuthStatus {
        if self.hub.is_closing() {
            tracing::debug!("Server closing, ignoring authentication result");
            return AuthStatus::Dropped;
        }

        match self.hub.registry.promote(outcome.connection_id, &outcome.user_id) {
            Promotion::Vanished => AuthStatus::Dropped,
            Promotion::Promoted { handle, evicted } => {
                let ack = ServerMessage::user_authenticated(outcome.user_id.clone());
                if let Err(e) = handle.send(ack).await {
                    tracing::warn!(error = %e, "Failed to acknowledge authentication");
                }
                AuthStatus::Authenticated {
                    evicted: evicted.is_some(),
                }
            }
        }
    }

    /// Consume authenticator results until shutdown or the channel closes
    pub async fn run(
        self: Arc<Self>,
        mut outcomes: mpsc::Receiver<AuthOutcome>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        tracing::info!("Authentication coordinator started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Authentication coordinator received shutdown signal");
                    break;
                }
                outcome = outcomes.recv() => {
                    match outcome {
                        Some(outcome) => {
                            self.complete(outcome).await;
                        }
                        None => {
                            tracing::info!("Authentication outcome channel closed");
                            break;
                        }
                    }
                }
            }
        }

        tracing::info!("Authentication coordinator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::outcome_channel;
    use crate::hub::testing::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_complete_promotes_and_acknowledges() {
        let (hub, _) = hub();
        let coordinator = AuthCoordinator::new(hub.clone());
        let (handle, mut rx) = connect(&hub);

        let status = coordinator
            .complete(AuthOutcome {
                connection_id: handle.id,
                user_id: "42".to_string(),
            })
            .await;

        assert_eq!(status, AuthStatus::Authenticated { evicted: false });
        assert_eq!(hub.registry.user_of(handle.id).as_deref(), Some("42"));
        assert_eq!(drain(&mut rx), vec![r#"{"type":"USER_AUTHENTICATED","data":"42"}"#.to_string()]);
    }

    #[tokio::test]
    async fn test_second_session_evicts_first() {
        let (hub, _) = hub();
        let coordinator = AuthCoordinator::new(hub.clone());
        let (a, _ra) = connect(&hub);
        let (b, mut rb) = connect(&hub);

        coordinator
            .complete(AuthOutcome { connection_id: a.id, user_id: "42".into() })
            .await;
        let status = coordinator
            .complete(AuthOutcome { connection_id: b.id, user_id: "42".into() })
            .await;

        assert_eq!(status, AuthStatus::Authenticated { evicted: true });
        assert!(a.is_closed());
        assert_eq!(hub.registry.session("42").map(|h| h.id), Some(b.id));
        assert_eq!(drain(&mut rb).len(), 1);
    }

    #[tokio::test]
    async fn test_vanished_connection_is_dropped() {
        let (hub, _) = hub();
        let coordinator = AuthCoordinator::new(hub.clone());
        let (handle, mut rx) = connect(&hub);
        hub.disconnect(&handle).await;

        let status = coordinator
            .complete(AuthOutcome { connection_id: handle.id, user_id: "1".into() })
            .await;

        assert_eq!(status, AuthStatus::Dropped);
        assert!(hub.registry.session("1").is_none());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_results_ignored_while_closing() {
        let (hub, _) = hub();
        let coordinator = AuthCoordinator::new(hub.clone());
        let (handle, _rx) = connect(&hub);
        hub.begin_closing();

        let status = coordinator
            .complete(AuthOutcome { connection_id: handle.id, user_id: "1".into() })
            .await;

        assert_eq!(status, AuthStatus::Dropped);
        assert!(hub.registry.is_pending(handle.id));
    }

    #[tokio::test]
    async fn test_begin_failure_sends_unknown_error() {
        let authenticator = Arc::new(RecordingAuthenticator {
            fail: true,
            ..Default::default()
        });
        let hub = hub_with(Default::default(), authenticator);
        let coordinator = AuthCoordinator::new(hub.clone());
        let (handle, mut rx) = connect(&hub);

        assert_eq!(coordinator.begin(&handle, "token".into()).await, AuthStatus::Failed);
        assert_eq!(
            drain(&mut rx),
            vec![r#"{"type":"FAILURE","data":{"type":"USER_AUTHENTICATION","error":"UNKNOWN_ERROR"}}"#.to_string()]
        );
    }

    #[tokio::test]
    async fn test_run_applies_outcomes_until_shutdown() {
        let (hub, _) = hub();
        let coordinator = Arc::new(AuthCoordinator::new(hub.clone()));
        let (tx, rx) = outcome_channel(4);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (handle, _rx) = connect(&hub);

        let task = tokio::spawn(coordinator.clone().run(rx, shutdown_rx));
        tx.send(AuthOutcome { connection_id: handle.id, user_id: "5".into() })
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while hub.registry.user_of(handle.id).is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("outcome should be applied");

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("coordinator should stop")
            .expect("coordinator should not panic");
    }
}
