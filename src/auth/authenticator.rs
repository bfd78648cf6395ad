//! Pluggable credential verification.
//!
//! An [`Authenticator`] accepts a credential for a pending connection and
//! reports success later through the outcome channel. Failed verification is
//! never reported; the connection simply stays pending until the sweeper
//! expires it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::{AbortHandle, Abortable};
use tokio::sync::mpsc;

use crate::config::{AuthConfig, JwtConfig};
use crate::connection_manager::{ConnectionId, UserId};
use crate::error::AppError;

use super::JwtValidator;

/// Successful verification of a pending connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthOutcome {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
}

/// Bounded channel carrying verification results to the coordinator
pub fn outcome_channel(capacity: usize) -> (mpsc::Sender<AuthOutcome>, mpsc::Receiver<AuthOutcome>) {
    mpsc::channel(capacity.max(1))
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Start verifying `credential` for a pending connection.
    ///
    /// `Err` means the attempt could not be started at all; bad credentials are
    /// not an error.
    async fn authenticate(&self, connection_id: ConnectionId, credential: String) -> Result<(), AppError>;

    /// Drop any in-flight verification state for the connection
    fn invalidate(&self, connection_id: ConnectionId);

    fn name(&self) -> &'static str;
}

/// In-flight verifications, abortable per connection
struct PendingAttempts {
    next_attempt: AtomicU64,
    attempts: Arc<DashMap<ConnectionId, (u64, AbortHandle)>>,
    outcomes: mpsc::Sender<AuthOutcome>,
}

impl PendingAttempts {
    fn new(outcomes: mpsc::Sender<AuthOutcome>) -> Self {
        Self {
            next_attempt: AtomicU64::new(0),
            attempts: Arc::new(DashMap::new()),
            outcomes,
        }
    }

    /// Run `verify` in the background and report its user id on success.
    /// A newer attempt for the same connection replaces the older one.
    fn spawn<F>(&self, connection_id: ConnectionId, verify: F)
    where
        F: Future<Output = Option<UserId>> + Send + 'static,
    {
        let attempt = self.next_attempt.fetch_add(1, Ordering::Relaxed);
        let (abort_handle, registration) = AbortHandle::new_pair();
        if let Some((_, (_, previous))) = self.attempts.remove(&connection_id) {
            previous.abort();
        }
        self.attempts.insert(connection_id, (attempt, abort_handle));

        let attempts = self.attempts.clone();
        let outcomes = self.outcomes.clone();
        let task = async move {
            if let Some(user_id) = verify.await {
                if outcomes
                    .send(AuthOutcome {
                        connection_id,
                        user_id,
                    })
                    .await
                    .is_err()
                {
                    tracing::warn!(
                        connection_id = %connection_id,
                        "Authentication outcome channel closed, dropping result"
                    );
                }
            }
            attempts.remove_if(&connection_id, |_, (id, _)| *id == attempt);
        };
        tokio::spawn(Abortable::new(task, registration));
    }

    fn invalidate(&self, connection_id: ConnectionId) -> bool {
        match self.attempts.remove(&connection_id) {
            Some((_, (_, handle))) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.attempts.len()
    }
}

/// Verifies bearer JWTs; the user id is the `sub` claim
pub struct JwtAuthenticator {
    validator: Arc<JwtValidator>,
    attempts: PendingAttempts,
}

impl JwtAuthenticator {
    pub fn new(config: &JwtConfig, outcomes: mpsc::Sender<AuthOutcome>) -> Self {
        Self {
            validator: Arc::new(JwtValidator::new(config)),
            attempts: PendingAttempts::new(outcomes),
        }
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn authenticate(&self, connection_id: ConnectionId, credential: String) -> Result<(), AppError> {
        let validator = self.validator.clone();
        self.attempts.spawn(connection_id, async move {
            match validator.verify(&credential) {
                Ok(user_id) => Some(user_id),
                Err(e) => {
                    tracing::warn!(
                        connection_id = %connection_id,
                        error = %e,
                        "JWT verification failed"
                    );
                    None
                }
            }
        });
        Ok(())
    }

    fn invalidate(&self, connection_id: ConnectionId) {
        if self.attempts.invalidate(connection_id) {
            tracing::debug!(connection_id = %connection_id, "Aborted in-flight JWT verification");
        }
    }

    fn name(&self) -> &'static str {
        "jwt"
    }
}

/// Shared-secret table: each secret maps to one user id
pub struct StaticAuthenticator {
    credentials: Arc<HashMap<String, UserId>>,
    attempts: PendingAttempts,
}

impl StaticAuthenticator {
    pub fn new(credentials: HashMap<String, UserId>, outcomes: mpsc::Sender<AuthOutcome>) -> Self {
        Self {
            credentials: Arc::new(credentials),
            attempts: PendingAttempts::new(outcomes),
        }
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(&self, connection_id: ConnectionId, credential: String) -> Result<(), AppError> {
        let credentials = self.credentials.clone();
        self.attempts.spawn(connection_id, async move {
            let user_id = credentials.get(&credential).cloned();
            if user_id.is_none() {
                tracing::warn!(connection_id = %connection_id, "Unknown credential");
            }
            user_id
        });
        Ok(())
    }

    fn invalidate(&self, connection_id: ConnectionId) {
        self.attempts.invalidate(connection_id);
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

/// Create an authenticator based on configuration.
///
/// - `"static"`: shared secrets from `auth.credentials`
/// - `"jwt"` (default): HMAC-signed JWTs, requires `jwt.secret`
pub fn create_authenticator(
    auth: &AuthConfig,
    jwt: &JwtConfig,
    outcomes: mpsc::Sender<AuthOutcome>,
) -> Result<Arc<dyn Authenticator>, AppError> {
    match auth.backend.as_str() {
        "static" => {
            tracing::info!(
                backend = "static",
                credentials = auth.credentials.len(),
                "Creating static authenticator"
            );
            Ok(Arc::new(StaticAuthenticator::new(auth.credentials.clone(), outcomes)))
        }
        "jwt" => {
            if jwt.secret.is_empty() {
                return Err(AppError::Config(config::ConfigError::Message(
                    "jwt.secret is required for the jwt authenticator".to_string(),
                )));
            }
            tracing::info!(backend = "jwt", "Creating JWT authenticator");
            Ok(Arc::new(JwtAuthenticator::new(jwt, outcomes)))
        }
        other => Err(AppError::Config(config::ConfigError::Message(format!(
            "unknown auth backend: {}",
            other
        )))),
    }
}
