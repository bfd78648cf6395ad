//! Graceful shutdown of the signaling relay.
//!
//! `stop` walks the controller from Running to Stopped:
//! 1. Raises the closing flag so the accept path and the sweeper refuse new work
//! 2. Stops the sweeper and waits a bounded time for its in-flight run
//! 3. Sends SERVER_CLOSING to every authenticated connection, then closes it.
//!    Pending connections are closed without an envelope.
//! 4. Polls the authenticated count a fixed number of times until it reaches zero

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::ShutdownSettings;
use crate::hub::SignalingHub;
use crate::websocket::ServerMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Draining,
    Stopped,
}

/// Result of a stop request
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// False when another stop already ran or is running
    pub initiated: bool,
    /// The sweeper finished within the bound
    pub sweeper_stopped: bool,
    /// Connections that accepted the closing envelope
    pub clients_notified: usize,
    pub pending_closed: usize,
    /// Authenticated connections still registered when polling ended
    pub residual_connections: usize,
    pub duration: Duration,
}

pub struct ShutdownController {
    hub: Arc<SignalingHub>,
    shutdown_tx: broadcast::Sender<()>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    state: Mutex<ShutdownState>,
    config: ShutdownSettings,
}

impl ShutdownController {
    pub fn new(
        hub: Arc<SignalingHub>,
        shutdown_tx: broadcast::Sender<()>,
        sweeper: Option<JoinHandle<()>>,
        config: ShutdownSettings,
    ) -> Self {
        Self {
            hub,
            shutdown_tx,
            sweeper: Mutex::new(sweeper),
            state: Mutex::new(ShutdownState::Running),
            config,
        }
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transition(&self, from: ShutdownState, to: ShutdownState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != from {
            return false;
        }
        *state = to;
        true
    }

    /// Execute the shutdown sequence. Only the first call does any work.
    #[tracing::instrument(
        name = "graceful_shutdown",
        skip(self),
        fields(authenticated = self.hub.registry.authenticated_count())
    )]
    pub async fn stop(&self) -> ShutdownReport {
        let start = Instant::now();
        let mut report = ShutdownReport::default();

        if !self.transition(ShutdownState::Running, ShutdownState::Draining) {
            tracing::debug!("Shutdown already requested");
            return report;
        }
        report.initiated = true;

        tracing::info!("Starting graceful shutdown - Phase 1: Refusing new work");
        self.hub.begin_closing();

        tracing::info!("Phase 2: Stopping background tasks");
        report.sweeper_stopped = self.stop_sweeper().await;

        tracing::info!("Phase 3: Notifying clients");
        report.clients_notified = self.notify_and_close().await;
        report.pending_closed = self.close_pending();

        tracing::info!("Phase 4: Waiting for connections to close");
        report.residual_connections = self.wait_for_connections_to_close().await;

        self.transition(ShutdownState::Draining, ShutdownState::Stopped);
        report.duration = start.elapsed();

        tracing::info!(
            sweeper_stopped = report.sweeper_stopped,
            clients_notified = report.clients_notified,
            pending_closed = report.pending_closed,
            residual_connections = report.residual_connections,
            duration_ms = report.duration.as_millis() as u64,
            "Graceful shutdown completed"
        );

        report
    }

    async fn stop_sweeper(&self) -> bool {
        let _ = self.shutdown_tx.send(());

        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(handle) = handle else {
            return true;
        };

        let abort = handle.abort_handle();
        let limit = Duration::from_millis(self.config.sweeper_stop_timeout_ms);
        match timeout(limit, handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Sweeper task failed");
                true
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.config.sweeper_stop_timeout_ms,
                    "Sweeper did not stop in time, aborting"
                );
                abort.abort();
                false
            }
        }
    }

    /// Send the closing envelope to every authenticated connection, then close it
    async fn notify_and_close(&self) -> usize {
        let sessions = self.hub.registry.snapshot();
        if sessions.is_empty() {
            return 0;
        }

        tracing::info!(
            total_connections = sessions.len(),
            "Sending shutdown notifications to clients"
        );

        let limit = Duration::from_millis(self.config.notify_timeout_ms);
        let mut futures = FuturesUnordered::new();
        for session in sessions {
            futures.push(async move {
                let notified = match timeout(limit, session.handle.send(ServerMessage::ServerClosing)).await {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        tracing::debug!(
                            connection_id = %session.handle.id,
                            error = %e,
                            "Failed to send shutdown notification"
                        );
                        false
                    }
                    Err(_) => {
                        tracing::debug!(
                            connection_id = %session.handle.id,
                            "Timeout sending shutdown notification"
                        );
                        false
                    }
                };
                session.handle.close();
                notified
            });
        }

        let mut notified = 0;
        while let Some(success) = futures.next().await {
            if success {
                notified += 1;
            }
        }
        notified
    }

    fn close_pending(&self) -> usize {
        self.hub
            .registry
            .pending_snapshot()
            .iter()
            .filter(|handle| self.hub.expire_pending(handle))
            .count()
    }

    /// Poll the authenticated count a bounded number of times, exiting at zero
    async fn wait_for_connections_to_close(&self) -> usize {
        let poll = Duration::from_millis(self.config.drain_poll_interval_ms);
        for attempt in 0..self.config.drain_attempts {
            let remaining = self.hub.registry.authenticated_count();
            if remaining == 0 {
                return 0;
            }
            tracing::debug!(attempt = attempt, remaining = remaining, "Waiting for connections to drain");
            tokio::time::sleep(poll).await;
        }

        let remaining = self.hub.registry.authenticated_count();
        if remaining > 0 {
            tracing::warn!(
                remaining_connections = remaining,
                "Some connections did not close gracefully"
            );
        }
        remaining
    }
}
