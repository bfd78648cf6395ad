use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::config::SignalingConfig;
use crate::hub::SignalingHub;
use crate::metrics::SweepMetrics;

/// Connections closed by one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_pending: usize,
    pub expired_inactive: usize,
}

/// Background task closing connections that outlived their timeouts
pub struct InvalidationSweeper {
    hub: Arc<SignalingHub>,
    config: SignalingConfig,
    shutdown: broadcast::Receiver<()>,
}

impl InvalidationSweeper {
    pub fn new(
        hub: Arc<SignalingHub>,
        config: SignalingConfig,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            hub,
            config,
            shutdown,
        }
    }

    /// Sweep on a fixed period until shutdown. The first sweep runs immediately.
    pub async fn run(mut self) {
        if self.config.sweep_interval_ms == 0 {
            tracing::warn!("Sweep interval of 0 ms, sweeping every millisecond instead");
        }
        let mut timer = tokio::time::interval(self.config.sweep_interval());

        tracing::info!(
            sweep_interval_ms = self.config.sweep_interval_ms,
            authentication_timeout_ms = self.config.authentication_timeout_ms,
            inactive_timeout_ms = self.config.inactive_timeout_ms,
            "Invalidation sweeper started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Invalidation sweeper received shutdown signal");
                    break;
                }
                _ = timer.tick() => {
                    if self.hub.is_closing() {
                        continue;
                    }
                    self.sweep_at(Utc::now()).await;
                }
            }
        }

        tracing::info!("Invalidation sweeper stopped");
    }

    /// Close every connection idle beyond its limit as of `now`
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let start = Instant::now();
        let report = SweepReport {
            expired_pending: self.expire_pending(now),
            expired_inactive: self.expire_inactive(now).await,
        };

        SweepMetrics::record_expired("authentication_timeout", report.expired_pending);
        SweepMetrics::record_expired("inactive_timeout", report.expired_inactive);
        SweepMetrics::record_duration(start.elapsed().as_secs_f64());

        if report.expired_pending > 0 || report.expired_inactive > 0 {
            tracing::info!(
                expired_pending = report.expired_pending,
                expired_inactive = report.expired_inactive,
                "Invalidated stale connections"
            );
        }

        report
    }

    fn expire_pending(&self, now: DateTime<Utc>) -> usize {
        let limit = self.config.authentication_timeout();
        let stale: Vec<_> = self
            .hub
            .registry
            .pending_snapshot()
            .into_iter()
            .filter(|handle| handle.is_idle(now, limit))
            .collect();

        let mut expired = 0;
        for handle in stale {
            if self.hub.expire_pending(&handle) {
                tracing::info!(
                    connection_id = %handle.id,
                    timeout_ms = limit.as_millis() as u64,
                    "Authentication timed out"
                );
                expired += 1;
            }
        }
        expired
    }

    async fn expire_inactive(&self, now: DateTime<Utc>) -> usize {
        let limit = self.config.inactive_timeout();
        let stale: Vec<_> = self
            .hub
            .registry
            .snapshot()
            .into_iter()
            .filter(|session| session.handle.is_idle(now, limit))
            .collect();

        let mut expired = 0;
        for session in stale {
            if self.hub.disconnect(&session.handle).await.is_some() {
                tracing::info!(
                    connection_id = %session.handle.id,
                    user_id = %session.user_id,
                    timeout_ms = limit.as_millis() as u64,
                    "Connection inactive, closing"
                );
                expired += 1;
            }
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::testing::*;
    use std::time::Duration;

    fn config() -> SignalingConfig {
        SignalingConfig {
            authentication_timeout_ms: 1_000,
            inactive_timeout_ms: 2_000,
            sweep_interval_ms: 50,
            ..Default::default()
        }
    }

    fn sweeper(hub: Arc<SignalingHub>) -> (InvalidationSweeper, broadcast::Sender<()>) {
        let (tx, rx) = broadcast::channel(1);
        (InvalidationSweeper::new(hub, config(), rx), tx)
    }

    fn after(ms: i64) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::milliseconds(ms)
    }

    #[tokio::test]
    async fn test_pending_beyond_authentication_timeout_is_closed() {
        let (hub, authenticator) = hub();
        let (stale, _rs) = connect(&hub);
        let (sweeper, _tx) = sweeper(hub.clone());

        assert_eq!(sweeper.sweep_at(after(500)).await, SweepReport::default());
        assert!(!stale.is_closed());

        let report = sweeper.sweep_at(after(1_500)).await;
        assert_eq!(report.expired_pending, 1);
        assert!(stale.is_closed());
        assert!(!hub.registry.is_pending(stale.id));
        assert_eq!(*authenticator.invalidated.lock().unwrap(), vec![stale.id]);
    }

    #[tokio::test]
    async fn test_authenticated_before_deadline_survives() {
        let (hub, _) = hub();
        let (handle, _rx) = connect(&hub);
        hub.registry.promote(handle.id, "1");
        let (sweeper, _tx) = sweeper(hub.clone());

        // Past the authentication timeout but within the inactivity timeout
        let report = sweeper.sweep_at(after(1_500)).await;
        assert_eq!(report, SweepReport::default());
        assert!(!handle.is_closed());
        assert_eq!(hub.registry.authenticated_count(), 1);
    }

    #[tokio::test]
    async fn test_inactive_session_is_closed_and_leaves_room() {
        let (hub, _) = hub();
        let (idle, _ri) = sign_in(&hub, "1");
        let (active, mut ra) = sign_in(&hub, "2");
        hub.rooms.join("1").await;
        drain(&mut ra);

        let now = after(2_500);
        active.touch_at(now);
        let (sweeper, _tx) = sweeper(hub.clone());

        let report = sweeper.sweep_at(now).await;
        assert_eq!(report.expired_inactive, 1);
        assert!(idle.is_closed());
        assert!(!active.is_closed());
        assert!(hub.registry.session("1").is_none());
        assert!(hub.rooms.members().await.is_empty());
        assert_eq!(drain(&mut ra), vec![r#"{"type":"ROOM_MEMBERS","data":[]}"#.to_string()]);
    }

    #[tokio::test]
    async fn test_ping_resets_inactivity_clock() {
        let (hub, _) = hub();
        let (handle, _rx) = sign_in(&hub, "1");
        let (sweeper, _tx) = sweeper(hub.clone());

        handle.touch_at(after(1_500));
        assert_eq!(sweeper.sweep_at(after(3_000)).await.expired_inactive, 0);
        assert_eq!(sweeper.sweep_at(after(4_000)).await.expired_inactive, 1);
    }

    #[tokio::test]
    async fn test_run_sweeps_immediately_and_stops_on_shutdown() {
        let (hub, _) = hub();
        let (handle, _rx) = connect(&hub);
        tokio::time::sleep(Duration::from_millis(5)).await;

        let (tx, rx) = broadcast::channel(1);
        let config = SignalingConfig {
            authentication_timeout_ms: 0,
            sweep_interval_ms: 60_000,
            ..Default::default()
        };
        let task = tokio::spawn(InvalidationSweeper::new(hub.clone(), config, rx).run());

        tokio::time::timeout(Duration::from_secs(1), handle.closed())
            .await
            .expect("first sweep should run immediately");

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("sweeper should stop")
            .expect("sweeper should not panic");
    }

    #[tokio::test]
    async fn test_run_skips_while_closing() {
        let (hub, _) = hub();
        let (handle, _rx) = connect(&hub);
        hub.begin_closing();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let (tx, rx) = broadcast::channel(1);
        let config = SignalingConfig {
            authentication_timeout_ms: 0,
            sweep_interval_ms: 10,
            ..Default::default()
        };
        let task = tokio::spawn(InvalidationSweeper::new(hub.clone(), config, rx).run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_closed());

        tx.send(()).unwrap();
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_zero_interval_keeps_sweeping() {
        let (hub, _) = hub();
        let (tx, rx) = broadcast::channel(1);
        let config = SignalingConfig {
            authentication_timeout_ms: 0,
            sweep_interval_ms: 0,
            ..Default::default()
        };
        let task = tokio::spawn(InvalidationSweeper::new(hub.clone(), config, rx).run());

        // Admitted after the first sweep, so only a repeated sweep can close it
        tokio::time::sleep(Duration::from_millis(20)).await;
        let (handle, _rx) = connect(&hub);
        tokio::time::timeout(Duration::from_secs(1), handle.closed())
            .await
            .expect("later sweep should close the pending connection");

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("sweeper should stop")
            .expect("sweeper should not panic");
    }
}
