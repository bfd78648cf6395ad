//! Global presence room.
//!
//! Membership is a set of user ids. Every change is broadcast to all
//! authenticated connections, not just members. The membership mutex is the
//! single ordering point: the set mutation, the change decision and the
//! enqueueing of the snapshot happen under one lock, so broadcasts leave in
//! the same order as the mutations that caused them.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::connection_manager::{ConnectionRegistry, SendError, UserId};
use crate::metrics::RoomMetrics;
use crate::websocket::{OutboundMessage, ServerMessage};

/// Delivery summary of one membership broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastResult {
    pub delivered: usize,
    pub failed: usize,
}

pub struct RoomTracker {
    members: Mutex<BTreeSet<UserId>>,
    registry: Arc<ConnectionRegistry>,
}

impl RoomTracker {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            members: Mutex::new(BTreeSet::new()),
            registry,
        }
    }

    /// Add a user. Returns whether membership changed.
    ///
    /// A user whose session closed after the caller looked it up is not
    /// added, since no later disconnect would remove it.
    pub async fn join(&self, user_id: &str) -> bool {
        let mut members = self.members.lock().await;
        if self.registry.session(user_id).is_none() {
            tracing::info!(user_id = %user_id, "Join from user without a live session ignored");
            return false;
        }
        let changed = members.insert(user_id.to_string());
        if changed {
            self.broadcast_locked(&members);
        } else {
            tracing::info!(user_id = %user_id, "Room unchanged by join");
        }
        changed
    }

    /// Remove a user. Returns whether membership changed.
    pub async fn leave(&self, user_id: &str) -> bool {
        let mut members = self.members.lock().await;
        let changed = members.remove(user_id);
        if changed {
            self.broadcast_locked(&members);
        } else {
            tracing::info!(user_id = %user_id, "Room unchanged by leave");
        }
        changed
    }

    /// Cascade of an authenticated connection closing
    pub async fn on_disconnect(&self, user_id: &str) -> bool {
        let mut members = self.members.lock().await;
        let changed = members.remove(user_id);
        if changed {
            tracing::info!(user_id = %user_id, "Removed disconnected user from room");
            self.broadcast_locked(&members);
        }
        changed
    }

    pub async fn members(&self) -> Vec<UserId> {
        self.members.lock().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.members.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.members.lock().await.is_empty()
    }

    /// Enqueue the snapshot on every authenticated connection without waiting.
    /// Must be called with the membership lock held.
    fn broadcast_locked(&self, members: &BTreeSet<UserId>) -> BroadcastResult {
        let snapshot: Vec<UserId> = members.iter().cloned().collect();
        let message = match OutboundMessage::preserialize(&ServerMessage::room_members(snapshot)) {
            Ok(m) => m,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize room members");
                return BroadcastResult::default();
            }
        };

        let mut result = BroadcastResult::default();
        for session in self.registry.snapshot() {
            match session.handle.try_send(message.clone()) {
                Ok(()) => result.delivered += 1,
                Err(SendError::Full) => {
                    result.failed += 1;
                    tracing::warn!(
                        connection_id = %session.handle.id,
                        user_id = %session.user_id,
                        "Outbound buffer full, dropped room members snapshot"
                    );
                }
                Err(e) => {
                    result.failed += 1;
                    tracing::debug!(
                        connection_id = %session.handle.id,
                        user_id = %session.user_id,
                        error = %e,
                        "Failed to deliver room members"
                    );
                }
            }
        }

        RoomMetrics::record_broadcast(members.len());
        tracing::info!(
            members = members.len(),
            delivered = result.delivered,
            failed = result.failed,
            "Room members broadcast"
        );

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_manager::Admission;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn setup() -> (Arc<ConnectionRegistry>, RoomTracker) {
        let registry = Arc::new(ConnectionRegistry::new(16, Duration::from_millis(100)));
        let room = RoomTracker::new(registry.clone());
        (registry, room)
    }

    fn authenticated(registry: &ConnectionRegistry, user_id: &str) -> mpsc::Receiver<OutboundMessage> {
        let (tx, rx) = mpsc::channel(16);
        let Admission::Admitted(handle) = registry.admit_pending(None, tx) else {
            panic!("admission refused");
        };
        registry.promote(handle.id, user_id);
        rx
    }

    fn drain(rx: &mut mpsc::Receiver<OutboundMessage>) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(message) = rx.try_recv() {
            frames.push(message.to_json().unwrap());
        }
        frames
    }

    #[tokio::test]
    async fn test_double_join_broadcasts_once() {
        let (registry, room) = setup();
        let mut rx = authenticated(&registry, "1");

        assert!(room.join("1").await);
        assert!(!room.join("1").await);

        let frames = drain(&mut rx);
        assert_eq!(frames, vec![r#"{"type":"ROOM_MEMBERS","data":["1"]}"#.to_string()]);
    }

    #[tokio::test]
    async fn test_leave_of_non_member_is_silent() {
        let (registry, room) = setup();
        let mut rx = authenticated(&registry, "1");

        assert!(!room.leave("1").await);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_non_members() {
        let (registry, room) = setup();
        let mut member = authenticated(&registry, "1");
        let mut observer = authenticated(&registry, "2");

        room.join("1").await;

        assert_eq!(drain(&mut member).len(), 1);
        assert_eq!(drain(&mut observer).len(), 1);
    }

    #[tokio::test]
    async fn test_membership_replays_sequence() {
        let (registry, room) = setup();
        let _sessions: Vec<_> = ["1", "2", "3"].iter().map(|id| authenticated(&registry, id)).collect();
        room.join("3").await;
        room.join("1").await;
        room.leave("3").await;
        room.join("2").await;
        room.leave("9").await;

        assert_eq!(room.members().await, vec!["1".to_string(), "2".to_string()]);
    }

    #[tokio::test]
    async fn test_disconnect_broadcasts_only_on_change() {
        let (registry, room) = setup();
        let mut rx = authenticated(&registry, "1");

        assert!(!room.on_disconnect("5").await);
        assert!(drain(&mut rx).is_empty());

        let _r5 = authenticated(&registry, "5");
        room.join("5").await;
        drain(&mut rx);
        assert!(room.on_disconnect("5").await);
        assert_eq!(drain(&mut rx), vec![r#"{"type":"ROOM_MEMBERS","data":[]}"#.to_string()]);
        assert!(room.is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_joins_broadcast_once_per_change() {
        let (registry, room) = setup();
        let mut rx = authenticated(&registry, "observer");
        let _sessions: Vec<_> = (0..4).map(|i| authenticated(&registry, &i.to_string())).collect();
        let room = Arc::new(room);

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let room = room.clone();
                tokio::spawn(async move { room.join(&(i % 4).to_string()).await })
            })
            .collect();
        let mut changes = 0;
        for task in tasks {
            if task.await.unwrap() {
                changes += 1;
            }
        }

        assert_eq!(changes, 4);
        assert_eq!(room.len().await, 4);
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 4);
        // Snapshots grow monotonically because they are emitted in mutation order
        assert_eq!(frames.last().unwrap(), r#"{"type":"ROOM_MEMBERS","data":["0","1","2","3"]}"#);
    }

    #[tokio::test]
    async fn test_join_after_session_closed_is_ignored() {
        let (registry, room) = setup();
        let (tx, _rx) = mpsc::channel(16);
        let Admission::Admitted(leaving) = registry.admit_pending(None, tx) else {
            panic!("admission refused");
        };
        registry.promote(leaving.id, "1");
        let mut observer = authenticated(&registry, "2");

        // Session closes between the caller's user lookup and the join
        leaving.close();
        registry.remove(leaving.id);

        assert!(!room.join("1").await);
        assert!(room.is_empty().await);
        assert!(drain(&mut observer).is_empty());
    }

    #[tokio::test]
    async fn test_full_buffer_drops_snapshot_for_that_session_only() {
        let (registry, room) = setup();
        let (tx, mut stalled) = mpsc::channel(1);
        let Admission::Admitted(handle) = registry.admit_pending(None, tx) else {
            panic!("admission refused");
        };
        registry.promote(handle.id, "1");
        handle.try_send(ServerMessage::Pong).unwrap();
        let mut observer = authenticated(&registry, "2");

        assert!(room.join("2").await);

        assert_eq!(drain(&mut stalled), vec![r#"{"type":"PONG"}"#.to_string()]);
        assert_eq!(drain(&mut observer).len(), 1);
    }
}
