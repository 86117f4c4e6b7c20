//! Per-room fan-out to member connections.
//!
//! Each connection owns a bounded outbox drained by its socket task. A
//! room's [`BroadcastGroup`] holds the outboxes of its members; messages are
//! encoded once and the same `Arc<str>` is pushed to every recipient, so
//! emission order is preserved per recipient.
//!
//! Pushes never wait. A full outbox drops the frame and raises the
//! connection's overflow signal; the socket task then closes the
//! connection, and the client rejoins to resync.
//!
//! The group lives inside the room's mutex, which is what serializes
//! broadcasts for a room.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use crate::protocol::ServerMessage;

/// Connection identifier.
pub type ConnId = Uuid;

/// Pre-encoded outbound frame.
pub type Frame = Arc<str>;

/// Default outbox capacity, in frames.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 1024;

/// Create a connection outbox holding at most `capacity` frames.
pub fn outbox_channel(capacity: usize) -> (Outbox, Inbox) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let overflow = Arc::new(Notify::new());
    (
        Outbox {
            tx,
            overflow: overflow.clone(),
        },
        Inbox { rx, overflow },
    )
}

/// Sending half of a connection's outbox.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Frame>,
    overflow: Arc<Notify>,
}

impl Outbox {
    /// Queue a frame without waiting.
    ///
    /// Returns `false` when the frame was dropped. A full outbox also
    /// raises the overflow signal seen by [`Inbox::overflow_signal`].
    pub fn push(&self, frame: Frame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.overflow.notify_one();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Receiving half of a connection's outbox, owned by the socket task.
#[derive(Debug)]
pub struct Inbox {
    rx: mpsc::Receiver<Frame>,
    overflow: Arc<Notify>,
}

impl Inbox {
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<Frame, TryRecvError> {
        self.rx.try_recv()
    }

    /// Notified once a push found the outbox full.
    pub fn overflow_signal(&self) -> Arc<Notify> {
        self.overflow.clone()
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_members: usize,
}

/// Atomic broadcast counters.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// A connection subscribed to a room.
#[derive(Debug, Clone)]
pub struct Member {
    pub conn_id: ConnId,
    pub user_id: String,
    outbox: Outbox,
}

/// Fan-out group for a single room.
pub struct BroadcastGroup {
    members: HashMap<ConnId, Member>,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    pub fn new() -> Self {
        Self {
            members: HashMap::new(),
            stats: AtomicBroadcastStats::new(),
        }
    }

    /// Add (or replace) a member connection.
    pub fn add_member(&mut self, conn_id: ConnId, user_id: impl Into<String>, outbox: Outbox) {
        self.members.insert(
            conn_id,
            Member {
                conn_id,
                user_id: user_id.into(),
                outbox,
            },
        );
    }

    pub fn remove_member(&mut self, conn_id: &ConnId) -> Option<Member> {
        self.members.remove(conn_id)
    }

    pub fn has_member(&self, conn_id: &ConnId) -> bool {
        self.members.contains_key(conn_id)
    }

    pub fn member(&self, conn_id: &ConnId) -> Option<&Member> {
        self.members.get(conn_id)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Connection ids belonging to `user_id`.
    pub fn connections_of(&self, user_id: &str) -> Vec<ConnId> {
        self.members
            .values()
            .filter(|m| m.user_id == user_id)
            .map(|m| m.conn_id)
            .collect()
    }

    /// Broadcast to every member except `exclude`.
    ///
    /// Returns the number of outboxes that accepted the frame. Full and
    /// closed outboxes are counted as dropped; their owner cleans up on
    /// disconnect.
    pub fn broadcast(&self, msg: &ServerMessage, exclude: Option<&ConnId>) -> usize {
        let Some(frame) = encode(msg) else {
            return 0;
        };
        self.deliver(&frame, |m| Some(&m.conn_id) != exclude)
    }

    /// Send to every connection of `user_id`.
    pub fn send_to_user(&self, user_id: &str, msg: &ServerMessage) -> usize {
        let Some(frame) = encode(msg) else {
            return 0;
        };
        self.deliver(&frame, |m| m.user_id == user_id)
    }

    fn deliver(&self, frame: &Frame, include: impl Fn(&Member) -> bool) -> usize {
        let mut delivered = 0;
        for member in self.members.values().filter(|m| include(m)) {
            if member.outbox.push(frame.clone()) {
                delivered += 1;
            } else {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        delivered
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_members: self.members.len(),
        }
    }
}

impl Default for BroadcastGroup {
    fn default() -> Self {
        Self::new()
    }
}

fn encode(msg: &ServerMessage) -> Option<Frame> {
    match msg.encode() {
        Ok(text) => Some(Arc::from(text)),
        Err(e) => {
            log::error!("Failed to encode broadcast: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unlocked(widget: &str) -> ServerMessage {
        ServerMessage::WidgetUnlocked {
            room_id: "r1".into(),
            widget_id: widget.into(),
            user_id: "u1".into(),
        }
    }

    fn drain(rx: &mut Inbox) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(ServerMessage::decode(&frame).unwrap());
        }
        out
    }

    #[test]
    fn test_add_remove_member() {
        let mut group = BroadcastGroup::new();
        let (tx, _rx) = outbox_channel(8);
        let conn = Uuid::new_v4();

        group.add_member(conn, "alice", tx);
        assert_eq!(group.member_count(), 1);
        assert!(group.has_member(&conn));
        assert_eq!(group.member(&conn).unwrap().user_id, "alice");

        group.remove_member(&conn);
        assert!(group.is_empty());
        assert!(!group.has_member(&conn));
    }

    #[test]
    fn test_broadcast_excludes_sender() {
        let mut group = BroadcastGroup::new();
        let (tx1, mut rx1) = outbox_channel(8);
        let (tx2, mut rx2) = outbox_channel(8);
        let (tx3, mut rx3) = outbox_channel(8);
        let (c1, c2, c3) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        group.add_member(c1, "alice", tx1);
        group.add_member(c2, "bob", tx2);
        group.add_member(c3, "carol", tx3);

        let count = group.broadcast(&unlocked("w1"), Some(&c1));
        assert_eq!(count, 2);
        assert!(drain(&mut rx1).is_empty());
        assert_eq!(drain(&mut rx2), vec![unlocked("w1")]);
        assert_eq!(drain(&mut rx3), vec![unlocked("w1")]);
    }

    #[test]
    fn test_broadcast_preserves_order() {
        let mut group = BroadcastGroup::new();
        let (tx, mut rx) = outbox_channel(8);
        group.add_member(Uuid::new_v4(), "bob", tx);

        for w in ["w1", "w2", "w3"] {
            group.broadcast(&unlocked(w), None);
        }
        assert_eq!(drain(&mut rx), vec![unlocked("w1"), unlocked("w2"), unlocked("w3")]);
    }

    #[test]
    fn test_send_to_user_reaches_all_connections() {
        let mut group = BroadcastGroup::new();
        let (tx1, mut rx1) = outbox_channel(8);
        let (tx2, mut rx2) = outbox_channel(8);
        let (tx3, mut rx3) = outbox_channel(8);
        group.add_member(Uuid::new_v4(), "bob", tx1);
        group.add_member(Uuid::new_v4(), "bob", tx2);
        group.add_member(Uuid::new_v4(), "carol", tx3);

        assert_eq!(group.send_to_user("bob", &unlocked("w1")), 2);
        assert_eq!(drain(&mut rx1).len(), 1);
        assert_eq!(drain(&mut rx2).len(), 1);
        assert!(drain(&mut rx3).is_empty());
        assert_eq!(group.connections_of("bob").len(), 2);
    }

    #[test]
    fn test_closed_outbox_counts_as_dropped() {
        let mut group = BroadcastGroup::new();
        let (tx, rx) = outbox_channel(8);
        group.add_member(Uuid::new_v4(), "bob", tx);
        drop(rx);

        assert_eq!(group.broadcast(&unlocked("w1"), None), 0);
        let stats = group.stats();
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.messages_dropped, 1);
        assert_eq!(stats.active_members, 1);
    }

    #[tokio::test]
    async fn test_full_outbox_drops_and_signals_overflow() {
        let mut group = BroadcastGroup::new();
        let (slow_tx, mut slow_rx) = outbox_channel(2);
        let (fast_tx, mut fast_rx) = outbox_channel(8);
        group.add_member(Uuid::new_v4(), "slow", slow_tx);
        group.add_member(Uuid::new_v4(), "fast", fast_tx);
        let overflow = slow_rx.overflow_signal();

        let delivered: Vec<usize> = ["w1", "w2", "w3"]
            .iter()
            .map(|w| group.broadcast(&unlocked(w), None))
            .collect();
        assert_eq!(delivered, vec![2, 2, 1]);

        let stats = group.stats();
        assert_eq!(stats.messages_sent, 3);
        assert_eq!(stats.messages_dropped, 1);

        tokio::time::timeout(std::time::Duration::from_millis(100), overflow.notified())
            .await
            .expect("overflow should be signalled");
        assert_eq!(drain(&mut slow_rx), vec![unlocked("w1"), unlocked("w2")]);
        assert_eq!(drain(&mut fast_rx).len(), 3);
    }
}
