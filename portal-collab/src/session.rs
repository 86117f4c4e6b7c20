//! Room sessions: presence, widget locks and change reconciliation.
//!
//! ```text
//! CollabService
//!   ├── RoomRegistry   RwLock<HashMap<room_id, Arc<Mutex<Room>>>>
//!   │      └── Room    participants · LockTable · VersionTracker · BroadcastGroup
//!   ├── Recorder       history / activity / chat (background writer)
//!   └── AccessPolicy   join gate
//! ```
//!
//! Every operation on a room runs under that room's mutex, including the
//! broadcast it emits. Rooms never wait on each other; the registry lock is
//! only held to look up, insert or remove a room.
//!
//! A room is created on first join and dropped when its last connection
//! leaves. A dropped room is marked `closed` before it leaves the registry,
//! so a joiner that raced the removal retries with a fresh room.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

use crate::auth::{AccessPolicy, Identity};
use crate::broadcast::{BroadcastGroup, ConnId, Outbox};
use crate::change::{Change, ChangeRequest, MonotonicClock};
use crate::error::{CollabError, CollabResult};
use crate::protocol::{Cursor, PresenceStatus, ServerMessage, SignalKind, SignalRelay};
use crate::recorder::{
    ActivityAction, ActivityEntry, ChatMessage, HistoryEntry, LogKind, Recorder,
};
use crate::transform::transform_all;
use crate::value::Value;
use crate::version::VersionTracker;

/// A lock older than this may be taken over by another user.
pub const LOCK_STALE_AFTER: Duration = Duration::from_secs(30);

/// Activity entries returned when no limit is given.
pub const DEFAULT_ACTIVITY_LIMIT: usize = 50;

// ───────────────────────────────────────────────────────────────────
// Participants & locks
// ───────────────────────────────────────────────────────────────────

/// One user's presence in a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantSession {
    pub user_id: String,
    pub display_name: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub cursor: Option<Cursor>,
    #[serde(default)]
    pub active_widget_id: Option<String>,
    #[serde(default)]
    pub status: PresenceStatus,
    /// Millis of the last message seen from this user.
    pub last_seen: u64,
}

impl ParticipantSession {
    pub fn from_identity(identity: &Identity, now: u64) -> Self {
        Self {
            user_id: identity.user_id.clone(),
            display_name: identity.display_name.clone(),
            avatar: identity.avatar.clone(),
            cursor: None,
            active_widget_id: None,
            status: PresenceStatus::Active,
            last_seen: now,
        }
    }
}

/// Exclusive edit lock on a widget.
#[derive(Debug, Clone)]
pub struct Lock {
    pub widget_id: String,
    pub user_id: String,
    pub display_name: String,
    pub acquired_at: Instant,
    /// Wall-clock stamp reported to clients.
    pub acquired_at_ms: u64,
}

impl Lock {
    pub fn is_stale(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.acquired_at) >= LOCK_STALE_AFTER
    }

    pub fn info(&self) -> LockInfo {
        LockInfo {
            widget_id: self.widget_id.clone(),
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            acquired_at: self.acquired_at_ms,
        }
    }
}

/// Wire view of a [`Lock`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    pub widget_id: String,
    pub user_id: String,
    pub display_name: String,
    pub acquired_at: u64,
}

/// Widget locks of one room, keyed by widget id.
///
/// ```text
/// unlocked ──acquire──► locked(holder) ──release(holder)──► unlocked
///                           │
///                           └──acquire(other, age ≥ 30s)──► locked(other)
/// ```
#[derive(Debug, Default)]
pub struct LockTable {
    locks: HashMap<String, Lock>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take (or refresh) the lock on `widget_id` for `identity`.
    ///
    /// Fails with [`CollabError::LockConflict`] while another user holds a
    /// live lock.
    pub fn acquire(
        &mut self,
        widget_id: &str,
        identity: &Identity,
        now: Instant,
        now_ms: u64,
    ) -> CollabResult<LockInfo> {
        let observed = match self.locks.get(widget_id) {
            Some(held) if held.user_id != identity.user_id => {
                if !held.is_stale(now) {
                    return Err(CollabError::LockConflict {
                        widget_id: widget_id.to_string(),
                        locked_by: held.display_name.clone(),
                    });
                }
                Some((held.acquired_at, held.display_name.clone()))
            }
            _ => None,
        };

        let lock = Lock {
            widget_id: widget_id.to_string(),
            user_id: identity.user_id.clone(),
            display_name: identity.display_name.clone(),
            acquired_at: now,
            acquired_at_ms: now_ms,
        };
        let info = lock.info();

        match observed {
            Some((expected, previous)) => {
                if !self.override_stale(widget_id, expected, lock) {
                    let locked_by = self
                        .holder(widget_id)
                        .map(|l| l.display_name.clone())
                        .unwrap_or_default();
                    return Err(CollabError::LockConflict {
                        widget_id: widget_id.to_string(),
                        locked_by,
                    });
                }
                log::info!(
                    "Stale lock on {widget_id} held by {previous} taken over by {}",
                    identity.display_name
                );
            }
            None => {
                self.locks.insert(widget_id.to_string(), lock);
            }
        }
        Ok(info)
    }

    /// Replace the lock only if it is still the one acquired at `expected`.
    fn override_stale(&mut self, widget_id: &str, expected: Instant, lock: Lock) -> bool {
        match self.locks.get_mut(widget_id) {
            Some(current) if current.acquired_at == expected => {
                *current = lock;
                true
            }
            _ => false,
        }
    }

    /// Release if held by `user_id`. Returns whether a lock was removed.
    pub fn release(&mut self, widget_id: &str, user_id: &str) -> bool {
        match self.locks.get(widget_id) {
            Some(held) if held.user_id == user_id => {
                self.locks.remove(widget_id);
                true
            }
            _ => false,
        }
    }

    /// Release every lock held by `user_id`, returning the widget ids.
    pub fn release_all(&mut self, user_id: &str) -> Vec<String> {
        let mut released: Vec<String> = self
            .locks
            .values()
            .filter(|l| l.user_id == user_id)
            .map(|l| l.widget_id.clone())
            .collect();
        released.sort();
        for widget_id in &released {
            self.locks.remove(widget_id);
        }
        released
    }

    /// Drop every lock.
    pub fn clear(&mut self) -> Vec<Lock> {
        let mut all: Vec<Lock> = self.locks.drain().map(|(_, l)| l).collect();
        all.sort_by(|a, b| a.widget_id.cmp(&b.widget_id));
        all
    }

    pub fn holder(&self, widget_id: &str) -> Option<&Lock> {
        self.locks.get(widget_id)
    }

    pub fn infos(&self) -> Vec<LockInfo> {
        let mut infos: Vec<LockInfo> = self.locks.values().map(Lock::info).collect();
        infos.sort_by(|a, b| a.widget_id.cmp(&b.widget_id));
        infos
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

// ───────────────────────────────────────────────────────────────────
// Rooms
// ───────────────────────────────────────────────────────────────────

/// Shared state of one room.
pub struct Room {
    id: String,
    participants: HashMap<String, ParticipantSession>,
    locks: LockTable,
    tracker: VersionTracker,
    group: BroadcastGroup,
    closed: bool,
}

impl Room {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            participants: HashMap::new(),
            locks: LockTable::new(),
            tracker: VersionTracker::new(),
            group: BroadcastGroup::new(),
            closed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Participants ordered by user id.
    pub fn participants(&self) -> Vec<ParticipantSession> {
        let mut list: Vec<ParticipantSession> = self.participants.values().cloned().collect();
        list.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        list
    }

    pub fn participant(&self, user_id: &str) -> Option<&ParticipantSession> {
        self.participants.get(user_id)
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    pub fn tracker(&self) -> &VersionTracker {
        &self.tracker
    }

    pub fn group(&self) -> &BroadcastGroup {
        &self.group
    }
}

/// All live rooms of this process.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Mutex<Room>>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, room_id: &str) -> Option<Arc<Mutex<Room>>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    pub async fn get_or_create(&self, room_id: &str) -> Arc<Mutex<Room>> {
        if let Some(room) = self.get(room_id).await {
            return room;
        }
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room_id.to_string())
            .or_insert_with(|| {
                log::info!("Room {room_id} created");
                Arc::new(Mutex::new(Room::new(room_id)))
            })
            .clone()
    }

    /// Remove `room_id` if it still maps to `room`.
    async fn remove(&self, room_id: &str, room: &Arc<Mutex<Room>>) -> bool {
        let mut rooms = self.rooms.write().await;
        match rooms.get(room_id) {
            Some(current) if Arc::ptr_eq(current, room) => {
                rooms.remove(room_id);
                log::info!("Room {room_id} removed (empty)");
                true
            }
            _ => false,
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn room_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rooms.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

// ───────────────────────────────────────────────────────────────────
// Connections
// ───────────────────────────────────────────────────────────────────

/// Per-connection state owned by the connection's task.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub conn_id: ConnId,
    pub identity: Identity,
    outbox: Outbox,
    rooms: HashSet<String>,
}

impl ConnectionHandle {
    pub fn new(identity: Identity, outbox: Outbox) -> Self {
        Self {
            conn_id: Uuid::new_v4(),
            identity,
            outbox,
            rooms: HashSet::new(),
        }
    }

    /// Queue a message for this connection only.
    pub fn send(&self, msg: &ServerMessage) -> bool {
        match msg.encode() {
            Ok(text) => self.outbox.push(Arc::from(text)),
            Err(e) => {
                log::error!("Failed to encode message for {}: {e}", self.conn_id);
                false
            }
        }
    }

    pub fn has_joined(&self, room_id: &str) -> bool {
        self.rooms.contains(room_id)
    }

    pub fn joined_rooms(&self) -> Vec<String> {
        let mut rooms: Vec<String> = self.rooms.iter().cloned().collect();
        rooms.sort();
        rooms
    }
}

// ───────────────────────────────────────────────────────────────────
// Service
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Distinct users allowed per room (0 = unlimited)
    pub max_participants_per_room: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_participants_per_room: 100,
        }
    }
}

/// Returned to a successful joiner.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinOutcome {
    pub participants: Vec<ParticipantSession>,
    pub locks: Vec<LockInfo>,
}

/// Snapshot of a room's live and recorded state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStats {
    pub room_id: String,
    pub active: bool,
    pub participants: usize,
    pub connections: usize,
    pub locks: usize,
    pub tracked_changes: usize,
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub history_entries: usize,
    pub activity_entries: usize,
    pub chat_messages: usize,
}

fn not_joined(room_id: &str) -> CollabError {
    CollabError::NotJoined {
        room_id: room_id.to_string(),
    }
}

/// Room session manager shared by the gateway and the query API.
pub struct CollabService {
    registry: RoomRegistry,
    recorder: Recorder,
    policy: Arc<dyn AccessPolicy>,
    clock: MonotonicClock,
    config: ServiceConfig,
}

impl CollabService {
    pub fn new(recorder: Recorder, policy: Arc<dyn AccessPolicy>, config: ServiceConfig) -> Self {
        Self {
            registry: RoomRegistry::new(),
            recorder,
            policy,
            clock: MonotonicClock::new(),
            config,
        }
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    pub fn policy(&self) -> &dyn AccessPolicy {
        self.policy.as_ref()
    }

    /// Lock the room `conn` has joined.
    async fn member_room(
        &self,
        conn: &ConnectionHandle,
        room_id: &str,
    ) -> CollabResult<OwnedMutexGuard<Room>> {
        if !conn.has_joined(room_id) {
            return Err(not_joined(room_id));
        }
        let room = self
            .registry
            .get(room_id)
            .await
            .ok_or_else(|| not_joined(room_id))?;
        let guard = room.lock_owned().await;
        if guard.closed || !guard.group.has_member(&conn.conn_id) {
            return Err(not_joined(room_id));
        }
        Ok(guard)
    }

    pub async fn join(
        &self,
        conn: &mut ConnectionHandle,
        room_id: &str,
    ) -> CollabResult<JoinOutcome> {
        if !self.policy.can_access(&conn.identity, room_id) {
            log::warn!(
                "User {} denied access to room {room_id}",
                conn.identity.user_id
            );
            return Err(CollabError::AccessDenied {
                room_id: room_id.to_string(),
            });
        }

        loop {
            let mut room = self.registry.get_or_create(room_id).await.lock_owned().await;
            if room.closed {
                continue;
            }

            let identity = &conn.identity;
            let cap = self.config.max_participants_per_room;
            if cap > 0
                && !room.participants.contains_key(&identity.user_id)
                && room.participants.len() >= cap
            {
                return Err(CollabError::RoomFull {
                    room_id: room_id.to_string(),
                });
            }

            let now = self.clock.now();
            let session = ParticipantSession::from_identity(identity, now);
            room.participants
                .insert(identity.user_id.clone(), session.clone());
            room.group
                .add_member(conn.conn_id, &identity.user_id, conn.outbox.clone());
            room.group.broadcast(
                &ServerMessage::UserJoined {
                    room_id: room_id.to_string(),
                    user: session,
                },
                Some(&conn.conn_id),
            );
            self.recorder.record_activity(&ActivityEntry::new(
                room_id,
                &identity.user_id,
                &identity.display_name,
                ActivityAction::Joined,
                now,
            ));
            log::info!(
                "{} joined room {room_id} ({} participants)",
                identity.display_name,
                room.participants.len()
            );

            let outcome = JoinOutcome {
                participants: room.participants(),
                locks: room.locks.infos(),
            };
            conn.rooms.insert(room_id.to_string());
            return Ok(outcome);
        }
    }

    pub async fn leave(&self, conn: &mut ConnectionHandle, room_id: &str) -> CollabResult<()> {
        if !conn.rooms.remove(room_id) {
            return Err(not_joined(room_id));
        }
        self.remove_from_room(conn, room_id).await;
        Ok(())
    }

    /// Leave every joined room. Returns how many rooms were left.
    pub async fn disconnect(&self, mut conn: ConnectionHandle) -> usize {
        let rooms: Vec<String> = conn.rooms.drain().collect();
        for room_id in &rooms {
            self.remove_from_room(&conn, room_id).await;
        }
        rooms.len()
    }

    async fn remove_from_room(&self, conn: &ConnectionHandle, room_id: &str) {
        let Some(room) = self.registry.get(room_id).await else {
            return;
        };
        let mut guard = room.lock().await;
        if guard.group.remove_member(&conn.conn_id).is_none() {
            return;
        }

        let identity = &conn.identity;
        // Another tab of the same user keeps the presence and locks alive.
        if guard.group.connections_of(&identity.user_id).is_empty() {
            guard.participants.remove(&identity.user_id);
            guard.group.broadcast(
                &ServerMessage::UserLeft {
                    room_id: room_id.to_string(),
                    user_id: identity.user_id.clone(),
                    display_name: identity.display_name.clone(),
                },
                None,
            );
            for widget_id in guard.locks.release_all(&identity.user_id) {
                guard.group.broadcast(
                    &ServerMessage::WidgetUnlocked {
                        room_id: room_id.to_string(),
                        widget_id,
                        user_id: identity.user_id.clone(),
                    },
                    None,
                );
            }
            self.recorder.record_activity(&ActivityEntry::new(
                room_id,
                &identity.user_id,
                &identity.display_name,
                ActivityAction::Left,
                self.clock.now(),
            ));
            log::info!("{} left room {room_id}", identity.display_name);
        }

        let empty = guard.group.is_empty();
        if empty {
            guard.closed = true;
        }
        drop(guard);
        if empty {
            self.registry.remove(room_id, &room).await;
        }
    }

    pub async fn lock_widget(
        &self,
        conn: &ConnectionHandle,
        room_id: &str,
        widget_id: &str,
    ) -> CollabResult<LockInfo> {
        self.lock_widget_at(conn, room_id, widget_id, Instant::now())
            .await
    }

    /// [`lock_widget`](Self::lock_widget) with an explicit clock reading.
    pub async fn lock_widget_at(
        &self,
        conn: &ConnectionHandle,
        room_id: &str,
        widget_id: &str,
        now: Instant,
    ) -> CollabResult<LockInfo> {
        let mut room = self.member_room(conn, room_id).await?;
        let info = room
            .locks
            .acquire(widget_id, &conn.identity, now, self.clock.now())
            .inspect_err(|e| log::debug!("Lock on {widget_id} in {room_id} refused: {e}"))?;
        room.group.broadcast(
            &ServerMessage::WidgetLocked {
                room_id: room_id.to_string(),
                lock: info.clone(),
            },
            Some(&conn.conn_id),
        );
        Ok(info)
    }

    /// Release a lock held by the caller. Unlocking a widget the caller does
    /// not hold succeeds without effect; returns whether anything was released.
    pub async fn unlock_widget(
        &self,
        conn: &ConnectionHandle,
        room_id: &str,
        widget_id: &str,
    ) -> CollabResult<bool> {
        let mut room = self.member_room(conn, room_id).await?;
        let released = room.locks.release(widget_id, &conn.identity.user_id);
        if released {
            room.group.broadcast(
                &ServerMessage::WidgetUnlocked {
                    room_id: room_id.to_string(),
                    widget_id: widget_id.to_string(),
                    user_id: conn.identity.user_id.clone(),
                },
                Some(&conn.conn_id),
            );
        }
        Ok(released)
    }

    pub async fn cursor_move(
        &self,
        conn: &ConnectionHandle,
        room_id: &str,
        cursor: Cursor,
    ) -> CollabResult<()> {
        let mut room = self.member_room(conn, room_id).await?;
        let now = self.clock.now();
        if let Some(p) = room.participants.get_mut(&conn.identity.user_id) {
            p.cursor = Some(cursor.clone());
            p.last_seen = now;
        }
        room.group.broadcast(
            &ServerMessage::CursorUpdate {
                room_id: room_id.to_string(),
                user_id: conn.identity.user_id.clone(),
                display_name: conn.identity.display_name.clone(),
                cursor,
            },
            Some(&conn.conn_id),
        );
        log::trace!("Cursor update from {} in {room_id}", conn.identity.user_id);
        Ok(())
    }

    pub async fn update_presence(
        &self,
        conn: &ConnectionHandle,
        room_id: &str,
        status: PresenceStatus,
        active_widget_id: Option<String>,
    ) -> CollabResult<()> {
        let mut room = self.member_room(conn, room_id).await?;
        let now = self.clock.now();
        if let Some(p) = room.participants.get_mut(&conn.identity.user_id) {
            p.status = status;
            p.active_widget_id = active_widget_id.clone();
            p.last_seen = now;
        }
        room.group.broadcast(
            &ServerMessage::PresenceChanged {
                room_id: room_id.to_string(),
                user_id: conn.identity.user_id.clone(),
                status,
                active_widget_id,
            },
            Some(&conn.conn_id),
        );
        Ok(())
    }

    /// Reconcile an edit against concurrent changes and fan it out.
    ///
    /// Returns the reconciled change. History and activity are queued to the
    /// recorder without waiting.
    pub async fn submit_change(
        &self,
        conn: &ConnectionHandle,
        room_id: &str,
        request: ChangeRequest,
    ) -> CollabResult<Change> {
        let mut room = self.member_room(conn, room_id).await?;
        let identity = &conn.identity;

        let change = Change::from_request(request, &identity.user_id, self.clock.now());
        let (concurrent, _) = room.tracker.record_and_get_concurrent(&change);
        let reconciled = transform_all(&change, &concurrent);
        if !concurrent.is_empty() {
            log::debug!(
                "Reconciled {} change on {} against {} concurrent",
                change.change_type.as_str(),
                change.widget_id,
                concurrent.len()
            );
        }
        if let Some(p) = room.participants.get_mut(&identity.user_id) {
            p.last_seen = reconciled.timestamp;
        }

        room.group.broadcast(
            &ServerMessage::WidgetChanged {
                room_id: room_id.to_string(),
                display_name: identity.display_name.clone(),
                change: reconciled.clone(),
            },
            Some(&conn.conn_id),
        );

        self.recorder.append_history(&HistoryEntry::new(
            room_id,
            &identity.display_name,
            reconciled.clone(),
        ));
        self.recorder.record_activity(
            &ActivityEntry::new(
                room_id,
                &identity.user_id,
                &identity.display_name,
                ActivityAction::Edited,
                reconciled.timestamp,
            )
            .on_widget(&reconciled.widget_id)
            .with_detail(reconciled.change_type.as_str()),
        );
        Ok(reconciled)
    }

    /// Post a chat message. Every member receives `chat:new`, sender included.
    pub async fn chat(
        &self,
        conn: &ConnectionHandle,
        room_id: &str,
        message: String,
        widget_id: Option<String>,
    ) -> CollabResult<ChatMessage> {
        if message.trim().is_empty() {
            return Err(CollabError::Malformed("empty chat message".into()));
        }
        let room = self.member_room(conn, room_id).await?;
        let identity = &conn.identity;
        let chat = ChatMessage {
            id: Uuid::new_v4().to_string(),
            room_id: room_id.to_string(),
            user_id: identity.user_id.clone(),
            user_name: identity.display_name.clone(),
            message,
            widget_id,
            timestamp: self.clock.now(),
        };
        room.group.broadcast(
            &ServerMessage::ChatNew {
                room_id: room_id.to_string(),
                message: chat.clone(),
            },
            None,
        );
        self.recorder.append_chat(&chat);

        let mut activity = ActivityEntry::new(
            room_id,
            &identity.user_id,
            &identity.display_name,
            ActivityAction::Commented,
            chat.timestamp,
        );
        if let Some(widget_id) = &chat.widget_id {
            activity = activity.on_widget(widget_id);
        }
        self.recorder.record_activity(&activity);
        Ok(chat)
    }

    /// Relay a signaling payload to the target user's connections in the
    /// room. Returns the number of connections reached.
    pub async fn relay_signal(
        &self,
        conn: &ConnectionHandle,
        room_id: &str,
        kind: SignalKind,
        target_user_id: &str,
        payload: Value,
    ) -> CollabResult<usize> {
        let room = self.member_room(conn, room_id).await?;
        let relay = SignalRelay {
            room_id: room_id.to_string(),
            from_user_id: conn.identity.user_id.clone(),
            payload,
        };
        let delivered = room
            .group
            .send_to_user(target_user_id, &ServerMessage::signal(kind, relay));
        if delivered == 0 {
            log::debug!(
                "{} relay from {} found no connection for {target_user_id} in {room_id}",
                kind.as_str(),
                conn.identity.user_id
            );
        }
        Ok(delivered)
    }

    /// Newest-first activity of a joined room.
    pub async fn activity_feed(
        &self,
        conn: &ConnectionHandle,
        room_id: &str,
        limit: Option<usize>,
    ) -> CollabResult<Vec<ActivityEntry>> {
        drop(self.member_room(conn, room_id).await?);
        Ok(self
            .recorder
            .read_activity(room_id, limit.unwrap_or(DEFAULT_ACTIVITY_LIMIT))
            .await)
    }

    pub async fn participants(&self, room_id: &str) -> Vec<ParticipantSession> {
        let Some(room) = self.registry.get(room_id).await else {
            return Vec::new();
        };
        let room = room.lock().await;
        room.participants()
    }

    pub async fn stats(&self, room_id: &str) -> RoomStats {
        let mut stats = RoomStats {
            room_id: room_id.to_string(),
            active: false,
            participants: 0,
            connections: 0,
            locks: 0,
            tracked_changes: 0,
            messages_sent: 0,
            messages_dropped: 0,
            history_entries: 0,
            activity_entries: 0,
            chat_messages: 0,
        };
        if let Some(room) = self.registry.get(room_id).await {
            let room = room.lock().await;
            stats.active = !room.closed;
            stats.participants = room.participants.len();
            stats.connections = room.group.member_count();
            stats.locks = room.locks.len();
            stats.tracked_changes = room.tracker.change_count();
            let broadcast = room.group.stats();
            stats.messages_sent = broadcast.messages_sent;
            stats.messages_dropped = broadcast.messages_dropped;
        }
        stats.history_entries = self.recorder.count(LogKind::History, room_id).await;
        stats.activity_entries = self.recorder.count(LogKind::Activity, room_id).await;
        stats.chat_messages = self.recorder.count(LogKind::Chat, room_id).await;
        stats
    }

    /// Wipe a room's recorded logs and its in-memory locks and versions.
    /// Connected participants stay joined.
    pub async fn clear_room(&self, room_id: &str) {
        if let Some(room) = self.registry.get(room_id).await {
            let mut room = room.lock().await;
            room.tracker.clear();
            for lock in room.locks.clear() {
                room.group.broadcast(
                    &ServerMessage::WidgetUnlocked {
                        room_id: room_id.to_string(),
                        widget_id: lock.widget_id,
                        user_id: lock.user_id,
                    },
                    None,
                );
            }
        }
        self.recorder.clear(room_id);
        log::info!("Cleared collaboration data for room {room_id}");
    }
}
