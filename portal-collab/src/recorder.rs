//! Bounded per-room logs: change history, activity feed and chat.
//!
//! Each log is one JSON array under a key such as `collab:history:{room}`.
//! An append reads the array, pushes, trims the front down to the cap and
//! writes it back with the log's TTL. All store traffic goes through a single
//! writer task, so appends made by this process never interleave:
//!
//! ```text
//! CollabService ──append──► mpsc ──► writer task ──spawn_blocking──► KvStore
//!               ──read────►      ──►  (in order)
//! ```
//!
//! Failures are logged with the room id and swallowed. Reads fall back to an
//! empty list.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::change::Change;
use crate::storage::{KvStore, StoreError};

/// One accepted change, as kept in the room history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: String,
    pub room_id: String,
    pub user_name: String,
    pub change: Change,
}

impl HistoryEntry {
    pub fn new(room_id: impl Into<String>, user_name: impl Into<String>, change: Change) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            room_id: room_id.into(),
            user_name: user_name.into(),
            change,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityAction {
    Joined,
    Left,
    Edited,
    Commented,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    pub id: String,
    pub room_id: String,
    pub user_id: String,
    pub user_name: String,
    pub action: ActivityAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub widget_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub timestamp: u64,
}

impl ActivityEntry {
    pub fn new(
        room_id: impl Into<String>,
        user_id: impl Into<String>,
        user_name: impl Into<String>,
        action: ActivityAction,
        timestamp: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            room_id: room_id.into(),
            user_id: user_id.into(),
            user_name: user_name.into(),
            action,
            widget_id: None,
            detail: None,
            timestamp,
        }
    }

    pub fn on_widget(mut self, widget_id: impl Into<String>) -> Self {
        self.widget_id = Some(widget_id.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub room_id: String,
    pub user_id: String,
    pub user_name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub widget_id: Option<String>,
    pub timestamp: u64,
}

/// The three per-room logs with their caps and retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogKind {
    History,
    Activity,
    Chat,
}

impl LogKind {
    pub const ALL: [LogKind; 3] = [LogKind::History, LogKind::Activity, LogKind::Chat];

    /// Maximum entries kept per room.
    pub fn cap(&self) -> usize {
        match self {
            LogKind::History => 100,
            LogKind::Activity => 200,
            LogKind::Chat => 500,
        }
    }

    pub fn ttl(&self) -> Duration {
        match self {
            LogKind::History => Duration::from_secs(60 * 60),
            LogKind::Activity => Duration::from_secs(24 * 60 * 60),
            LogKind::Chat => Duration::from_secs(365 * 24 * 60 * 60),
        }
    }

    pub fn key(&self, room_id: &str) -> String {
        let name = match self {
            LogKind::History => "history",
            LogKind::Activity => "activity",
            LogKind::Chat => "chat",
        };
        format!("collab:{name}:{room_id}")
    }
}

enum RecordCommand {
    Append {
        kind: LogKind,
        room_id: String,
        entry: serde_json::Value,
    },
    Read {
        kind: LogKind,
        room_id: String,
        reply: oneshot::Sender<Vec<serde_json::Value>>,
    },
    Clear {
        room_id: String,
    },
    Flush(oneshot::Sender<()>),
}

/// Handle to the background log writer. Cheap to clone.
#[derive(Clone)]
pub struct Recorder {
    tx: mpsc::UnboundedSender<RecordCommand>,
}

impl Recorder {
    /// Start the writer task on the current runtime.
    pub fn spawn(store: Arc<dyn KvStore>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(store, rx));
        Self { tx }
    }

    pub fn append_history(&self, entry: &HistoryEntry) {
        self.append(LogKind::History, &entry.room_id, entry);
    }

    pub fn record_activity(&self, entry: &ActivityEntry) {
        self.append(LogKind::Activity, &entry.room_id, entry);
    }

    pub fn append_chat(&self, message: &ChatMessage) {
        self.append(LogKind::Chat, &message.room_id, message);
    }

    fn append<T: Serialize>(&self, kind: LogKind, room_id: &str, entry: &T) {
        let entry = match serde_json::to_value(entry) {
            Ok(v) => v,
            Err(e) => {
                log::error!("Failed to encode {kind:?} entry for room {room_id}: {e}");
                return;
            }
        };
        let cmd = RecordCommand::Append {
            kind,
            room_id: room_id.to_string(),
            entry,
        };
        if self.tx.send(cmd).is_err() {
            log::error!("Recorder stopped; dropped {kind:?} entry for room {room_id}");
        }
    }

    /// Last `limit` history entries, oldest first.
    pub async fn read_history(&self, room_id: &str, limit: usize) -> Vec<HistoryEntry> {
        self.read(LogKind::History, room_id, limit).await
    }

    /// Last `limit` activity entries, newest first.
    pub async fn read_activity(&self, room_id: &str, limit: usize) -> Vec<ActivityEntry> {
        let mut entries: Vec<ActivityEntry> = self.read(LogKind::Activity, room_id, limit).await;
        entries.reverse();
        entries
    }

    /// Last `limit` chat messages, oldest first.
    pub async fn read_chat(&self, room_id: &str, limit: usize) -> Vec<ChatMessage> {
        self.read(LogKind::Chat, room_id, limit).await
    }

    /// Number of entries currently held in a log.
    pub async fn count(&self, kind: LogKind, room_id: &str) -> usize {
        self.read_raw(kind, room_id).await.len()
    }

    async fn read<T: DeserializeOwned>(&self, kind: LogKind, room_id: &str, limit: usize) -> Vec<T> {
        let raw = self.read_raw(kind, room_id).await;
        let start = raw.len().saturating_sub(limit);
        raw.into_iter()
            .skip(start)
            .filter_map(|v| match serde_json::from_value(v) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    log::warn!("Skipping unreadable {kind:?} entry in room {room_id}: {e}");
                    None
                }
            })
            .collect()
    }

    async fn read_raw(&self, kind: LogKind, room_id: &str) -> Vec<serde_json::Value> {
        let (reply, rx) = oneshot::channel();
        let cmd = RecordCommand::Read {
            kind,
            room_id: room_id.to_string(),
            reply,
        };
        if self.tx.send(cmd).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Delete all three logs of a room.
    pub fn clear(&self, room_id: &str) {
        let cmd = RecordCommand::Clear {
            room_id: room_id.to_string(),
        };
        if self.tx.send(cmd).is_err() {
            log::error!("Recorder stopped; could not clear room {room_id}");
        }
    }

    /// Wait until every command queued before this call has been applied.
    pub async fn flush(&self) {
        let (done, rx) = oneshot::channel();
        if self.tx.send(RecordCommand::Flush(done)).is_ok() {
            let _ = rx.await;
        }
    }
}

async fn run_writer(store: Arc<dyn KvStore>, mut rx: mpsc::UnboundedReceiver<RecordCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            RecordCommand::Append {
                kind,
                room_id,
                entry,
            } => {
                let store = store.clone();
                let key = kind.key(&room_id);
                let result =
                    tokio::task::spawn_blocking(move || append_blocking(&*store, &key, kind, entry))
                        .await;
                report(result, "append", kind, &room_id);
            }
            RecordCommand::Read {
                kind,
                room_id,
                reply,
            } => {
                let store = store.clone();
                let key = kind.key(&room_id);
                let result = tokio::task::spawn_blocking(move || load(&*store, &key)).await;
                let entries = match result {
                    Ok(Ok(entries)) => entries,
                    other => {
                        report(other.map(|r| r.map(|_| ())), "read", kind, &room_id);
                        Vec::new()
                    }
                };
                let _ = reply.send(entries);
            }
            RecordCommand::Clear { room_id } => {
                let store = store.clone();
                let keys: Vec<String> = LogKind::ALL.iter().map(|k| k.key(&room_id)).collect();
                let result = tokio::task::spawn_blocking(move || {
                    keys.iter().try_for_each(|key| store.del(key))
                })
                .await;
                match result {
                    Ok(Ok(())) => log::info!("Cleared collaboration logs for room {room_id}"),
                    Ok(Err(e)) => log::error!("Failed to clear logs for room {room_id}: {e}"),
                    Err(e) => log::error!("Clear task for room {room_id} panicked: {e}"),
                }
            }
            RecordCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    log::debug!("Recorder writer stopped");
}

fn report(
    result: Result<Result<(), StoreError>, tokio::task::JoinError>,
    op: &str,
    kind: LogKind,
    room_id: &str,
) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::error!("Failed to {op} {kind:?} log for room {room_id}: {e}"),
        Err(e) => log::error!("{kind:?} {op} task for room {room_id} panicked: {e}"),
    }
}

fn load(store: &dyn KvStore, key: &str) -> Result<Vec<serde_json::Value>, StoreError> {
    match store.get(key)? {
        Some(text) => {
            serde_json::from_str(&text).map_err(|e| StoreError::Deserialization(e.to_string()))
        }
        None => Ok(Vec::new()),
    }
}

fn append_blocking(
    store: &dyn KvStore,
    key: &str,
    kind: LogKind,
    entry: serde_json::Value,
) -> Result<(), StoreError> {
    let mut entries = load(store, key)?;
    entries.push(entry);
    if entries.len() > kind.cap() {
        let excess = entries.len() - kind.cap();
        entries.drain(..excess);
    }
    let text =
        serde_json::to_string(&entries).map_err(|e| StoreError::Serialization(e.to_string()))?;
    store.set(key, &text, kind.ttl())
}
