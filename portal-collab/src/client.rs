//! WebSocket client for the collaboration gateway.
//!
//! Provides:
//! - Connection lifecycle with bearer-token handshake
//! - Request/reply correlation through `requestId`
//! - A stream of room events (joins, locks, changes, chat, signals)
//! - Offline queue for widget changes made while disconnected
//!
//! On reconnect the client rejoins every room it was in, then replays the
//! queued changes in order.
//!
//! Events are delivered without waiting: when the event channel is full the
//! event is dropped and counted, so replies keep flowing to their requests
//! even if nobody drains the events.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Message;

use crate::change::{Change, ChangeRequest};
use crate::protocol::{
    ClientMessage, Cursor, Inbound, PresenceStatus, ProtocolError, Reply, ServerMessage,
    SignalKind, SignalRequest,
};
use crate::recorder::{ActivityEntry, ChatMessage};
use crate::session::{JoinOutcome, LockInfo};
use crate::value::Value;

/// How long a request waits for its reply.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Events buffered before new ones are dropped.
pub const EVENT_CAPACITY: usize = 256;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    /// A server frame that is not the reply to one of our requests.
    Message(ServerMessage),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Not connected")]
    NotConnected,

    #[error("Server rejected the token")]
    Unauthorized,

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Connection closed")]
    Closed,

    #[error("Request timed out")]
    Timeout,

    #[error("Offline queue full")]
    QueueFull,

    #[error("{code}: {error}")]
    Rejected {
        code: String,
        error: String,
        locked_by: Option<String>,
    },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl ClientError {
    /// Error code reported by the server, if the request reached it.
    pub fn code(&self) -> Option<&str> {
        match self {
            ClientError::Rejected { code, .. } => Some(code),
            _ => None,
        }
    }
}

/// Turn a failure reply into [`ClientError::Rejected`].
fn accepted(reply: Reply) -> Result<Reply, ClientError> {
    if reply.success {
        return Ok(reply);
    }
    Err(ClientError::Rejected {
        code: reply.code.unwrap_or_default(),
        error: reply.error.unwrap_or_default(),
        locked_by: reply.locked_by,
    })
}

/// Widget changes made while disconnected, replayed on reconnection.
pub struct OfflineQueue {
    queue: VecDeque<QueuedChange>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct QueuedChange {
    room_id: String,
    change: ChangeRequest,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue a change; `false` when the queue is full.
    pub fn enqueue(&mut self, room_id: &str, change: ChangeRequest) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(QueuedChange {
            room_id: room_id.to_string(),
            change,
        });
        true
    }

    pub fn drain(&mut self) -> Vec<(String, ChangeRequest)> {
        self.queue
            .drain(..)
            .map(|q| (q.room_id, q.change))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

type PendingReplies = Arc<Mutex<HashMap<String, oneshot::Sender<Reply>>>>;

/// Non-blocking sender for [`ClientEvent`]s.
#[derive(Debug, Clone)]
struct EventSink {
    tx: mpsc::Sender<ClientEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventSink {
    fn emit(&self, event: ClientEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed);
                if dropped % EVENT_CAPACITY as u64 == 0 {
                    log::warn!("Event channel full; {} events dropped so far", dropped + 1);
                }
            }
            // Receiver dropped: the caller is not listening.
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// The collaboration client.
pub struct CollabClient {
    server_url: String,
    token: String,

    state: Arc<RwLock<ConnectionState>>,

    /// Rooms to rejoin after a reconnect.
    rooms: Arc<Mutex<BTreeSet<String>>>,

    offline_queue: Arc<Mutex<OfflineQueue>>,

    /// Replies awaited by in-flight requests, keyed by request id.
    pending: PendingReplies,
    next_request: AtomicU64,

    /// Bumped on every connect/disconnect so a stale reader task cannot
    /// touch the state of a newer connection.
    epoch: Arc<AtomicU64>,

    outgoing_tx: Option<mpsc::Sender<String>>,

    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    events: EventSink,
}

impl CollabClient {
    pub fn new(server_url: impl Into<String>, token: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        Self {
            server_url: server_url.into(),
            token: token.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            rooms: Arc::new(Mutex::new(BTreeSet::new())),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(10_000))),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_request: AtomicU64::new(1),
            epoch: Arc::new(AtomicU64::new(0)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            events: EventSink {
                tx: event_tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect to the gateway, presenting the token as a bearer header.
    ///
    /// Spawns background tasks for reading/writing WebSocket frames.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        *self.state.write().await = ConnectionState::Connecting;

        let result = self.open().await;
        if result.is_err() {
            *self.state.write().await = ConnectionState::Disconnected;
        }
        result
    }

    async fn open(&mut self) -> Result<(), ClientError> {
        let mut request = self
            .server_url
            .as_str()
            .into_client_request()
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.token))
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws_stream, _) = match tokio_tungstenite::connect_async(request).await {
            Ok(ok) => ok,
            Err(tokio_tungstenite::tungstenite::Error::Http(response))
                if response.status() == StatusCode::UNAUTHORIZED =>
            {
                return Err(ClientError::Unauthorized);
            }
            Err(e) => return Err(ClientError::Connect(e.to_string())),
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Rejoin rooms, then replay offline edits; the gateway handles a
        // connection's frames in order, so joins land first.
        let rooms: Vec<String> = self.rooms.lock().await.iter().cloned().collect();
        let queued = self.offline_queue.lock().await.drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued changes", queued.len());
        }
        let replay = rooms
            .into_iter()
            .map(|room_id| ClientMessage::Join { room_id })
            .chain(
                queued
                    .into_iter()
                    .map(|(room_id, change)| ClientMessage::Change { room_id, change }),
            );
        for message in replay {
            let text = Inbound::new(None, message).encode()?;
            out_tx.send(text).await.map_err(|_| ClientError::Closed)?;
        }

        self.outgoing_tx = Some(out_tx);
        *self.state.write().await = ConnectionState::Connected;
        self.events.emit(ClientEvent::Connected);

        // Reader task: route replies to waiters, everything else to events
        let events = self.events.clone();
        let state = self.state.clone();
        let pending = self.pending.clone();
        let epoch = self.epoch.clone();
        let generation = epoch.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerMessage::decode(text.as_str()) {
                        Ok(ServerMessage::Reply(reply)) => {
                            let waiter = match &reply.request_id {
                                Some(id) => pending.lock().await.remove(id),
                                None => None,
                            };
                            match waiter {
                                Some(tx) => {
                                    let _ = tx.send(reply);
                                }
                                None => events.emit(ClientEvent::Message(ServerMessage::Reply(reply))),
                            }
                        }
                        Ok(other) => events.emit(ClientEvent::Message(other)),
                        Err(e) => log::warn!("Undecodable frame from server: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            if epoch.load(Ordering::SeqCst) != generation {
                return;
            }
            // Connection lost; dropping the waiters wakes them with `Closed`
            *state.write().await = ConnectionState::Disconnected;
            pending.lock().await.clear();
            events.emit(ClientEvent::Disconnected);
        });

        Ok(())
    }

    /// Close the connection. Rooms stay remembered for the next connect.
    pub async fn disconnect(&mut self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        // Dropping the sender ends the writer task, which closes the socket.
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
        self.pending.lock().await.clear();
        self.events.emit(ClientEvent::Disconnected);
    }

    async fn outgoing(&self) -> Result<&mpsc::Sender<String>, ClientError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        self.outgoing_tx.as_ref().ok_or(ClientError::NotConnected)
    }

    /// Send a message and wait for its reply.
    ///
    /// Failure replies come back as `Ok`; the typed helpers below turn them
    /// into [`ClientError::Rejected`].
    pub async fn request(&self, message: ClientMessage) -> Result<Reply, ClientError> {
        let tx = self.outgoing().await?;
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed).to_string();
        let text = Inbound::new(Some(request_id.clone()), message).encode()?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), reply_tx);
        if tx.send(text).await.is_err() {
            self.pending.lock().await.remove(&request_id);
            return Err(ClientError::Closed);
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                Err(ClientError::Timeout)
            }
        }
    }

    /// Send without waiting. A failure reply arrives as an event.
    async fn notify(&self, message: ClientMessage) -> Result<(), ClientError> {
        let tx = self.outgoing().await?;
        let text = Inbound::new(None, message).encode()?;
        tx.send(text).await.map_err(|_| ClientError::Closed)
    }

    pub async fn join(&self, room_id: &str) -> Result<JoinOutcome, ClientError> {
        let reply = accepted(
            self.request(ClientMessage::Join {
                room_id: room_id.to_string(),
            })
            .await?,
        )?;
        self.rooms.lock().await.insert(room_id.to_string());
        Ok(JoinOutcome {
            participants: reply.participants.unwrap_or_default(),
            locks: reply.locks.unwrap_or_default(),
        })
    }

    pub async fn leave(&self, room_id: &str) -> Result<(), ClientError> {
        self.rooms.lock().await.remove(room_id);
        accepted(
            self.request(ClientMessage::Leave {
                room_id: room_id.to_string(),
            })
            .await?,
        )?;
        Ok(())
    }

    pub async fn lock(&self, room_id: &str, widget_id: &str) -> Result<Option<LockInfo>, ClientError> {
        let reply = accepted(
            self.request(ClientMessage::Lock {
                room_id: room_id.to_string(),
                widget_id: widget_id.to_string(),
            })
            .await?,
        )?;
        Ok(reply.lock)
    }

    pub async fn unlock(&self, room_id: &str, widget_id: &str) -> Result<(), ClientError> {
        accepted(
            self.request(ClientMessage::Unlock {
                room_id: room_id.to_string(),
                widget_id: widget_id.to_string(),
            })
            .await?,
        )?;
        Ok(())
    }

    /// Submit a widget change.
    ///
    /// While disconnected the change is queued and `Ok(None)` is returned;
    /// otherwise the reconciled change comes back.
    pub async fn change(
        &self,
        room_id: &str,
        change: ChangeRequest,
    ) -> Result<Option<Change>, ClientError> {
        if self.connection_state().await != ConnectionState::Connected {
            let mut queue = self.offline_queue.lock().await;
            if !queue.enqueue(room_id, change) {
                return Err(ClientError::QueueFull);
            }
            return Ok(None);
        }
        let reply = accepted(
            self.request(ClientMessage::Change {
                room_id: room_id.to_string(),
                change,
            })
            .await?,
        )?;
        Ok(reply.change)
    }

    /// Move our cursor. Dropped silently while offline.
    pub async fn cursor(&self, room_id: &str, cursor: Cursor) -> Result<(), ClientError> {
        if self.connection_state().await != ConnectionState::Connected {
            return Ok(());
        }
        self.notify(ClientMessage::CursorMove {
            room_id: room_id.to_string(),
            cursor,
        })
        .await
    }

    pub async fn presence(
        &self,
        room_id: &str,
        status: PresenceStatus,
        active_widget_id: Option<String>,
    ) -> Result<(), ClientError> {
        accepted(
            self.request(ClientMessage::Presence {
                room_id: room_id.to_string(),
                status,
                active_widget_id,
            })
            .await?,
        )?;
        Ok(())
    }

    pub async fn chat(
        &self,
        room_id: &str,
        message: &str,
        widget_id: Option<String>,
    ) -> Result<Option<ChatMessage>, ClientError> {
        let reply = accepted(
            self.request(ClientMessage::Chat {
                room_id: room_id.to_string(),
                message: message.to_string(),
                widget_id,
            })
            .await?,
        )?;
        Ok(reply.message)
    }

    pub async fn activity_feed(
        &self,
        room_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ActivityEntry>, ClientError> {
        let reply = accepted(
            self.request(ClientMessage::ActivityFeed {
                room_id: room_id.to_string(),
                limit,
            })
            .await?,
        )?;
        Ok(reply.activities.unwrap_or_default())
    }

    /// Relay a signaling payload; returns how many connections received it.
    pub async fn signal(
        &self,
        kind: SignalKind,
        room_id: &str,
        target_user_id: &str,
        payload: Value,
    ) -> Result<usize, ClientError> {
        let signal = SignalRequest {
            room_id: room_id.to_string(),
            target_user_id: target_user_id.to_string(),
            payload,
        };
        let message = match kind {
            SignalKind::Offer => ClientMessage::Offer(signal),
            SignalKind::Answer => ClientMessage::Answer(signal),
            SignalKind::IceCandidate => ClientMessage::IceCandidate(signal),
        };
        let reply = accepted(self.request(message).await?)?;
        Ok(reply.delivered.unwrap_or(0))
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Rooms the client is in (and will rejoin on reconnect).
    pub async fn rooms(&self) -> Vec<String> {
        self.rooms.lock().await.iter().cloned().collect()
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }

    /// Events dropped because the event channel was full.
    pub fn dropped_events(&self) -> u64 {
        self.events.dropped.load(Ordering::Relaxed)
    }
}
