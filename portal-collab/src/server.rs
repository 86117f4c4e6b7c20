//! WebSocket gateway in front of the room session manager.
//!
//! Architecture:
//! ```text
//! Client A ──┐  (Bearer token checked in the handshake, 401 on failure)
//!             ├── connection task ── route() ── CollabService ── Room (mutex)
//! Client B ──┘        ▲                                            │
//!                     └──────────── outbox (mpsc) ◄── BroadcastGroup
//!                                                                  │
//!                                              Recorder ── KvStore (Memory / RocksDB)
//! ```
//!
//! Each connection runs one task that reads frames in order, dispatches them
//! and drains its outbox to the socket. Replies go through the outbox too, so
//! a client sees frames in the order the server produced them. The outbox is
//! bounded; a client that falls `outbox_capacity` frames behind is
//! disconnected and resyncs by rejoining.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use crate::auth::{bearer_token, query_token, AccessPolicy, Identity, TokenVerifier, WorkspacePolicy};
use crate::broadcast::{outbox_channel, Inbox, DEFAULT_OUTBOX_CAPACITY};
use crate::change::Change;
use crate::error::{CollabError, CollabResult};
use crate::http::{self, AppState};
use crate::protocol::{ClientMessage, Inbound, Reply, ServerMessage, SignalKind, SignalRequest};
use crate::recorder::Recorder;
use crate::session::{CollabService, ConnectionHandle, ServiceConfig};
use crate::storage::{KvStore, MemoryStore, RocksStore, StoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// WebSocket address to bind to
    pub bind_addr: String,
    /// Query API address (None = disabled)
    pub http_bind_addr: Option<String>,
    /// Maximum distinct users per room (0 = unlimited)
    pub max_participants_per_room: usize,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Frames a connection may have queued before it is dropped as too slow
    pub outbox_capacity: usize,
    /// Expired-key sweep interval in seconds
    pub sweep_interval_secs: u64,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// HMAC secret for bearer tokens
    pub jwt_secret: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            http_bind_addr: Some("127.0.0.1:9091".to_string()),
            max_participants_per_room: 100,
            heartbeat_interval_secs: 30,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            sweep_interval_secs: 300,
            storage_path: None,
            jwt_secret: "dev-secret-change-me".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var} must be set")]
    Missing { var: &'static str },
    #[error("{var} has invalid value {value:?}")]
    Invalid { var: &'static str, value: String },
}

impl ServerConfig {
    /// Load configuration from the process environment.
    ///
    /// | Env Var                    | Required | Default          |
    /// |----------------------------|----------|------------------|
    /// | `COLLAB_JWT_SECRET`        | **yes**  | --               |
    /// | `COLLAB_BIND_ADDR`         | no       | `127.0.0.1:9090` |
    /// | `COLLAB_HTTP_BIND_ADDR`    | no       | `127.0.0.1:9091` (`off` disables) |
    /// | `COLLAB_MAX_PARTICIPANTS`  | no       | `100`            |
    /// | `COLLAB_HEARTBEAT_SECS`    | no       | `30`             |
    /// | `COLLAB_OUTBOX_CAPACITY`   | no       | `1024`           |
    /// | `COLLAB_SWEEP_SECS`        | no       | `300`            |
    /// | `COLLAB_STORAGE_PATH`      | no       | in-memory        |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary variable source.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let jwt_secret = get("COLLAB_JWT_SECRET")
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing {
                var: "COLLAB_JWT_SECRET",
            })?;

        let http_bind_addr = match get("COLLAB_HTTP_BIND_ADDR") {
            Some(v) if v.is_empty() || v.eq_ignore_ascii_case("off") => None,
            Some(v) => Some(v),
            None => defaults.http_bind_addr,
        };

        Ok(Self {
            bind_addr: get("COLLAB_BIND_ADDR").unwrap_or(defaults.bind_addr),
            http_bind_addr,
            max_participants_per_room: parse_var(
                &get,
                "COLLAB_MAX_PARTICIPANTS",
                defaults.max_participants_per_room,
            )?,
            heartbeat_interval_secs: parse_var(
                &get,
                "COLLAB_HEARTBEAT_SECS",
                defaults.heartbeat_interval_secs,
            )?,
            outbox_capacity: parse_var(&get, "COLLAB_OUTBOX_CAPACITY", defaults.outbox_capacity)?,
            sweep_interval_secs: parse_var(&get, "COLLAB_SWEEP_SECS", defaults.sweep_interval_secs)?,
            storage_path: get("COLLAB_STORAGE_PATH")
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            jwt_secret,
        })
    }
}

fn parse_var<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(var) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value }),
        None => Ok(default),
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub malformed_messages: u64,
    pub slow_disconnects: u64,
    pub purged_keys: u64,
}

/// State shared by every connection task.
struct Gateway {
    service: Arc<CollabService>,
    verifier: TokenVerifier,
    stats: RwLock<ServerStats>,
    heartbeat: Duration,
    outbox_capacity: usize,
}

/// The collaboration server.
pub struct CollabServer {
    config: ServerConfig,
    gateway: Arc<Gateway>,
    store: Arc<dyn KvStore>,
}

impl CollabServer {
    /// Create a server with the default workspace access policy.
    ///
    /// Starts the recorder's writer task, so it must be called from within
    /// a Tokio runtime.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        Self::with_policy(config, Arc::new(WorkspacePolicy))
    }

    pub fn with_policy(
        config: ServerConfig,
        policy: Arc<dyn AccessPolicy>,
    ) -> Result<Self, StoreError> {
        let store: Arc<dyn KvStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?),
            None => Arc::new(MemoryStore::new()),
        };
        let service = CollabService::new(
            Recorder::spawn(store.clone()),
            policy,
            ServiceConfig {
                max_participants_per_room: config.max_participants_per_room,
            },
        );
        let gateway = Gateway {
            service: Arc::new(service),
            verifier: TokenVerifier::new(&config.jwt_secret),
            stats: RwLock::new(ServerStats::default()),
            heartbeat: Duration::from_secs(config.heartbeat_interval_secs.max(1)),
            outbox_capacity: config.outbox_capacity.max(1),
        };
        Ok(Self {
            config,
            gateway: Arc::new(gateway),
            store,
        })
    }

    /// Start listening for WebSocket connections.
    ///
    /// Also starts the query API (if configured) and the expired-key sweep.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Collaboration server listening on {}", self.config.bind_addr);

        if let Some(addr) = &self.config.http_bind_addr {
            let http_listener = TcpListener::bind(addr).await?;
            let state = self.app_state();
            tokio::spawn(async move {
                if let Err(e) = http::serve(http_listener, state).await {
                    log::error!("Query API stopped: {e}");
                }
            });
        }

        self.spawn_sweeper();

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let gateway = self.gateway.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, gateway).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    fn spawn_sweeper(&self) {
        let store = self.store.clone();
        let gateway = self.gateway.clone();
        let period = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let store = store.clone();
                match tokio::task::spawn_blocking(move || store.purge_expired()).await {
                    Ok(Ok(0)) => {}
                    Ok(Ok(n)) => {
                        log::info!("Purged {n} expired keys");
                        gateway.stats.write().await.purged_keys += n as u64;
                    }
                    Ok(Err(e)) => log::error!("Expired-key sweep failed: {e}"),
                    Err(e) => log::error!("Expired-key sweep panicked: {e}"),
                }
            }
        });
    }

    /// Handler state for the query API.
    pub fn app_state(&self) -> AppState {
        AppState {
            service: self.gateway.service.clone(),
            verifier: self.gateway.verifier.clone(),
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.gateway.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn service(&self) -> &Arc<CollabService> {
        &self.gateway.service
    }

    pub fn verifier(&self) -> &TokenVerifier {
        &self.gateway.verifier
    }
}

fn unauthorized(reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(format!("Unauthorized: {reason}")));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    gateway: Arc<Gateway>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut identity: Option<Identity> = None;
    let verifier = &gateway.verifier;
    let handshake = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        let token = req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(bearer_token)
            .or_else(|| req.uri().query().and_then(query_token));
        let Some(token) = token else {
            return Err(unauthorized("missing bearer token"));
        };
        match verifier.verify(token) {
            Ok(id) => {
                identity = Some(id);
                Ok(resp)
            }
            Err(e) => Err(unauthorized(&e.to_string())),
        }
    })
    .await;

    let ws_stream = match handshake {
        Ok(ws) => ws,
        Err(e) => {
            log::warn!("Rejected handshake from {addr}: {e}");
            gateway.stats.write().await.rejected_connections += 1;
            return Ok(());
        }
    };
    let Some(identity) = identity else {
        return Ok(());
    };
    log::info!(
        "WebSocket connection established from {addr} for user {}",
        identity.user_id
    );

    {
        let mut s = gateway.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let (outbox, mut inbox) = outbox_channel(gateway.outbox_capacity);
    let mut conn = ConnectionHandle::new(identity, outbox);
    let result = run_session(ws_stream, &mut inbox, &mut conn, &gateway, addr).await;

    // Same cleanup as an explicit leave, whatever ended the session.
    let left = gateway.service.disconnect(conn).await;
    if left > 0 {
        log::info!("Connection from {addr} closed; left {left} rooms");
    }
    gateway.stats.write().await.active_connections -= 1;
    result
}

async fn run_session(
    ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    inbox: &mut Inbox,
    conn: &mut ConnectionHandle,
    gateway: &Gateway,
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let mut heartbeat = tokio::time::interval(gateway.heartbeat);
    heartbeat.tick().await;
    let overflow = inbox.overflow_signal();

    loop {
        tokio::select! {
            // Incoming WebSocket message
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        gateway.stats.write().await.total_messages += 1;
                        if let Some(out) = dispatch(&gateway.service, conn, text.as_str()).await {
                            if matches!(out, ServerMessage::Error { .. }) {
                                gateway.stats.write().await.malformed_messages += 1;
                            }
                            conn.send(&out);
                        }
                    }

                    Some(Ok(Message::Binary(_))) => {
                        log::warn!("Binary frame from {addr} ignored");
                        conn.send(&ServerMessage::error(&CollabError::Malformed(
                            "binary frames are not supported".into(),
                        )));
                    }

                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break;
                    }

                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }

                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break;
                    }

                    _ => {}
                }
            }

            // Outgoing frames: replies and room broadcasts
            frame = inbox.recv() => {
                match frame {
                    Some(frame) => ws_sender.send(Message::Text(frame.as_ref().into())).await?,
                    None => break,
                }
            }

            _ = overflow.notified() => {
                log::warn!(
                    "Outbox for {addr} full ({} frames); closing slow connection",
                    gateway.outbox_capacity
                );
                gateway.stats.write().await.slow_disconnects += 1;
                break;
            }

            _ = heartbeat.tick() => {
                ws_sender.send(Message::Ping(Default::default())).await?;
            }
        }
    }

    Ok(())
}

/// Decode one text frame, run it, and produce the frame to send back.
///
/// Returns `None` for messages that are answered only on failure
/// (`cursor:move`).
pub async fn dispatch(
    service: &CollabService,
    conn: &mut ConnectionHandle,
    text: &str,
) -> Option<ServerMessage> {
    let Inbound {
        request_id,
        message,
    } = match Inbound::decode(text) {
        Ok(inbound) => inbound,
        Err(e) => {
            log::warn!("Malformed frame from user {}: {e}", conn.identity.user_id);
            return Some(ServerMessage::error(&CollabError::Malformed(e.to_string())));
        }
    };

    log::trace!(
        "{} -> {} in {}",
        conn.identity.user_id,
        message.kind(),
        message.room_id()
    );
    match route(service, conn, message).await {
        Ok(Some(reply)) => Some(ServerMessage::Reply(reply.with_request_id(request_id))),
        Ok(None) => None,
        Err(e) => Some(ServerMessage::Reply(
            Reply::failure(&e).with_request_id(request_id),
        )),
    }
}

async fn route(
    service: &CollabService,
    conn: &mut ConnectionHandle,
    message: ClientMessage,
) -> CollabResult<Option<Reply>> {
    let reply = match message {
        ClientMessage::Join { room_id } => {
            let joined = service.join(conn, &room_id).await?;
            Reply {
                participants: Some(joined.participants),
                locks: Some(joined.locks),
                ..Reply::ok()
            }
        }
        ClientMessage::Leave { room_id } => {
            service.leave(conn, &room_id).await?;
            Reply::ok()
        }
        ClientMessage::CursorMove { room_id, cursor } => {
            service.cursor_move(conn, &room_id, cursor).await?;
            return Ok(None);
        }
        ClientMessage::Lock { room_id, widget_id } => {
            let lock = service.lock_widget(conn, &room_id, &widget_id).await?;
            Reply {
                lock: Some(lock),
                ..Reply::ok()
            }
        }
        ClientMessage::Unlock { room_id, widget_id } => {
            service.unlock_widget(conn, &room_id, &widget_id).await?;
            Reply::ok()
        }
        ClientMessage::Change { room_id, change } => {
            let change: Change = service.submit_change(conn, &room_id, change).await?;
            Reply {
                change: Some(change),
                ..Reply::ok()
            }
        }
        ClientMessage::Presence {
            room_id,
            status,
            active_widget_id,
        } => {
            service
                .update_presence(conn, &room_id, status, active_widget_id)
                .await?;
            Reply::ok()
        }
        ClientMessage::ActivityFeed { room_id, limit } => {
            let activities = service.activity_feed(conn, &room_id, limit).await?;
            Reply {
                activities: Some(activities),
                ..Reply::ok()
            }
        }
        ClientMessage::Chat {
            room_id,
            message,
            widget_id,
        } => {
            let message = service.chat(conn, &room_id, message, widget_id).await?;
            Reply {
                message: Some(message),
                ..Reply::ok()
            }
        }
        ClientMessage::Offer(signal) => relay(service, conn, SignalKind::Offer, signal).await?,
        ClientMessage::Answer(signal) => relay(service, conn, SignalKind::Answer, signal).await?,
        ClientMessage::IceCandidate(signal) => {
            relay(service, conn, SignalKind::IceCandidate, signal).await?
        }
    };
    Ok(Some(reply))
}

async fn relay(
    service: &CollabService,
    conn: &ConnectionHandle,
    kind: SignalKind,
    signal: SignalRequest,
) -> CollabResult<Reply> {
    let delivered = service
        .relay_signal(
            conn,
            &signal.room_id,
            kind,
            &signal.target_user_id,
            signal.payload,
        )
        .await?;
    Ok(Reply {
        delivered: Some(delivered),
        ..Reply::ok()
    })
}
