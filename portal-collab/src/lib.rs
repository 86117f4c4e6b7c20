//! # portal-collab: Real-time collaborative dashboard editing
//!
//! Several users edit the widgets of one dashboard at the same time. Each
//! dashboard is a room; the server serialises edits per room, reconciles
//! concurrent ones and fans the results out to everyone else.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐    WebSocket (JSON)    ┌──────────────┐
//! │ CollabClient │ ◄────────────────────► │ CollabServer │
//! │  (per tab)   │   Bearer token auth    │  (gateway)   │
//! └──────────────┘                        └──────┬───────┘
//!                                                │
//!                                         ┌──────┴───────┐
//!                                         │ CollabService│
//!                                         │ rooms, locks │
//!                                         └──┬────────┬──┘
//!                               ┌────────────┘        └───────────┐
//!                        ┌──────┴───────┐                  ┌──────┴──────┐
//!                        │ VersionTracker│                 │  Recorder   │
//!                        │ + transform   │                 │ (TTL logs)  │
//!                        └───────────────┘                 └──────┬──────┘
//!                                                                 │
//!                                                    KvStore: Memory / RocksDB
//! ```
//!
//! ## Modules
//!
//! - [`value`]: JSON-like widget values
//! - [`change`]: Change requests and stamped changes
//! - [`version`]: Per-widget change log and concurrency detection
//! - [`transform`]: Operational transform of concurrent changes
//! - [`session`]: Rooms, participants, widget locks
//! - [`broadcast`]: Per-room fan-out to connection outboxes
//! - [`recorder`]: History, activity and chat logs
//! - [`storage`]: TTL key-value stores
//! - [`auth`]: Bearer tokens and room access policy
//! - [`protocol`]: JSON wire messages
//! - [`server`]: WebSocket gateway
//! - [`http`]: REST query API
//! - [`client`]: WebSocket client

pub mod auth;
pub mod broadcast;
pub mod change;
pub mod client;
pub mod error;
pub mod http;
pub mod protocol;
pub mod recorder;
pub mod server;
pub mod session;
pub mod storage;
pub mod transform;
pub mod value;
pub mod version;

// Re-exports for convenience
pub use auth::{AccessPolicy, Identity, TokenVerifier, WorkspacePolicy};
pub use broadcast::{outbox_channel, BroadcastGroup, BroadcastStats, Inbox, Outbox};
pub use change::{Change, ChangeKind, ChangeRequest, MonotonicClock};
pub use client::{ClientError, ClientEvent, CollabClient, ConnectionState, OfflineQueue};
pub use error::{CollabError, CollabResult};
pub use protocol::{
    ClientMessage, Cursor, Inbound, PresenceStatus, ProtocolError, Reply, ServerMessage,
    SignalKind,
};
pub use recorder::{ActivityAction, ActivityEntry, ChatMessage, HistoryEntry, LogKind, Recorder};
pub use server::{CollabServer, ConfigError, ServerConfig, ServerStats};
pub use session::{CollabService, ConnectionHandle, LockInfo, ParticipantSession, RoomStats};
pub use storage::{KvStore, MemoryStore, RocksStore, StoreConfig, StoreError};
pub use transform::transform_all;
pub use value::Value;
pub use version::VersionTracker;
