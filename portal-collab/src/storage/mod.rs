//! Key/value persistence with per-key expiry.
//!
//! The recorder only needs `get`, `set` with a TTL, and `del`. Two backends:
//!
//! ```text
//! ┌──────────────┐   KvStore   ┌──────────────┐
//! │  Recorder    │ ──────────► │ MemoryStore  │  (tests, single process)
//! │ (writer task)│             ├──────────────┤
//! └──────────────┘             │ RocksStore   │  (durable, LZ4 envelopes)
//!                              └──────────────┘
//! ```
//!
//! Calls are blocking; async callers go through `spawn_blocking`.

pub mod memory;
pub mod rocks;

use std::time::Duration;
use thiserror::Error;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Store lock poisoned")]
    Poisoned,
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Minimal key/value interface with TTL.
pub trait KvStore: Send + Sync {
    /// Value for `key`, or `None` if absent or expired.
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write `value` under `key`, expiring after `ttl`.
    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    fn del(&self, key: &str) -> Result<(), StoreError>;

    /// Drop every expired key. Returns how many were removed.
    fn purge_expired(&self) -> Result<usize, StoreError> {
        Ok(0)
    }
}
