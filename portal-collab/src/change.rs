//! Widget changes and the logical clock that stamps them.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use crate::value::Value;

/// Kind of widget change. Determines the merge rule used by the transform engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Config,
    Position,
    Size,
    Content,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Config => "config",
            ChangeKind::Position => "position",
            ChangeKind::Size => "size",
            ChangeKind::Content => "content",
        }
    }
}

/// An edit as submitted by a client, before the server stamps it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRequest {
    pub widget_id: String,
    pub change_type: ChangeKind,
    #[serde(default)]
    pub old_value: Value,
    #[serde(default)]
    pub new_value: Value,
}

/// A stamped widget change.
///
/// Produced from a [`ChangeRequest`], reconciled at most once against its
/// concurrent set, then treated as immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub widget_id: String,
    pub change_type: ChangeKind,
    pub old_value: Value,
    pub new_value: Value,
    pub user_id: String,
    /// Logical timestamp (millis, monotonic per process).
    pub timestamp: u64,
}

impl Change {
    pub fn new(
        widget_id: impl Into<String>,
        change_type: ChangeKind,
        new_value: Value,
        user_id: impl Into<String>,
        timestamp: u64,
    ) -> Self {
        Self {
            widget_id: widget_id.into(),
            change_type,
            old_value: Value::Null,
            new_value,
            user_id: user_id.into(),
            timestamp,
        }
    }

    pub fn from_request(req: ChangeRequest, user_id: impl Into<String>, timestamp: u64) -> Self {
        Self {
            widget_id: req.widget_id,
            change_type: req.change_type,
            old_value: req.old_value,
            new_value: req.new_value,
            user_id: user_id.into(),
            timestamp,
        }
    }
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Millisecond clock that never goes backwards within a process.
///
/// Returns wall-clock millis, bumped by one whenever the wall clock
/// stalls or steps back.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: AtomicU64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> u64 {
        let wall = now_millis();
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = wall.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }
}
