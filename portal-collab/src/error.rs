//! Error taxonomy for the collaboration core.

use thiserror::Error;

/// Errors surfaced by collaboration operations.
///
/// Only [`CollabError::AuthRejected`] ends a connection; every other kind is
/// answered with a `{success: false}` reply and the connection stays open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollabError {
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("access denied to room {room_id}")]
    AccessDenied { room_id: String },

    #[error("widget {widget_id} is locked by {locked_by}")]
    LockConflict { widget_id: String, locked_by: String },

    #[error("not joined to room {room_id}")]
    NotJoined { room_id: String },

    #[error("room {room_id} is full")]
    RoomFull { room_id: String },

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("malformed message: {0}")]
    Malformed(String),
}

impl CollabError {
    /// Short machine-readable code used in replies.
    pub fn code(&self) -> &'static str {
        match self {
            CollabError::AuthRejected(_) => "AUTH_REJECTED",
            CollabError::AccessDenied { .. } => "ACCESS_DENIED",
            CollabError::LockConflict { .. } => "LOCK_CONFLICT",
            CollabError::NotJoined { .. } => "NOT_JOINED",
            CollabError::RoomFull { .. } => "ROOM_FULL",
            CollabError::Persistence(_) => "PERSISTENCE",
            CollabError::Malformed(_) => "MALFORMED",
        }
    }
}

pub type CollabResult<T> = Result<T, CollabError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = CollabError::LockConflict {
            widget_id: "w1".into(),
            locked_by: "Alice".into(),
        };
        assert_eq!(err.to_string(), "widget w1 is locked by Alice");
        assert_eq!(err.code(), "LOCK_CONFLICT");
    }

    #[test]
    fn test_codes_distinct() {
        let errs = [
            CollabError::AuthRejected("x".into()),
            CollabError::AccessDenied { room_id: "r".into() },
            CollabError::NotJoined { room_id: "r".into() },
            CollabError::RoomFull { room_id: "r".into() },
            CollabError::Persistence("x".into()),
            CollabError::Malformed("x".into()),
        ];
        let mut codes: Vec<&str> = errs.iter().map(|e| e.code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errs.len());
    }
}
