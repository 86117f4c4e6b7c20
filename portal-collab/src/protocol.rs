//! JSON wire protocol for the collaboration gateway.
//!
//! Every frame is a WebSocket text message holding one JSON object with a
//! `type` tag:
//!
//! ```text
//! → {"type": "widget:lock", "requestId": "7", "roomId": "r1", "widgetId": "w1"}
//! ← {"type": "reply", "requestId": "7", "success": false,
//!    "error": "widget w1 is locked by Alice", "code": "LOCK_CONFLICT", "lockedBy": "Alice"}
//! ← {"type": "widget:locked", "roomId": "r1", "widgetId": "w1", ...}   (to other members)
//! ```
//!
//! `requestId` is optional and echoed back in the matching `reply`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::change::{Change, ChangeRequest};
use crate::error::CollabError;
use crate::recorder::{ActivityEntry, ChatMessage};
use crate::session::{LockInfo, ParticipantSession};
use crate::value::Value;

/// Cursor position within a dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub widget_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_id: Option<String>,
}

impl Cursor {
    pub fn at(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            widget_id: None,
            element_id: None,
        }
    }
}

/// Participant activity status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    #[default]
    Active,
    Idle,
    Away,
}

/// Peer-signaling message kinds relayed verbatim between participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
        }
    }
}

/// Inbound signaling payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalRequest {
    pub room_id: String,
    pub target_user_id: String,
    #[serde(default)]
    pub payload: Value,
}

/// Outbound signaling relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalRelay {
    pub room_id: String,
    pub from_user_id: String,
    pub payload: Value,
}

/// Messages a client sends to the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    #[serde(rename = "join")]
    Join { room_id: String },

    #[serde(rename = "leave")]
    Leave { room_id: String },

    #[serde(rename = "cursor:move")]
    CursorMove { room_id: String, cursor: Cursor },

    #[serde(rename = "widget:lock")]
    Lock { room_id: String, widget_id: String },

    #[serde(rename = "widget:unlock")]
    Unlock { room_id: String, widget_id: String },

    #[serde(rename = "widget:change")]
    Change { room_id: String, change: ChangeRequest },

    #[serde(rename = "presence:update")]
    Presence {
        room_id: String,
        status: PresenceStatus,
        #[serde(default)]
        active_widget_id: Option<String>,
    },

    #[serde(rename = "activity:feed")]
    ActivityFeed {
        room_id: String,
        #[serde(default)]
        limit: Option<usize>,
    },

    #[serde(rename = "chat:message")]
    Chat {
        room_id: String,
        message: String,
        #[serde(default)]
        widget_id: Option<String>,
    },

    #[serde(rename = "offer")]
    Offer(SignalRequest),

    #[serde(rename = "answer")]
    Answer(SignalRequest),

    #[serde(rename = "ice-candidate")]
    IceCandidate(SignalRequest),
}

impl ClientMessage {
    /// Room this message targets.
    pub fn room_id(&self) -> &str {
        match self {
            ClientMessage::Join { room_id }
            | ClientMessage::Leave { room_id }
            | ClientMessage::CursorMove { room_id, .. }
            | ClientMessage::Lock { room_id, .. }
            | ClientMessage::Unlock { room_id, .. }
            | ClientMessage::Change { room_id, .. }
            | ClientMessage::Presence { room_id, .. }
            | ClientMessage::ActivityFeed { room_id, .. }
            | ClientMessage::Chat { room_id, .. } => room_id,
            ClientMessage::Offer(s) | ClientMessage::Answer(s) | ClientMessage::IceCandidate(s) => {
                &s.room_id
            }
        }
    }

    /// Wire tag of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Join { .. } => "join",
            ClientMessage::Leave { .. } => "leave",
            ClientMessage::CursorMove { .. } => "cursor:move",
            ClientMessage::Lock { .. } => "widget:lock",
            ClientMessage::Unlock { .. } => "widget:unlock",
            ClientMessage::Change { .. } => "widget:change",
            ClientMessage::Presence { .. } => "presence:update",
            ClientMessage::ActivityFeed { .. } => "activity:feed",
            ClientMessage::Chat { .. } => "chat:message",
            ClientMessage::Offer(_) => SignalKind::Offer.as_str(),
            ClientMessage::Answer(_) => SignalKind::Answer.as_str(),
            ClientMessage::IceCandidate(_) => SignalKind::IceCandidate.as_str(),
        }
    }
}

/// A client frame: optional correlation id plus the message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inbound {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub message: ClientMessage,
}

impl Inbound {
    pub fn new(request_id: Option<String>, message: ClientMessage) -> Self {
        Self {
            request_id,
            message,
        }
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Direct answer to an inbound request.
///
/// Flat object: `success` plus whichever payload fields apply.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participants: Option<Vec<ParticipantSession>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locks: Option<Vec<LockInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<LockInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<Change>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activities: Option<Vec<ActivityEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered: Option<usize>,
}

impl Reply {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn failure(err: &CollabError) -> Self {
        let locked_by = match err {
            CollabError::LockConflict { locked_by, .. } => Some(locked_by.clone()),
            _ => None,
        };
        Self {
            success: false,
            error: Some(err.to_string()),
            code: Some(err.code().to_string()),
            locked_by,
            ..Self::default()
        }
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }
}

/// Messages the gateway sends to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    #[serde(rename = "user:joined")]
    UserJoined {
        room_id: String,
        user: ParticipantSession,
    },

    #[serde(rename = "user:left")]
    UserLeft {
        room_id: String,
        user_id: String,
        display_name: String,
    },

    #[serde(rename = "cursor:update")]
    CursorUpdate {
        room_id: String,
        user_id: String,
        display_name: String,
        cursor: Cursor,
    },

    #[serde(rename = "widget:locked")]
    WidgetLocked { room_id: String, lock: LockInfo },

    #[serde(rename = "widget:unlocked")]
    WidgetUnlocked {
        room_id: String,
        widget_id: String,
        user_id: String,
    },

    #[serde(rename = "widget:changed")]
    WidgetChanged {
        room_id: String,
        display_name: String,
        change: Change,
    },

    #[serde(rename = "presence:changed")]
    PresenceChanged {
        room_id: String,
        user_id: String,
        status: PresenceStatus,
        #[serde(default)]
        active_widget_id: Option<String>,
    },

    #[serde(rename = "chat:new")]
    ChatNew {
        room_id: String,
        message: ChatMessage,
    },

    #[serde(rename = "offer")]
    Offer(SignalRelay),

    #[serde(rename = "answer")]
    Answer(SignalRelay),

    #[serde(rename = "ice-candidate")]
    IceCandidate(SignalRelay),

    #[serde(rename = "reply")]
    Reply(Reply),

    /// Frame-level failure with no request context (e.g. unparseable JSON).
    #[serde(rename = "error")]
    Error {
        success: bool,
        error: String,
        code: String,
    },
}

impl ServerMessage {
    pub fn signal(kind: SignalKind, relay: SignalRelay) -> Self {
        match kind {
            SignalKind::Offer => ServerMessage::Offer(relay),
            SignalKind::Answer => ServerMessage::Answer(relay),
            SignalKind::IceCandidate => ServerMessage::IceCandidate(relay),
        }
    }

    pub fn error(err: &CollabError) -> Self {
        ServerMessage::Error {
            success: false,
            error: err.to_string(),
            code: err.code().to_string(),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeKind;

    #[test]
    fn test_decode_join() {
        let inbound = Inbound::decode(r#"{"type": "join", "roomId": "r1", "requestId": "1"}"#).unwrap();
        assert_eq!(inbound.request_id.as_deref(), Some("1"));
        assert_eq!(inbound.message, ClientMessage::Join { room_id: "r1".into() });
    }

    #[test]
    fn test_decode_cursor_move() {
        let inbound = Inbound::decode(
            r#"{"type": "cursor:move", "roomId": "r1", "cursor": {"x": 1.5, "y": 2, "widgetId": "w1"}}"#,
        )
        .unwrap();
        match inbound.message {
            ClientMessage::CursorMove { room_id, cursor } => {
                assert_eq!(room_id, "r1");
                assert_eq!(cursor.x, 1.5);
                assert_eq!(cursor.y, 2.0);
                assert_eq!(cursor.widget_id.as_deref(), Some("w1"));
                assert!(cursor.element_id.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_widget_change() {
        let inbound = Inbound::decode(
            r#"{"type": "widget:change", "roomId": "r1",
                "change": {"widgetId": "w1", "changeType": "position", "oldValue": {"x": 0}, "newValue": {"x": 10}}}"#,
        )
        .unwrap();
        match inbound.message {
            ClientMessage::Change { change, .. } => {
                assert_eq!(change.change_type, ChangeKind::Position);
                assert_eq!(change.new_value.get("x"), Some(&Value::Int(10)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_presence_optional_widget() {
        let inbound =
            Inbound::decode(r#"{"type": "presence:update", "roomId": "r1", "status": "idle"}"#).unwrap();
        assert_eq!(
            inbound.message,
            ClientMessage::Presence {
                room_id: "r1".into(),
                status: PresenceStatus::Idle,
                active_widget_id: None,
            }
        );
    }

    #[test]
    fn test_decode_signal() {
        let inbound = Inbound::decode(
            r#"{"type": "ice-candidate", "roomId": "r1", "targetUserId": "u2", "payload": {"candidate": "abc"}}"#,
        )
        .unwrap();
        assert_eq!(inbound.message.kind(), "ice-candidate");
        assert_eq!(inbound.message.room_id(), "r1");
        match inbound.message {
            ClientMessage::IceCandidate(signal) => assert_eq!(signal.target_user_id, "u2"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_missing_field_fails() {
        assert!(Inbound::decode(r#"{"type": "widget:lock", "roomId": "r1"}"#).is_err());
        assert!(Inbound::decode(r#"{"type": "teleport", "roomId": "r1"}"#).is_err());
        assert!(Inbound::decode("not json").is_err());
    }

    #[test]
    fn test_lock_conflict_reply_shape() {
        let err = CollabError::LockConflict {
            widget_id: "w1".into(),
            locked_by: "Alice".into(),
        };
        let msg = ServerMessage::Reply(Reply::failure(&err).with_request_id(Some("9".into())));
        let json: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "reply");
        assert_eq!(json["requestId"], "9");
        assert_eq!(json["success"], false);
        assert_eq!(json["lockedBy"], "Alice");
        assert!(json.get("participants").is_none());
    }

    #[test]
    fn test_server_message_tags() {
        let msg = ServerMessage::WidgetUnlocked {
            room_id: "r1".into(),
            widget_id: "w1".into(),
            user_id: "u1".into(),
        };
        let json: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "widget:unlocked");
        assert_eq!(json["widgetId"], "w1");

        let decoded = ServerMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_signal_relay_tag() {
        let msg = ServerMessage::signal(
            SignalKind::Offer,
            SignalRelay {
                room_id: "r1".into(),
                from_user_id: "u1".into(),
                payload: Value::from("sdp"),
            },
        );
        let json: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(json["fromUserId"], "u1");
        assert_eq!(json["payload"], "sdp");
    }
}
