//! Wire protocol types for the realtime core.
//!
//! Covers: inbound WebSocket frames (subscribe_chat, unsubscribe_chat,
//! message relay), outbound broadcast events, and the persisted-message
//! payload shared by the HTTP producers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// User identity, resolved once from the access token at connect time.
pub type UserId = i64;
/// Persisted chat identity.
pub type ChatId = i64;
/// Persisted message identity.
pub type MessageId = i64;

// ═══════════════════════════════════════════════════════════════
// Client → Server frames
// ═══════════════════════════════════════════════════════════════

/// Inbound WebSocket frame, dispatched on the `action` field.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientFrame {
    SubscribeChat { chat_id: ChatId },
    UnsubscribeChat { chat_id: ChatId },
    /// Ephemeral relay: the full frame is forwarded verbatim to the
    /// chat's subscribers, never persisted.
    Message { chat_id: ChatId },
}

/// Sent to a client on a rejected frame (e.g. subscribing to a chat
/// the user is not a member of).
#[derive(Debug, Serialize)]
pub struct ErrorFrame {
    pub action: &'static str,
    pub code: String,
    pub message: String,
}

impl ErrorFrame {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            action: "error",
            code: code.into(),
            message: message.into(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// Outbound broadcast events
// ═══════════════════════════════════════════════════════════════

/// An event pushed to every connection subscribed to a chat.
///
/// All variants serialize to a plain JSON object; the variants exist so
/// producers cannot assemble ad-hoc shapes.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// A persisted chat message (send, edit, reaction update).
    Message(MessagePayload),
    /// A gift-triggered chat message; wrapped as `{"message": {...}}`
    /// on the wire so clients can route it to the gift banner.
    Gift(MessagePayload),
    /// Client-supplied payload relayed verbatim (typing indicators and
    /// other unpersisted signals).
    Relay(JsonValue),
}

impl ChatEvent {
    /// The JSON object actually written to subscriber sockets.
    pub fn to_wire(&self) -> JsonValue {
        match self {
            ChatEvent::Message(payload) => {
                serde_json::to_value(payload).unwrap_or(JsonValue::Null)
            }
            ChatEvent::Gift(payload) => {
                serde_json::json!({ "message": payload })
            }
            ChatEvent::Relay(value) => value.clone(),
        }
    }
}

/// Full representation of a persisted message, as returned by the HTTP
/// producers and broadcast to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub content: String,
    pub message_type: String,
    pub gift_id: Option<i64>,
    pub is_edited: bool,
    pub is_deleted: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub reactions: Vec<ReactionItem>,
    #[serde(default)]
    pub my_reaction: Option<String>,
}

/// Aggregated reaction count for one emoji on one message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReactionItem {
    pub emoji: String,
    pub count: i64,
}

// ═══════════════════════════════════════════════════════════════
// Message types (matches Postgres CHECK constraint)
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Text,
    Echo,
    Gift,
    System,
    Voice,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Echo => "echo",
            Self::Gift => "gift",
            Self::System => "system",
            Self::Voice => "voice",
        }
    }

    /// Parse a client-supplied type name, defaulting to `text`.
    pub fn parse_or_text(s: &str) -> Self {
        match s {
            "echo" => Self::Echo,
            "gift" => Self::Gift,
            "system" => Self::System,
            "voice" => Self::Voice,
            _ => Self::Text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_on_action_field() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"action": "subscribe_chat", "chat_id": 7}"#).unwrap();
        assert!(matches!(frame, ClientFrame::SubscribeChat { chat_id: 7 }));

        let frame: ClientFrame =
            serde_json::from_str(r#"{"action": "message", "chat_id": 3, "text": "hi"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Message { chat_id: 3 }));
    }

    #[test]
    fn unknown_action_is_rejected() {
        assert!(serde_json::from_str::<ClientFrame>(r#"{"action": "explode"}"#).is_err());
        assert!(serde_json::from_str::<ClientFrame>(r#"{"action": "subscribe_chat"}"#).is_err());
    }

    fn payload() -> MessagePayload {
        MessagePayload {
            id: 1,
            chat_id: 2,
            sender_id: 3,
            content: "hello".into(),
            message_type: "text".into(),
            gift_id: None,
            is_edited: false,
            is_deleted: false,
            edited_at: None,
            created_at: Utc::now(),
            reactions: vec![],
            my_reaction: None,
        }
    }

    #[test]
    fn gift_event_is_wrapped() {
        let wire = ChatEvent::Gift(payload()).to_wire();
        assert_eq!(wire["message"]["id"], 1);
        assert_eq!(wire["message"]["chat_id"], 2);
    }

    #[test]
    fn message_event_is_bare() {
        let wire = ChatEvent::Message(payload()).to_wire();
        assert_eq!(wire["id"], 1);
        assert!(wire.get("message").is_none());
    }

    #[test]
    fn relay_event_is_verbatim() {
        let raw = serde_json::json!({"action": "message", "chat_id": 3, "typing": true});
        let wire = ChatEvent::Relay(raw.clone()).to_wire();
        assert_eq!(wire, raw);
    }

    #[test]
    fn message_type_parse() {
        assert_eq!(MessageType::parse_or_text("voice").as_str(), "voice");
        assert_eq!(MessageType::parse_or_text("bogus").as_str(), "text");
    }
}
