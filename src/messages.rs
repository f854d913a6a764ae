//! Message event producers: persisted message send and reaction set.
//!
//! Both endpoints enforce chat membership, persist through `db`, and
//! then hand the finished payload to the fan-out broadcaster. Broadcast
//! delivery is best-effort; a failed push never fails the request.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use tracing::debug;

use crate::auth;
use crate::db::{self, MessageRow};
use crate::error::BridgeError;
use crate::state::AppState;
use crate::types::{ChatEvent, ChatId, MessageId, MessagePayload, MessageType, ReactionItem};

/// BRG credited to the sender per persisted message.
const BRG_PER_MESSAGE: f64 = 0.01;

#[derive(Debug, Deserialize)]
pub struct MessageCreate {
    pub content: String,
    #[serde(default = "default_message_type")]
    pub message_type: String,
    #[serde(default)]
    pub gift_id: Option<i64>,
}

fn default_message_type() -> String {
    "text".into()
}

#[derive(Debug, Deserialize)]
pub struct ReactionBody {
    /// One emoji, or null to remove the user's reaction.
    pub emoji: Option<String>,
}

pub(crate) fn payload_from_row(
    row: MessageRow,
    reactions: Vec<ReactionItem>,
    my_reaction: Option<String>,
) -> MessagePayload {
    MessagePayload {
        id: row.id,
        chat_id: row.chat_id,
        sender_id: row.sender_id,
        content: row.content,
        message_type: row.message_type,
        gift_id: row.gift_id,
        is_edited: row.is_edited,
        is_deleted: row.is_deleted,
        edited_at: row.edited_at,
        created_at: row.created_at,
        reactions,
        my_reaction,
    }
}

/// POST /api/v1/messages/chat/{chat_id} — persist a message, credit the
/// sender's BRG reward, broadcast to the chat's subscribers.
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<ChatId>,
    headers: HeaderMap,
    Json(body): Json<MessageCreate>,
) -> Result<Json<MessagePayload>, BridgeError> {
    let user_id = auth::authenticate(&state.config.secret_key, &headers)?;

    if !db::chat_exists(&state.db, chat_id).await? {
        return Err(BridgeError::ChatNotFound);
    }
    if !db::is_chat_member(&state.db, chat_id, user_id).await? {
        return Err(BridgeError::Forbidden);
    }

    let msg_type = MessageType::parse_or_text(&body.message_type);
    let row = db::insert_message(
        &state.db,
        chat_id,
        user_id,
        &body.content,
        msg_type.as_str(),
        body.gift_id,
    )
    .await?;
    db::credit_balance(&state.db, user_id, BRG_PER_MESSAGE).await?;

    let payload = payload_from_row(row, vec![], None);
    let delivered = state
        .registry
        .broadcast_to_chat(chat_id, &ChatEvent::Message(payload.clone()));
    debug!(chat_id, message_id = payload.id, delivered, "message broadcast");

    Ok(Json(payload))
}

/// POST /api/v1/messages/{message_id}/reaction — set or remove the
/// caller's reaction, then broadcast the re-aggregated message.
pub async fn set_reaction(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<MessageId>,
    headers: HeaderMap,
    Json(body): Json<ReactionBody>,
) -> Result<Json<MessagePayload>, BridgeError> {
    let user_id = auth::authenticate(&state.config.secret_key, &headers)?;

    let row = db::get_message(&state.db, message_id)
        .await?
        .ok_or(BridgeError::MessageNotFound)?;
    if !db::is_chat_member(&state.db, row.chat_id, user_id).await? {
        return Err(BridgeError::Forbidden);
    }

    match normalize_emoji(body.emoji.as_deref()) {
        Some(emoji) => db::upsert_reaction(&state.db, message_id, user_id, &emoji).await?,
        None => db::delete_reaction(&state.db, message_id, user_id).await?,
    }

    let (reactions, my_reaction) = db::message_reactions(&state.db, message_id, user_id).await?;
    let chat_id = row.chat_id;
    let payload = payload_from_row(row, reactions, my_reaction);
    state
        .registry
        .broadcast_to_chat(chat_id, &ChatEvent::Message(payload.clone()));

    Ok(Json(payload))
}

/// Trim, cap at 20 chars, and treat empty as "remove".
fn normalize_emoji(emoji: Option<&str>) -> Option<String> {
    let trimmed = emoji?.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(20).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emoji_normalization() {
        assert_eq!(normalize_emoji(None), None);
        assert_eq!(normalize_emoji(Some("")), None);
        assert_eq!(normalize_emoji(Some("   ")), None);
        assert_eq!(normalize_emoji(Some(" 🔥 ")), Some("🔥".into()));
        let long = "x".repeat(40);
        assert_eq!(normalize_emoji(Some(&long)).unwrap().chars().count(), 20);
    }
}
