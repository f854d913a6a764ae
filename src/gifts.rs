//! Gift event producer: balance debit, gift record, and the
//! gift-triggered chat message broadcast as `{"message": {...}}`.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::auth;
use crate::db;
use crate::error::BridgeError;
use crate::messages::payload_from_row;
use crate::state::AppState;
use crate::types::{ChatEvent, ChatId, MessagePayload, MessageType, UserId};

#[derive(Debug, Deserialize)]
pub struct GiftSendBody {
    pub gift_id: i64,
    pub to_user_id: UserId,
    #[serde(default)]
    pub message: Option<String>,
    /// When present and the sender is a member, a gift message is also
    /// posted to this chat and broadcast.
    #[serde(default)]
    pub chat_id: Option<ChatId>,
}

#[derive(Debug, Serialize)]
pub struct GiftSendResponse {
    pub ok: bool,
    /// Sender's balance after the debit.
    pub balance: f64,
    pub message: Option<MessagePayload>,
}

/// POST /api/v1/gifts/send
pub async fn send_gift(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<GiftSendBody>,
) -> Result<Json<GiftSendResponse>, BridgeError> {
    let user_id = auth::authenticate(&state.config.secret_key, &headers)?;
    ensure_not_self(user_id, body.to_user_id)?;

    let sender = db::get_user(&state.db, user_id)
        .await?
        .ok_or(BridgeError::Unauthorized)?;

    let gift = db::get_gift(&state.db, body.gift_id)
        .await?
        .ok_or(BridgeError::GiftNotFound)?;
    db::get_user(&state.db, body.to_user_id)
        .await?
        .ok_or(BridgeError::UserNotFound)?;

    let message_text = body
        .message
        .as_deref()
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(|text| text.chars().take(500).collect::<String>());

    // Atomic check-and-debit; the returned balance is the post-debit
    // value, exact even if a concurrent credit lands meanwhile.
    let balance = db::try_debit_balance(&state.db, user_id, gift.price)
        .await?
        .ok_or(BridgeError::InsufficientBalance)?;

    let user_gift_id = db::insert_user_gift(
        &state.db,
        body.to_user_id,
        gift.id,
        user_id,
        message_text.as_deref(),
    )
    .await?;

    let mut chat_message = None;
    if let Some(chat_id) = body.chat_id {
        if db::is_chat_member(&state.db, chat_id, user_id).await? {
            let sender_name = sender
                .display_name
                .clone()
                .unwrap_or_else(|| sender.email.clone());
            let emoji = gift.name.chars().next().unwrap_or('🎁');
            let mut content = format!("{sender_name} sent you a gift {emoji}!");
            if let Some(text) = &message_text {
                content.push_str(&format!(" Message: {text}"));
            }

            let row = db::insert_message(
                &state.db,
                chat_id,
                user_id,
                &content,
                MessageType::Gift.as_str(),
                Some(gift.id),
            )
            .await?;
            db::link_gift_message(&state.db, user_gift_id, row.id).await?;

            let payload = payload_from_row(row, vec![], None);
            state
                .registry
                .broadcast_to_chat(chat_id, &ChatEvent::Gift(payload.clone()));
            chat_message = Some(payload);
        }
    }

    info!(
        user_id,
        to_user_id = body.to_user_id,
        gift_id = gift.id,
        "gift sent"
    );

    Ok(Json(GiftSendResponse {
        ok: true,
        balance,
        message: chat_message,
    }))
}

/// Gifting yourself is a free BRG sink; reject it up front.
fn ensure_not_self(sender: UserId, recipient: UserId) -> Result<(), BridgeError> {
    if sender == recipient {
        return Err(BridgeError::SelfGift);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_gift_is_rejected() {
        assert!(matches!(ensure_not_self(7, 7), Err(BridgeError::SelfGift)));
        assert!(ensure_not_self(7, 8).is_ok());
    }
}
