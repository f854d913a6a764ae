//! Postgres query layer for bridged.
//!
//! All persisted state goes through this module. Uses sqlx with
//! runtime-checked queries to avoid needing a live DB at compile time.
//!
//! Chat membership is persisted here and only *read* by the realtime
//! core; the registry never writes membership.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::BridgeError;
use crate::types::{ChatId, MessageId, ReactionItem, UserId};

// ═══════════════════════════════════════════════════════════════
// Membership oracle
// ═══════════════════════════════════════════════════════════════

/// Whether the user is a persisted member of the chat. Consulted before
/// every subscribe, message post, reaction, and gift-triggered message.
pub async fn is_chat_member(
    pool: &PgPool,
    chat_id: ChatId,
    user_id: UserId,
) -> Result<bool, BridgeError> {
    let row: Option<(i32,)> = sqlx::query_as(
        r#"
        SELECT 1 FROM chat_members WHERE chat_id = $1 AND user_id = $2
        "#,
    )
    .bind(chat_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.is_some())
}

pub async fn chat_exists(pool: &PgPool, chat_id: ChatId) -> Result<bool, BridgeError> {
    let row: Option<(i32,)> = sqlx::query_as(r#"SELECT 1 FROM chats WHERE id = $1"#)
        .bind(chat_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

// ═══════════════════════════════════════════════════════════════
// Users
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, sqlx::FromRow)]
pub struct UserRow {
    pub id: UserId,
    pub email: String,
    pub display_name: Option<String>,
    pub balance: f64,
}

pub async fn get_user(pool: &PgPool, user_id: UserId) -> Result<Option<UserRow>, BridgeError> {
    let row: Option<UserRow> = sqlx::query_as(
        r#"
        SELECT id, email, display_name, COALESCE(balance, 0) AS balance
        FROM users WHERE id = $1
        "#,
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Credit BRG to a user (e.g. the per-message reward).
pub async fn credit_balance(
    pool: &PgPool,
    user_id: UserId,
    amount: f64,
) -> Result<(), BridgeError> {
    sqlx::query(
        r#"
        UPDATE users SET balance = COALESCE(balance, 0) + $2 WHERE id = $1
        "#,
    )
    .bind(user_id)
    .bind(amount)
    .execute(pool)
    .await?;
    Ok(())
}

/// Debit BRG if the balance covers it. Returns the post-debit balance,
/// or None (no rows touched) when the balance is insufficient, so
/// check-and-debit is atomic and the returned value is exact even with
/// concurrent credits.
pub async fn try_debit_balance(
    pool: &PgPool,
    user_id: UserId,
    amount: f64,
) -> Result<Option<f64>, BridgeError> {
    let row: Option<(f64,)> = sqlx::query_as(
        r#"
        UPDATE users SET balance = balance - $2
        WHERE id = $1 AND COALESCE(balance, 0) >= $2
        RETURNING balance
        "#,
    )
    .bind(user_id)
    .bind(amount)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(balance,)| balance))
}

// ═══════════════════════════════════════════════════════════════
// Messages
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, sqlx::FromRow)]
pub struct MessageRow {
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
}

pub async fn insert_message(
    pool: &PgPool,
    chat_id: ChatId,
    sender_id: UserId,
    content: &str,
    message_type: &str,
    gift_id: Option<i64>,
) -> Result<MessageRow, BridgeError> {
    let row: MessageRow = sqlx::query_as(
        r#"
        INSERT INTO messages (chat_id, sender_id, content, message_type, gift_id)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id, chat_id, sender_id, content, message_type, gift_id,
                  is_edited, is_deleted, edited_at, created_at
        "#,
    )
    .bind(chat_id)
    .bind(sender_id)
    .bind(content)
    .bind(message_type)
    .bind(gift_id)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn get_message(
    pool: &PgPool,
    message_id: MessageId,
) -> Result<Option<MessageRow>, BridgeError> {
    let row: Option<MessageRow> = sqlx::query_as(
        r#"
        SELECT id, chat_id, sender_id, content, message_type, gift_id,
               is_edited, is_deleted, edited_at, created_at
        FROM messages WHERE id = $1
        "#,
    )
    .bind(message_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

// ═══════════════════════════════════════════════════════════════
// Reactions
// ═══════════════════════════════════════════════════════════════

/// Set or replace the user's single reaction on a message.
pub async fn upsert_reaction(
    pool: &PgPool,
    message_id: MessageId,
    user_id: UserId,
    emoji: &str,
) -> Result<(), BridgeError> {
    sqlx::query(
        r#"
        INSERT INTO message_reactions (message_id, user_id, emoji)
        VALUES ($1, $2, $3)
        ON CONFLICT (message_id, user_id) DO UPDATE SET emoji = EXCLUDED.emoji
        "#,
    )
    .bind(message_id)
    .bind(user_id)
    .bind(emoji)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete_reaction(
    pool: &PgPool,
    message_id: MessageId,
    user_id: UserId,
) -> Result<(), BridgeError> {
    sqlx::query(r#"DELETE FROM message_reactions WHERE message_id = $1 AND user_id = $2"#)
        .bind(message_id)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Aggregated reaction counts for a message, plus the asking user's own
/// reaction if any.
pub async fn message_reactions(
    pool: &PgPool,
    message_id: MessageId,
    current_user: UserId,
) -> Result<(Vec<ReactionItem>, Option<String>), BridgeError> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        r#"
        SELECT emoji, COUNT(*) FROM message_reactions
        WHERE message_id = $1
        GROUP BY emoji
        ORDER BY emoji
        "#,
    )
    .bind(message_id)
    .fetch_all(pool)
    .await?;

    let mine: Option<(String,)> = sqlx::query_as(
        r#"SELECT emoji FROM message_reactions WHERE message_id = $1 AND user_id = $2"#,
    )
    .bind(message_id)
    .bind(current_user)
    .fetch_optional(pool)
    .await?;

    let reactions = rows
        .into_iter()
        .map(|(emoji, count)| ReactionItem { emoji, count })
        .collect();
    Ok((reactions, mine.map(|(emoji,)| emoji)))
}

// ═══════════════════════════════════════════════════════════════
// Gifts
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, sqlx::FromRow)]
pub struct GiftRow {
    pub id: i64,
    pub name: String,
    pub price: f64,
}

pub async fn get_gift(pool: &PgPool, gift_id: i64) -> Result<Option<GiftRow>, BridgeError> {
    let row: Option<GiftRow> =
        sqlx::query_as(r#"SELECT id, name, price FROM gifts WHERE id = $1"#)
            .bind(gift_id)
            .fetch_optional(pool)
            .await?;
    Ok(row)
}

/// Record a received gift. Returns the user_gifts row id.
pub async fn insert_user_gift(
    pool: &PgPool,
    to_user_id: UserId,
    gift_id: i64,
    sender_id: UserId,
    message_text: Option<&str>,
) -> Result<i64, BridgeError> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO user_gifts (user_id, gift_id, quantity, sender_id, message_text)
        VALUES ($1, $2, 1, $3, $4)
        RETURNING id
        "#,
    )
    .bind(to_user_id)
    .bind(gift_id)
    .bind(sender_id)
    .bind(message_text)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

/// Link a gift record to the chat message announcing it.
pub async fn link_gift_message(
    pool: &PgPool,
    user_gift_id: i64,
    message_id: MessageId,
) -> Result<(), BridgeError> {
    sqlx::query(r#"UPDATE user_gifts SET message_id = $2 WHERE id = $1"#)
        .bind(user_gift_id)
        .bind(message_id)
        .execute(pool)
        .await?;
    Ok(())
}
