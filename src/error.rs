//! Error types for bridged.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("not authenticated")]
    Unauthorized,

    #[error("no access to chat")]
    Forbidden,

    #[error("chat not found")]
    ChatNotFound,

    #[error("message not found")]
    MessageNotFound,

    #[error("gift not found")]
    GiftNotFound,

    #[error("recipient not found")]
    UserNotFound,

    #[error("insufficient BRG balance")]
    InsufficientBalance,

    #[error("cannot send a gift to yourself")]
    SelfGift,
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let status = match &self {
            BridgeError::Unauthorized => StatusCode::UNAUTHORIZED,
            BridgeError::Forbidden => StatusCode::FORBIDDEN,
            BridgeError::ChatNotFound
            | BridgeError::MessageNotFound
            | BridgeError::GiftNotFound
            | BridgeError::UserNotFound => StatusCode::NOT_FOUND,
            BridgeError::InsufficientBalance | BridgeError::SelfGift => StatusCode::BAD_REQUEST,
            BridgeError::Db(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}
