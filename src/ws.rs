//! WebSocket handler — the realtime core of bridged.
//!
//! Flow per connection:
//! 1. Resolve identity from the bearer credential (query param `token`,
//!    falling back to the Authorization header)
//! 2. On failure: upgrade, close with code 4001, no state created
//! 3. On success: register in the connection registry, spawn a writer
//!    task draining the connection's outbound queue
//! 4. Frame loop: subscribe_chat / unsubscribe_chat / message relay
//! 5. On any exit (close, error, stream end): unregister from presence
//!    and every chat subscription

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap};
use axum::response::IntoResponse;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth;
use crate::db;
use crate::registry::{ConnId, ConnectionSender};
use crate::state::AppState;
use crate::types::{ChatEvent, ChatId, ClientFrame, ErrorFrame, UserId};

/// Close code sent when the connect-time credential is missing,
/// malformed, or expired.
const CLOSE_AUTH_FAILED: u16 = 4001;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// Axum handler for GET /ws — upgrades to WebSocket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    let user_id = auth::extract_credential(query.token.as_deref(), auth_header)
        .and_then(|token| auth::decode_access_token(&state.config.secret_key, token).ok());

    match user_id {
        Some(user_id) => ws.on_upgrade(move |socket| handle_socket(socket, state, user_id)),
        None => {
            warn!(code = CLOSE_AUTH_FAILED, "ws auth failed");
            // Upgrade, then immediately close with the sentinel code.
            ws.on_upgrade(|mut socket| async move {
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: CLOSE_AUTH_FAILED,
                        reason: "authentication failed".into(),
                    })))
                    .await;
            })
        }
    }
}

/// Per-connection task: register, run the frame loop, unregister.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, user_id: UserId) {
    let (sink, mut receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();

    let conn = state.registry.register(user_id, tx.clone());
    info!(user_id, "ws connected");

    // Writer task: owns the sink, drains the outbound queue. Broadcasts
    // enqueue here without waiting on the socket.
    let writer_handle = tokio::spawn(writer_task(sink, rx));

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                handle_frame(text.as_str(), user_id, conn, &state, &tx).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => { /* pings auto-ponged by axum; binary ignored */ }
            Err(e) => {
                warn!(user_id, "ws recv error: {e}");
                break;
            }
        }
    }

    state.registry.unregister(conn, user_id);
    writer_handle.abort();
    info!(user_id, "ws disconnected");
}

async fn writer_task(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        if sink.send(msg).await.is_err() {
            // Socket is broken; the reader loop will notice and clean up.
            break;
        }
    }
}

/// Dispatch one inbound frame. Malformed frames are logged and ignored —
/// they never take the connection down.
async fn handle_frame(
    text: &str,
    user_id: UserId,
    conn: ConnId,
    state: &Arc<AppState>,
    tx: &ConnectionSender,
) {
    let raw: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            debug!(user_id, "ignoring non-JSON frame: {e}");
            return;
        }
    };
    let frame: ClientFrame = match serde_json::from_value(raw.clone()) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(user_id, "ignoring malformed frame: {e}");
            return;
        }
    };

    match frame {
        ClientFrame::SubscribeChat { chat_id } => {
            if check_membership(state, chat_id, user_id, tx).await {
                state.registry.subscribe(user_id, chat_id, conn);
            }
        }
        ClientFrame::UnsubscribeChat { chat_id } => {
            state.registry.unsubscribe(chat_id, conn);
        }
        ClientFrame::Message { chat_id } => {
            // Ephemeral relay: forwarded verbatim, never persisted.
            if check_membership(state, chat_id, user_id, tx).await {
                state.registry.broadcast_to_chat(chat_id, &ChatEvent::Relay(raw));
            }
        }
    }
}

/// Membership gate for subscribe and relay. Non-members get an error
/// frame; oracle failures are treated as "not a member".
async fn check_membership(
    state: &Arc<AppState>,
    chat_id: ChatId,
    user_id: UserId,
    tx: &ConnectionSender,
) -> bool {
    match db::is_chat_member(&state.db, chat_id, user_id).await {
        Ok(true) => true,
        Ok(false) => {
            debug!(user_id, chat_id, "rejected: not a chat member");
            send_error(tx, "forbidden", "no access to chat");
            false
        }
        Err(e) => {
            warn!(user_id, chat_id, "membership check failed: {e}");
            send_error(tx, "internal", "membership check failed");
            false
        }
    }
}

fn send_error(tx: &ConnectionSender, code: &str, message: &str) {
    if let Ok(json) = serde_json::to_string(&ErrorFrame::new(code, message)) {
        let _ = tx.send(Message::Text(json.into()));
    }
}
