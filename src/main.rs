//! bridged — Bridge realtime server.
//!
//! WebSocket fan-out core (connection registry + chat broadcaster) plus
//! the HTTP event producers that feed it: message send, reaction set,
//! gift send.

mod auth;
mod config;
mod db;
mod error;
mod gifts;
mod messages;
mod registry;
mod state;
mod types;
mod ws;

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderValue, Method};
use axum::routing::{get, post};
use axum::{Json, Router};
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::BridgeError;
use crate::state::AppState;

#[tokio::main]
async fn main() {
    // Load .env if present (local dev).
    let _ = dotenvy::dotenv();

    let config = config::Config::from_env();

    // Tracing.
    tracing_subscriber::fmt()
        .with_env_filter(&config.log_level)
        .with_target(true)
        .init();

    info!("bridged starting");
    info!(listen = %config.listen_addr);

    // ── Postgres ────────────────────────────────────────────
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to Postgres");

    // Run migration.
    info!("running migrations");
    sqlx::raw_sql(include_str!("../migrations/001_init.sql"))
        .execute(&pool)
        .await
        .expect("migration failed");

    info!("database ready");

    // ── Shared state ────────────────────────────────────────
    let state = AppState::new(pool, config.clone());

    // ── CORS ────────────────────────────────────────────────
    let origins: Vec<HeaderValue> = config
        .cors_origins
        .split(',')
        .filter_map(|origin| origin.trim().parse().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    // ── Routes ──────────────────────────────────────────────
    let app = Router::new()
        // WebSocket endpoint.
        .route("/ws", get(ws::ws_handler))
        // Event producers.
        .route("/api/v1/messages/chat/{chat_id}", post(messages::send_message))
        .route(
            "/api/v1/messages/{message_id}/reaction",
            post(messages::set_reaction),
        )
        .route("/api/v1/gifts/send", post(gifts::send_gift))
        // Presence query (admin dashboard).
        .route("/api/v1/admin/online", get(online_users))
        // Health check (useful for K8s liveness probes).
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state);

    // ── Bind & serve ────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .expect("failed to bind");

    info!(addr = %config.listen_addr, "bridged listening");

    axum::serve(listener, app)
        .await
        .expect("server error");
}

/// Liveness probe.
async fn healthz() -> &'static str {
    "ok"
}

/// Users with at least one open WebSocket connection.
async fn online_users(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
) -> Result<Json<serde_json::Value>, BridgeError> {
    auth::authenticate(&state.config.secret_key, &headers)?;
    let mut ids = state.registry.online_user_ids();
    ids.sort_unstable();
    Ok(Json(serde_json::json!({ "online_user_ids": ids })))
}
