//! Shared server state — database pool, connection registry, config.

use std::sync::Arc;

use sqlx::PgPool;

use crate::config::Config;
use crate::registry::Registry;

/// Shared state accessible from all handlers. The registry lives here,
/// constructed once at startup — handlers reach it through this struct,
/// never through a global.
pub struct AppState {
    pub db: PgPool,
    /// Live WebSocket connections: presence + chat subscriptions.
    pub registry: Registry,
    pub config: Config,
}

impl AppState {
    pub fn new(db: PgPool, config: Config) -> Arc<Self> {
        Arc::new(Self {
            db,
            registry: Registry::new(),
            config,
        })
    }
}
