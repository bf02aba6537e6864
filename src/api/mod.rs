//! Admin HTTP surface.

pub mod handlers;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use handlers::AppState;

/// Build the admin routes.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Queue status
        .route("/queues/chain", get(handlers::check_chain))
        .route("/queues/trash", get(handlers::check_trash))
        .route("/queues/chain/purge", post(handlers::purge_chain))
        .route("/queues/trash/purge", post(handlers::purge_trash))
        // Publishing
        .route("/messages", post(handlers::publish_message))
        .with_state(state)
}
