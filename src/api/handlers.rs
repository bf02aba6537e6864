//! HTTP request handlers for the admin surface.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::bridge::{EnqueueOptions, EnqueueOverrides, RabbitmqHandler};
use crate::error::BridgeError;
use crate::types::QueueStatus;

/// Application state shared across handlers.
pub struct AppState {
    pub handler: RabbitmqHandler,
}

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub prepared: bool,
}

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let prepared = state.handler.is_prepared();
    Json(HealthResponse {
        status: (if prepared { "healthy" } else { "degraded" }).to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        prepared,
    })
}

pub async fn check_chain(
    State(state): State<Arc<AppState>>,
) -> Result<Json<QueueStatus>, StatusCode> {
    state.handler.check_chain().await.map(Json).map_err(status_for)
}

pub async fn check_trash(
    State(state): State<Arc<AppState>>,
) -> Result<Json<QueueStatus>, StatusCode> {
    state.handler.check_trash().await.map(Json).map_err(status_for)
}

/// Purge response.
#[derive(Debug, Serialize, Deserialize)]
pub struct PurgeResponse {
    pub queue: String,
    pub purged: u32,
}

pub async fn purge_chain(
    State(state): State<Arc<AppState>>,
) -> Result<Json<PurgeResponse>, StatusCode> {
    let purged = state.handler.purge_chain().await.map_err(status_for)?;
    Ok(Json(PurgeResponse {
        queue: state.handler.config().queue.clone(),
        purged,
    }))
}

pub async fn purge_trash(
    State(state): State<Arc<AppState>>,
) -> Result<Json<PurgeResponse>, StatusCode> {
    let purged = state.handler.purge_trash().await.map_err(status_for)?;
    let queue = state
        .handler
        .config()
        .recycler
        .as_ref()
        .map(|recycler| recycler.queue.clone())
        .unwrap_or_default();
    Ok(Json(PurgeResponse { queue, purged }))
}

/// Routing options for `POST /messages`.
#[derive(Debug, Default, Deserialize)]
pub struct PublishParams {
    /// Replaces the default routing key for this message
    pub routing_key: Option<String>,
    /// Comma-separated routing keys that receive a copy
    pub cc: Option<String>,
}

/// Publish response.
#[derive(Debug, Serialize, Deserialize)]
pub struct PublishResponse {
    pub routing_key: String,
    pub cc: Vec<String>,
    /// False when the message was only queued for the publish worker
    pub confirmed: bool,
}

/// Publish a JSON message.
///
/// Without routing options the call waits for the broker. With options the
/// message is queued and `202 Accepted` is returned.
pub async fn publish_message(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PublishParams>,
    Json(message): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<PublishResponse>), StatusCode> {
    let cc: Vec<String> = params
        .cc
        .as_deref()
        .map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    let routing_key = params
        .routing_key
        .clone()
        .unwrap_or_else(|| state.handler.config().routing_key.clone());

    if params.routing_key.is_none() && cc.is_empty() {
        state.handler.publish(&message).await.map_err(status_for)?;
        info!(routing_key = %routing_key, "Message published via admin API");
        return Ok((
            StatusCode::OK,
            Json(PublishResponse {
                routing_key,
                cc,
                confirmed: true,
            }),
        ));
    }

    let options = EnqueueOptions { cc: cc.clone() };
    let overrides = EnqueueOverrides {
        routing_key: params.routing_key,
    };
    state
        .handler
        .enqueue(&message, options, overrides)
        .map_err(status_for)?;
    info!(routing_key = %routing_key, cc = ?cc, "Message queued via admin API");
    Ok((
        StatusCode::ACCEPTED,
        Json(PublishResponse {
            routing_key,
            cc,
            confirmed: false,
        }),
    ))
}

fn status_for(err: BridgeError) -> StatusCode {
    error!(error = %err, "Admin request failed");
    match err {
        BridgeError::RecyclerNotConfigured => StatusCode::NOT_FOUND,
        BridgeError::Encoding(_) | BridgeError::Config(_) => StatusCode::BAD_REQUEST,
        BridgeError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        BridgeError::NotPrepared | BridgeError::Connection(_) => StatusCode::SERVICE_UNAVAILABLE,
        BridgeError::Topology(_) | BridgeError::Publish(_) | BridgeError::Consume(_) => {
            StatusCode::BAD_GATEWAY
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(BridgeError::RecyclerNotConfigured), StatusCode::NOT_FOUND);
        assert_eq!(status_for(BridgeError::NotPrepared), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            status_for(BridgeError::Publish("channel closed".into())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(BridgeError::QuotaExceeded { max_consumers: 3 }),
            StatusCode::TOO_MANY_REQUESTS
        );
    }
}
