//! AMQP Bridge - Admin Entry Point
//!
//! Prepares one handler from the environment and serves its queue status,
//! purge and publish operations over HTTP.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use amqp_bridge::api::{self, handlers::AppState};
use amqp_bridge::transport::{AmqpConnector, Connector, MemoryBroker};
use amqp_bridge::{BridgeError, HandlerConfig, RabbitmqHandler};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env before anything reads the environment
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "amqp_bridge=info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match std::env::var("BRIDGE_CONFIG") {
        Ok(path) => HandlerConfig::load(Some(Path::new(&path))),
        Err(_) => HandlerConfig::from_env(),
    }
    .context("loading handler configuration")?;

    info!("Starting AMQP Bridge v{}", env!("CARGO_PKG_VERSION"));
    info!(exchange = %config.exchange, queue = %config.queue, "Handler configured");

    let connector: Arc<dyn Connector> = if config.uri.starts_with("memory://") {
        info!("Using in-process broker");
        Arc::new(MemoryBroker::new())
    } else {
        Arc::new(AmqpConnector)
    };

    let handler = RabbitmqHandler::new(config, connector)?;
    handler.on_connection_lost(Arc::new(|err: &BridgeError| {
        error!(error = %err, "Broker connection lost, broker requests fail until restart");
    }));
    handler.prepare().await?;

    let state = Arc::new(AppState { handler });

    // Build HTTP routes
    let app = api::router(Arc::clone(&state))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // Start server
    let port = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3018);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    state.handler.destroy().await?;
    info!("Shut down");

    Ok(())
}
