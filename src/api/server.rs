//! Router wiring and server startup for the gateway process.

use anyhow::{Context, Result};
use axum::http::Method;
use axum::routing::{any, get};
use axum::{Json, Router};
use log::{info, warn};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

use crate::api::admin;
use crate::gateway::pipeline::{dispatch_api, GatewayState};

/// Public health probe; everything else under `/api/` goes through the
/// admission pipeline.
async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub fn create_router(state: Arc<GatewayState>) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/api/*path", any(dispatch_api));

    if state.config.admin_key.is_some() {
        router = router.nest("/admin", admin::router(state.clone()));
    } else {
        warn!("ADMIN_KEY not set; admin surface is disabled");
    }

    router
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PUT,
                    Method::DELETE,
                    Method::OPTIONS,
                ])
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Periodic housekeeping: expired replay fingerprints and idle rate-limit
/// windows.
fn spawn_sweepers(state: Arc<GatewayState>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            state.replay.sweep();
            state.rate_limiter.cleanup_expired();
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {}", e);
    }
    info!("shutdown signal received");
}

/// Bind and serve until interrupted. Returns an error (non-zero exit) when
/// the port is taken.
pub async fn start_gateway(state: Arc<GatewayState>) -> Result<()> {
    let port = state.config.port;
    let app = create_router(state.clone());
    spawn_sweepers(state.clone());

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .with_context(|| format!("binding port {}", port))?;
    info!(
        "gateway listening on http://0.0.0.0:{} ({} routes, network {})",
        port,
        state.routes.len(),
        state.config.network
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("serving gateway")?;

    Ok(())
}
