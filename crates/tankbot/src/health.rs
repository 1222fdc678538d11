//! `GET /health` for process supervisors.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use tankwatch::{ConnectionState, Monitor};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Clone)]
pub struct HealthState {
    pub monitor: Arc<Monitor>,
}

/// Health check endpoint. 200 while the feed is live, 503 otherwise.
pub async fn handle_health(State(state): State<HealthState>) -> (StatusCode, Json<serde_json::Value>) {
    let status = state.monitor.status();

    let (code, label) = match status.state {
        ConnectionState::Connected => (StatusCode::OK, "healthy"),
        ConnectionState::Degraded => (StatusCode::OK, "degraded"),
        ConnectionState::Connecting | ConnectionState::Disconnected => {
            (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
        }
    };

    (
        code,
        Json(serde_json::json!({
            "status": label,
            "version": env!("CARGO_PKG_VERSION"),
            "monitor": status,
            "session": state.monitor.health().health_summary(),
        })),
    )
}

pub fn router(monitor: Arc<Monitor>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .with_state(HealthState { monitor })
}

/// Serve the health endpoint until `cancel` fires.
pub async fn serve(port: u16, monitor: Arc<Monitor>, cancel: CancellationToken) -> Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("Health: GET http://{}/health", addr);

    axum::serve(listener, router(monitor))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .context("Health server error")?;

    Ok(())
}
