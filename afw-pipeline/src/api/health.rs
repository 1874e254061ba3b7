//! Health check endpoint

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::queue::QueueState;
use crate::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok" or "degraded"
    pub status: String,
    pub module: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub database: String,
    pub queue: QueueState,
}

/// GET /health
///
/// 200 when the store answers and the queue is running, 503 otherwise.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let uptime = Utc::now().signed_duration_since(state.startup_time);
    let uptime_seconds = uptime.num_seconds().max(0) as u64;

    let database = match state.store.health().await {
        Ok(()) => "ok".to_string(),
        Err(e) => format!("error: {}", e),
    };
    let queue = state.queue.state();
    let healthy = database == "ok" && state.queue.is_healthy();

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            status: if healthy { "ok" } else { "degraded" }.to_string(),
            module: "afw-pipeline".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds,
            database,
            queue,
        }),
    )
}

/// Build health check routes
pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
