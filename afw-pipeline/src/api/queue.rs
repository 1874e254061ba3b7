//! Queue status endpoint

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::jobs::RunnerCountersSnapshot;
use crate::queue::QueueStats;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct QueueStatusResponse {
    pub queue: QueueStats,
    pub runner: RunnerCountersSnapshot,
    /// Stage names with a registered handler
    pub stages: Vec<String>,
}

/// GET /api/queue
pub async fn queue_status(State(state): State<AppState>) -> Json<QueueStatusResponse> {
    Json(QueueStatusResponse {
        queue: state.queue.stats(),
        runner: state.runner.counters(),
        stages: state.runner.registry().stages(),
    })
}

/// Build queue routes
pub fn queue_routes() -> Router<AppState> {
    Router::new().route("/api/queue", get(queue_status))
}
