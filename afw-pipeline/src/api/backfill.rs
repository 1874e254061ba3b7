//! Backfill trigger and report endpoints

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::{Deserialize, Serialize};

use crate::backfill::BackfillReport;
use crate::error::{ApiError, ApiResult};
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct BackfillRequest {
    /// Overrides the configured limit; `0` = no cap
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct BackfillStatusResponse {
    pub running: bool,
    pub report: BackfillReport,
}

#[derive(Debug, Serialize)]
pub struct BackfillStartedResponse {
    pub started: bool,
    pub limit: i64,
}

/// GET /api/backfill
pub async fn latest_backfill(
    State(state): State<AppState>,
) -> ApiResult<Json<BackfillStatusResponse>> {
    let tracker = state.backfill.tracker();
    let report = tracker
        .latest()
        .await
        .ok_or_else(|| ApiError::NotFound("no backfill has completed yet".to_string()))?;

    Ok(Json(BackfillStatusResponse {
        running: tracker.is_running(),
        report,
    }))
}

/// POST /api/backfill
pub async fn start_backfill(
    State(state): State<AppState>,
    body: Option<Json<BackfillRequest>>,
) -> ApiResult<(StatusCode, Json<BackfillStartedResponse>)> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let limit = request
        .limit
        .unwrap_or_else(|| state.backfill.default_limit())
        .max(0);

    if state.backfill.launch(Some(limit)).is_none() {
        return Err(ApiError::Conflict("a backfill pass is already running".to_string()));
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(BackfillStartedResponse {
            started: true,
            limit,
        }),
    ))
}

/// Build backfill routes
pub fn backfill_routes() -> Router<AppState> {
    Router::new().route("/api/backfill", get(latest_backfill).post(start_backfill))
}
