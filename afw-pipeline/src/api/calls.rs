//! Call rollup endpoints

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::Serialize;

use super::jobs::ListQuery;
use crate::error::ApiResult;
use crate::models::{Call, Job};
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct CallListResponse {
    pub calls: Vec<Call>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct CallDetailResponse {
    pub call: Call,
    pub jobs: Vec<Job>,
}

/// GET /api/calls?limit=N
pub async fn list_calls(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<CallListResponse>> {
    let calls = state.store.list_calls(query.effective_limit()).await?;
    Ok(Json(CallListResponse {
        count: calls.len(),
        calls,
    }))
}

/// GET /api/calls/:artifact_id
pub async fn get_call(
    State(state): State<AppState>,
    Path(artifact_id): Path<String>,
) -> ApiResult<Json<CallDetailResponse>> {
    let call = state.store.require_call(&artifact_id).await?;
    let jobs = state.store.list_jobs_for_artifact(&artifact_id).await?;
    Ok(Json(CallDetailResponse { call, jobs }))
}

/// Build call routes
pub fn call_routes() -> Router<AppState> {
    Router::new()
        .route("/api/calls", get(list_calls))
        .route("/api/calls/:artifact_id", get(get_call))
}
