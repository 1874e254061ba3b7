//! Job listing, detail and admission endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::db::JobLogLine;
use crate::error::{ApiError, ApiResult};
use crate::models::{Job, Stage, StageParams};
use crate::queue::JobSource;
use crate::AppState;

pub const DEFAULT_LIST_LIMIT: u32 = 50;
pub const MAX_LIST_LIMIT: u32 = 500;
/// Log lines included in a job detail response
pub const DETAIL_LOG_LINES: usize = 200;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<u32>,
}

impl ListQuery {
    /// Requested limit, defaulted and clamped to `1..=MAX_LIST_LIMIT`
    pub fn effective_limit(&self) -> u32 {
        self.limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT)
    }
}

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<Job>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct JobDetailResponse {
    pub job: Job,
    pub logs: Vec<JobLogLine>,
}

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub artifact_id: String,
    pub stage: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub job: Job,
    /// `false` when an identical job already existed
    pub admitted: bool,
}

/// GET /api/jobs?limit=N
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<JobListResponse>> {
    let jobs = state.store.list_jobs(query.effective_limit()).await?;
    Ok(Json(JobListResponse {
        count: jobs.len(),
        jobs,
    }))
}

/// GET /api/jobs/:id
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<JobDetailResponse>> {
    let job = state.store.require_job(id).await?;
    let logs = state.runner.log_tail(id, DETAIL_LOG_LINES).await?;
    Ok(Json(JobDetailResponse { job, logs }))
}

/// POST /api/jobs
///
/// Known stage names are accepted case-insensitively and stored in canonical
/// form; unknown names are admitted as given and fail with "no handler".
pub async fn enqueue_job(
    State(state): State<AppState>,
    Json(request): Json<EnqueueRequest>,
) -> ApiResult<(StatusCode, Json<EnqueueResponse>)> {
    let artifact_id = request.artifact_id.trim();
    if artifact_id.is_empty() {
        return Err(ApiError::BadRequest("artifact_id is required".to_string()));
    }

    let stage = request.stage.trim();
    if stage.is_empty() {
        return Err(ApiError::BadRequest("stage is required".to_string()));
    }
    let stage = stage
        .parse::<Stage>()
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| stage.to_string());

    let params = StageParams::from_json_value(request.params).map_err(ApiError::BadRequest)?;

    let (job, admitted) = state
        .runner
        .submit(artifact_id, &stage, params, JobSource::Api)
        .await?;

    Ok((StatusCode::ACCEPTED, Json(EnqueueResponse { job, admitted })))
}

/// Build job routes
pub fn job_routes() -> Router<AppState> {
    Router::new()
        .route("/api/jobs", get(list_jobs).post(enqueue_job))
        .route("/api/jobs/:id", get(get_job))
}
