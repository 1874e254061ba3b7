//! afw-pipeline library interface
//!
//! The job orchestration subsystem (bounded queue, idempotent runner,
//! persistent store, backfill selector) plus the stage registry, polling
//! watcher and HTTP API built on top of it.

pub mod api;
pub mod backfill;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod models;
pub mod queue;
pub mod scanner;
pub mod stages;
pub mod watcher;

pub use crate::error::{ApiError, ApiResult};

use afw_common::events::EventBus;
use axum::Router;
use chrono::{DateTime, Utc};
use tower_http::trace::TraceLayer;

use crate::backfill::BackfillLauncher;
use crate::db::JobStore;
use crate::jobs::JobRunner;
use crate::queue::WorkQueue;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: JobStore,
    pub runner: JobRunner,
    pub queue: WorkQueue,
    pub backfill: BackfillLauncher,
    /// Event bus for SSE broadcasting
    pub event_bus: EventBus,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(runner: JobRunner, backfill: BackfillLauncher, event_bus: EventBus) -> Self {
        Self {
            store: runner.store().clone(),
            queue: runner.queue().clone(),
            runner,
            backfill,
            event_bus,
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::health_routes())
        .merge(api::queue_routes())
        .merge(api::job_routes())
        .merge(api::call_routes())
        .merge(api::backfill_routes())
        .merge(api::event_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
