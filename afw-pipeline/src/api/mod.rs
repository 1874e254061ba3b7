//! HTTP API handlers for afw-pipeline
//!
//! A thin mapping from requests onto the store, runner, queue and backfill
//! launcher held in [`crate::AppState`].

pub mod backfill;
pub mod calls;
pub mod events;
pub mod health;
pub mod jobs;
pub mod queue;

pub use backfill::backfill_routes;
pub use calls::call_routes;
pub use events::event_routes;
pub use health::health_routes;
pub use jobs::job_routes;
pub use queue::queue_routes;
