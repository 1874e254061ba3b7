//! Idempotent job runner
//!
//! Glues the store, the stage registry and the work queue: admission
//! computes an idempotency key and inserts-or-fetches the job row before the
//! work is handed to the queue; workers dispatch to the registered stage and
//! record the terminal state.

pub mod idempotency;
pub mod log_buffer;
pub mod registry;
pub mod runner;

pub use idempotency::idempotency_key;
pub use log_buffer::{JobLogBuffer, JobLogger};
pub use registry::{StageContext, StageHandler, StageRegistry};
pub use runner::{EnqueueOutcome, EnqueueReport, JobRunner, RunnerCounters, RunnerCountersSnapshot};

use thiserror::Error;

use crate::models::Job;

/// Errors surfaced to producers calling the runner
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("store error: {0}")]
    Store(#[from] afw_common::Error),

    /// The job row was persisted and stays `queued`
    #[error("queue full, job {} left queued", .job.id)]
    QueueFull { job: Box<Job> },

    #[error("queue closed, job {} left queued", .job.id)]
    QueueClosed { job: Box<Job> },

    #[error("no handler registered for stage {0}")]
    NoHandler(String),

    #[error("enqueue cancelled before admission")]
    Cancelled,
}
