//! Units of work accepted by the queue

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Who asked for the work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobSource {
    Watcher,
    Backfill,
    Api,
    Internal,
}

impl JobSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobSource::Watcher => "watcher",
            JobSource::Backfill => "backfill",
            JobSource::Api => "api",
            JobSource::Internal => "internal",
        }
    }
}

impl fmt::Display for JobSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a queued job ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed(String),
    TimedOut(Duration),
    /// Failed after the pool's shutdown token fired
    Cancelled(String),
    Panicked(String),
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Succeeded)
    }

    /// Short label used in log lines
    pub fn label(&self) -> &'static str {
        match self {
            JobOutcome::Succeeded => "succeeded",
            JobOutcome::Failed(_) => "failed",
            JobOutcome::TimedOut(_) => "timed_out",
            JobOutcome::Cancelled(_) => "cancelled",
            JobOutcome::Panicked(_) => "panicked",
        }
    }

    /// Human-readable error, `None` on success
    pub fn error_message(&self) -> Option<String> {
        match self {
            JobOutcome::Succeeded => None,
            JobOutcome::Failed(msg) | JobOutcome::Cancelled(msg) => Some(msg.clone()),
            JobOutcome::TimedOut(limit) => Some(format!("timed out after {}s", limit.as_secs())),
            JobOutcome::Panicked(msg) => Some(format!("stage panicked: {}", msg)),
        }
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

type WorkFn = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send>;
type FinishFn = Box<dyn FnOnce(JobOutcome) -> BoxFuture<'static, ()> + Send>;

/// A unit of work plus an optional completion callback
///
/// The work closure receives a token that is cancelled when the per-job
/// timeout fires or the pool shuts down.
pub struct QueuedJob {
    pub id: String,
    pub source: JobSource,
    pub(crate) work: WorkFn,
    pub(crate) on_finish: Option<FinishFn>,
}

impl QueuedJob {
    pub fn new<F, Fut>(id: impl Into<String>, source: JobSource, work: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            id: id.into(),
            source,
            work: Box::new(move |token| Box::pin(work(token))),
            on_finish: None,
        }
    }

    /// Invoked once by the worker after the job ends, whatever the outcome
    pub fn on_finish<F, Fut>(mut self, callback: F) -> Self
    where
        F: FnOnce(JobOutcome) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_finish = Some(Box::new(move |outcome| Box::pin(callback(outcome))));
        self
    }
}

impl fmt::Debug for QueuedJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedJob")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("has_on_finish", &self.on_finish.is_some())
            .finish()
    }
}
