//! Job runner
//!
//! `enqueue` persists the job before the queue ever sees it; a duplicate
//! admission returns the existing row and does nothing else. The worker side
//! claims the row (`queued → running`) before invoking the stage, so a job
//! can only execute once even if it somehow reached the queue twice.

use afw_common::{time, EventBus, PipelineEvent};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::idempotency::idempotency_key;
use super::log_buffer::{JobLogBuffer, JobLogger};
use super::registry::{StageContext, StageRegistry};
use super::RunnerError;
use crate::db::{JobLogLine, JobStore};
use crate::models::{CallUpdate, Job, JobStatus, NewJob, StageParams};
use crate::queue::{JobOutcome, JobSource, QueuedJob, Rejected, RetryOutcome, WorkQueue};

/// Upper bound for persisted error text, in bytes
pub const MAX_ERROR_BYTES: usize = 2048;

// Worker-side claim state shared between the work closure and its completion
// callback. Only a `Claimed` (or never-reached `Pending`) job is finalized by
// the callback; `Settled` was already finalized inline, `Skipped` was never ours.
const TICKET_PENDING: u8 = 0;
const TICKET_CLAIMED: u8 = 1;
const TICKET_SETTLED: u8 = 2;
const TICKET_SKIPPED: u8 = 3;

/// What happened to a retried admission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueOutcome {
    Enqueued,
    /// An identical job already existed; nothing was queued
    AlreadyAdmitted,
    DroppedFull,
    Cancelled,
    Closed,
}

#[derive(Debug, Clone)]
pub struct EnqueueReport {
    pub job: Job,
    pub outcome: EnqueueOutcome,
}

/// Runner-level counters, owned by one runner
#[derive(Debug, Default)]
pub struct RunnerCounters {
    admitted: AtomicU64,
    deduplicated: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunnerCountersSnapshot {
    pub admitted: u64,
    pub deduplicated: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub rejected: u64,
}

impl RunnerCounters {
    pub fn snapshot(&self) -> RunnerCountersSnapshot {
        RunnerCountersSnapshot {
            admitted: self.admitted.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Clonable handle; all clones share store, queue, log ring and counters
#[derive(Clone)]
pub struct JobRunner {
    store: JobStore,
    registry: Arc<StageRegistry>,
    queue: WorkQueue,
    logs: Arc<JobLogBuffer>,
    counters: Arc<RunnerCounters>,
    events: EventBus,
}

impl JobRunner {
    pub fn new(store: JobStore, registry: StageRegistry, queue: WorkQueue, events: EventBus) -> Self {
        Self {
            store,
            registry: Arc::new(registry),
            queue,
            logs: Arc::new(JobLogBuffer::new()),
            counters: Arc::new(RunnerCounters::default()),
            events,
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    pub fn counters(&self) -> RunnerCountersSnapshot {
        self.counters.snapshot()
    }

    /// Admit a job and make one non-blocking attempt to queue it
    ///
    /// An idempotent conflict returns the existing job with `Ok`. A refused
    /// queue attempt returns `QueueFull`/`QueueClosed` carrying the persisted
    /// job, which stays `queued`.
    pub async fn enqueue(
        &self,
        artifact_id: &str,
        stage: &str,
        params: StageParams,
        source: JobSource,
    ) -> Result<Job, RunnerError> {
        self.submit(artifact_id, stage, params, source)
            .await
            .map(|(job, _)| job)
    }

    /// Same as [`JobRunner::enqueue`], also reporting whether this call
    /// created the job (`false` on idempotent conflict)
    pub async fn submit(
        &self,
        artifact_id: &str,
        stage: &str,
        params: StageParams,
        source: JobSource,
    ) -> Result<(Job, bool), RunnerError> {
        let (job, is_new) = self.admit(artifact_id, stage, params, source).await?;
        if !is_new {
            return Ok((job, false));
        }

        match self.queue.offer(self.build_task(&job, source)) {
            Ok(()) => Ok((job, true)),
            Err(Rejected::Full(_)) => {
                self.note_rejected(&job, "queue_full");
                Err(RunnerError::QueueFull { job: Box::new(job) })
            }
            Err(Rejected::Closed(_)) => {
                self.note_rejected(&job, "queue_closed");
                Err(RunnerError::QueueClosed { job: Box::new(job) })
            }
        }
    }

    /// Admit a job and retry queueing it for up to `max_wait`
    ///
    /// Returns `Err(Cancelled)` without touching the store if `cancel` already
    /// fired. Otherwise every queue outcome is reported in the
    /// [`EnqueueReport`]; only store failures are errors.
    #[allow(clippy::too_many_arguments)]
    pub async fn enqueue_with_retry(
        &self,
        artifact_id: &str,
        stage: &str,
        params: StageParams,
        source: JobSource,
        cancel: &CancellationToken,
        max_wait: Duration,
        poll_interval: Duration,
    ) -> Result<EnqueueReport, RunnerError> {
        if cancel.is_cancelled() {
            return Err(RunnerError::Cancelled);
        }

        let (job, is_new) = self.admit(artifact_id, stage, params, source).await?;
        if !is_new {
            return Ok(EnqueueReport {
                job,
                outcome: EnqueueOutcome::AlreadyAdmitted,
            });
        }

        let task = self.build_task(&job, source);
        let outcome = match self
            .queue
            .enqueue_with_retry(cancel, task, max_wait, poll_interval)
            .await
        {
            RetryOutcome::Enqueued => EnqueueOutcome::Enqueued,
            RetryOutcome::DroppedFull => {
                self.note_rejected(&job, "queue_full");
                EnqueueOutcome::DroppedFull
            }
            RetryOutcome::Cancelled => {
                self.note_rejected(&job, "cancelled");
                EnqueueOutcome::Cancelled
            }
            RetryOutcome::Closed => {
                self.note_rejected(&job, "queue_closed");
                EnqueueOutcome::Closed
            }
        };

        Ok(EnqueueReport { job, outcome })
    }

    /// Buffered log lines for a job, if it ran recently in this process
    pub fn logs(&self, job_id: i64) -> Option<Vec<JobLogLine>> {
        self.logs.lines(job_id)
    }

    /// Last `n` log lines, from the ring or else from the `job_logs` table
    pub async fn log_tail(&self, job_id: i64, n: usize) -> Result<Vec<JobLogLine>, RunnerError> {
        if let Some(lines) = self.logs.tail(job_id, n) {
            return Ok(lines);
        }
        let limit = u32::try_from(n).unwrap_or(u32::MAX);
        Ok(self.store.job_logs(job_id, limit).await?)
    }

    fn logger(&self, job_id: i64) -> JobLogger {
        JobLogger::new(job_id, Arc::clone(&self.logs), self.store.clone())
    }

    async fn admit(
        &self,
        artifact_id: &str,
        stage: &str,
        params: StageParams,
        source: JobSource,
    ) -> Result<(Job, bool), RunnerError> {
        if artifact_id.trim().is_empty() {
            return Err(afw_common::Error::InvalidInput("artifact_id must not be empty".into()).into());
        }
        if stage.trim().is_empty() {
            return Err(afw_common::Error::InvalidInput("stage must not be empty".into()).into());
        }

        let new_job = NewJob {
            artifact_id: artifact_id.to_string(),
            stage: stage.to_string(),
            idempotency_key: idempotency_key(artifact_id, stage, &params),
            params,
        };

        let (job, is_new) = self.store.insert_job_idempotent(&new_job, time::now()).await?;

        if is_new {
            RunnerCounters::bump(&self.counters.admitted);
            self.logger(job.id)
                .log(format!("admitted {} for {} via {}", job.stage, job.artifact_id, source))
                .await;
            self.events.emit_lossy(PipelineEvent::JobAdmitted {
                job_id: job.id,
                artifact_id: job.artifact_id.clone(),
                stage: job.stage.clone(),
                source: source.to_string(),
                timestamp: time::now(),
            });
        } else {
            RunnerCounters::bump(&self.counters.deduplicated);
            debug!(
                job_id = job.id,
                status = %job.status,
                source = %source,
                "Duplicate admission ignored"
            );
        }

        Ok((job, is_new))
    }

    fn note_rejected(&self, job: &Job, reason: &str) {
        RunnerCounters::bump(&self.counters.rejected);
        self.events.emit_lossy(PipelineEvent::JobDropped {
            job_id: job.id,
            artifact_id: job.artifact_id.clone(),
            stage: job.stage.clone(),
            reason: reason.to_string(),
            timestamp: time::now(),
        });
    }

    fn build_task(&self, job: &Job, source: JobSource) -> QueuedJob {
        let ticket = Arc::new(AtomicU8::new(TICKET_PENDING));
        let job_id = job.id;

        let work_runner = self.clone();
        let work_ticket = Arc::clone(&ticket);
        let artifact_id = job.artifact_id.clone();
        let stage = job.stage.clone();
        let params = job.params.clone();

        let finish_runner = self.clone();
        let finish_artifact = job.artifact_id.clone();
        let finish_stage = job.stage.clone();

        QueuedJob::new(format!("job-{}", job_id), source, move |cancel| async move {
            work_runner
                .execute(job_id, artifact_id, stage, params, cancel, work_ticket)
                .await
        })
        .on_finish(move |outcome| async move {
            finish_runner
                .finish(job_id, &finish_artifact, &finish_stage, outcome, &ticket)
                .await;
        })
    }

    /// Worker-side body of a job
    async fn execute(
        &self,
        job_id: i64,
        artifact_id: String,
        stage: String,
        params: StageParams,
        cancel: CancellationToken,
        ticket: Arc<AtomicU8>,
    ) -> anyhow::Result<()> {
        let Some(handler) = self.registry.get(&stage) else {
            let err = RunnerError::NoHandler(stage.clone());
            error!(job_id, artifact_id = %artifact_id, stage = %stage, "No handler registered");
            self.complete(job_id, &artifact_id, &stage, JobStatus::Failed, Some(err.to_string()))
                .await;
            ticket.store(TICKET_SETTLED, Ordering::SeqCst);
            return Err(err.into());
        };

        if !self.store.mark_job_started(job_id, time::now()).await? {
            ticket.store(TICKET_SKIPPED, Ordering::SeqCst);
            debug!(job_id, "Job no longer queued, skipping");
            return Ok(());
        }
        ticket.store(TICKET_CLAIMED, Ordering::SeqCst);

        self.events.emit_lossy(PipelineEvent::JobStarted {
            job_id,
            artifact_id: artifact_id.clone(),
            stage: stage.clone(),
            timestamp: time::now(),
        });

        let logger = self.logger(job_id);
        logger.log(format!("started {}", stage)).await;

        let ctx = StageContext {
            job_id,
            stage,
            cancel,
            logger,
        };
        handler.run(ctx, artifact_id, params).await
    }

    /// Completion callback: record the outcome unless already recorded
    async fn finish(
        &self,
        job_id: i64,
        artifact_id: &str,
        stage: &str,
        outcome: JobOutcome,
        ticket: &AtomicU8,
    ) {
        match ticket.load(Ordering::SeqCst) {
            TICKET_SETTLED | TICKET_SKIPPED => return,
            _ => {}
        }

        let status = match &outcome {
            JobOutcome::Succeeded => JobStatus::Succeeded,
            JobOutcome::Cancelled(_) => JobStatus::Cancelled,
            JobOutcome::Failed(_) | JobOutcome::TimedOut(_) | JobOutcome::Panicked(_) => {
                JobStatus::Failed
            }
        };

        self.complete(job_id, artifact_id, stage, status, outcome.error_message())
            .await;
    }

    /// Persist a terminal status, roll it up into the call row and announce it
    async fn complete(
        &self,
        job_id: i64,
        artifact_id: &str,
        stage: &str,
        status: JobStatus,
        error: Option<String>,
    ) {
        let error = error.map(truncate_error);
        let now = time::now();

        match self
            .store
            .mark_job_finished(job_id, status, error.as_deref(), now)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(job_id, status = %status, "Job already finished, outcome not recorded");
                return;
            }
            Err(e) => {
                error!(job_id, status = %status, error = %e, "Failed to record job outcome");
                return;
            }
        }

        let update = CallUpdate {
            artifact_id: artifact_id.to_string(),
            stage: stage.to_string(),
            status,
            error: error.clone(),
        };
        if let Err(e) = self.store.upsert_call(&update, now).await {
            error!(job_id, artifact_id, error = %e, "Failed to update call rollup");
        }

        match status {
            JobStatus::Succeeded => RunnerCounters::bump(&self.counters.succeeded),
            _ => RunnerCounters::bump(&self.counters.failed),
        }

        let line = match &error {
            None => format!("{} {}", stage, status),
            Some(err) => format!("{} {}: {}", stage, status, err),
        };
        self.logger(job_id).log(line).await;

        debug!(job_id, artifact_id, stage, status = %status, "Job outcome recorded");

        self.events.emit_lossy(PipelineEvent::JobFinished {
            job_id,
            artifact_id: artifact_id.to_string(),
            stage: stage.to_string(),
            status: status.to_string(),
            error,
            timestamp: now,
        });
    }
}

/// Cut `message` to at most [`MAX_ERROR_BYTES`] bytes on a char boundary
pub fn truncate_error(mut message: String) -> String {
    if message.len() <= MAX_ERROR_BYTES {
        return message;
    }
    let mut end = MAX_ERROR_BYTES;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message.truncate(end);
    message
}
