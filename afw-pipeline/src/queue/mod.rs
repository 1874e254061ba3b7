//! Bounded work queue with a fixed worker pool
//!
//! Producers hand off [`QueuedJob`]s with a single non-blocking attempt;
//! `worker_count` long-lived tokio tasks share one bounded buffer and run each
//! job under a per-job timeout. A panicking job is contained at the worker
//! loop boundary and reported as a failure; the worker keeps serving.
//!
//! Cancelling the root token passed to [`WorkQueue::start`] stops the pool
//! for good. An in-flight job that ignores its token is abandoned as
//! cancelled after [`CANCEL_GRACE`].

pub mod counters;
pub mod job;

pub use counters::{CounterSnapshot, QueueCounters};
pub use job::{JobOutcome, JobSource, QueuedJob};

use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long an in-flight job may keep running once the root token fires
pub const CANCEL_GRACE: Duration = Duration::from_secs(2);

/// Lifecycle of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    NotStarted,
    Running,
    Stopped,
}

impl QueueState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => QueueState::NotStarted,
            1 => QueueState::Running,
            _ => QueueState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            QueueState::NotStarted => 0,
            QueueState::Running => 1,
            QueueState::Stopped => 2,
        }
    }
}

/// Read-only snapshot for status endpoints
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub state: QueueState,
    pub length: usize,
    pub capacity: usize,
    pub worker_count: usize,
    pub processed: u64,
    pub failed: u64,
    pub dropped: u64,
}

/// Why a non-blocking offer was refused; the job is handed back
#[derive(Debug)]
pub enum Rejected {
    /// Buffer at capacity
    Full(QueuedJob),
    /// Pool not started or already stopped
    Closed(QueuedJob),
}

/// Result of [`WorkQueue::enqueue_with_retry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryOutcome {
    Enqueued,
    /// Still full when `max_wait` ran out
    DroppedFull,
    /// The caller's token fired first
    Cancelled,
    /// The pool will never accept the job
    Closed,
}

struct Inner {
    capacity: usize,
    worker_count: usize,
    job_timeout: Duration,
    state: AtomicU8,
    sender: Mutex<Option<mpsc::Sender<QueuedJob>>>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<QueuedJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Mutex<Option<CancellationToken>>,
    counters: QueueCounters,
}

/// Clonable handle to one queue + worker pool
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl WorkQueue {
    /// Create a stopped pool; nothing runs until [`WorkQueue::start`]
    pub fn new(capacity: usize, worker_count: usize, job_timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);

        Self {
            inner: Arc::new(Inner {
                capacity,
                worker_count: worker_count.max(1),
                job_timeout,
                state: AtomicU8::new(QueueState::NotStarted.as_u8()),
                sender: Mutex::new(Some(sender)),
                receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
                workers: Mutex::new(Vec::new()),
                shutdown: Mutex::new(None),
                counters: QueueCounters::new(),
            }),
        }
    }

    /// Launch exactly `worker_count` workers bound to `shutdown`
    ///
    /// Cancelling `shutdown` stops further dequeues; in-flight jobs see their
    /// own (child) token cancelled. Calling `start` twice is a no-op.
    pub fn start(&self, shutdown: CancellationToken) {
        let swapped = self.inner.state.compare_exchange(
            QueueState::NotStarted.as_u8(),
            QueueState::Running.as_u8(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if swapped.is_err() {
            warn!(state = ?self.state(), "Work queue start ignored");
            return;
        }

        *lock(&self.inner.shutdown) = Some(shutdown.clone());

        let mut workers = lock(&self.inner.workers);
        for worker_id in 0..self.inner.worker_count {
            let inner = Arc::clone(&self.inner);
            let shutdown = shutdown.clone();
            workers.push(tokio::spawn(async move {
                worker_loop(worker_id, inner, shutdown).await;
            }));
        }

        info!(
            workers = self.inner.worker_count,
            capacity = self.inner.capacity,
            job_timeout_secs = self.inner.job_timeout.as_secs(),
            "Work queue started"
        );
    }

    /// Single non-blocking attempt; `false` if full or not running
    pub fn enqueue(&self, job: QueuedJob) -> bool {
        self.offer(job).is_ok()
    }

    /// Single non-blocking attempt that hands the job back on refusal
    pub fn offer(&self, job: QueuedJob) -> Result<(), Rejected> {
        match self.try_send(job) {
            // Full is the only drop-accounted refusal
            Err(Rejected::Full(job)) => {
                self.inner.counters.job_dropped(&job.id, self.inner.capacity);
                Err(Rejected::Full(job))
            }
            other => other,
        }
    }

    fn try_send(&self, job: QueuedJob) -> Result<(), Rejected> {
        if self.state() != QueueState::Running {
            return Err(Rejected::Closed(job));
        }

        let sender = lock(&self.inner.sender);
        let Some(sender) = sender.as_ref() else {
            return Err(Rejected::Closed(job));
        };

        // Count before sending so a fast worker never decrements first
        self.inner.counters.job_admitted();
        match sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => {
                self.inner.counters.job_dequeued();
                Err(Rejected::Full(job))
            }
            Err(TrySendError::Closed(job)) => {
                self.inner.counters.job_dequeued();
                Err(Rejected::Closed(job))
            }
        }
    }

    /// Retry [`WorkQueue::offer`] every `poll_interval` for up to `max_wait`
    ///
    /// Blocks the calling task only, never a worker. A job still refused at
    /// the deadline is counted as dropped once.
    pub async fn enqueue_with_retry(
        &self,
        cancel: &CancellationToken,
        job: QueuedJob,
        max_wait: Duration,
        poll_interval: Duration,
    ) -> RetryOutcome {
        if cancel.is_cancelled() {
            return RetryOutcome::Cancelled;
        }

        let deadline = Instant::now() + max_wait;
        let poll_interval = poll_interval.max(Duration::from_millis(1));
        let mut job = job;

        loop {
            match self.try_send(job) {
                Ok(()) => return RetryOutcome::Enqueued,
                Err(Rejected::Closed(_)) => return RetryOutcome::Closed,
                Err(Rejected::Full(back)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        self.inner.counters.job_dropped(&back.id, self.inner.capacity);
                        return RetryOutcome::DroppedFull;
                    }
                    job = back;
                    let nap = poll_interval.min(deadline - now);
                    tokio::select! {
                        _ = cancel.cancelled() => return RetryOutcome::Cancelled,
                        _ = tokio::time::sleep(nap) => {}
                    }
                }
            }
        }
    }

    /// Close admission and wait up to `grace` for queued and in-flight jobs
    ///
    /// Returns `true` when every worker exited within `grace`. Workers still
    /// running after that keep going; [`WorkQueue::cancel_and_wait`] forces
    /// them down.
    pub async fn stop(&self, grace: Duration) -> bool {
        self.inner
            .state
            .store(QueueState::Stopped.as_u8(), Ordering::SeqCst);
        // Dropping the sender lets workers drain the buffer, then see `None`
        lock(&self.inner.sender).take();

        let drained = self.join_workers(grace).await;
        if drained {
            info!("Work queue stopped");
        } else {
            warn!(
                grace_ms = grace.as_millis() as u64,
                "Work queue drain did not finish within grace period"
            );
        }
        drained
    }

    /// Cancel the root token and wait up to `wait` for the workers to record
    /// their in-flight jobs as cancelled
    ///
    /// Jobs still sitting in the buffer are not run and keep their queued rows.
    pub async fn cancel_and_wait(&self, wait: Duration) -> bool {
        self.inner
            .state
            .store(QueueState::Stopped.as_u8(), Ordering::SeqCst);
        if let Some(token) = lock(&self.inner.shutdown).as_ref() {
            token.cancel();
        }

        let exited = self.join_workers(wait).await;
        if !exited {
            error!(
                wait_ms = wait.as_millis() as u64,
                "Workers still busy after cancellation, abandoning them"
            );
        }
        exited
    }

    /// Join every worker handle; unfinished handles are kept for a later call
    async fn join_workers(&self, wait: Duration) -> bool {
        let mut handles: Vec<JoinHandle<()>> = lock(&self.inner.workers).drain(..).collect();

        let joined =
            tokio::time::timeout(wait, futures::future::join_all(handles.iter_mut())).await;
        match joined {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!(error = %e, "Worker task ended abnormally");
                    }
                }
                true
            }
            Err(_) => {
                handles.retain(|handle| !handle.is_finished());
                lock(&self.inner.workers).extend(handles);
                false
            }
        }
    }

    /// A running pool whose root token fired reports `Stopped`
    pub fn state(&self) -> QueueState {
        let state = QueueState::from_u8(self.inner.state.load(Ordering::SeqCst));
        if state == QueueState::Running && self.root_cancelled() {
            return QueueState::Stopped;
        }
        state
    }

    fn root_cancelled(&self) -> bool {
        lock(&self.inner.shutdown)
            .as_ref()
            .map(|token| token.is_cancelled())
            .unwrap_or(false)
    }

    pub fn is_healthy(&self) -> bool {
        self.state() == QueueState::Running
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn worker_count(&self) -> usize {
        self.inner.worker_count
    }

    pub fn job_timeout(&self) -> Duration {
        self.inner.job_timeout
    }

    pub fn stats(&self) -> QueueStats {
        let counters = self.inner.counters.snapshot();
        QueueStats {
            state: self.state(),
            length: counters.pending,
            capacity: self.inner.capacity,
            worker_count: self.inner.worker_count,
            processed: counters.processed,
            failed: counters.failed,
            dropped: counters.dropped,
        }
    }
}

async fn worker_loop(worker_id: usize, inner: Arc<Inner>, shutdown: CancellationToken) {
    debug!(worker = worker_id, "Worker started");

    loop {
        let next = {
            let mut receiver = inner.receiver.lock().await;
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                job = receiver.recv() => job,
            }
        };

        let Some(job) = next else {
            break;
        };

        inner.counters.job_dequeued();
        run_job(worker_id, &inner, &shutdown, job).await;
    }

    debug!(worker = worker_id, "Worker exiting");
}

async fn run_job(worker_id: usize, inner: &Inner, shutdown: &CancellationToken, job: QueuedJob) {
    let QueuedJob {
        id,
        source,
        work,
        on_finish,
    } = job;

    let token = shutdown.child_token();
    let started = Instant::now();
    let job_timeout = inner.job_timeout;

    let work_token = token.clone();
    let root = shutdown.clone();
    let result = AssertUnwindSafe(async move {
        let work = tokio::time::timeout(job_timeout, work(work_token));
        tokio::select! {
            biased;
            finished = work => Some(finished),
            _ = async {
                root.cancelled().await;
                tokio::time::sleep(CANCEL_GRACE).await;
            } => None,
        }
    })
    .catch_unwind()
    .await;

    let outcome = match result {
        Ok(Some(Ok(Ok(())))) => JobOutcome::Succeeded,
        Ok(Some(Ok(Err(e)))) if shutdown.is_cancelled() => {
            JobOutcome::Cancelled(format!("{:#}", e))
        }
        Ok(Some(Ok(Err(e)))) => JobOutcome::Failed(format!("{:#}", e)),
        Ok(Some(Err(_elapsed))) => JobOutcome::TimedOut(job_timeout),
        Ok(None) => JobOutcome::Cancelled(format!(
            "abandoned {}s after shutdown",
            CANCEL_GRACE.as_secs()
        )),
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(worker = worker_id, job = %id, panic = %message, "Job panicked; worker recovered");
            JobOutcome::Panicked(message)
        }
    };
    token.cancel();

    inner.counters.job_completed(outcome.is_success());

    let elapsed_ms = started.elapsed().as_millis() as u64;
    match outcome.error_message() {
        None => info!(
            job = %id,
            source = %source,
            worker = worker_id,
            elapsed_ms,
            outcome = %outcome,
            "Job finished"
        ),
        Some(err) => warn!(
            job = %id,
            source = %source,
            worker = worker_id,
            elapsed_ms,
            outcome = %outcome,
            error = %err,
            "Job finished"
        ),
    }

    if let Some(callback) = on_finish {
        let finished = AssertUnwindSafe(async move { callback(outcome).await })
            .catch_unwind()
            .await;
        if let Err(panic) = finished {
            error!(
                worker = worker_id,
                job = %id,
                panic = %panic_message(panic.as_ref()),
                "Completion callback panicked"
            );
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
