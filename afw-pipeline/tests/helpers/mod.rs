//! Shared test utilities
//!
//! Each integration test file includes this with `mod helpers;`, so not every
//! helper is used by every file.

#![allow(dead_code)]

use std::future::Future;
use std::time::{Duration, Instant};

use afw_common::EventBus;
use afw_pipeline::db::JobStore;
use afw_pipeline::jobs::{JobRunner, StageRegistry};
use afw_pipeline::models::{Job, JobStatus};
use afw_pipeline::queue::WorkQueue;
use tokio_util::sync::CancellationToken;

/// Upper bound for any single wait in the tests
pub const WAIT_LIMIT: Duration = Duration::from_secs(5);

/// Poll `check` every 10ms until it returns true; panics after [`WAIT_LIMIT`]
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + WAIT_LIMIT;
    loop {
        if check().await {
            return;
        }
        if Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait for a job row to reach a terminal status and return it
pub async fn wait_for_terminal(store: &JobStore, job_id: i64) -> Job {
    wait_until("job to finish", move || async move {
        matches!(
            store.get_job(job_id).await,
            Ok(Some(job)) if job.status.is_terminal()
        )
    })
    .await;
    store
        .get_job(job_id)
        .await
        .unwrap()
        .expect("job row vanished")
}

/// Wait for a job row to reach `status`
pub async fn wait_for_status(store: &JobStore, job_id: i64, status: JobStatus) {
    wait_until(&format!("job {} to become {}", job_id, status), move || async move {
        matches!(store.get_job(job_id).await, Ok(Some(job)) if job.status == status)
    })
    .await;
}

/// Running runner over a fresh in-memory store
pub struct Harness {
    pub store: JobStore,
    pub queue: WorkQueue,
    pub runner: JobRunner,
    pub events: EventBus,
    pub shutdown: CancellationToken,
}

impl Harness {
    pub async fn start(registry: StageRegistry, capacity: usize, workers: usize, timeout: Duration) -> Self {
        let store = JobStore::open_in_memory().await.unwrap();
        let events = EventBus::new(64);
        let queue = WorkQueue::new(capacity, workers, timeout);
        let shutdown = CancellationToken::new();
        queue.start(shutdown.clone());
        let runner = JobRunner::new(store.clone(), registry, queue.clone(), events.clone());

        Self {
            store,
            queue,
            runner,
            events,
            shutdown,
        }
    }

    pub async fn stop(self) {
        self.queue.stop(WAIT_LIMIT).await;
        self.shutdown.cancel();
    }
}
