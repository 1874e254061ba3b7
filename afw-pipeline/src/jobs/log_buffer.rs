//! In-memory per-job log ring
//!
//! Sharded by job id so concurrent jobs rarely contend on one mutex. Each job
//! keeps at most [`LINES_PER_JOB`] lines; each shard tracks at most
//! [`JOBS_PER_SHARD`] jobs and forgets the oldest one when full. Persisted
//! lines in `job_logs` outlive eviction here.

use afw_common::time;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

use crate::db::{JobLogLine, JobStore};

pub const SHARD_COUNT: usize = 16;
pub const LINES_PER_JOB: usize = 200;
pub const JOBS_PER_SHARD: usize = 64;

#[derive(Debug, Default)]
struct Shard {
    lines: HashMap<i64, VecDeque<JobLogLine>>,
    /// Job ids in first-seen order, for eviction
    order: VecDeque<i64>,
}

#[derive(Debug)]
pub struct JobLogBuffer {
    shards: Vec<Mutex<Shard>>,
}

impl Default for JobLogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl JobLogBuffer {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(Shard::default())).collect(),
        }
    }

    fn shard(&self, job_id: i64) -> MutexGuard<'_, Shard> {
        let index = job_id.rem_euclid(SHARD_COUNT as i64) as usize;
        match self.shards[index].lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn push(&self, job_id: i64, line: JobLogLine) {
        let mut shard = self.shard(job_id);

        if !shard.lines.contains_key(&job_id) {
            while shard.order.len() >= JOBS_PER_SHARD {
                match shard.order.pop_front() {
                    Some(evicted) => {
                        shard.lines.remove(&evicted);
                    }
                    None => break,
                }
            }
            shard.order.push_back(job_id);
        }

        let ring = shard.lines.entry(job_id).or_default();
        if ring.len() >= LINES_PER_JOB {
            ring.pop_front();
        }
        ring.push_back(line);
    }

    /// All buffered lines for a job, oldest first
    pub fn lines(&self, job_id: i64) -> Option<Vec<JobLogLine>> {
        self.shard(job_id)
            .lines
            .get(&job_id)
            .map(|ring| ring.iter().cloned().collect())
    }

    /// The last `n` buffered lines for a job, oldest first
    pub fn tail(&self, job_id: i64, n: usize) -> Option<Vec<JobLogLine>> {
        self.shard(job_id).lines.get(&job_id).map(|ring| {
            let skip = ring.len().saturating_sub(n);
            ring.iter().skip(skip).cloned().collect()
        })
    }
}

/// Job-scoped log sink handed to stage handlers
///
/// Every line goes to the in-memory ring and to the `job_logs` table. A failed
/// table write is reported but never fails the job.
#[derive(Clone)]
pub struct JobLogger {
    job_id: i64,
    buffer: Arc<JobLogBuffer>,
    store: JobStore,
}

impl JobLogger {
    pub fn new(job_id: i64, buffer: Arc<JobLogBuffer>, store: JobStore) -> Self {
        Self {
            job_id,
            buffer,
            store,
        }
    }

    pub fn job_id(&self) -> i64 {
        self.job_id
    }

    pub async fn log(&self, line: impl Into<String>) {
        let line = JobLogLine {
            line: line.into(),
            created_at: time::now(),
        };

        self.buffer.push(self.job_id, line.clone());

        if let Err(e) = self
            .store
            .append_job_log(self.job_id, &line.line, line.created_at)
            .await
        {
            warn!(job_id = self.job_id, error = %e, "Failed to persist job log line");
        }
    }
}
