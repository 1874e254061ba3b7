//! Polling directory watcher
//!
//! Turns newly appearing audio files in the calls directory into `INGEST`
//! admissions. Files already present at startup are left to backfill.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::jobs::{JobRunner, RunnerError};
use crate::models::{Stage, StageParams};
use crate::queue::JobSource;
use crate::scanner;

pub struct DirectoryWatcher {
    calls_dir: PathBuf,
    interval: Duration,
    runner: JobRunner,
    seen: HashSet<String>,
}

impl DirectoryWatcher {
    pub fn new(calls_dir: PathBuf, interval: Duration, runner: JobRunner) -> Self {
        Self {
            calls_dir,
            interval: interval.max(Duration::from_millis(10)),
            runner,
            seen: HashSet::new(),
        }
    }

    /// Record everything currently in the directory as already seen
    pub async fn seed(&mut self) {
        match self.list().await {
            Ok(names) => {
                debug!(count = names.len(), "Watcher seeded with existing files");
                self.seen.extend(names);
            }
            Err(e) => warn!(dir = %self.calls_dir.display(), error = %e, "Watcher seed listing failed"),
        }
    }

    /// One poll: admit every file not seen before, returning how many
    ///
    /// A file whose admission fails for a reason other than a full queue is
    /// not marked seen, so the next tick tries again.
    pub async fn poll_once(&mut self) -> usize {
        let names = match self.list().await {
            Ok(names) => names,
            Err(e) => {
                warn!(dir = %self.calls_dir.display(), error = %e, "Watcher listing failed");
                return 0;
            }
        };

        let mut admitted = 0;
        for name in names {
            if self.seen.contains(&name) {
                continue;
            }

            match self
                .runner
                .enqueue(&name, Stage::Ingest.as_str(), StageParams::new(), JobSource::Watcher)
                .await
            {
                Ok(job) => {
                    info!(artifact_id = %name, job_id = job.id, "New call detected");
                    admitted += 1;
                    self.seen.insert(name);
                }
                Err(RunnerError::QueueFull { job }) => {
                    // The row stays queued until an external recovery sweep re-offers it
                    warn!(artifact_id = %name, job_id = job.id, "New call detected but queue is full");
                    self.seen.insert(name);
                }
                Err(e) => {
                    warn!(artifact_id = %name, error = %e, "Failed to admit new call");
                }
            }
        }

        admitted
    }

    /// Seed, then poll until `cancel` fires
    pub fn spawn(mut self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.seed().await;
            info!(
                dir = %self.calls_dir.display(),
                interval_ms = self.interval.as_millis() as u64,
                "Directory watcher started"
            );

            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; the seed already covered it
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.poll_once().await;
                    }
                }
            }

            info!("Directory watcher stopped");
        })
    }

    async fn list(&self) -> Result<Vec<String>, scanner::ScanError> {
        let dir = self.calls_dir.clone();
        let files = tokio::task::spawn_blocking(move || scanner::list_audio_files(&dir))
            .await
            .map_err(|e| scanner::ScanError::Io {
                path: self.calls_dir.clone(),
                message: e.to_string(),
            })??;
        Ok(files.into_iter().map(|f| f.filename).collect())
    }
}
