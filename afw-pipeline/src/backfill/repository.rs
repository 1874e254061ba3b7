//! Calls-directory backfill repository
//!
//! Candidates are the audio files directly inside the calls directory. Each
//! one's status comes from the store; queueing goes through the runner's
//! retrying admission path so every candidate is accounted for.

use afw_common::{time, EventBus, PipelineEvent};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{BackfillCandidate, BackfillRepository, BackfillSummary, CandidateStatus, EnqueueResult};
use crate::jobs::{EnqueueOutcome, JobRunner};
use crate::models::{ArtifactState, JobStatus, Stage, StageParams};
use crate::queue::JobSource;
use crate::scanner;

/// Map persisted state to a candidate status
///
/// In-flight work (a queued or running newest job) wins over the call
/// rollup, so an artifact with a pending follow-up stage is not `done`.
pub fn candidate_status(state: Option<&ArtifactState>) -> CandidateStatus {
    let Some(state) = state else {
        return CandidateStatus::New;
    };

    match state.latest_job_status {
        Some(JobStatus::Running) => return CandidateStatus::Processing,
        Some(JobStatus::Queued) => return CandidateStatus::Queued,
        _ => {}
    }

    match state.call_status {
        Some(JobStatus::Succeeded) => CandidateStatus::Done,
        Some(JobStatus::Failed) | Some(JobStatus::Cancelled) => CandidateStatus::Error,
        _ => CandidateStatus::New,
    }
}

#[derive(Clone)]
pub struct DirectoryRepository {
    calls_dir: PathBuf,
    runner: JobRunner,
    events: EventBus,
    retry_window: Duration,
    poll_interval: Duration,
}

impl DirectoryRepository {
    pub fn new(
        calls_dir: PathBuf,
        runner: JobRunner,
        events: EventBus,
        retry_window: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            calls_dir,
            runner,
            events,
            retry_window,
            poll_interval,
        }
    }
}

#[async_trait]
impl BackfillRepository for DirectoryRepository {
    async fn list_candidates(
        &self,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<Vec<BackfillCandidate>> {
        let dir = self.calls_dir.clone();
        let files = tokio::task::spawn_blocking(move || scanner::list_audio_files(&dir))
            .await
            .context("calls directory scan task failed")?
            .with_context(|| format!("listing {}", self.calls_dir.display()))?;

        let states: HashMap<String, ArtifactState> = self
            .runner
            .store()
            .artifact_states()
            .await
            .context("loading artifact states")?;

        Ok(files
            .into_iter()
            .map(|file| {
                let state = states.get(&file.filename);
                BackfillCandidate {
                    status: candidate_status(state),
                    updated_at: state.map(|s| s.updated_at),
                    filename: file.filename,
                    mod_time: file.mod_time,
                    size_bytes: file.size_bytes,
                }
            })
            .collect())
    }

    async fn queue_record(
        &self,
        cancel: &CancellationToken,
        candidate: &BackfillCandidate,
    ) -> anyhow::Result<EnqueueResult> {
        let report = self
            .runner
            .enqueue_with_retry(
                &candidate.filename,
                Stage::Ingest.as_str(),
                StageParams::new(),
                JobSource::Backfill,
                cancel,
                self.retry_window,
                self.poll_interval,
            )
            .await?;

        match report.outcome {
            EnqueueOutcome::Enqueued | EnqueueOutcome::AlreadyAdmitted => Ok(EnqueueResult::Enqueued),
            EnqueueOutcome::DroppedFull => Ok(EnqueueResult::DroppedFull),
            EnqueueOutcome::Cancelled => Err(anyhow!(
                "cancelled while waiting for queue space (job {})",
                report.job.id
            )),
            EnqueueOutcome::Closed => Err(anyhow!("queue closed (job {})", report.job.id)),
        }
    }

    async fn on_backfill_complete(&self, summary: BackfillSummary) {
        self.events.emit_lossy(PipelineEvent::BackfillCompleted {
            total_candidates: summary.total_candidates,
            already_processed: summary.already_processed,
            unprocessed: summary.unprocessed,
            selected: summary.selected,
            enqueued: summary.enqueued,
            dropped_full: summary.dropped_full,
            other_errors: summary.other_errors,
            timestamp: time::now(),
        });
    }
}
