//! Job records and the job state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::StageParams;

/// Pipeline stage names
///
/// The store and the stage registry key on [`Stage::as_str`], so a job for a
/// stage outside this set can still be admitted (and then fails with "no
/// handler").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Ingest,
    Preprocess,
    AlertInitial,
    Transcribe,
    Normalize,
    Enrich,
    Publish,
}

impl Stage {
    /// All known stages in pipeline order
    pub const ALL: [Stage; 7] = [
        Stage::Ingest,
        Stage::Preprocess,
        Stage::AlertInitial,
        Stage::Transcribe,
        Stage::Normalize,
        Stage::Enrich,
        Stage::Publish,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Ingest => "INGEST",
            Stage::Preprocess => "PREPROCESS",
            Stage::AlertInitial => "ALERT_INITIAL",
            Stage::Transcribe => "TRANSCRIBE",
            Stage::Normalize => "NORMALIZE",
            Stage::Enrich => "ENRICH",
            Stage::Publish => "PUBLISH",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Stage> for String {
    fn from(stage: Stage) -> Self {
        stage.as_str().to_string()
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown stage: {}", s))
    }
}

/// Job status
///
/// Transitions only move forward: `queued → running → {succeeded, failed}`.
/// `queued → failed` is allowed for jobs that cannot start (no handler), and
/// `cancelled` is reserved for forced shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether `self → next` is a legal state machine step
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Queued, JobStatus::Running) => true,
            (JobStatus::Queued | JobStatus::Running, s) => s.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// One attempt to execute one stage for one artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Store-assigned, monotonically increasing identifier
    pub id: i64,
    pub artifact_id: String,
    pub stage: String,
    pub status: JobStatus,
    pub params: StageParams,
    /// Digest of (artifact_id, stage, params); unique in the store
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Only set when status is failed or cancelled
    pub last_error: Option<String>,
}

/// Admission request for [`crate::db::JobStore::insert_job_idempotent`]
#[derive(Debug, Clone)]
pub struct NewJob {
    pub artifact_id: String,
    pub stage: String,
    pub params: StageParams,
    pub idempotency_key: String,
}
