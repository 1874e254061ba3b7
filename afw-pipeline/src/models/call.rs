//! Call (artifact) rollup records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::JobStatus;

/// Current view of one artifact across all stages
///
/// Written only by the job runner, once per job completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub artifact_id: String,
    /// Status of the most recently completed job for this artifact
    pub status: JobStatus,
    pub last_stage: String,
    pub last_error: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Completion record applied by [`crate::db::JobStore::upsert_call`]
#[derive(Debug, Clone)]
pub struct CallUpdate {
    pub artifact_id: String,
    pub stage: String,
    pub status: JobStatus,
    /// `None` clears any previous error
    pub error: Option<String>,
}

/// Latest persisted processing state of an artifact, as seen by backfill
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactState {
    /// Rollup status from the calls table, if any job has completed
    pub call_status: Option<JobStatus>,
    /// Status of the newest job row for the artifact, if any
    pub latest_job_status: Option<JobStatus>,
    pub updated_at: DateTime<Utc>,
}
