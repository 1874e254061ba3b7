//! Job row operations
//!
//! Status updates carry their allowed source states in the `WHERE` clause, so
//! the state machine cannot move backwards even if two callers race.

use afw_common::time::{parse_db_timestamp, parse_optional_db_timestamp, to_db_string};
use afw_common::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::debug;

use super::JobStore;
use crate::models::{Job, JobStatus, NewJob, StageParams};

const JOB_COLUMNS: &str = "id, artifact_id, stage, status, params, idempotency_key, \
     created_at, updated_at, started_at, finished_at, last_error";

impl JobStore {
    /// Insert a queued job unless one with the same idempotency key exists
    ///
    /// Returns the persisted row and whether this call created it. The unique
    /// index decides the winner when producers race; the loser gets the
    /// winner's row back.
    pub async fn insert_job_idempotent(
        &self,
        job: &NewJob,
        ts: DateTime<Utc>,
    ) -> Result<(Job, bool)> {
        let now = to_db_string(ts);
        let params = job.params.canonical_json();

        let rows_affected = {
            let _guard = self.write_guard().await;
            sqlx::query(
                r#"
                INSERT INTO jobs (artifact_id, stage, status, params, idempotency_key, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(idempotency_key) DO NOTHING
                "#,
            )
            .bind(&job.artifact_id)
            .bind(&job.stage)
            .bind(JobStatus::Queued.as_str())
            .bind(&params)
            .bind(&job.idempotency_key)
            .bind(&now)
            .bind(&now)
            .execute(&self.pool)
            .await?
            .rows_affected()
        };

        let stored = self
            .get_job_by_key(&job.idempotency_key)
            .await?
            .ok_or_else(|| {
                Error::Internal(format!(
                    "job with idempotency key {} missing after insert",
                    job.idempotency_key
                ))
            })?;

        let is_new = rows_affected == 1;
        if !is_new {
            debug!(
                job_id = stored.id,
                artifact_id = %stored.artifact_id,
                stage = %stored.stage,
                "Idempotent admission returned existing job"
            );
        }

        Ok((stored, is_new))
    }

    /// Move a job from `queued` to `running`
    ///
    /// Returns `false` when the job was not in `queued` (already claimed or
    /// finished), in which case nothing changed.
    pub async fn mark_job_started(&self, id: i64, ts: DateTime<Utc>) -> Result<bool> {
        let now = to_db_string(ts);
        let _guard = self.write_guard().await;

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'running', started_at = ?, updated_at = ?
            WHERE id = ? AND status = 'queued'
            "#,
        )
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Record a terminal status
    ///
    /// Only `queued` or `running` rows are updated; returns `false` if the job
    /// had already finished. `error` is stored for non-success statuses only.
    pub async fn mark_job_finished(
        &self,
        id: i64,
        status: JobStatus,
        error: Option<&str>,
        ts: DateTime<Utc>,
    ) -> Result<bool> {
        if !status.is_terminal() {
            return Err(Error::InvalidInput(format!(
                "{} is not a terminal job status",
                status
            )));
        }

        let now = to_db_string(ts);
        let error = if status == JobStatus::Succeeded { None } else { error };
        let _guard = self.write_guard().await;

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?, finished_at = ?, updated_at = ?, last_error = ?
            WHERE id = ? AND status IN ('queued', 'running')
            "#,
        )
        .bind(status.as_str())
        .bind(&now)
        .bind(&now)
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Load a job by id
    pub async fn get_job(&self, id: i64) -> Result<Option<Job>> {
        let sql = format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(job_from_row).transpose()
    }

    /// Like [`JobStore::get_job`], but a missing row is `Error::NotFound`
    pub async fn require_job(&self, id: i64) -> Result<Job> {
        self.get_job(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job {}", id)))
    }

    /// Load a job by idempotency key
    pub async fn get_job_by_key(&self, idempotency_key: &str) -> Result<Option<Job>> {
        let sql = format!("SELECT {} FROM jobs WHERE idempotency_key = ?", JOB_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(idempotency_key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    /// Most recently created jobs first
    pub async fn list_jobs(&self, limit: u32) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {} FROM jobs ORDER BY created_at DESC, id DESC LIMIT ?",
            JOB_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    /// All jobs for one artifact, oldest first
    pub async fn list_jobs_for_artifact(&self, artifact_id: &str) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {} FROM jobs WHERE artifact_id = ? ORDER BY id ASC",
            JOB_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(artifact_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }
}

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let status: String = row.try_get("status")?;
    let status = status.parse::<JobStatus>().map_err(Error::Internal)?;

    let params: String = row.try_get("params")?;
    let params = StageParams::from_stored(&params)?;

    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Job {
        id: row.try_get("id")?,
        artifact_id: row.try_get("artifact_id")?,
        stage: row.try_get("stage")?,
        status,
        params,
        idempotency_key: row.try_get("idempotency_key")?,
        created_at: parse_db_timestamp(&created_at)?,
        updated_at: parse_db_timestamp(&updated_at)?,
        started_at: parse_optional_db_timestamp(row.try_get("started_at")?)?,
        finished_at: parse_optional_db_timestamp(row.try_get("finished_at")?)?,
        last_error: row.try_get("last_error")?,
    })
}
