//! Call rollup operations

use afw_common::time::{parse_db_timestamp, to_db_string};
use afw_common::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::{BTreeMap, HashMap};

use super::JobStore;
use crate::models::{ArtifactState, Call, CallUpdate, JobStatus};

impl JobStore {
    /// Apply one job completion to the artifact's rollup row
    ///
    /// Tags are set to `{}` on first insert and left untouched afterwards.
    pub async fn upsert_call(&self, update: &CallUpdate, ts: DateTime<Utc>) -> Result<()> {
        let now = to_db_string(ts);
        let _guard = self.write_guard().await;

        sqlx::query(
            r#"
            INSERT INTO calls (artifact_id, status, last_stage, last_error, tags, created_at, updated_at)
            VALUES (?, ?, ?, ?, '{}', ?, ?)
            ON CONFLICT(artifact_id) DO UPDATE SET
                status = excluded.status,
                last_stage = excluded.last_stage,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&update.artifact_id)
        .bind(update.status.as_str())
        .bind(&update.stage)
        .bind(update.error.as_deref())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Load one artifact's rollup
    pub async fn get_call(&self, artifact_id: &str) -> Result<Option<Call>> {
        let row = sqlx::query(
            r#"
            SELECT artifact_id, status, last_stage, last_error, tags, created_at, updated_at
            FROM calls
            WHERE artifact_id = ?
            "#,
        )
        .bind(artifact_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(call_from_row).transpose()
    }

    pub async fn require_call(&self, artifact_id: &str) -> Result<Call> {
        self.get_call(artifact_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("call {}", artifact_id)))
    }

    /// Most recently created calls first
    pub async fn list_calls(&self, limit: u32) -> Result<Vec<Call>> {
        let rows = sqlx::query(
            r#"
            SELECT artifact_id, status, last_stage, last_error, tags, created_at, updated_at
            FROM calls
            ORDER BY created_at DESC, artifact_id ASC
            LIMIT ?
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(call_from_row).collect()
    }

    /// Latest persisted state for every artifact the store knows about
    ///
    /// Combines the calls rollup (completed work) with the newest job row per
    /// artifact (work admitted or in flight that has not completed yet).
    pub async fn artifact_states(&self) -> Result<HashMap<String, ArtifactState>> {
        let mut states: HashMap<String, ArtifactState> = HashMap::new();

        let job_rows = sqlx::query(
            r#"
            SELECT j.artifact_id, j.status, j.updated_at
            FROM jobs j
            JOIN (SELECT artifact_id, MAX(id) AS max_id FROM jobs GROUP BY artifact_id) latest
              ON latest.max_id = j.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        for row in &job_rows {
            let artifact_id: String = row.try_get("artifact_id")?;
            let status: String = row.try_get("status")?;
            let updated_at: String = row.try_get("updated_at")?;
            states.insert(
                artifact_id,
                ArtifactState {
                    call_status: None,
                    latest_job_status: Some(status.parse().map_err(Error::Internal)?),
                    updated_at: parse_db_timestamp(&updated_at)?,
                },
            );
        }

        let call_rows = sqlx::query("SELECT artifact_id, status, updated_at FROM calls")
            .fetch_all(&self.pool)
            .await?;

        for row in &call_rows {
            let artifact_id: String = row.try_get("artifact_id")?;
            let status: String = row.try_get("status")?;
            let status: JobStatus = status.parse().map_err(Error::Internal)?;
            let updated_at: String = row.try_get("updated_at")?;
            let updated_at = parse_db_timestamp(&updated_at)?;

            states
                .entry(artifact_id)
                .and_modify(|state| {
                    state.call_status = Some(status);
                    if updated_at > state.updated_at {
                        state.updated_at = updated_at;
                    }
                })
                .or_insert(ArtifactState {
                    call_status: Some(status),
                    latest_job_status: None,
                    updated_at,
                });
        }

        Ok(states)
    }
}

fn call_from_row(row: &SqliteRow) -> Result<Call> {
    let status: String = row.try_get("status")?;
    let tags: String = row.try_get("tags")?;
    let tags: BTreeMap<String, String> = serde_json::from_str(&tags)?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Call {
        artifact_id: row.try_get("artifact_id")?,
        status: status.parse().map_err(Error::Internal)?,
        last_stage: row.try_get("last_stage")?,
        last_error: row.try_get("last_error")?,
        tags,
        created_at: parse_db_timestamp(&created_at)?,
        updated_at: parse_db_timestamp(&updated_at)?,
    })
}
