//! Append-only per-job log lines
//!
//! Writers never trim; readers ask for the most recent N lines.

use afw_common::time::{parse_db_timestamp, to_db_string};
use afw_common::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::Row;

use super::JobStore;

/// One persisted log line
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobLogLine {
    pub line: String,
    pub created_at: DateTime<Utc>,
}

impl JobStore {
    pub async fn append_job_log(&self, job_id: i64, line: &str, ts: DateTime<Utc>) -> Result<()> {
        let now = to_db_string(ts);
        let _guard = self.write_guard().await;

        sqlx::query("INSERT INTO job_logs (job_id, line, created_at) VALUES (?, ?, ?)")
            .bind(job_id)
            .bind(line)
            .bind(&now)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// The most recent `limit` lines for a job, oldest first
    pub async fn job_logs(&self, job_id: i64, limit: u32) -> Result<Vec<JobLogLine>> {
        let rows = sqlx::query(
            r#"
            SELECT line, created_at FROM (
                SELECT rowid AS seq, line, created_at
                FROM job_logs
                WHERE job_id = ?
                ORDER BY rowid DESC
                LIMIT ?
            )
            ORDER BY seq ASC
            "#,
        )
        .bind(job_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let created_at: String = row.try_get("created_at")?;
                Ok(JobLogLine {
                    line: row.try_get("line")?,
                    created_at: parse_db_timestamp(&created_at)?,
                })
            })
            .collect()
    }
}
