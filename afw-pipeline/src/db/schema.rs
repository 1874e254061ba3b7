//! Pipeline table definitions
//!
//! `CREATE ... IF NOT EXISTS` throughout, so running this on every startup is
//! safe. The unique index on `jobs.idempotency_key` is what makes admission
//! idempotent under concurrent producers.

use afw_common::Result;
use sqlx::SqlitePool;
use tracing::info;

/// Create jobs, calls and job_logs tables with their indexes
pub async fn create_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            artifact_id TEXT NOT NULL,
            stage TEXT NOT NULL,
            status TEXT NOT NULL,
            params TEXT NOT NULL DEFAULT '{}',
            idempotency_key TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            started_at TEXT,
            finished_at TEXT,
            last_error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_idem ON jobs(idempotency_key)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_artifact ON jobs(artifact_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS calls (
            artifact_id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            last_stage TEXT NOT NULL,
            last_error TEXT,
            tags TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_logs (
            job_id INTEGER NOT NULL,
            line TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_job_logs_job ON job_logs(job_id)")
        .execute(pool)
        .await?;

    info!("Database tables initialized (jobs, calls, job_logs)");

    Ok(())
}
