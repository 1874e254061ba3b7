//! Persistent job/call store
//!
//! SQLite-backed source of truth for job attempts, artifact rollups and
//! per-job log lines. The store is the only mutable state shared between
//! queue workers, and it serializes every write internally.

pub mod calls;
pub mod job_logs;
pub mod jobs;
pub mod schema;

pub use job_logs::JobLogLine;

use afw_common::Result;
use sqlx::SqlitePool;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// Clonable handle over the pipeline database
#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl JobStore {
    /// Open (or create) the database file and ensure the schema exists
    pub async fn open(db_path: &Path) -> Result<Self> {
        let pool = afw_common::db::open_pool(db_path).await?;
        Self::from_pool(pool).await
    }

    /// Private in-memory store, used by tests
    pub async fn open_in_memory() -> Result<Self> {
        let pool = afw_common::db::open_memory_pool().await?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, creating tables if needed
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        schema::create_tables(&pool).await?;
        Ok(Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Returns an error if the database is not reachable
    pub async fn health(&self) -> Result<()> {
        afw_common::db::ping(&self.pool).await
    }

    /// Serializes writers; held for the duration of one statement
    async fn write_guard(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }
}
