//! On-demand backfill passes
//!
//! At most one pass runs at a time. The launcher records each finished pass
//! so the API can report the latest summary.

use afw_common::time;
use chrono::{DateTime, Utc};
use serde::Serialize;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::{run_once, BackfillRepository, BackfillSummary};
use crate::queue::panic_message;

/// Latest completed pass, as exposed over the API
#[derive(Debug, Clone, Serialize)]
pub struct BackfillReport {
    #[serde(flatten)]
    pub summary: BackfillSummary,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct BackfillTracker {
    latest: RwLock<Option<BackfillReport>>,
    running: AtomicBool,
}

impl BackfillTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a pass as started; `false` if one is already running
    pub fn try_begin(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn finish(&self, summary: BackfillSummary) -> BackfillReport {
        let report = BackfillReport {
            summary,
            finished_at: time::now(),
        };
        *self.latest.write().await = Some(report.clone());
        self.running.store(false, Ordering::SeqCst);
        report
    }

    pub async fn latest(&self) -> Option<BackfillReport> {
        self.latest.read().await.clone()
    }
}

#[derive(Clone)]
pub struct BackfillLauncher {
    repo: Arc<dyn BackfillRepository>,
    tracker: Arc<BackfillTracker>,
    cancel: CancellationToken,
    default_limit: i64,
}

impl BackfillLauncher {
    /// `cancel` bounds every pass this launcher starts
    pub fn new(repo: Arc<dyn BackfillRepository>, cancel: CancellationToken, default_limit: i64) -> Self {
        Self {
            repo,
            tracker: Arc::new(BackfillTracker::new()),
            cancel,
            default_limit,
        }
    }

    pub fn tracker(&self) -> &BackfillTracker {
        &self.tracker
    }

    pub fn default_limit(&self) -> i64 {
        self.default_limit
    }

    /// Start a pass in the background, or `None` if one is already running
    pub fn launch(&self, limit: Option<i64>) -> Option<JoinHandle<BackfillSummary>> {
        if !self.tracker.try_begin() {
            return None;
        }

        let limit = limit.unwrap_or(self.default_limit).max(0);
        let repo = Arc::clone(&self.repo);
        let tracker = Arc::clone(&self.tracker);
        let cancel = self.cancel.child_token();

        info!(limit, "Backfill pass starting");
        Some(tokio::spawn(async move {
            // The tracker must be released even if the completion callback panics
            let summary = match AssertUnwindSafe(run_once(repo.as_ref(), &cancel, limit))
                .catch_unwind()
                .await
            {
                Ok(summary) => summary,
                Err(panic) => {
                    error!(panic = %panic_message(panic.as_ref()), "Backfill completion panicked");
                    BackfillSummary::default()
                }
            };
            tracker.finish(summary).await;
            summary
        }))
    }
}
