//! Backfill selector
//!
//! Reconciles what is on disk against what the store says was processed and
//! re-enqueues a bounded, most-recent-first slice of the rest. Selection is a
//! pure function; [`run`] wraps it in a fire-and-forget task that always
//! reports exactly one [`BackfillSummary`].

pub mod launcher;
pub mod repository;

pub use launcher::{BackfillLauncher, BackfillReport, BackfillTracker};
pub use repository::DirectoryRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::queue::panic_message;

/// Processing status of a candidate, derived from persisted state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateStatus {
    New,
    Queued,
    Processing,
    Done,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackfillCandidate {
    pub filename: String,
    pub mod_time: DateTime<Utc>,
    pub size_bytes: u64,
    pub status: CandidateStatus,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Audit trail of one reconciliation pass
///
/// `selected == enqueued + dropped_full + other_errors` always holds for a
/// summary produced by [`run_once`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillSummary {
    pub total_candidates: usize,
    pub already_processed: usize,
    pub unprocessed: usize,
    pub selected: usize,
    pub enqueued: usize,
    pub dropped_full: usize,
    pub other_errors: usize,
}

/// Result of handing one candidate to the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    /// Queued, or already admitted earlier
    Enqueued,
    /// Queue stayed full for the whole retry window
    DroppedFull,
}

/// Storage/queue side of a backfill pass
#[async_trait]
pub trait BackfillRepository: Send + Sync {
    async fn list_candidates(
        &self,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Vec<BackfillCandidate>>;

    async fn queue_record(
        &self,
        cancel: &CancellationToken,
        candidate: &BackfillCandidate,
    ) -> anyhow::Result<EnqueueResult>;

    /// Called exactly once per pass with the final summary
    async fn on_backfill_complete(&self, summary: BackfillSummary);
}

/// Pick at most `limit` unprocessed candidates, newest first
///
/// Ties on `mod_time` break by filename. `limit <= 0` means no cap. The
/// returned summary has the enqueue counters at zero.
pub fn select_pending(
    mut candidates: Vec<BackfillCandidate>,
    limit: i64,
) -> (Vec<BackfillCandidate>, BackfillSummary) {
    candidates.sort_by(|a, b| {
        b.mod_time
            .cmp(&a.mod_time)
            .then_with(|| a.filename.cmp(&b.filename))
    });

    let total_candidates = candidates.len();
    let (done, pending): (Vec<_>, Vec<_>) = candidates
        .into_iter()
        .partition(|c| c.status == CandidateStatus::Done);

    let unprocessed = pending.len();
    let cap = if limit <= 0 {
        unprocessed
    } else {
        usize::try_from(limit).unwrap_or(usize::MAX).min(unprocessed)
    };
    let selected: Vec<BackfillCandidate> = pending.into_iter().take(cap).collect();

    let summary = BackfillSummary {
        total_candidates,
        already_processed: done.len(),
        unprocessed,
        selected: selected.len(),
        ..BackfillSummary::default()
    };

    (selected, summary)
}

/// Run one pass in the background; never blocks the caller
pub fn run(
    repo: Arc<dyn BackfillRepository>,
    cancel: CancellationToken,
    limit: i64,
) -> JoinHandle<BackfillSummary> {
    tokio::spawn(async move { run_once(repo.as_ref(), &cancel, limit).await })
}

/// One complete pass: list, select, queue, report
///
/// A listing failure reports an all-zero summary, and so does a panic inside
/// the repository. Cancellation mid-loop counts the selections not yet
/// attempted as `other_errors`.
pub async fn run_once(
    repo: &dyn BackfillRepository,
    cancel: &CancellationToken,
    limit: i64,
) -> BackfillSummary {
    let summary = match AssertUnwindSafe(reconcile(repo, cancel, limit))
        .catch_unwind()
        .await
    {
        Ok(summary) => summary,
        Err(panic) => {
            error!(panic = %panic_message(panic.as_ref()), "Backfill pass panicked");
            BackfillSummary::default()
        }
    };

    repo.on_backfill_complete(summary).await;
    summary
}

async fn reconcile(
    repo: &dyn BackfillRepository,
    cancel: &CancellationToken,
    limit: i64,
) -> BackfillSummary {
    let candidates = match repo.list_candidates(cancel).await {
        Ok(candidates) => candidates,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Backfill listing failed");
            return BackfillSummary::default();
        }
    };

    let (selected, mut summary) = select_pending(candidates, limit);

    for (index, candidate) in selected.iter().enumerate() {
        if cancel.is_cancelled() {
            let remaining = selected.len() - index;
            warn!(remaining, "Backfill cancelled before all selections were queued");
            summary.other_errors += remaining;
            break;
        }

        match repo.queue_record(cancel, candidate).await {
            Ok(EnqueueResult::Enqueued) => summary.enqueued += 1,
            Ok(EnqueueResult::DroppedFull) => summary.dropped_full += 1,
            Err(e) => {
                warn!(
                    filename = %candidate.filename,
                    error = %format!("{:#}", e),
                    "Backfill could not queue candidate"
                );
                summary.other_errors += 1;
            }
        }
    }

    info!(
        total = summary.total_candidates,
        already_processed = summary.already_processed,
        unprocessed = summary.unprocessed,
        selected = summary.selected,
        enqueued = summary.enqueued,
        dropped_full = summary.dropped_full,
        other_errors = summary.other_errors,
        "Backfill pass complete"
    );

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn candidate(name: &str, minute: i64, status: CandidateStatus) -> BackfillCandidate {
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        BackfillCandidate {
            filename: name.to_string(),
            mod_time: base + Duration::minutes(minute),
            size_bytes: 1024,
            status,
            updated_at: None,
        }
    }

    #[test]
    fn test_every_fifth_done_selects_fifteen_newest() {
        let records: Vec<BackfillCandidate> = (0..30)
            .map(|i| {
                let status = if i % 5 == 0 {
                    CandidateStatus::Done
                } else {
                    CandidateStatus::New
                };
                candidate(&format!("call_{:02}.mp3", i), i, status)
            })
            .collect();

        let (selected, summary) = select_pending(records, 15);

        assert_eq!(selected.len(), 15);
        assert!(selected.iter().all(|c| c.status != CandidateStatus::Done));
        assert!(selected.windows(2).all(|w| w[0].mod_time > w[1].mod_time));
        assert_eq!(summary.total_candidates, 30);
        assert_eq!(summary.already_processed, 6);
        assert_eq!(summary.unprocessed, 24);
        assert_eq!(summary.selected, 15);
        assert_eq!(selected[0].filename, "call_29.mp3");
    }

    #[test]
    fn test_non_positive_limit_means_no_cap() {
        let records = vec![
            candidate("a.mp3", 1, CandidateStatus::New),
            candidate("b.mp3", 2, CandidateStatus::Error),
            candidate("c.mp3", 3, CandidateStatus::Done),
        ];

        let (selected, summary) = select_pending(records.clone(), 0);
        assert_eq!(selected.len(), 2);
        assert_eq!(summary.selected, 2);

        let (selected, _) = select_pending(records, -5);
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn test_unfinished_states_are_reselected() {
        let records = vec![
            candidate("q.mp3", 1, CandidateStatus::Queued),
            candidate("p.mp3", 2, CandidateStatus::Processing),
            candidate("e.mp3", 3, CandidateStatus::Error),
        ];
        let (selected, summary) = select_pending(records, 10);
        assert_eq!(summary.unprocessed, 3);
        let names: Vec<&str> = selected.iter().map(|c| c.filename.as_str()).collect();
        assert_eq!(names, vec!["e.mp3", "p.mp3", "q.mp3"]);
    }

    #[test]
    fn test_equal_mod_times_break_ties_by_filename() {
        let records = vec![
            candidate("zeta.mp3", 5, CandidateStatus::New),
            candidate("alpha.mp3", 5, CandidateStatus::New),
            candidate("mid.mp3", 5, CandidateStatus::New),
        ];
        let (selected, _) = select_pending(records, 0);
        let names: Vec<&str> = selected.iter().map(|c| c.filename.as_str()).collect();
        assert_eq!(names, vec!["alpha.mp3", "mid.mp3", "zeta.mp3"]);
    }

    #[test]
    fn test_limit_larger_than_pending() {
        let records = vec![candidate("only.mp3", 1, CandidateStatus::New)];
        let (selected, summary) = select_pending(records, 200);
        assert_eq!(selected.len(), 1);
        assert_eq!(summary.selected, 1);
    }
}
