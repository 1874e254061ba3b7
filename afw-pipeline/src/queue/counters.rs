//! Queue counters and throttled drop logging
//!
//! Owned by a [`super::WorkQueue`] instance; there are no process-wide
//! counters, so two queues in one process (or one per test) never share state.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

/// Minimum spacing between queue-full log lines
pub const DROP_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
pub struct QueueCounters {
    pending: AtomicUsize,
    processed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    drop_log: DropLogThrottle,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub pending: usize,
    pub processed: u64,
    pub failed: u64,
    pub dropped: u64,
}

impl QueueCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn job_admitted(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn job_dequeued(&self) {
        // Saturating: a dequeue can never outrun its admission, but the
        // counter must not wrap if that ever changes.
        let _ = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
    }

    pub(crate) fn job_completed(&self, success: bool) {
        self.processed.fetch_add(1, Ordering::SeqCst);
        if !success {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Count one queue-full rejection and log it at a throttled rate
    pub(crate) fn job_dropped(&self, job_id: &str, capacity: usize) {
        let total = self.dropped.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(suppressed) = self.drop_log.should_log(Instant::now()) {
            warn!(
                job = job_id,
                capacity,
                dropped_total = total,
                suppressed,
                "Queue full, job dropped"
            );
        }
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            pending: self.pending.load(Ordering::SeqCst),
            processed: self.processed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            dropped: self.dropped.load(Ordering::SeqCst),
        }
    }
}

/// Rate limiter for the queue-full warning
///
/// The first drop logs immediately. Later drops log at most once per
/// [`DROP_LOG_INTERVAL`], reporting how many were swallowed in between.
#[derive(Debug, Default)]
pub struct DropLogThrottle {
    state: Mutex<ThrottleState>,
}

#[derive(Debug, Default)]
struct ThrottleState {
    last_logged: Option<Instant>,
    suppressed: u64,
}

impl DropLogThrottle {
    /// Returns `Some(suppressed_since_last_line)` when a line should be written
    pub fn should_log(&self, now: Instant) -> Option<u64> {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let due = match state.last_logged {
            None => true,
            Some(last) => now.duration_since(last) >= DROP_LOG_INTERVAL,
        };

        if due {
            let suppressed = state.suppressed;
            state.last_logged = Some(now);
            state.suppressed = 0;
            Some(suppressed)
        } else {
            state.suppressed += 1;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_drop_logs_immediately() {
        let throttle = DropLogThrottle::default();
        assert_eq!(throttle.should_log(Instant::now()), Some(0));
    }

    #[test]
    fn test_drops_within_interval_are_suppressed_and_counted() {
        let throttle = DropLogThrottle::default();
        let start = Instant::now();

        assert_eq!(throttle.should_log(start), Some(0));
        assert_eq!(throttle.should_log(start + Duration::from_millis(10)), None);
        assert_eq!(throttle.should_log(start + Duration::from_secs(1)), None);
        assert_eq!(throttle.should_log(start + Duration::from_secs(3)), None);

        // Next line after the interval reports the three swallowed drops
        assert_eq!(throttle.should_log(start + DROP_LOG_INTERVAL), Some(3));
        assert_eq!(throttle.should_log(start + DROP_LOG_INTERVAL), None);
    }

    #[test]
    fn test_counters_track_outcomes() {
        let counters = QueueCounters::new();
        counters.job_admitted();
        counters.job_admitted();
        counters.job_dequeued();
        counters.job_completed(true);
        counters.job_completed(false);
        counters.job_dropped("job-x", 8);

        let snap = counters.snapshot();
        assert_eq!(snap.pending, 1);
        assert_eq!(snap.processed, 2);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.dropped, 1);
    }

    #[test]
    fn test_pending_never_underflows() {
        let counters = QueueCounters::new();
        counters.job_dequeued();
        assert_eq!(counters.snapshot().pending, 0);
    }
}
