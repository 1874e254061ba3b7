//! Integration tests for the bounded work queue and its worker pool

mod helpers;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use afw_pipeline::queue::{
    JobOutcome, JobSource, QueueState, QueuedJob, RetryOutcome, WorkQueue, CANCEL_GRACE,
};
use helpers::wait_until;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

fn ok_job(id: &str) -> QueuedJob {
    QueuedJob::new(id, JobSource::Internal, |_| async { anyhow::Ok(()) })
}

/// Job that reports when it starts, then waits for a permit from `gate`
fn gated_job(id: &str, gate: Arc<Semaphore>, started: mpsc::UnboundedSender<String>) -> QueuedJob {
    let name = id.to_string();
    QueuedJob::new(id, JobSource::Internal, move |_| async move {
        let _ = started.send(name);
        let _permit = gate.acquire().await?;
        anyhow::Ok(())
    })
}

async fn wait_for_processed(queue: &WorkQueue, expected: u64) {
    wait_until("queue to process jobs", move || async move {
        queue.stats().processed >= expected
    })
    .await;
}

// ============================================================================
// Throughput and accounting
// ============================================================================

#[tokio::test]
async fn test_successes_and_failures_counted() {
    let queue = WorkQueue::new(16, 2, Duration::from_secs(5));
    let shutdown = CancellationToken::new();
    queue.start(shutdown.clone());

    for i in 0..5 {
        assert!(queue.enqueue(ok_job(&format!("ok-{}", i))));
    }
    for i in 0..3 {
        let job = QueuedJob::new(format!("bad-{}", i), JobSource::Internal, |_| async {
            Err::<(), _>(anyhow::anyhow!("stage rejected input"))
        });
        assert!(queue.enqueue(job));
    }

    wait_for_processed(&queue, 8).await;

    let stats = queue.stats();
    assert_eq!(stats.processed, 8);
    assert_eq!(stats.failed, 3);
    assert_eq!(stats.dropped, 0);
    assert_eq!(stats.length, 0);
    assert_eq!(stats.worker_count, 2);
    assert_eq!(stats.state, QueueState::Running);

    assert!(queue.stop(Duration::from_secs(5)).await);
    shutdown.cancel();
}

#[tokio::test]
async fn test_every_job_runs_exactly_once() {
    let queue = WorkQueue::new(64, 4, Duration::from_secs(5));
    let shutdown = CancellationToken::new();
    queue.start(shutdown.clone());

    let runs = Arc::new(AtomicUsize::new(0));
    for i in 0..50 {
        let runs = Arc::clone(&runs);
        let job = QueuedJob::new(format!("job-{}", i), JobSource::Internal, move |_| async move {
            runs.fetch_add(1, Ordering::SeqCst);
            anyhow::Ok(())
        });
        assert!(queue.enqueue(job));
    }

    wait_for_processed(&queue, 50).await;
    assert_eq!(runs.load(Ordering::SeqCst), 50);

    queue.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_on_finish_sees_outcome() {
    let queue = WorkQueue::new(4, 1, Duration::from_secs(5));
    queue.start(CancellationToken::new());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let ok_tx = tx.clone();
    assert!(queue.enqueue(ok_job("fine").on_finish(move |outcome| async move {
        let _ = ok_tx.send(outcome);
    })));
    let job = QueuedJob::new("broken", JobSource::Api, |_| async { Err::<(), _>(anyhow::anyhow!("no audio")) })
        .on_finish(move |outcome| async move {
            let _ = tx.send(outcome);
        });
    assert!(queue.enqueue(job));

    assert_eq!(rx.recv().await, Some(JobOutcome::Succeeded));
    assert_eq!(rx.recv().await, Some(JobOutcome::Failed("no audio".to_string())));

    queue.stop(Duration::from_secs(5)).await;
}

// ============================================================================
// Bounded buffer
// ============================================================================

#[tokio::test]
async fn test_full_buffer_refuses_without_blocking() {
    let capacity = 2;
    let queue = WorkQueue::new(capacity, 1, Duration::from_secs(10));
    queue.start(CancellationToken::new());

    let gate = Arc::new(Semaphore::new(0));
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();

    // Occupy the only worker so the buffer fills behind it
    assert!(queue.enqueue(gated_job("in-flight", Arc::clone(&gate), started_tx.clone())));
    assert_eq!(started_rx.recv().await.as_deref(), Some("in-flight"));

    for i in 0..capacity {
        assert!(queue.enqueue(gated_job(&format!("buffered-{}", i), Arc::clone(&gate), started_tx.clone())));
    }
    assert_eq!(queue.stats().length, capacity);

    // C + 1 jobs accepted; the next one is refused immediately
    assert!(!queue.enqueue(ok_job("overflow")));
    let stats = queue.stats();
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.length, capacity);

    gate.add_permits(16);
    wait_for_processed(&queue, 3).await;
    assert_eq!(queue.stats().failed, 0);

    queue.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_retry_succeeds_once_space_frees() {
    let queue = WorkQueue::new(1, 1, Duration::from_secs(10));
    queue.start(CancellationToken::new());

    let gate = Arc::new(Semaphore::new(0));
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    assert!(queue.enqueue(gated_job("a", Arc::clone(&gate), started_tx.clone())));
    started_rx.recv().await;
    assert!(queue.enqueue(gated_job("b", Arc::clone(&gate), started_tx.clone())));

    let releaser = {
        let gate = Arc::clone(&gate);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            gate.add_permits(16);
        })
    };

    let outcome = queue
        .enqueue_with_retry(
            &CancellationToken::new(),
            ok_job("c"),
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
        .await;
    assert_eq!(outcome, RetryOutcome::Enqueued);
    releaser.await.unwrap();

    wait_for_processed(&queue, 3).await;
    assert_eq!(queue.stats().dropped, 0);

    queue.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_retry_gives_up_after_window() {
    let queue = WorkQueue::new(1, 1, Duration::from_secs(10));
    queue.start(CancellationToken::new());

    let gate = Arc::new(Semaphore::new(0));
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    assert!(queue.enqueue(gated_job("a", Arc::clone(&gate), started_tx.clone())));
    started_rx.recv().await;
    assert!(queue.enqueue(gated_job("b", Arc::clone(&gate), started_tx.clone())));

    let outcome = queue
        .enqueue_with_retry(
            &CancellationToken::new(),
            ok_job("c"),
            Duration::from_millis(60),
            Duration::from_millis(10),
        )
        .await;
    assert_eq!(outcome, RetryOutcome::DroppedFull);
    // Counted once, not once per attempt
    assert_eq!(queue.stats().dropped, 1);

    gate.add_permits(16);
    queue.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_retry_stops_on_cancel() {
    let queue = WorkQueue::new(1, 1, Duration::from_secs(10));
    queue.start(CancellationToken::new());

    let gate = Arc::new(Semaphore::new(0));
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    assert!(queue.enqueue(gated_job("a", Arc::clone(&gate), started_tx.clone())));
    started_rx.recv().await;
    assert!(queue.enqueue(gated_job("b", Arc::clone(&gate), started_tx.clone())));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let outcome = queue
        .enqueue_with_retry(&cancel, ok_job("c"), Duration::from_secs(30), Duration::from_millis(10))
        .await;
    assert_eq!(outcome, RetryOutcome::Cancelled);
    assert_eq!(queue.stats().dropped, 0);

    gate.add_permits(16);
    queue.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_retry_on_stopped_queue_is_closed() {
    let queue = WorkQueue::new(4, 1, Duration::from_secs(1));
    queue.start(CancellationToken::new());
    assert!(queue.stop(Duration::from_secs(1)).await);

    let outcome = queue
        .enqueue_with_retry(
            &CancellationToken::new(),
            ok_job("late"),
            Duration::from_millis(50),
            Duration::from_millis(10),
        )
        .await;
    assert_eq!(outcome, RetryOutcome::Closed);
    assert!(!queue.enqueue(ok_job("later")));
    assert_eq!(queue.state(), QueueState::Stopped);
}

// ============================================================================
// Failure containment
// ============================================================================

#[tokio::test]
async fn test_panicking_job_does_not_kill_worker() {
    let queue = WorkQueue::new(8, 1, Duration::from_secs(5));
    queue.start(CancellationToken::new());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let job = QueuedJob::new("explodes", JobSource::Internal, |_| async {
        if true {
            panic!("decoder blew up");
        }
        anyhow::Ok(())
    })
    .on_finish(move |outcome| async move {
        let _ = tx.send(outcome);
    });
    assert!(queue.enqueue(job));

    assert_eq!(
        rx.recv().await,
        Some(JobOutcome::Panicked("decoder blew up".to_string()))
    );

    // Same single worker still serves
    assert!(queue.enqueue(ok_job("after")));
    wait_for_processed(&queue, 2).await;

    let stats = queue.stats();
    assert_eq!(stats.failed, 1);
    assert!(queue.is_healthy());

    queue.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_slow_job_times_out_and_sees_cancel() {
    let queue = WorkQueue::new(4, 1, Duration::from_millis(50));
    queue.start(CancellationToken::new());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let job = QueuedJob::new("sleepy", JobSource::Internal, |_| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        anyhow::Ok(())
    })
    .on_finish(move |outcome| async move {
        let _ = tx.send(outcome);
    });
    assert!(queue.enqueue(job));

    let outcome = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timeout was not enforced");
    assert_eq!(outcome, Some(JobOutcome::TimedOut(Duration::from_millis(50))));
    assert_eq!(queue.stats().failed, 1);

    queue.stop(Duration::from_secs(5)).await;
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_stop_drains_buffered_jobs() {
    let queue = WorkQueue::new(16, 2, Duration::from_secs(5));
    queue.start(CancellationToken::new());

    let runs = Arc::new(AtomicUsize::new(0));
    for i in 0..10 {
        let runs = Arc::clone(&runs);
        let job = QueuedJob::new(format!("drain-{}", i), JobSource::Internal, move |_| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            runs.fetch_add(1, Ordering::SeqCst);
            anyhow::Ok(())
        });
        assert!(queue.enqueue(job));
    }

    assert!(queue.stop(Duration::from_secs(5)).await);
    assert_eq!(runs.load(Ordering::SeqCst), 10);
    assert_eq!(queue.stats().processed, 10);
}

#[tokio::test]
async fn test_stop_gives_up_after_grace() {
    let queue = WorkQueue::new(4, 1, Duration::from_secs(30));
    queue.start(CancellationToken::new());

    let gate = Arc::new(Semaphore::new(0));
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    assert!(queue.enqueue(gated_job("stuck", Arc::clone(&gate), started_tx)));
    started_rx.recv().await;

    assert!(!queue.stop(Duration::from_millis(50)).await);
    assert_eq!(queue.state(), QueueState::Stopped);

    gate.add_permits(1);
}

#[tokio::test]
async fn test_shutdown_token_reaches_in_flight_job() {
    let queue = WorkQueue::new(4, 1, Duration::from_secs(30));
    let shutdown = CancellationToken::new();
    queue.start(shutdown.clone());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let (started_tx, mut started_rx) = mpsc::unbounded_channel::<()>();
    let job = QueuedJob::new("cooperative", JobSource::Internal, move |token| async move {
        let _ = started_tx.send(());
        token.cancelled().await;
        Err::<(), _>(anyhow::anyhow!("interrupted"))
    })
    .on_finish(move |outcome| async move {
        let _ = tx.send(outcome);
    });
    assert!(queue.enqueue(job));
    started_rx.recv().await;

    shutdown.cancel();
    assert_eq!(
        rx.recv().await,
        Some(JobOutcome::Cancelled("interrupted".to_string()))
    );
}

#[tokio::test]
async fn test_second_start_is_ignored() {
    let queue = WorkQueue::new(4, 3, Duration::from_secs(1));
    let shutdown = CancellationToken::new();
    queue.start(shutdown.clone());
    queue.start(shutdown.clone());

    assert_eq!(queue.worker_count(), 3);
    assert!(queue.enqueue(ok_job("one")));
    wait_for_processed(&queue, 1).await;

    assert!(queue.stop(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_root_cancel_stops_admission_and_health() {
    let queue = WorkQueue::new(4, 2, Duration::from_secs(5));
    let shutdown = CancellationToken::new();
    queue.start(shutdown.clone());
    assert!(queue.is_healthy());

    shutdown.cancel();

    assert_eq!(queue.state(), QueueState::Stopped);
    assert!(!queue.is_healthy());
    assert!(!queue.enqueue(ok_job("after-cancel")));
    assert_eq!(queue.stats().length, 0);
    assert_eq!(queue.stats().dropped, 0, "a closed pool is not a drop");
}

#[tokio::test]
async fn test_cancel_and_wait_records_stuck_job_as_cancelled() {
    let queue = WorkQueue::new(4, 1, Duration::from_secs(60));
    queue.start(CancellationToken::new());

    // Ignores its token entirely
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (started_tx, mut started_rx) = mpsc::unbounded_channel::<()>();
    let job = QueuedJob::new("stubborn", JobSource::Internal, move |_| async move {
        let _ = started_tx.send(());
        tokio::time::sleep(Duration::from_secs(60)).await;
        anyhow::Ok(())
    })
    .on_finish(move |outcome| async move {
        let _ = tx.send(outcome);
    });
    assert!(queue.enqueue(job));
    started_rx.recv().await;

    assert!(!queue.stop(Duration::from_millis(50)).await);
    assert!(queue.cancel_and_wait(CANCEL_GRACE + Duration::from_secs(3)).await);

    match rx.recv().await {
        Some(JobOutcome::Cancelled(message)) => assert!(message.contains("after shutdown")),
        other => panic!("expected a cancelled outcome, got {:?}", other),
    }
}
