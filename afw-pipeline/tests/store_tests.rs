//! Integration tests for the persistent job/call store

use std::collections::HashSet;

use afw_common::{time, Error};
use afw_pipeline::db::JobStore;
use afw_pipeline::jobs::idempotency_key;
use afw_pipeline::models::{CallUpdate, JobStatus, NewJob, StageParams};
use chrono::Duration as ChronoDuration;
use tempfile::TempDir;
use tokio::task::JoinSet;

fn new_job(artifact_id: &str, stage: &str, params: StageParams) -> NewJob {
    NewJob {
        artifact_id: artifact_id.to_string(),
        stage: stage.to_string(),
        idempotency_key: idempotency_key(artifact_id, stage, &params),
        params,
    }
}

// ============================================================================
// Idempotent admission
// ============================================================================

#[tokio::test]
async fn test_duplicate_admission_returns_existing_row() {
    let store = JobStore::open_in_memory().await.unwrap();
    let job = new_job("call-001.mp3", "INGEST", StageParams::new());

    let (first, created) = store.insert_job_idempotent(&job, time::now()).await.unwrap();
    assert!(created);
    assert_eq!(first.status, JobStatus::Queued);
    assert!(first.started_at.is_none());

    let (second, created_again) = store.insert_job_idempotent(&job, time::now()).await.unwrap();
    assert!(!created_again);
    assert_eq!(second.id, first.id);
    assert_eq!(second.created_at, first.created_at);
}

#[tokio::test]
async fn test_different_params_are_different_jobs() {
    let store = JobStore::open_in_memory().await.unwrap();

    let (a, _) = store
        .insert_job_idempotent(&new_job("call-001.mp3", "TRANSCRIBE", StageParams::new().with("model", "small")), time::now())
        .await
        .unwrap();
    let (b, created) = store
        .insert_job_idempotent(&new_job("call-001.mp3", "TRANSCRIBE", StageParams::new().with("model", "large")), time::now())
        .await
        .unwrap();

    assert!(created);
    assert_ne!(a.id, b.id);
    assert!(b.id > a.id);
    assert_eq!(b.params.get_str("model"), Some("large"));
}

#[tokio::test]
async fn test_concurrent_admission_creates_one_row() {
    let temp = TempDir::new().unwrap();
    let store = JobStore::open(&temp.path().join("afw.db")).await.unwrap();

    let mut tasks = JoinSet::new();
    for _ in 0..16 {
        let store = store.clone();
        tasks.spawn(async move {
            let job = new_job("call-race.mp3", "INGEST", StageParams::new());
            store.insert_job_idempotent(&job, time::now()).await.unwrap()
        });
    }

    let mut ids = HashSet::new();
    let mut created = 0;
    while let Some(result) = tasks.join_next().await {
        let (job, is_new) = result.unwrap();
        ids.insert(job.id);
        if is_new {
            created += 1;
        }
    }

    assert_eq!(ids.len(), 1, "all callers must see the same job");
    assert_eq!(created, 1, "exactly one caller creates the row");
    assert_eq!(store.list_jobs_for_artifact("call-race.mp3").await.unwrap().len(), 1);
}

// ============================================================================
// State machine
// ============================================================================

#[tokio::test]
async fn test_transitions_only_move_forward() {
    let store = JobStore::open_in_memory().await.unwrap();
    let (job, _) = store
        .insert_job_idempotent(&new_job("call-002.mp3", "INGEST", StageParams::new()), time::now())
        .await
        .unwrap();

    assert!(store.mark_job_started(job.id, time::now()).await.unwrap());
    // A second claim loses
    assert!(!store.mark_job_started(job.id, time::now()).await.unwrap());

    assert!(store
        .mark_job_finished(job.id, JobStatus::Succeeded, Some("ignored"), time::now())
        .await
        .unwrap());

    // Terminal rows never change again
    assert!(!store
        .mark_job_finished(job.id, JobStatus::Failed, Some("late failure"), time::now())
        .await
        .unwrap());
    assert!(!store.mark_job_started(job.id, time::now()).await.unwrap());

    let stored = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Succeeded);
    assert!(stored.last_error.is_none(), "success never carries an error");
    assert!(stored.started_at.is_some());
    assert!(stored.finished_at.is_some());
    assert!(stored.finished_at >= stored.started_at);
}

#[tokio::test]
async fn test_queued_job_can_fail_without_starting() {
    let store = JobStore::open_in_memory().await.unwrap();
    let (job, _) = store
        .insert_job_idempotent(&new_job("call-003.mp3", "GEOCODE", StageParams::new()), time::now())
        .await
        .unwrap();

    assert!(store
        .mark_job_finished(job.id, JobStatus::Failed, Some("no handler registered for stage GEOCODE"), time::now())
        .await
        .unwrap());

    let stored = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert!(stored.started_at.is_none());
    assert_eq!(
        stored.last_error.as_deref(),
        Some("no handler registered for stage GEOCODE")
    );
}

#[tokio::test]
async fn test_non_terminal_finish_rejected() {
    let store = JobStore::open_in_memory().await.unwrap();
    let (job, _) = store
        .insert_job_idempotent(&new_job("call-004.mp3", "INGEST", StageParams::new()), time::now())
        .await
        .unwrap();

    let result = store
        .mark_job_finished(job.id, JobStatus::Running, None, time::now())
        .await;
    assert!(matches!(result, Err(Error::InvalidInput(_))));
}

#[tokio::test]
async fn test_unknown_job_lookups() {
    let store = JobStore::open_in_memory().await.unwrap();
    assert!(store.get_job(999).await.unwrap().is_none());
    assert!(store.get_job_by_key("nope").await.unwrap().is_none());
    assert!(!store.mark_job_started(999, time::now()).await.unwrap());

    assert!(matches!(store.require_job(999).await, Err(Error::NotFound(_))));
    assert!(matches!(
        store.require_call("never-seen.mp3").await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_list_jobs_newest_first() {
    let store = JobStore::open_in_memory().await.unwrap();
    let base = time::now();
    for i in 0..5 {
        store
            .insert_job_idempotent(
                &new_job(&format!("call-{}.mp3", i), "INGEST", StageParams::new()),
                base + ChronoDuration::seconds(i),
            )
            .await
            .unwrap();
    }

    let jobs = store.list_jobs(3).await.unwrap();
    let artifacts: Vec<&str> = jobs.iter().map(|j| j.artifact_id.as_str()).collect();
    assert_eq!(artifacts, vec!["call-4.mp3", "call-3.mp3", "call-2.mp3"]);
}

// ============================================================================
// Calls rollup and artifact state
// ============================================================================

#[tokio::test]
async fn test_upsert_call_tracks_latest_completion() {
    let store = JobStore::open_in_memory().await.unwrap();

    store
        .upsert_call(
            &CallUpdate {
                artifact_id: "call-010.mp3".to_string(),
                stage: "INGEST".to_string(),
                status: JobStatus::Failed,
                error: Some("unreadable header".to_string()),
            },
            time::now(),
        )
        .await
        .unwrap();

    let first = store.get_call("call-010.mp3").await.unwrap().unwrap();
    assert_eq!(first.status, JobStatus::Failed);
    assert_eq!(first.last_error.as_deref(), Some("unreadable header"));
    assert!(first.tags.is_empty());

    store
        .upsert_call(
            &CallUpdate {
                artifact_id: "call-010.mp3".to_string(),
                stage: "TRANSCRIBE".to_string(),
                status: JobStatus::Succeeded,
                error: None,
            },
            time::now(),
        )
        .await
        .unwrap();

    let second = store.get_call("call-010.mp3").await.unwrap().unwrap();
    assert_eq!(second.status, JobStatus::Succeeded);
    assert_eq!(second.last_stage, "TRANSCRIBE");
    assert!(second.last_error.is_none());
    assert_eq!(second.created_at, first.created_at);
    assert!(second.updated_at >= first.updated_at);

    assert_eq!(store.list_calls(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_artifact_states_merge_jobs_and_calls() {
    let store = JobStore::open_in_memory().await.unwrap();

    // Only admitted
    store
        .insert_job_idempotent(&new_job("queued.mp3", "INGEST", StageParams::new()), time::now())
        .await
        .unwrap();

    // Completed
    let (done, _) = store
        .insert_job_idempotent(&new_job("done.mp3", "INGEST", StageParams::new()), time::now())
        .await
        .unwrap();
    store.mark_job_started(done.id, time::now()).await.unwrap();
    store
        .mark_job_finished(done.id, JobStatus::Succeeded, None, time::now())
        .await
        .unwrap();
    store
        .upsert_call(
            &CallUpdate {
                artifact_id: "done.mp3".to_string(),
                stage: "INGEST".to_string(),
                status: JobStatus::Succeeded,
                error: None,
            },
            time::now(),
        )
        .await
        .unwrap();

    let states = store.artifact_states().await.unwrap();
    assert_eq!(states.len(), 2);

    let queued = &states["queued.mp3"];
    assert_eq!(queued.latest_job_status, Some(JobStatus::Queued));
    assert_eq!(queued.call_status, None);

    let done = &states["done.mp3"];
    assert_eq!(done.latest_job_status, Some(JobStatus::Succeeded));
    assert_eq!(done.call_status, Some(JobStatus::Succeeded));

    assert!(!states.contains_key("never-seen.mp3"));
}

// ============================================================================
// Job logs
// ============================================================================

#[tokio::test]
async fn test_job_log_tail_returns_newest_in_order() {
    let store = JobStore::open_in_memory().await.unwrap();
    for i in 0..10 {
        store
            .append_job_log(7, &format!("line {}", i), time::now())
            .await
            .unwrap();
    }
    store.append_job_log(8, "other job", time::now()).await.unwrap();

    let tail = store.job_logs(7, 3).await.unwrap();
    let lines: Vec<&str> = tail.iter().map(|l| l.line.as_str()).collect();
    assert_eq!(lines, vec!["line 7", "line 8", "line 9"]);

    assert_eq!(store.job_logs(7, 100).await.unwrap().len(), 10);
    assert!(store.job_logs(42, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_store_survives_reopen() {
    let temp = TempDir::new().unwrap();
    let db_path = temp.path().join("afw.db");

    let job_id = {
        let store = JobStore::open(&db_path).await.unwrap();
        let (job, _) = store
            .insert_job_idempotent(&new_job("persist.mp3", "INGEST", StageParams::new()), time::now())
            .await
            .unwrap();
        store.pool().close().await;
        job.id
    };

    let store = JobStore::open(&db_path).await.unwrap();
    let job = store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.artifact_id, "persist.mp3");
    assert_eq!(job.status, JobStatus::Queued);
    store.health().await.unwrap();
}
