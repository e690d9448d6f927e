//! Unit tests for the per-key job worker

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::oneshot;

use fleet_operator::worker::{JobError, MAX_LOG_LINES, Worker};

use crate::common::*;

const TIMEOUT: Duration = Duration::from_secs(30);

/// Start a job on `key` that runs until the returned sender fires
async fn blocked_job(worker: &Worker, key: &str) -> oneshot::Sender<()> {
    let (tx, rx) = oneshot::channel::<()>();
    worker
        .create_job(
            TIMEOUT,
            key,
            |_log| async move {
                let _ = rx.await;
                Ok::<(), String>(())
            },
            || async {},
        )
        .await
        .unwrap();
    tx
}

#[tokio::test]
async fn test_concurrent_creates_for_one_key() {
    let worker = Arc::new(Worker::new("workspace"));
    let runs = Arc::new(AtomicUsize::new(0));
    let (release, gate) = tokio::sync::watch::channel(false);

    let attempts = (0..8).map(|_| {
        let worker = worker.clone();
        let runs = runs.clone();
        let gate = gate.clone();
        async move {
            worker
                .create_job(
                    TIMEOUT,
                    "ws1",
                    move |_log| async move {
                        let mut gate = gate;
                        runs.fetch_add(1, Ordering::SeqCst);
                        let _ = gate.wait_for(|open| *open).await;
                        Ok::<(), String>(())
                    },
                    || async {},
                )
                .await
        }
    });
    let results = join_all(attempts).await;

    let accepted = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(accepted, 1);
    for result in results.iter().filter(|r| r.is_err()) {
        assert_eq!(
            result.as_ref().unwrap_err(),
            &JobError::AlreadyRunning("ws1".to_string())
        );
    }
    assert_eq!(worker.count_jobs(), 1);

    release.send_replace(true);
    wait_idle(&worker).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_keys_run_independently() {
    let worker = Worker::new("cluster");
    let a = blocked_job(&worker, "a").await;
    let b = blocked_job(&worker, "b").await;

    assert_eq!(worker.count_jobs(), 2);
    assert!(worker.is_running("a") && worker.is_running("b"));
    let keys: Vec<String> = worker.jobs().into_iter().map(|j| j.key).collect();
    assert_eq!(keys, vec!["a", "b"]);

    a.send(()).unwrap();
    let w = &worker;
    eventually(|| async move { !w.is_running("a") }).await;
    assert!(worker.is_running("b"));

    b.send(()).unwrap();
    wait_idle(&worker).await;
}

#[tokio::test]
async fn test_key_free_again_after_job() {
    let worker = Worker::new("workspace");
    let first = blocked_job(&worker, "ws1").await;
    first.send(()).unwrap();
    wait_idle(&worker).await;

    let second = blocked_job(&worker, "ws1").await;
    assert!(worker.is_running("ws1"));
    second.send(()).unwrap();
    wait_idle(&worker).await;
}

#[tokio::test]
async fn test_failure_callback_runs_once_with_reason() {
    let worker = Worker::new("workspace");
    let failures = Arc::new(AtomicUsize::new(0));
    let counter = failures.clone();

    worker
        .create_job(
            TIMEOUT,
            "ws1",
            |log| async move {
                log.line("terraform apply");
                Err::<(), _>("exit status 1")
            },
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await
        .unwrap();

    wait_idle(&worker).await;
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    assert_eq!(worker.failure_log("ws1").as_deref(), Some("exit status 1"));
}

#[tokio::test]
async fn test_log_keeps_latest_lines() {
    let worker = Worker::new("workspace");
    worker
        .create_job(
            TIMEOUT,
            "ws1",
            |log| async move {
                for i in 0..MAX_LOG_LINES + 5 {
                    log.line(format!("line {i}"));
                }
                Ok::<(), String>(())
            },
            || async {},
        )
        .await
        .unwrap();

    wait_idle(&worker).await;
    let w = &worker;
    eventually(|| async move { w.logs("ws1").last().map(String::as_str) == Some("line 1004") })
        .await;
    let logs = worker.logs("ws1");
    assert_eq!(logs.len(), MAX_LOG_LINES);
    assert_eq!(logs[0], "line 5");
}

#[tokio::test]
async fn test_new_log_replaces_previous_run() {
    let worker = Worker::new("workspace");
    worker
        .create_job(TIMEOUT, "ws1", |_log| async { Err::<(), _>("boom") }, || async {})
        .await
        .unwrap();
    wait_idle(&worker).await;
    assert!(worker.failure_log("ws1").is_some());

    worker
        .create_job(TIMEOUT, "ws1", |_log| async { Ok::<(), String>(()) }, || async {})
        .await
        .unwrap();
    assert!(worker.failure_log("ws1").is_none());
    wait_idle(&worker).await;
}

#[tokio::test]
async fn test_lock_holds_back_new_jobs() {
    let worker = Arc::new(Worker::new("workspace"));
    let guard = worker.lock().await;

    let pending = {
        let worker = worker.clone();
        tokio::spawn(async move {
            worker
                .create_job(TIMEOUT, "ws1", |_log| async { Ok::<(), String>(()) }, || async {})
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pending.is_finished());
    assert_eq!(worker.count_jobs(), 0);

    drop(guard);
    pending.await.unwrap().unwrap();
    wait_idle(&worker).await;
}

#[tokio::test]
async fn test_lock_waits_for_jobs_being_accepted_only() {
    let worker = Worker::new("workspace");
    let running = blocked_job(&worker, "ws1").await;

    // Running jobs do not block the lock
    let guard = tokio::time::timeout(Duration::from_secs(1), worker.lock())
        .await
        .unwrap();
    assert_eq!(worker.count_jobs(), 1);

    drop(guard);
    running.send(()).unwrap();
    wait_idle(&worker).await;
}
