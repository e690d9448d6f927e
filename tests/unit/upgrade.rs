//! Drain and self-upgrade

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Instant;

use fleet_operator::controller::{
    DRAIN_POLL_INTERVAL, Error, ImageUpdater, Result, run_self_upgrade, upgrade_when_idle,
    wait_for_idle,
};
use fleet_operator::worker::Worker;

/// Fails the first `failures` updates, then records the tag
struct FakeUpdater {
    failures: usize,
    attempts: AtomicUsize,
    applied: Mutex<Vec<String>>,
}

impl FakeUpdater {
    fn failing(failures: usize) -> Self {
        Self {
            failures,
            attempts: AtomicUsize::new(0),
            applied: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ImageUpdater for FakeUpdater {
    async fn update_image_tag(&self, tag: &str) -> Result<()> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(Error::ValidationError("registry unavailable".to_string()));
        }
        self.applied.lock().unwrap().push(tag.to_string());
        Ok(())
    }
}

/// Start a job on `worker` that runs until `gate` turns true
async fn gated_job(worker: &Worker, key: &str, gate: watch::Receiver<bool>) {
    worker
        .create_job(
            Duration::from_secs(3600),
            key,
            move |_log| async move {
                let mut gate = gate;
                let _ = gate.wait_for(|open| *open).await;
                Ok::<(), String>(())
            },
            || async {},
        )
        .await
        .unwrap();
}

async fn noop_job(worker: &Worker, key: &str) -> std::result::Result<(), fleet_operator::worker::JobError> {
    worker
        .create_job(
            Duration::from_secs(60),
            key,
            |_log| async { Ok::<(), String>(()) },
            || async {},
        )
        .await
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_idle_outlasts_running_jobs() {
    let workspaces = Worker::new("workspace");
    let clusters = Worker::new("cluster");
    let (open, gate) = watch::channel(false);
    gated_job(&workspaces, "ws1", gate.clone()).await;
    gated_job(&clusters, "c1", gate).await;
    assert_eq!(workspaces.count_jobs() + clusters.count_jobs(), 2);

    let released_at = Duration::from_secs(150);
    let workers = [&workspaces, &clusters];
    let started = Instant::now();
    let release = async {
        tokio::time::sleep(released_at).await;
        open.send_replace(true);
    };
    let (guards, ()) = tokio::join!(wait_for_idle(&workers, DRAIN_POLL_INTERVAL), release);

    assert_eq!(guards.len(), 2);
    assert_eq!(workspaces.count_jobs() + clusters.count_jobs(), 0);
    // Noticed on the first check after the jobs finished
    let elapsed = started.elapsed();
    assert!(elapsed >= released_at);
    assert!(elapsed <= released_at + DRAIN_POLL_INTERVAL);

    // Locked: new jobs wait instead of starting
    let blocked = tokio::time::timeout(Duration::from_secs(1), noop_job(&workspaces, "ws2")).await;
    assert!(blocked.is_err());
    assert!(!workspaces.is_running("ws2"));

    drop(guards);
    noop_job(&workspaces, "ws2").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_idle_workers_drain_at_once() {
    let workspaces = Worker::new("workspace");
    let clusters = Worker::new("cluster");

    let started = Instant::now();
    let guards = wait_for_idle(&[&workspaces, &clusters], DRAIN_POLL_INTERVAL).await;
    assert_eq!(guards.len(), 2);
    assert!(started.elapsed() < DRAIN_POLL_INTERVAL);
}

#[tokio::test(start_paused = true)]
async fn test_upgrade_retries_failed_update() {
    let workspaces = Worker::new("workspace");
    let clusters = Worker::new("cluster");
    let updater = FakeUpdater::failing(2);

    let started = Instant::now();
    let guards = upgrade_when_idle(&[&workspaces, &clusters], &updater, "v2", DRAIN_POLL_INTERVAL).await;

    assert_eq!(updater.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(*updater.applied.lock().unwrap(), vec!["v2"]);
    assert!(started.elapsed() >= DRAIN_POLL_INTERVAL * 2);
    assert_eq!(guards.len(), 2);

    let blocked = tokio::time::timeout(Duration::from_secs(1), noop_job(&clusters, "c1")).await;
    assert!(blocked.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_self_upgrade_keeps_workers_locked() {
    let worker = Worker::new("workspace");
    let updater = FakeUpdater::failing(0);

    let workers = [&worker];
    let upgrade = tokio::time::timeout(
        Duration::from_secs(600),
        run_self_upgrade(&workers, &updater, "v3", DRAIN_POLL_INTERVAL),
    );
    let refused = async {
        // Let the drain take its locks first
        tokio::time::sleep(Duration::from_secs(1)).await;
        tokio::time::timeout(Duration::from_secs(60), noop_job(&worker, "ws1")).await
    };
    let (upgrade, refused) = tokio::join!(upgrade, refused);

    assert!(upgrade.is_err());
    assert!(refused.is_err());
    assert_eq!(*updater.applied.lock().unwrap(), vec!["v3"]);
}
