//! Per-key job scheduler for long-running provisioning work
//!
//! A [`Worker`] runs at most one job per key. Each job gets its own task plus a
//! supervisor that enforces the deadline, runs the failure callback exactly
//! once, and releases the key only after that callback finished. The worker
//! knows nothing about the resource store.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, mpsc};
use tracing::{debug, info, warn};

/// Lines kept per key
pub const MAX_LOG_LINES: usize = 1000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("a job for {0} is already running")]
    AlreadyRunning(String),
}

/// Handle given to a job for capturing output
#[derive(Clone)]
pub struct LogSink {
    tx: mpsc::UnboundedSender<String>,
}

impl LogSink {
    /// A sink plus the receiving end of its lines
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn line(&self, line: impl Into<String>) {
        let _ = self.tx.send(line.into());
    }
}

/// An active job
#[derive(Clone, Debug)]
pub struct JobInfo {
    pub key: String,
    pub started_at: DateTime<Utc>,
    pub timeout: Duration,
}

#[derive(Default)]
struct JobLog {
    lines: VecDeque<String>,
    failure: Option<String>,
}

/// Held while new jobs are refused. Dropping it accepts jobs again.
pub type DrainGuard = OwnedRwLockWriteGuard<()>;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Worker {
    name: String,
    jobs: Arc<Mutex<HashMap<String, JobInfo>>>,
    logs: Arc<Mutex<HashMap<String, JobLog>>>,
    /// Read-held while accepting a job, write-held by [`Worker::lock`]
    gate: Arc<RwLock<()>>,
}

impl Worker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            jobs: Arc::new(Mutex::new(HashMap::new())),
            logs: Arc::new(Mutex::new(HashMap::new())),
            gate: Arc::new(RwLock::new(())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start `work` for `key` unless a job for it is already running.
    ///
    /// If `work` returns an error, panics or outlives `timeout`, `on_failure`
    /// runs once before the key is released. Waits while the worker is locked.
    pub async fn create_job<W, Fut, E, F, FailFut>(
        &self,
        timeout: Duration,
        key: &str,
        work: W,
        on_failure: F,
    ) -> Result<(), JobError>
    where
        W: FnOnce(LogSink) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
        F: FnOnce() -> FailFut + Send + 'static,
        FailFut: Future<Output = ()> + Send + 'static,
    {
        self.claim(timeout, key).await?.start(work, on_failure);
        Ok(())
    }

    /// Reserve `key` for a job started later with [`JobClaim::start`].
    ///
    /// The key counts as running from here on, so callers can make changes
    /// that must not race another job before starting theirs. Waits while the
    /// worker is locked, and holds off [`Worker::lock`] until started or dropped.
    pub async fn claim(&self, timeout: Duration, key: &str) -> Result<JobClaim, JobError> {
        let accepting = self.gate.clone().read_owned().await;

        {
            let mut jobs = locked(&self.jobs);
            if jobs.contains_key(key) {
                return Err(JobError::AlreadyRunning(key.to_string()));
            }
            jobs.insert(
                key.to_string(),
                JobInfo {
                    key: key.to_string(),
                    started_at: Utc::now(),
                    timeout,
                },
            );
        }

        Ok(JobClaim {
            worker: self.name.clone(),
            key: key.to_string(),
            timeout,
            jobs: self.jobs.clone(),
            logs: self.logs.clone(),
            accepting: Some(accepting),
        })
    }

    pub fn count_jobs(&self) -> usize {
        locked(&self.jobs).len()
    }

    pub fn is_running(&self, key: &str) -> bool {
        locked(&self.jobs).contains_key(key)
    }

    pub fn jobs(&self) -> Vec<JobInfo> {
        let mut jobs: Vec<JobInfo> = locked(&self.jobs).values().cloned().collect();
        jobs.sort_by(|a, b| a.key.cmp(&b.key));
        jobs
    }

    /// Output captured from the current or last job for `key`
    pub fn logs(&self, key: &str) -> Vec<String> {
        locked(&self.logs)
            .get(key)
            .map(|log| log.lines.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Why the last job for `key` failed, if it did
    pub fn failure_log(&self, key: &str) -> Option<String> {
        locked(&self.logs).get(key).and_then(|log| log.failure.clone())
    }

    /// Refuse new jobs until the guard is dropped. Running jobs are unaffected.
    pub async fn lock(&self) -> DrainGuard {
        self.gate.clone().write_owned().await
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("jobs", &self.count_jobs())
            .finish()
    }
}

/// A key reserved on a [`Worker`]. Dropping it unstarted releases the key.
pub struct JobClaim {
    worker: String,
    key: String,
    timeout: Duration,
    jobs: Arc<Mutex<HashMap<String, JobInfo>>>,
    logs: Arc<Mutex<HashMap<String, JobLog>>>,
    /// Taken once the job is started
    accepting: Option<OwnedRwLockReadGuard<()>>,
}

impl JobClaim {
    /// Run `work` under the claimed key
    pub fn start<W, Fut, E, F, FailFut>(mut self, work: W, on_failure: F)
    where
        W: FnOnce(LogSink) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
        F: FnOnce() -> FailFut + Send + 'static,
        FailFut: Future<Output = ()> + Send + 'static,
    {
        let _accepting = self.accepting.take();
        let key = self.key.clone();
        let timeout = self.timeout;
        locked(&self.logs).insert(key.clone(), JobLog::default());

        let (sink, mut rx) = LogSink::channel();
        {
            let logs = self.logs.clone();
            let key = key.clone();
            tokio::spawn(async move {
                while let Some(line) = rx.recv().await {
                    let mut logs = locked(&logs);
                    let log = logs.entry(key.clone()).or_default();
                    if log.lines.len() == MAX_LOG_LINES {
                        log.lines.pop_front();
                    }
                    log.lines.push_back(line);
                }
            });
        }

        let jobs = self.jobs.clone();
        let logs = self.logs.clone();
        let worker = self.worker.clone();
        tokio::spawn(async move {
            let mut handle = tokio::spawn(work(sink));

            let outcome = match tokio::time::timeout(timeout, &mut handle).await {
                Ok(Ok(Ok(()))) => Ok(()),
                Ok(Ok(Err(e))) => Err(e.to_string()),
                Ok(Err(join_error)) => Err(format!("job panicked: {join_error}")),
                Err(_) => {
                    handle.abort();
                    Err(format!("job timed out after {timeout:?}"))
                }
            };

            match outcome {
                Ok(()) => {
                    info!(worker = %worker, key = %key, "Job succeeded");
                }
                Err(reason) => {
                    warn!(worker = %worker, key = %key, reason = %reason, "Job failed");
                    locked(&logs).entry(key.clone()).or_default().failure = Some(reason);
                    // Own task so a panicking callback still releases the key
                    if let Err(join_error) = tokio::spawn(on_failure()).await {
                        warn!(worker = %worker, key = %key, error = %join_error, "Failure callback panicked");
                    }
                }
            }

            locked(&jobs).remove(&key);
            debug!(worker = %worker, key = %key, "Job released");
        });
    }
}

impl Drop for JobClaim {
    fn drop(&mut self) {
        // Still holding the gate means the job was never started
        if self.accepting.is_some() {
            locked(&self.jobs).remove(&self.key);
            debug!(worker = %self.worker, key = %self.key, "Claim released unused");
        }
    }
}
