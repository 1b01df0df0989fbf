//! Background runner for separation jobs.
//!
//! Every job runs in its own tokio task with its own cancellation token.
//! By default the runner admits any number of jobs at once; an optional
//! semaphore bounds concurrency and an optional timeout cancels jobs that
//! run too long.
//!
//! A task is always started, even when its token is already cancelled, so
//! the job body can commit its own terminal state.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::jobs::JobId;
use crate::metrics::MetricsCollector;

/// Configuration for the task runner.
#[derive(Debug, Clone, Default)]
pub struct TaskRunnerConfig {
    /// Maximum number of jobs running at once; `None` is unbounded.
    pub max_concurrent: Option<usize>,
    /// Wall-clock budget per job; `None` is unlimited.
    pub task_timeout: Option<Duration>,
}

impl TaskRunnerConfig {
    /// Bounds concurrency.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = Some(max.max(1));
        self
    }

    /// Sets the per-job timeout.
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }
}

/// Snapshot of runner counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunnerStats {
    /// Jobs handed to the runner.
    pub spawned: u64,
    /// Jobs that finished successfully.
    pub completed: u64,
    /// Jobs that finished with an error without being cancelled.
    pub failed: u64,
    /// Jobs that finished after their token was cancelled.
    pub cancelled: u64,
    /// Jobs currently in flight (waiting for a slot or running).
    pub active: u64,
}

impl RunnerStats {
    /// Jobs that reached an outcome.
    pub fn finished(&self) -> u64 {
        self.completed + self.failed + self.cancelled
    }
}

/// Shared state for tracking runner statistics.
#[derive(Default)]
struct SharedRunnerStats {
    spawned: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    active: AtomicU64,
}

impl SharedRunnerStats {
    fn to_stats(&self) -> RunnerStats {
        RunnerStats {
            spawned: self.spawned.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            cancelled: self.cancelled.load(Ordering::SeqCst),
            active: self.active.load(Ordering::SeqCst),
        }
    }
}

/// How a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Failed,
    Cancelled,
}

impl Outcome {
    fn label(self) -> &'static str {
        match self {
            Outcome::Completed => "done",
            Outcome::Failed => "error",
            Outcome::Cancelled => "cancelled",
        }
    }
}

/// Spawns and tracks background jobs.
pub struct TaskRunner {
    config: TaskRunnerConfig,
    semaphore: Option<Arc<Semaphore>>,
    tokens: Arc<Mutex<HashMap<JobId, CancellationToken>>>,
    shutdown: CancellationToken,
    stats: Arc<SharedRunnerStats>,
    metrics: MetricsCollector,
}

impl Default for TaskRunner {
    fn default() -> Self {
        Self::new(TaskRunnerConfig::default())
    }
}

impl TaskRunner {
    pub fn new(config: TaskRunnerConfig) -> Self {
        Self {
            semaphore: config.max_concurrent.map(|n| Arc::new(Semaphore::new(n))),
            config,
            tokens: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
            stats: Arc::new(SharedRunnerStats::default()),
            metrics: MetricsCollector::new(),
        }
    }

    fn tokens(&self) -> MutexGuard<'_, HashMap<JobId, CancellationToken>> {
        lock_tokens(&self.tokens)
    }

    /// Runs `job` for `job_id` in the background.
    ///
    /// `job` receives the job's cancellation token and must return promptly
    /// once it fires.
    pub fn spawn<F, Fut, T, E>(&self, job_id: JobId, job: F) -> JoinHandle<()>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Display + Send + 'static,
    {
        let token = self.shutdown.child_token();
        self.tokens().insert(job_id.clone(), token.clone());

        self.stats.spawned.fetch_add(1, Ordering::SeqCst);
        self.stats.active.fetch_add(1, Ordering::SeqCst);

        let semaphore = self.semaphore.clone();
        let tokens = Arc::clone(&self.tokens);
        let stats = Arc::clone(&self.stats);
        let metrics = self.metrics.clone();
        let task_timeout = self.config.task_timeout;

        debug!(job_id = %job_id, "Job spawned");

        tokio::spawn(async move {
            // Waiting for a slot ends early on cancellation; the job still
            // runs so it can record the cancellation itself.
            let _permit = match &semaphore {
                Some(sem) => tokio::select! {
                    permit = Arc::clone(sem).acquire_owned() => permit.ok(),
                    _ = token.cancelled() => None,
                },
                None => None,
            };

            let start = Instant::now();
            metrics.job_started();

            let fut = job(token.clone());
            tokio::pin!(fut);

            let result = match task_timeout {
                Some(limit) => tokio::select! {
                    result = &mut fut => result,
                    _ = tokio::time::sleep(limit) => {
                        warn!(job_id = %job_id, timeout_secs = limit.as_secs(), "Job timed out, cancelling");
                        token.cancel();
                        fut.await
                    }
                },
                None => fut.await,
            };

            let outcome = match &result {
                Ok(_) => {
                    stats.completed.fetch_add(1, Ordering::SeqCst);
                    Outcome::Completed
                }
                Err(_) if token.is_cancelled() => {
                    stats.cancelled.fetch_add(1, Ordering::SeqCst);
                    Outcome::Cancelled
                }
                Err(_) => {
                    stats.failed.fetch_add(1, Ordering::SeqCst);
                    Outcome::Failed
                }
            };

            let elapsed = start.elapsed();
            metrics.job_finished(outcome.label(), elapsed.as_secs_f64());
            stats.active.fetch_sub(1, Ordering::SeqCst);
            lock_tokens(&tokens).remove(&job_id);

            match result {
                Ok(_) => info!(job_id = %job_id, elapsed_ms = elapsed.as_millis() as u64, "Job finished"),
                Err(e) => info!(
                    job_id = %job_id,
                    outcome = outcome.label(),
                    error = %e,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Job finished with error"
                ),
            }
        })
    }

    /// Cancels a running job. Returns `false` when the job is not running.
    pub fn cancel(&self, job_id: &JobId) -> bool {
        match self.tokens().get(job_id) {
            Some(token) => {
                info!(job_id = %job_id, "Cancelling job");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether `job_id` is currently running.
    pub fn is_running(&self, job_id: &JobId) -> bool {
        self.tokens().contains_key(job_id)
    }

    /// Cancels every running job.
    pub fn shutdown(&self) {
        info!(active = self.stats.active.load(Ordering::SeqCst), "Cancelling all jobs");
        self.shutdown.cancel();
    }

    /// Returns current runner statistics.
    pub fn stats(&self) -> RunnerStats {
        self.stats.to_stats()
    }

    pub fn config(&self) -> &TaskRunnerConfig {
        &self.config
    }
}

fn lock_tokens(
    tokens: &Mutex<HashMap<JobId, CancellationToken>>,
) -> MutexGuard<'_, HashMap<JobId, CancellationToken>> {
    tokens.lock().unwrap_or_else(PoisonError::into_inner)
}
