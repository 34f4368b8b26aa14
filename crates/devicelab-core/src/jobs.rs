//! Background job runner.
//!
//! Jobs are futures returning `anyhow::Result<()>`, keyed by a caller-chosen
//! id. Submission spawns the job and returns immediately with a
//! [`JobHandle`] that observes its state. A failure or panic inside a job
//! becomes its terminal [`JobState::Failed`]; it is logged and never
//! propagated to other callers.
//!
//! The runner does not order unrelated jobs. Jobs that mutate the same
//! device must be serialized by the caller.

use crate::error::JobError;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex};
use tokio::task::AbortHandle;
use tracing::Instrument;

// ============================================================================
// State
// ============================================================================

/// Lifecycle of a job. Moves from `Pending` to a terminal state once.
#[derive(Debug, Clone)]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    /// The job returned an error or panicked.
    Failed(Arc<anyhow::Error>),
    /// The job was cancelled or the runner shut down before it finished.
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed(_) | Self::Cancelled)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed(_) => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Observes one submitted job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: String,
    state: watch::Receiver<JobState>,
}

impl JobHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current state without waiting.
    pub fn state(&self) -> JobState {
        self.state.borrow().clone()
    }

    /// Wait until the job reaches a terminal state and return it.
    pub async fn wait(&mut self) -> JobState {
        let outcome = self
            .state
            .wait_for(JobState::is_terminal)
            .await
            .map(|state| state.clone());
        match outcome {
            Ok(state) => state,
            // Sender gone without a terminal state: the task was dropped.
            Err(_) => match self.state.borrow().clone() {
                state if state.is_terminal() => state,
                _ => JobState::Cancelled,
            },
        }
    }
}

/// Counters for submitted and finished jobs.
#[derive(Debug, Default)]
pub struct JobStats {
    pub submitted: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    pub cancelled: AtomicU64,
}

// ============================================================================
// Runner
// ============================================================================

struct JobEntry {
    state: Arc<watch::Sender<JobState>>,
    abort: AbortHandle,
}

type Registry = Arc<Mutex<HashMap<String, JobEntry>>>;

/// Runs jobs on the tokio runtime and tracks the active ones by id.
#[derive(Default)]
pub struct JobRunner {
    jobs: Registry,
    stats: Arc<JobStats>,
    shut_down: AtomicBool,
}

impl JobRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `work` under `id`.
    ///
    /// # Errors
    ///
    /// - [`JobError::Duplicate`] if a job with this id is still active.
    /// - [`JobError::ShutDown`] after [`shutdown`](Self::shutdown).
    pub async fn submit<F>(&self, id: impl Into<String>, work: F) -> Result<JobHandle, JobError>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = id.into();
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(JobError::ShutDown);
        }

        // The registry lock is held across spawn and insert so the job cannot
        // deregister itself before it is registered.
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&id) {
            return Err(JobError::Duplicate(id));
        }

        let (tx, rx) = watch::channel(JobState::Pending);
        let tx = Arc::new(tx);
        let task = tokio::spawn(
            run_job(
                id.clone(),
                work,
                Arc::clone(&tx),
                Arc::clone(&self.jobs),
                Arc::clone(&self.stats),
            )
            .instrument(tracing::info_span!("job", job_id = %id)),
        );
        jobs.insert(
            id.clone(),
            JobEntry {
                state: tx,
                abort: task.abort_handle(),
            },
        );
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(job_id = %id, active = jobs.len(), "Job submitted");
        Ok(JobHandle { id, state: rx })
    }

    /// Whether a job with this id is pending or running.
    pub async fn job_exists(&self, id: &str) -> bool {
        self.jobs.lock().await.contains_key(id)
    }

    /// State of an active job, `None` once it has finished.
    pub async fn state(&self, id: &str) -> Option<JobState> {
        self.jobs
            .lock()
            .await
            .get(id)
            .map(|entry| entry.state.borrow().clone())
    }

    /// Abort an active job. Its handles observe [`JobState::Cancelled`].
    pub async fn cancel(&self, id: &str) -> Result<(), JobError> {
        let entry = self
            .jobs
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        entry.abort.abort();
        entry.state.send_replace(JobState::Cancelled);
        self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
        tracing::info!(job_id = %id, "Job cancelled");
        Ok(())
    }

    /// Ids of the active jobs.
    pub async fn active(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.jobs.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn stats(&self) -> &JobStats {
        &self.stats
    }

    /// Stop accepting jobs and abort the active ones.
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        let drained: Vec<(String, JobEntry)> = self.jobs.lock().await.drain().collect();
        let count = drained.len();
        for (_, entry) in drained {
            entry.abort.abort();
            entry.state.send_replace(JobState::Cancelled);
        }
        self.stats
            .cancelled
            .fetch_add(count as u64, Ordering::Relaxed);
        tracing::info!(aborted = count, "Job runner shut down");
    }
}

async fn run_job<F>(
    id: String,
    work: F,
    state: Arc<watch::Sender<JobState>>,
    jobs: Registry,
    stats: Arc<JobStats>,
) where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    state.send_replace(JobState::Running);
    let start = Instant::now();

    let outcome = match AssertUnwindSafe(work).catch_unwind().await {
        Ok(Ok(())) => JobState::Succeeded,
        Ok(Err(e)) => JobState::Failed(Arc::new(e)),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            JobState::Failed(Arc::new(anyhow::anyhow!("job panicked: {message}")))
        }
    };

    let elapsed_ms = start.elapsed().as_millis() as u64;
    match &outcome {
        JobState::Failed(e) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            tracing::error!(job_id = %id, elapsed_ms, error = format!("{e:#}"), "Job failed");
        }
        _ => {
            stats.succeeded.fetch_add(1, Ordering::Relaxed);
            tracing::info!(job_id = %id, elapsed_ms, "Job succeeded");
        }
    }

    let mut jobs = jobs.lock().await;
    state.send_replace(outcome);
    jobs.remove(&id);
}
