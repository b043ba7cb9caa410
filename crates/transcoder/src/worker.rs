//! Bounded pool of workers pulling submitted jobs off a shared queue.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use anyhow::{anyhow, Result};
use log::{error, info, warn};
use tokio::task::JoinHandle;
use crate::error::TranscodeError;
use crate::job::{Job, JobFailure, JobResult};
use crate::orchestrator::Orchestrator;
use crate::task::{TaskBackend, TaskRecord, TaskReporter};

/// A job handed to the pool: id, location of the stored upload and the
/// client's original filename
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub job_id: String,
    pub input_path: PathBuf,
    pub filename: String,
}

impl Submission {
    pub fn new(job_id: impl Into<String>, input_path: impl Into<PathBuf>, filename: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            input_path: input_path.into(),
            filename: filename.into(),
        }
    }

    fn into_job(self) -> Job {
        Job {
            job_id: self.job_id,
            input_path: self.input_path,
            filename: self.filename,
        }
    }
}

/// Run one job to completion and publish exactly one terminal state.
///
/// With a time limit, the orchestration future is dropped once the limit
/// passes; encoder children are spawned with kill-on-drop so no process
/// outlives its job. The FAILURE payload then carries the last published
/// snapshot with every unfinished profile failed, and only COMPLETED
/// outputs stay on disk.
pub async fn execute_job(
    orchestrator: &Orchestrator,
    job: &Job,
    reporter: &mut TaskReporter,
    time_limit: Option<Duration>,
) -> Result<JobResult, TranscodeError> {
    let outcome = match time_limit {
        Some(limit) => {
            let timed = tokio::time::timeout(limit, orchestrator.run(job, reporter)).await;
            match timed {
                Ok(outcome) => outcome,
                Err(_) => Err(abandon_job(orchestrator, job, reporter, limit).await),
            }
        }
        None => orchestrator.run(job, reporter).await,
    };

    match &outcome {
        Ok(result) => reporter.success(result),
        Err(e) => {
            error!("Job {}: failed: {}", job.job_id, e);
            reporter.failure(&JobFailure {
                error: e.to_string(),
                tasks: e.tasks().cloned(),
            });
        }
    }

    outcome
}

async fn abandon_job(
    orchestrator: &Orchestrator,
    job: &Job,
    reporter: &TaskReporter,
    limit: Duration,
) -> TranscodeError {
    let mut tasks = reporter.last_progress().cloned();
    if let Some(tracker) = tasks.as_mut() {
        tracker.fail_unfinished(&format!("job exceeded time limit of {:?}", limit));
    }
    orchestrator.discard_unfinished(&job.job_id, tasks.as_ref()).await;
    TranscodeError::TimeLimitExceeded { limit, tasks }
}

/// Fixed-size worker pool. Jobs wait in an unbounded queue until a worker is
/// free; each worker runs one job at a time.
pub struct WorkerPool {
    tx: async_channel::Sender<Submission>,
    backend: Arc<dyn TaskBackend>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(
        orchestrator: Arc<Orchestrator>,
        backend: Arc<dyn TaskBackend>,
        workers: usize,
        time_limit: Option<Duration>,
    ) -> Self {
        let (tx, rx) = async_channel::unbounded::<Submission>();
        let workers = workers.max(1);

        let handles = (0..workers)
            .map(|worker_id| {
                let rx = rx.clone();
                let orchestrator = orchestrator.clone();
                let backend = backend.clone();
                tokio::spawn(async move {
                    while let Ok(submission) = rx.recv().await {
                        let job = submission.into_job();
                        info!("Worker {}: picked up job {}", worker_id, job.job_id);
                        let mut reporter = TaskReporter::new(backend.clone(), job.job_id.clone());
                        let _ = execute_job(&orchestrator, &job, &mut reporter, time_limit).await;
                    }
                    info!("Worker {}: queue closed, exiting", worker_id);
                })
            })
            .collect();

        info!("Started {} worker(s)", workers);
        Self { tx, backend, handles }
    }

    /// Record the task as PENDING and enqueue it
    pub async fn submit(&self, submission: Submission) -> Result<()> {
        if let Err(e) = self.backend.store(TaskRecord::pending(&submission.job_id)) {
            warn!("Job {}: failed to record PENDING state: {}", submission.job_id, e);
        }
        let job_id = submission.job_id.clone();
        self.tx
            .send(submission)
            .await
            .map_err(|_| anyhow!("worker queue is closed, cannot submit job {}", job_id))
    }

    /// Jobs submitted but not yet picked up
    pub fn queued(&self) -> usize {
        self.tx.len()
    }

    /// Stop accepting jobs, let workers drain the queue and wait for them
    pub async fn shutdown(self) {
        self.tx.close();
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Worker task panicked: {}", e);
            }
        }
    }
}
