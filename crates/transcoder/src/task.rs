//! Task state as seen by the transport: the lifecycle of one submitted
//! orchestration run and the payload attached to its latest state.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use crate::job::{JobFailure, JobResult};
use crate::tracker::JobProgressTracker;

/// PENDING -> PROGRESS* -> SUCCESS | FAILURE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Progress,
    Success,
    Failure,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Success | TaskState::Failure)
    }
}

/// Latest state of a task and its raw payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub state: TaskState,
    #[serde(default)]
    pub payload: Value,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(task_id: impl Into<String>, state: TaskState, payload: Value) -> Self {
        Self {
            task_id: task_id.into(),
            state,
            payload,
            updated_at: Utc::now(),
        }
    }

    pub fn pending(task_id: impl Into<String>) -> Self {
        Self::new(task_id, TaskState::Pending, Value::Null)
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("task state I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("task {task_id} state is corrupted: {reason}")]
    Corrupted { task_id: String, reason: String },
    #[error("failed to serialize task payload: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("task backend lock poisoned")]
    Poisoned,
}

/// Storage for task records, shared between workers and readers
pub trait TaskBackend: Send + Sync {
    fn store(&self, record: TaskRecord) -> Result<(), BackendError>;
    fn load(&self, task_id: &str) -> Result<Option<TaskRecord>, BackendError>;
}

/// Read-side view of one task
pub trait TaskHandle {
    fn current_state(&self) -> Result<TaskRecord, BackendError>;
}

/// [`TaskHandle`] over any [`TaskBackend`]; unknown tasks read as PENDING
pub struct BackendTaskHandle<'a> {
    backend: &'a dyn TaskBackend,
    task_id: String,
}

impl<'a> BackendTaskHandle<'a> {
    pub fn new(backend: &'a dyn TaskBackend, task_id: impl Into<String>) -> Self {
        Self {
            backend,
            task_id: task_id.into(),
        }
    }
}

impl TaskHandle for BackendTaskHandle<'_> {
    fn current_state(&self) -> Result<TaskRecord, BackendError> {
        Ok(self
            .backend
            .load(&self.task_id)?
            .unwrap_or_else(|| TaskRecord::pending(&self.task_id)))
    }
}

/// In-process task backend
#[derive(Debug, Default)]
pub struct MemoryTaskBackend {
    records: RwLock<HashMap<String, TaskRecord>>,
}

impl MemoryTaskBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskBackend for MemoryTaskBackend {
    fn store(&self, record: TaskRecord) -> Result<(), BackendError> {
        let mut records = self.records.write().map_err(|_| BackendError::Poisoned)?;
        records.insert(record.task_id.clone(), record);
        Ok(())
    }

    fn load(&self, task_id: &str) -> Result<Option<TaskRecord>, BackendError> {
        let records = self.records.read().map_err(|_| BackendError::Poisoned)?;
        Ok(records.get(task_id).cloned())
    }
}

/// Task backend persisted as `<dir>/<task_id>.json`, so separate processes
/// (the CLI, the monitor) can poll worker progress.
#[derive(Debug, Clone)]
pub struct FileTaskBackend {
    dir: PathBuf,
}

impl FileTaskBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, BackendError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| BackendError::Io {
            path: dir.clone(),
            source: e,
        })?;
        Ok(Self { dir })
    }

    fn path_for(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", task_id))
    }
}

impl TaskBackend for FileTaskBackend {
    fn store(&self, record: TaskRecord) -> Result<(), BackendError> {
        let path = self.path_for(&record.task_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(&record)?;

        fs::write(&tmp, json).map_err(|e| BackendError::Io {
            path: tmp.clone(),
            source: e,
        })?;
        fs::rename(&tmp, &path).map_err(|e| BackendError::Io { path, source: e })
    }

    fn load(&self, task_id: &str) -> Result<Option<TaskRecord>, BackendError> {
        let path = self.path_for(task_id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(BackendError::Io { path, source: e }),
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| BackendError::Corrupted {
                task_id: task_id.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Write side of one task: publishes progress snapshots and exactly one
/// terminal payload. Publication failures are logged and swallowed; the
/// job's outcome never depends on the transport being reachable.
pub struct TaskReporter {
    backend: Arc<dyn TaskBackend>,
    task_id: String,
    terminal: bool,
    last_progress: Option<JobProgressTracker>,
}

impl TaskReporter {
    pub fn new(backend: Arc<dyn TaskBackend>, task_id: impl Into<String>) -> Self {
        Self {
            backend,
            task_id: task_id.into(),
            terminal: false,
            last_progress: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    /// Most recent snapshot handed to `progress`, published or not
    pub fn last_progress(&self) -> Option<&JobProgressTracker> {
        self.last_progress.as_ref()
    }

    fn publish(&mut self, state: TaskState, payload: Result<Value, serde_json::Error>) {
        if self.terminal {
            warn!("Job {}: ignoring {:?} publication after terminal state", self.task_id, state);
            return;
        }
        let result = payload
            .map_err(BackendError::from)
            .and_then(|payload| self.backend.store(TaskRecord::new(&self.task_id, state, payload)));
        if let Err(e) = result {
            warn!("Job {}: failed to publish {:?} state: {}", self.task_id, state, e);
        }
        if state.is_terminal() {
            self.terminal = true;
        }
    }

    pub fn pending(&mut self) {
        self.publish(TaskState::Pending, Ok(Value::Null));
    }

    pub fn progress(&mut self, tracker: &JobProgressTracker) {
        let snapshot = tracker.snapshot();
        self.publish(TaskState::Progress, serde_json::to_value(&snapshot));
        if !self.terminal {
            self.last_progress = Some(snapshot);
        }
    }

    pub fn success(&mut self, result: &JobResult) {
        self.publish(TaskState::Success, serde_json::to_value(result));
    }

    pub fn failure(&mut self, failure: &JobFailure) {
        self.publish(TaskState::Failure, serde_json::to_value(failure));
    }
}
