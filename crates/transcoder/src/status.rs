//! Client-facing projection of a job's task state.

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;
use log::warn;
use crate::job::{JobFailure, JobRecord, JobResult, JobStore};
use crate::task::{BackendError, BackendTaskHandle, TaskBackend, TaskHandle, TaskState};
use crate::tracker::JobProgressTracker;

pub const STATE_PROCESSING: &str = "Processing";
pub const STATE_FAILED: &str = "Failed";
pub const STATE_DATA_CORRUPTED: &str = "Failed (Data Corrupted)";

/// Profile name -> download URL, in profile table order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadUrls(Vec<(String, String)>);

impl DownloadUrls {
    pub fn get(&self, profile: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(name, _)| name == profile)
            .map(|(_, url)| url.as_str())
    }

    /// Default download: the first completed profile in table order
    pub fn first(&self) -> Option<(&str, &str)> {
        self.iter().next()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(name, url)| (name.as_str(), url.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for DownloadUrls {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, url) in &self.0 {
            map.serialize_entry(name, url)?;
        }
        map.end()
    }
}

/// `{task_id, state, overall_progress, details?, download_urls?, error?}`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusView {
    pub task_id: String,
    pub state: String,
    pub overall_progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<JobProgressTracker>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_urls: Option<DownloadUrls>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusView {
    fn bare(task_id: &str, state: impl Into<String>, overall_progress: u8) -> Self {
        Self {
            task_id: task_id.to_string(),
            state: state.into(),
            overall_progress,
            details: None,
            download_urls: None,
            error: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("task {0} not found")]
    NotFound(String),
    #[error("failed to read state of task {task_id}: {source}")]
    Internal {
        task_id: String,
        #[source]
        source: anyhow::Error,
    },
}

impl ProjectionError {
    fn internal(task_id: &str, source: impl Into<anyhow::Error>) -> Self {
        ProjectionError::Internal {
            task_id: task_id.to_string(),
            source: source.into(),
        }
    }
}

/// Combines the job store record with the task's latest state
pub struct StatusProjector<'a> {
    jobs: &'a dyn JobStore,
    tasks: &'a dyn TaskBackend,
    download_url_base: String,
}

impl<'a> StatusProjector<'a> {
    pub fn new(jobs: &'a dyn JobStore, tasks: &'a dyn TaskBackend, download_url_base: impl Into<String>) -> Self {
        Self {
            jobs,
            tasks,
            download_url_base: download_url_base.into(),
        }
    }

    pub fn download_url(&self, job_id: &str, profile: &str) -> String {
        format!("{}/{}/{}", self.download_url_base.trim_end_matches('/'), job_id, profile)
    }

    pub fn project(&self, job_id: &str) -> Result<StatusView, ProjectionError> {
        let record = self
            .jobs
            .get(job_id)
            .map_err(|e| ProjectionError::internal(job_id, e))?
            .ok_or_else(|| ProjectionError::NotFound(job_id.to_string()))?;

        let task = match BackendTaskHandle::new(self.tasks, job_id).current_state() {
            Ok(task) => task,
            Err(BackendError::Corrupted { reason, .. }) => return Ok(corrupted(job_id, &reason)),
            Err(e) => return Err(ProjectionError::internal(job_id, e)),
        };

        Ok(match task.state {
            TaskState::Pending => StatusView::bare(job_id, record.status, 0),
            TaskState::Progress => self.project_progress(job_id, task.payload),
            TaskState::Success => self.project_success(job_id, &record, task.payload),
            TaskState::Failure => self.project_failure(job_id, task.payload),
        })
    }

    fn project_progress(&self, job_id: &str, payload: Value) -> StatusView {
        match serde_json::from_value::<JobProgressTracker>(payload) {
            Ok(tracker) => StatusView {
                overall_progress: tracker.overall_percent(),
                details: Some(tracker),
                ..StatusView::bare(job_id, STATE_PROCESSING, 0)
            },
            Err(e) => corrupted(job_id, &e.to_string()),
        }
    }

    fn project_success(&self, job_id: &str, record: &JobRecord, payload: Value) -> StatusView {
        let result = match serde_json::from_value::<JobResult>(payload) {
            Ok(result) => result,
            Err(e) => return corrupted(job_id, &e.to_string()),
        };
        if result.job_id != record.task_id {
            warn!("Job {}: result payload names job {}", job_id, result.job_id);
        }

        let urls = result
            .tasks
            .completed_profiles()
            .into_iter()
            .map(|profile| (profile.to_string(), self.download_url(job_id, profile)))
            .collect();

        StatusView {
            download_urls: Some(DownloadUrls(urls)),
            details: Some(result.tasks),
            ..StatusView::bare(job_id, result.final_status.as_str(), 100)
        }
    }

    fn project_failure(&self, job_id: &str, payload: Value) -> StatusView {
        match serde_json::from_value::<JobFailure>(payload) {
            Ok(failure) => StatusView {
                details: failure.tasks,
                error: Some(failure.error),
                ..StatusView::bare(job_id, STATE_FAILED, 0)
            },
            Err(e) => corrupted(job_id, &e.to_string()),
        }
    }
}

fn corrupted(job_id: &str, reason: &str) -> StatusView {
    warn!("Job {}: unreadable task payload: {}", job_id, reason);
    StatusView {
        error: Some(format!("task payload could not be decoded: {}", reason)),
        ..StatusView::bare(job_id, STATE_DATA_CORRUPTED, 0)
    }
}
