use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::tracker::JobProgressTracker;

/// Coarse lifecycle label stored on a freshly ingested job
pub const STATUS_UPLOADED: &str = "Uploaded";

/// A unit of work handed to the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub input_path: PathBuf,
    pub filename: String,
}

/// Aggregate outcome of a finished job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalStatus {
    Completed,
    PartialSuccess,
    Failed,
}

impl FinalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalStatus::Completed => "COMPLETED",
            FinalStatus::PartialSuccess => "PARTIAL_SUCCESS",
            FinalStatus::Failed => "FAILED",
        }
    }
}

/// Terminal SUCCESS payload: `{status, job_id, tasks}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    #[serde(rename = "status")]
    pub final_status: FinalStatus,
    pub job_id: String,
    pub tasks: JobProgressTracker,
}

/// Terminal FAILURE payload: `{error, tasks}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks: Option<JobProgressTracker>,
}

/// Job metadata kept by the store, keyed by task id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub task_id: String,
    pub filename: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(task_id: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            filename: filename.into(),
            status: STATUS_UPLOADED.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Key-value store of job metadata
pub trait JobStore: Send + Sync {
    fn create(&self, record: JobRecord) -> Result<()>;
    fn get(&self, task_id: &str) -> Result<Option<JobRecord>>;
    fn list(&self) -> Result<Vec<JobRecord>>;
}

/// Process-lifetime in-memory job store
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<String, JobRecord>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryJobStore {
    fn create(&self, record: JobRecord) -> Result<()> {
        let mut jobs = self.jobs.write().map_err(|_| anyhow!("job store lock poisoned"))?;
        jobs.insert(record.task_id.clone(), record);
        Ok(())
    }

    fn get(&self, task_id: &str) -> Result<Option<JobRecord>> {
        let jobs = self.jobs.read().map_err(|_| anyhow!("job store lock poisoned"))?;
        Ok(jobs.get(task_id).cloned())
    }

    fn list(&self) -> Result<Vec<JobRecord>> {
        let jobs = self.jobs.read().map_err(|_| anyhow!("job store lock poisoned"))?;
        let mut records: Vec<_> = jobs.values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }
}

/// Job store persisted as one JSON file per job, readable by other processes
#[derive(Debug, Clone)]
pub struct FileJobStore {
    dir: PathBuf,
}

impl FileJobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create job state directory: {}", dir.display()))?;
        Ok(Self { dir })
    }
}

impl JobStore for FileJobStore {
    fn create(&self, record: JobRecord) -> Result<()> {
        save_job(&record, &self.dir)
    }

    fn get(&self, task_id: &str) -> Result<Option<JobRecord>> {
        load_job(task_id, &self.dir)
    }

    fn list(&self) -> Result<Vec<JobRecord>> {
        load_all_jobs(&self.dir)
    }
}

fn job_file(task_id: &str, dir: &Path) -> PathBuf {
    dir.join(format!("{}.json", task_id))
}

/// Write a job record atomically (temp file + rename)
pub fn save_job(record: &JobRecord, dir: &Path) -> Result<()> {
    let path = job_file(&record.task_id, dir);
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(record)
        .with_context(|| format!("Failed to serialize job {}", record.task_id))?;

    fs::write(&tmp, json)
        .with_context(|| format!("Failed to write job file: {}", tmp.display()))?;
    fs::rename(&tmp, &path)
        .with_context(|| format!("Failed to move job file into place: {}", path.display()))?;
    Ok(())
}

/// Load one job record, `None` if it does not exist
pub fn load_job(task_id: &str, dir: &Path) -> Result<Option<JobRecord>> {
    let path = job_file(task_id, dir);
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read job file: {}", path.display()))?;
    let record = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse job file: {}", path.display()))?;
    Ok(Some(record))
}

/// Load every job record in `dir`, oldest first. Unparsable files are skipped.
pub fn load_all_jobs(dir: &Path) -> Result<Vec<JobRecord>> {
    use log::warn;

    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut records = Vec::new();
    for entry in fs::read_dir(dir)
        .with_context(|| format!("Failed to read job state directory: {}", dir.display()))?
    {
        let path = entry?.path();
        if path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        let parsed = fs::read_to_string(&path)
            .map_err(anyhow::Error::from)
            .and_then(|c| serde_json::from_str::<JobRecord>(&c).map_err(anyhow::Error::from));
        match parsed {
            Ok(record) => records.push(record),
            Err(e) => warn!("Skipping unreadable job file {}: {}", path.display(), e),
        }
    }

    records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Ok(records)
}
