use std::path::{Path, PathBuf};
use thiserror::Error;
use crate::config::TranscodeConfig;
use crate::job::{JobResult, JobStore};
use crate::profile::{find_profile, profile_names};
use crate::task::{BackendError, BackendTaskHandle, TaskBackend, TaskHandle, TaskState};
use crate::tracker::ProfileStatus;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("invalid resolution {profile}, available: {}", available.join(", "))]
    UnknownProfile { profile: String, available: Vec<String> },
    #[error("task {0} not found")]
    JobNotFound(String),
    #[error("{profile} of task {job_id} is not available")]
    NotReady { job_id: String, profile: String },
    #[error("file not found on disk: {0}")]
    FileMissing(PathBuf),
    #[error("failed to look up task: {0}")]
    Store(#[source] anyhow::Error),
    #[error("failed to read task state: {0}")]
    Task(#[source] BackendError),
}

/// A rendition ready to be handed to a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    pub path: PathBuf,
    pub download_name: String,
    pub media_type: &'static str,
}

/// Locate the output of `profile` for `job_id`.
///
/// Only profiles marked COMPLETED in a SUCCESS payload are served; a file
/// left behind by a running, failed or killed encode never is. The
/// client-facing name is `transcoded_<original stem>_<profile>.<ext>`.
pub fn resolve_download(
    cfg: &TranscodeConfig,
    jobs: &dyn JobStore,
    tasks: &dyn TaskBackend,
    job_id: &str,
    profile: &str,
) -> Result<Download, DeliveryError> {
    if find_profile(profile).is_none() {
        return Err(DeliveryError::UnknownProfile {
            profile: profile.to_string(),
            available: profile_names().into_iter().map(String::from).collect(),
        });
    }

    let record = jobs
        .get(job_id)
        .map_err(DeliveryError::Store)?
        .ok_or_else(|| DeliveryError::JobNotFound(job_id.to_string()))?;

    if !profile_completed(tasks, job_id, profile)? {
        return Err(DeliveryError::NotReady {
            job_id: job_id.to_string(),
            profile: profile.to_string(),
        });
    }

    let path = cfg.output_path(job_id, profile);
    if !path.is_file() {
        return Err(DeliveryError::FileMissing(path));
    }

    let stem = Path::new(&record.filename)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| job_id.to_string());

    Ok(Download {
        path,
        download_name: format!("transcoded_{}_{}.{}", stem, profile, cfg.container_ext),
        media_type: media_type(&cfg.container_ext),
    })
}

fn profile_completed(tasks: &dyn TaskBackend, job_id: &str, profile: &str) -> Result<bool, DeliveryError> {
    let task = BackendTaskHandle::new(tasks, job_id)
        .current_state()
        .map_err(DeliveryError::Task)?;
    if task.state != TaskState::Success {
        return Ok(false);
    }

    let result: JobResult = serde_json::from_value(task.payload).map_err(|e| {
        DeliveryError::Task(BackendError::Corrupted {
            task_id: job_id.to_string(),
            reason: e.to_string(),
        })
    })?;
    Ok(result
        .tasks
        .get(profile)
        .map(|p| p.status == ProfileStatus::Completed)
        .unwrap_or(false))
}

pub fn media_type(container_ext: &str) -> &'static str {
    match container_ext.to_ascii_lowercase().as_str() {
        "mp4" | "m4v" => "video/mp4",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{FinalStatus, JobRecord, MemoryJobStore};
    use crate::profile::ResolutionProfile;
    use crate::task::{MemoryTaskBackend, TaskRecord};
    use crate::tracker::JobProgressTracker;

    fn setup() -> (tempfile::TempDir, TranscodeConfig, MemoryJobStore, MemoryTaskBackend) {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = TranscodeConfig::default_config();
        cfg.output_dir = dir.path().to_path_buf();
        let jobs = MemoryJobStore::new();
        jobs.create(JobRecord::new("j1", "My Clip.mov")).unwrap();
        (dir, cfg, jobs, MemoryTaskBackend::new())
    }

    /// 360p done, 720p still encoding at 37%
    fn halfway() -> JobProgressTracker {
        let mut tracker = JobProgressTracker::new(&[
            ResolutionProfile::new("360p", "-2:360"),
            ResolutionProfile::new("720p", "-2:720"),
        ]);
        tracker.mark_running("360p").unwrap();
        tracker.mark_completed("360p").unwrap();
        tracker.mark_running("720p").unwrap();
        tracker.update("720p", 37).unwrap();
        tracker
    }

    fn store(tasks: &MemoryTaskBackend, state: TaskState, payload: serde_json::Value) {
        tasks.store(TaskRecord::new("j1", state, payload)).unwrap();
    }

    #[test]
    fn test_resolves_completed_output() {
        let (_dir, cfg, jobs, tasks) = setup();
        let mut tracker = halfway();
        tracker.mark_failed("720p", "encoder exited with code 1").unwrap();
        let result = JobResult {
            final_status: FinalStatus::PartialSuccess,
            job_id: "j1".to_string(),
            tasks: tracker,
        };
        store(&tasks, TaskState::Success, serde_json::to_value(&result).unwrap());
        std::fs::write(cfg.output_path("j1", "360p"), b"x").unwrap();

        let download = resolve_download(&cfg, &jobs, &tasks, "j1", "360p").unwrap();
        assert_eq!(download.path, cfg.output_dir.join("j1_360p.mp4"));
        assert_eq!(download.download_name, "transcoded_My Clip_360p.mp4");
        assert_eq!(download.media_type, "video/mp4");

        // Failed profile stays hidden even if a file is lying around
        std::fs::write(cfg.output_path("j1", "720p"), b"junk").unwrap();
        assert!(matches!(
            resolve_download(&cfg, &jobs, &tasks, "j1", "720p"),
            Err(DeliveryError::NotReady { .. })
        ));
    }

    #[test]
    fn test_running_profile_is_not_served() {
        let (_dir, cfg, jobs, tasks) = setup();
        store(&tasks, TaskState::Progress, serde_json::to_value(halfway()).unwrap());
        std::fs::write(cfg.output_path("j1", "360p"), b"x").unwrap();
        std::fs::write(cfg.output_path("j1", "720p"), b"half-muxed").unwrap();

        for profile in ["360p", "720p"] {
            match resolve_download(&cfg, &jobs, &tasks, "j1", profile) {
                Err(DeliveryError::NotReady { profile: p, .. }) => assert_eq!(p, profile),
                other => panic!("expected NotReady for {}, got {:?}", profile, other),
            }
        }
    }

    #[test]
    fn test_lookup_failures() {
        let (_dir, cfg, jobs, tasks) = setup();
        match resolve_download(&cfg, &jobs, &tasks, "j1", "4k") {
            Err(DeliveryError::UnknownProfile { available, .. }) => {
                assert_eq!(available, vec!["360p", "720p", "1080p"]);
            }
            other => panic!("expected UnknownProfile, got {:?}", other),
        }
        assert!(matches!(
            resolve_download(&cfg, &jobs, &tasks, "nope", "360p"),
            Err(DeliveryError::JobNotFound(_))
        ));
        // No task state yet
        assert!(matches!(
            resolve_download(&cfg, &jobs, &tasks, "j1", "360p"),
            Err(DeliveryError::NotReady { .. })
        ));

        store(&tasks, TaskState::Success, serde_json::json!({"status": 7}));
        assert!(matches!(
            resolve_download(&cfg, &jobs, &tasks, "j1", "360p"),
            Err(DeliveryError::Task(BackendError::Corrupted { .. }))
        ));
    }

    #[test]
    fn test_completed_profile_without_file() {
        let (_dir, cfg, jobs, tasks) = setup();
        let mut tracker = halfway();
        tracker.mark_completed("720p").unwrap();
        let result = JobResult {
            final_status: FinalStatus::Completed,
            job_id: "j1".to_string(),
            tasks: tracker,
        };
        store(&tasks, TaskState::Success, serde_json::to_value(&result).unwrap());
        assert!(matches!(
            resolve_download(&cfg, &jobs, &tasks, "j1", "720p"),
            Err(DeliveryError::FileMissing(_))
        ));
    }
}
