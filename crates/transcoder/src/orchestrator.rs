use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use log::{debug, error, info, warn};
use crate::config::{output_file_name, TranscodeConfig};
use crate::encoder::{partial_output_path, Encoder, FfmpegEncoder};
use crate::error::{EncodeError, TranscodeError};
use crate::ffprobe::{effective_duration, DurationProbe, FFProbe};
use crate::job::{FinalStatus, Job, JobResult};
use crate::profile::{default_profiles, ResolutionProfile};
use crate::progress::percent_complete;
use crate::task::TaskReporter;
use crate::tracker::{JobProgressTracker, ProfileStatus};

/// Drives one job through every resolution profile.
///
/// Profiles run strictly one after another in table order, so a job never
/// has more than one encoder child alive. A failing profile is recorded and
/// skipped; only a missing input or the failure of every profile fails the
/// job as a whole.
pub struct Orchestrator {
    encoder: Arc<dyn Encoder>,
    prober: Arc<dyn DurationProbe>,
    profiles: Vec<ResolutionProfile>,
    output_dir: PathBuf,
    container_ext: String,
}

impl Orchestrator {
    pub fn new(
        encoder: Arc<dyn Encoder>,
        prober: Arc<dyn DurationProbe>,
        profiles: Vec<ResolutionProfile>,
        output_dir: impl Into<PathBuf>,
        container_ext: impl Into<String>,
    ) -> Self {
        Self {
            encoder,
            prober,
            profiles,
            output_dir: output_dir.into(),
            container_ext: container_ext.into(),
        }
    }

    /// ffmpeg/ffprobe backed orchestrator over the default profile table
    pub fn from_config(cfg: &TranscodeConfig) -> Self {
        Self::new(
            Arc::new(FfmpegEncoder::from_config(cfg)),
            Arc::new(FFProbe::new(cfg.ffprobe_bin.clone())),
            default_profiles(),
            cfg.output_dir.clone(),
            cfg.container_ext.clone(),
        )
    }

    pub fn output_path(&self, job_id: &str, profile_name: &str) -> PathBuf {
        self.output_dir
            .join(output_file_name(job_id, profile_name, &self.container_ext))
    }

    /// Remove whatever an interrupted run left behind for every profile that
    /// `tracker` does not show as COMPLETED. Without a tracker nothing is
    /// known to be finished.
    pub async fn discard_unfinished(&self, job_id: &str, tracker: Option<&JobProgressTracker>) {
        for profile in &self.profiles {
            let completed = tracker
                .and_then(|t| t.get(&profile.name))
                .map(|p| p.status == ProfileStatus::Completed)
                .unwrap_or(false);
            if !completed {
                discard_partial_output(&self.output_path(job_id, &profile.name)).await;
            }
        }
    }

    /// Run the whole job, publishing progress snapshots through `reporter`.
    ///
    /// The terminal payload is not published here; callers turn the returned
    /// result or error into exactly one SUCCESS/FAILURE publication.
    pub async fn run(&self, job: &Job, reporter: &mut TaskReporter) -> Result<JobResult, TranscodeError> {
        let mut tracker = JobProgressTracker::new(&self.profiles);

        if !input_exists(&job.input_path).await {
            error!("Job {}: input file not found: {}", job.job_id, job.input_path.display());
            reporter.progress(&tracker);
            return Err(TranscodeError::FatalPrecondition {
                reason: format!("input file not found: {}", job.input_path.display()),
                tasks: tracker,
            });
        }

        if self.profiles.is_empty() {
            return Err(TranscodeError::FatalPrecondition {
                reason: "no resolution profiles configured".to_string(),
                tasks: tracker,
            });
        }
        if let Some(name) = duplicate_profile_name(&self.profiles) {
            return Err(TranscodeError::FatalPrecondition {
                reason: format!("profile {} is configured more than once", name),
                tasks: tracker,
            });
        }

        let total_secs = effective_duration(self.prober.probe_duration(&job.input_path).await);
        info!(
            "Job {}: starting {} profile(s) for {} (duration {:.2}s)",
            job.job_id,
            self.profiles.len(),
            job.filename,
            total_secs
        );
        reporter.progress(&tracker);

        for profile in &self.profiles {
            tracker.mark_running(&profile.name)?;
            reporter.progress(&tracker);

            let output = self.output_path(&job.job_id, &profile.name);
            match self
                .encode_profile(job, profile, &output, total_secs, &mut tracker, reporter)
                .await
            {
                Ok(()) => {
                    tracker.mark_completed(&profile.name)?;
                    info!("Job {}: ✅ {} written to {}", job.job_id, profile.name, output.display());
                }
                Err(TranscodeError::ProfileFailure { profile: name, source }) => {
                    error!("Job {}: ❌ profile {} failed: {}", job.job_id, name, source);
                    tracker.mark_failed(&name, source.to_string())?;
                    discard_partial_output(&output).await;
                }
                Err(other) => return Err(other),
            }

            reporter.progress(&tracker);
        }

        self.finalize(job, tracker)
    }

    async fn encode_profile(
        &self,
        job: &Job,
        profile: &ResolutionProfile,
        output: &Path,
        total_secs: f64,
        tracker: &mut JobProgressTracker,
        reporter: &mut TaskReporter,
    ) -> Result<(), TranscodeError> {
        let profile_failure = |source: EncodeError| TranscodeError::ProfileFailure {
            profile: profile.name.clone(),
            source,
        };

        debug!("Job {}: encoding {} ({})", job.job_id, profile.name, profile.scale_spec);
        let mut run = self
            .encoder
            .start(&job.input_path, profile, output)
            .await
            .map_err(profile_failure)?;

        while let Some(event) = run.next_event().await {
            let percent = percent_complete(event.current_seconds, total_secs);
            if tracker.update(&profile.name, percent)? {
                debug!("Job {}: {} at {}%", job.job_id, profile.name, percent);
                reporter.progress(tracker);
            }
        }

        run.wait().await.map_err(profile_failure)
    }

    fn finalize(&self, job: &Job, tracker: JobProgressTracker) -> Result<JobResult, TranscodeError> {
        match tracker.final_status() {
            Some(FinalStatus::Failed) => {
                let reasons: Vec<String> = tracker
                    .failed_profiles()
                    .into_iter()
                    .map(|(name, err)| format!("{}: {}", name, err))
                    .collect();
                let message = format!("all {} profiles failed: {}", tracker.len(), reasons.join("; "));
                error!("Job {}: {}", job.job_id, message);
                Err(TranscodeError::AllProfilesFailed {
                    message,
                    tasks: tracker,
                })
            }
            Some(final_status) => {
                info!(
                    "Job {}: finished {} ({} completed, {} failed)",
                    job.job_id,
                    final_status.as_str(),
                    tracker.completed_profiles().len(),
                    tracker.failed_profiles().len()
                );
                Ok(JobResult {
                    final_status,
                    job_id: job.job_id.clone(),
                    tasks: tracker,
                })
            }
            // Every profile was driven to COMPLETED or FAILED above
            None => Err(TranscodeError::FatalPrecondition {
                reason: "job ended with unfinished profiles".to_string(),
                tasks: tracker,
            }),
        }
    }
}

async fn input_exists(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

fn duplicate_profile_name(profiles: &[ResolutionProfile]) -> Option<&str> {
    let mut seen = HashSet::new();
    profiles
        .iter()
        .map(|p| p.name.as_str())
        .find(|name| !seen.insert(*name))
}

/// Remove both the in-progress file and anything at the final output path
async fn discard_partial_output(output: &Path) {
    for path in [partial_output_path(output), output.to_path_buf()] {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!("Removed partial output {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove partial output {}: {}", path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use async_trait::async_trait;
    use crate::encoder::EncodeRun;
    use crate::error::ProbeError;
    use crate::job::{JobRecord, JobStore, MemoryJobStore};
    use crate::progress::ProgressEvent;
    use crate::status::StatusProjector;
    use crate::task::{BackendError, TaskBackend, TaskRecord, TaskState};
    use crate::tracker::ProfileStatus;

    /// Scripted behaviour of one fake encode
    #[derive(Clone)]
    enum Script {
        Succeed(Vec<f64>),
        ExitWith(Vec<f64>, i32),
        SpawnFails,
    }

    struct FakeEncoder {
        scripts: HashMap<String, Script>,
        started: Mutex<Vec<String>>,
    }

    impl FakeEncoder {
        fn new(scripts: &[(&str, Script)]) -> Self {
            Self {
                scripts: scripts.iter().map(|(n, s)| (n.to_string(), s.clone())).collect(),
                started: Mutex::new(Vec::new()),
            }
        }

        fn started(&self) -> Vec<String> {
            self.started.lock().unwrap().clone()
        }
    }

    struct FakeRun {
        events: VecDeque<f64>,
        exit_code: i32,
        output: PathBuf,
    }

    #[async_trait]
    impl EncodeRun for FakeRun {
        async fn next_event(&mut self) -> Option<ProgressEvent> {
            self.events.pop_front().map(|s| ProgressEvent { current_seconds: s })
        }

        async fn wait(&mut self) -> Result<(), EncodeError> {
            if self.exit_code == 0 {
                std::fs::write(&self.output, b"video").map_err(EncodeError::Io)?;
                Ok(())
            } else {
                // a crashed muxer leaves a truncated file behind
                std::fs::write(&self.output, b"half-muxed").map_err(EncodeError::Io)?;
                Err(EncodeError::NonZeroExit {
                    code: Some(self.exit_code),
                    tail: "Conversion failed!".to_string(),
                })
            }
        }
    }

    #[async_trait]
    impl Encoder for FakeEncoder {
        async fn start(
            &self,
            _input: &Path,
            profile: &ResolutionProfile,
            output: &Path,
        ) -> Result<Box<dyn EncodeRun>, EncodeError> {
            self.started.lock().unwrap().push(profile.name.clone());
            let script = self.scripts.get(&profile.name).cloned().unwrap_or(Script::Succeed(vec![]));
            let (events, exit_code) = match script {
                Script::Succeed(events) => (events, 0),
                Script::ExitWith(events, code) => (events, code),
                Script::SpawnFails => {
                    return Err(EncodeError::Spawn {
                        bin: PathBuf::from("ffmpeg"),
                        source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
                    })
                }
            };
            Ok(Box::new(FakeRun {
                events: events.into(),
                exit_code,
                output: output.to_path_buf(),
            }))
        }
    }

    struct FixedProbe(Result<f64, ()>);

    #[async_trait]
    impl DurationProbe for FixedProbe {
        async fn probe_duration(&self, _input: &Path) -> Result<f64, ProbeError> {
            self.0.map_err(|_| ProbeError::MissingDuration)
        }
    }

    /// Task backend that keeps every published record
    #[derive(Default)]
    struct RecordingBackend {
        history: Mutex<Vec<TaskRecord>>,
    }

    impl RecordingBackend {
        fn progress_payloads(&self) -> Vec<JobProgressTracker> {
            self.history
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.state == TaskState::Progress)
                .map(|r| serde_json::from_value(r.payload.clone()).unwrap())
                .collect()
        }
    }

    impl TaskBackend for RecordingBackend {
        fn store(&self, record: TaskRecord) -> Result<(), BackendError> {
            self.history.lock().unwrap().push(record);
            Ok(())
        }

        fn load(&self, task_id: &str) -> Result<Option<TaskRecord>, BackendError> {
            Ok(self
                .history
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|r| r.task_id == task_id)
                .cloned())
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        out_dir: PathBuf,
        job: Job,
        backend: Arc<RecordingBackend>,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.mp4");
        std::fs::write(&input, b"source").unwrap();
        let out_dir = dir.path().join("processed");
        std::fs::create_dir_all(&out_dir).unwrap();
        Harness {
            out_dir,
            job: Job {
                job_id: "job-1".to_string(),
                input_path: input,
                filename: "input.mp4".to_string(),
            },
            backend: Arc::new(RecordingBackend::default()),
            _dir: dir,
        }
    }

    fn profiles(names: &[&str]) -> Vec<ResolutionProfile> {
        names
            .iter()
            .map(|n| ResolutionProfile::new(*n, format!("-2:{}", n.trim_end_matches('p'))))
            .collect()
    }

    fn orchestrator(h: &Harness, encoder: Arc<FakeEncoder>, probe: Result<f64, ()>, names: &[&str]) -> Orchestrator {
        Orchestrator::new(encoder, Arc::new(FixedProbe(probe)), profiles(names), &h.out_dir, "mp4")
    }

    #[tokio::test]
    async fn test_all_profiles_succeed() {
        let h = harness();
        let encoder = Arc::new(FakeEncoder::new(&[
            ("240p", Script::Succeed(vec![2.0, 5.0, 10.0])),
            ("480p", Script::Succeed(vec![5.0])),
        ]));
        let orch = orchestrator(&h, encoder.clone(), Ok(10.0), &["240p", "480p"]);
        let mut reporter = TaskReporter::new(h.backend.clone(), "job-1");

        let result = orch.run(&h.job, &mut reporter).await.unwrap();

        assert_eq!(result.final_status, FinalStatus::Completed);
        assert_eq!(result.tasks.overall_percent(), 100);
        assert_eq!(encoder.started(), vec!["240p", "480p"]);
        for (_, p) in result.tasks.iter() {
            assert_eq!(p.status, ProfileStatus::Completed);
            assert_eq!(p.percent, 100);
        }
        assert!(h.out_dir.join("job-1_240p.mp4").exists());
        assert!(h.out_dir.join("job-1_480p.mp4").exists());
        assert!(!reporter.is_terminal());
    }

    #[tokio::test]
    async fn test_partial_success_scenario() {
        let h = harness();
        let encoder = Arc::new(FakeEncoder::new(&[
            ("240p", Script::Succeed(vec![3.0, 6.0])),
            ("480p", Script::Succeed(vec![6.0])),
            ("720p", Script::ExitWith(vec![1.0, 4.2], 1)),
        ]));
        let orch = orchestrator(&h, encoder.clone(), Ok(10.0), &["240p", "480p", "720p"]);
        let mut reporter = TaskReporter::new(h.backend.clone(), "job-1");

        let result = orch.run(&h.job, &mut reporter).await.unwrap();

        assert_eq!(result.final_status, FinalStatus::PartialSuccess);
        let failed = result.tasks.get("720p").unwrap();
        assert_eq!(failed.status, ProfileStatus::Failed);
        assert_eq!(failed.percent, 42);
        assert!(failed.error.as_deref().unwrap().contains("code 1"));
        assert_eq!(result.tasks.completed_profiles(), vec!["240p", "480p"]);
        assert!(!h.out_dir.join("job-1_720p.mp4").exists());

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "PARTIAL_SUCCESS");
        assert_eq!(json["tasks"]["240p"]["progress"], 100);
        assert_eq!(json["tasks"]["720p"]["status"], "FAILED");
    }

    #[tokio::test]
    async fn test_all_profiles_fail() {
        let h = harness();
        let encoder = Arc::new(FakeEncoder::new(&[
            ("240p", Script::SpawnFails),
            ("480p", Script::ExitWith(vec![], 69)),
        ]));
        let orch = orchestrator(&h, encoder.clone(), Ok(10.0), &["240p", "480p"]);
        let mut reporter = TaskReporter::new(h.backend.clone(), "job-1");

        let err = orch.run(&h.job, &mut reporter).await.unwrap_err();

        assert_eq!(encoder.started(), vec!["240p", "480p"]);
        match &err {
            TranscodeError::AllProfilesFailed { message, tasks } => {
                assert!(message.starts_with("all 2 profiles failed"));
                assert!(message.contains("240p: failed to spawn encoder"));
                assert!(tasks.completed_profiles().is_empty());
            }
            other => panic!("expected AllProfilesFailed, got {:?}", other),
        }
        assert!(err.tasks().is_some());
    }

    #[tokio::test]
    async fn test_missing_input_attempts_nothing() {
        let mut h = harness();
        h.job.input_path = h.out_dir.join("gone.mp4");
        let encoder = Arc::new(FakeEncoder::new(&[]));
        let orch = orchestrator(&h, encoder.clone(), Ok(10.0), &["240p", "480p"]);
        let mut reporter = TaskReporter::new(h.backend.clone(), "job-1");

        let err = orch.run(&h.job, &mut reporter).await.unwrap_err();

        assert!(encoder.started().is_empty());
        match err {
            TranscodeError::FatalPrecondition { tasks, .. } => {
                assert_eq!(tasks.count(ProfileStatus::Queued), 2);
            }
            other => panic!("expected FatalPrecondition, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicate_profile_names_attempt_nothing() {
        let h = harness();
        let encoder = Arc::new(FakeEncoder::new(&[]));
        let orch = orchestrator(&h, encoder.clone(), Ok(10.0), &["240p", "480p", "240p"]);
        let mut reporter = TaskReporter::new(h.backend.clone(), "job-1");

        let err = orch.run(&h.job, &mut reporter).await.unwrap_err();

        assert!(encoder.started().is_empty());
        assert!(matches!(err, TranscodeError::FatalPrecondition { .. }));
        assert_eq!(err.to_string(), "profile 240p is configured more than once");
    }

    #[tokio::test]
    async fn test_partial_success_projects_completed_downloads_only() {
        let h = harness();
        let encoder = Arc::new(FakeEncoder::new(&[
            ("240p", Script::Succeed(vec![5.0])),
            ("480p", Script::Succeed(vec![5.0])),
            ("720p", Script::ExitWith(vec![4.2], 1)),
        ]));
        let orch = orchestrator(&h, encoder, Ok(10.0), &["240p", "480p", "720p"]);
        let mut reporter = TaskReporter::new(h.backend.clone(), "job-1");

        let result = orch.run(&h.job, &mut reporter).await.unwrap();
        reporter.success(&result);

        let jobs = MemoryJobStore::new();
        jobs.create(JobRecord::new("job-1", "input.mp4")).unwrap();
        let projector = StatusProjector::new(&jobs, h.backend.as_ref(), "/api/v1/download");
        let view = projector.project("job-1").unwrap();

        assert_eq!(view.state, "PARTIAL_SUCCESS");
        assert_eq!(view.overall_progress, 100);
        let urls = view.download_urls.unwrap();
        let names: Vec<&str> = urls.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["240p", "480p"]);
        assert_eq!(urls.get("480p"), Some("/api/v1/download/job-1/480p"));
        assert!(urls.get("720p").is_none());
        assert_eq!(view.details.unwrap().get("720p").unwrap().status, ProfileStatus::Failed);
    }

    #[tokio::test]
    async fn test_probe_failure_is_advisory() {
        for probe in [Err(()), Ok(0.0)] {
            let h = harness();
            let encoder = Arc::new(FakeEncoder::new(&[
                ("240p", Script::Succeed(vec![0.5, 3.0])),
                ("480p", Script::ExitWith(vec![0.2], 1)),
            ]));
            let orch = orchestrator(&h, encoder, probe, &["240p", "480p"]);
            let mut reporter = TaskReporter::new(h.backend.clone(), "job-1");

            let result = orch.run(&h.job, &mut reporter).await.unwrap();
            assert_eq!(result.final_status, FinalStatus::PartialSuccess);
            // 1s fallback duration: 0.2s -> 20%
            assert_eq!(result.tasks.get("480p").unwrap().percent, 20);
        }
    }

    #[tokio::test]
    async fn test_duplicate_percents_publish_once() {
        let h = harness();
        // 1000 lines all mapping to 42% of a 100s source
        let encoder = Arc::new(FakeEncoder::new(&[("240p", Script::Succeed(vec![42.5; 1000]))]));
        let orch = orchestrator(&h, encoder, Ok(100.0), &["240p"]);
        let mut reporter = TaskReporter::new(h.backend.clone(), "job-1");

        orch.run(&h.job, &mut reporter).await.unwrap();

        let at_42 = h
            .backend
            .progress_payloads()
            .iter()
            .filter(|t| t.get("240p").map(|p| p.percent == 42 && p.status == ProfileStatus::Running).unwrap_or(false))
            .count();
        assert_eq!(at_42, 1);
    }

    #[tokio::test]
    async fn test_published_percent_is_monotonic_per_profile() {
        let h = harness();
        let encoder = Arc::new(FakeEncoder::new(&[
            ("240p", Script::Succeed(vec![1.0, 5.0, 3.0, 5.0, 8.0, 7.0])),
            ("480p", Script::ExitWith(vec![4.0, 2.0, 6.0], 1)),
        ]));
        let orch = orchestrator(&h, encoder, Ok(10.0), &["240p", "480p"]);
        let mut reporter = TaskReporter::new(h.backend.clone(), "job-1");

        orch.run(&h.job, &mut reporter).await.unwrap();

        let payloads = h.backend.progress_payloads();
        for name in ["240p", "480p"] {
            let mut last = 0u8;
            for snapshot in &payloads {
                let p = snapshot.get(name).unwrap();
                assert!(p.percent >= last, "{} went from {} to {}", name, last, p.percent);
                last = p.percent;
            }
        }

        // Profiles are published in table order: 480p never runs before 240p is terminal
        let first_480_running = payloads
            .iter()
            .position(|t| t.get("480p").unwrap().status == ProfileStatus::Running)
            .unwrap();
        assert!(payloads[first_480_running].get("240p").unwrap().status.is_terminal());
    }
}
