use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use crate::tracker::{JobProgressTracker, ProfileStatus};

/// Duration probing failures. Advisory only: callers fall back to a default.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to run ffprobe at {bin}: {source}")]
    Spawn {
        bin: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("ffprobe exited with code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },
    #[error("unparsable ffprobe output: {0}")]
    Unparsable(String),
    #[error("ffprobe reported no container duration")]
    MissingDuration,
}

/// Failure of one encoder invocation for one profile
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("failed to spawn encoder at {bin}: {source}")]
    Spawn {
        bin: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encoder exited with code {}: {tail}", code.map(|c| c.to_string()).unwrap_or_else(|| "none (killed by signal)".to_string()))]
    NonZeroExit { code: Option<i32>, tail: String },
    #[error("encoder I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to prepare output {path}: {reason}")]
    Output { path: PathBuf, reason: String },
}

/// Invalid use of the job progress tracker
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrackerError {
    #[error("unknown profile: {0}")]
    UnknownProfile(String),
    #[error("profile {profile}: invalid transition {from:?} -> {to:?}")]
    InvalidTransition {
        profile: String,
        from: ProfileStatus,
        to: ProfileStatus,
    },
    #[error("profile {profile} is {status:?}, progress updates need RUNNING")]
    NotRunning {
        profile: String,
        status: ProfileStatus,
    },
}

/// Outcome of an orchestration run that did not produce a job result.
///
/// `FatalPrecondition` and `AllProfilesFailed` are job-level failures that end
/// up in the FAILURE payload. `ProfileFailure` never escapes the orchestrator:
/// it is recorded on the failing profile and the job moves on.
#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("{reason}")]
    FatalPrecondition {
        reason: String,
        tasks: JobProgressTracker,
    },
    #[error("profile {profile} failed: {source}")]
    ProfileFailure {
        profile: String,
        #[source]
        source: EncodeError,
    },
    #[error("{message}")]
    AllProfilesFailed {
        message: String,
        tasks: JobProgressTracker,
    },
    #[error("job exceeded time limit of {limit:?}")]
    TimeLimitExceeded {
        limit: Duration,
        tasks: Option<JobProgressTracker>,
    },
    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

impl TranscodeError {
    /// Tracker snapshot attached to a job-level failure, if any
    pub fn tasks(&self) -> Option<&JobProgressTracker> {
        match self {
            TranscodeError::FatalPrecondition { tasks, .. }
            | TranscodeError::AllProfilesFailed { tasks, .. } => Some(tasks),
            TranscodeError::TimeLimitExceeded { tasks, .. } => tasks.as_ref(),
            _ => None,
        }
    }
}
