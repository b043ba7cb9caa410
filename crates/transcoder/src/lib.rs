pub mod config;
pub mod profile;
pub mod progress;
pub mod ffprobe;
pub mod encoder;
pub mod error;
pub mod tracker;
pub mod job;
pub mod task;
pub mod orchestrator;
pub mod worker;
pub mod status;
pub mod ingress;
pub mod delivery;

pub use config::TranscodeConfig;
pub use profile::ResolutionProfile;
pub use error::{EncodeError, ProbeError, TrackerError, TranscodeError};
pub use tracker::{JobProgressTracker, OverallStatus, ProfileProgress, ProfileStatus};
pub use job::{FinalStatus, Job, JobFailure, JobRecord, JobResult, JobStore};
pub use task::{TaskBackend, TaskReporter, TaskState};
pub use orchestrator::Orchestrator;
pub use worker::{Submission, WorkerPool};
pub use status::{ProjectionError, StatusProjector, StatusView};
