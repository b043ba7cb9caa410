use std::path::{Path, PathBuf};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the transcoding workers and their collaborators
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeConfig {
    /// Directory where ingested source files are stored
    pub upload_dir: PathBuf,
    /// Directory where per-profile outputs are written
    pub output_dir: PathBuf,
    /// Directory holding job metadata and task state JSON files
    pub state_dir: PathBuf,
    /// Directory scanned by `streamscaled serve` for new media files
    pub inbox_dir: PathBuf,
    /// Path to ffmpeg binary
    pub ffmpeg_bin: PathBuf,
    /// Path to ffprobe binary
    pub ffprobe_bin: PathBuf,
    /// Number of worker executors pulling jobs from the queue
    pub workers: usize,
    /// Hard limit for a single job's orchestration run, in seconds
    pub job_time_limit_secs: u64,
    /// Container extension of produced outputs (without dot)
    pub container_ext: String,
    /// ffmpeg video encoder used for every profile
    pub video_codec: String,
    /// Encoder preset
    pub preset: String,
    /// Constant rate factor
    pub crf: u8,
    /// File extensions accepted by ingress (without dot, lowercase)
    pub allowed_extensions: Vec<String>,
    /// Interval in seconds between inbox scans
    pub scan_interval_secs: u64,
    /// URL prefix used when building download references
    pub download_url_base: String,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl TranscodeConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            upload_dir: PathBuf::from("/data/uploads"),
            output_dir: PathBuf::from("/data/processed"),
            state_dir: PathBuf::from("/data/state"),
            inbox_dir: PathBuf::from("/data/inbox"),
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            workers: 4,
            job_time_limit_secs: 30 * 60,
            container_ext: "mp4".to_string(),
            video_codec: "libx264".to_string(),
            preset: "veryfast".to_string(),
            crf: 23,
            allowed_extensions: vec!["mp4".to_string(), "mkv".to_string(), "mov".to_string()],
            scan_interval_secs: 10,
            download_url_base: "/api/v1/download".to_string(),
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist.
    /// Environment overrides are applied last.
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                config = Self::parse(&content, config_path)?;
            }
        }

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn parse(content: &str, config_path: &Path) -> Result<Self> {
        // TOML by extension, JSON otherwise
        if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
            toml::from_str(content)
                .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))
        } else {
            serde_json::from_str(content)
                .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))
        }
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(bin) = std::env::var("STREAMSCALE_FFMPEG_BIN") {
            self.ffmpeg_bin = PathBuf::from(bin);
        }
        if let Ok(bin) = std::env::var("STREAMSCALE_FFPROBE_BIN") {
            self.ffprobe_bin = PathBuf::from(bin);
        }
        if let Ok(workers) = std::env::var("STREAMSCALE_WORKERS") {
            self.workers = workers
                .trim()
                .parse()
                .with_context(|| format!("Invalid STREAMSCALE_WORKERS value: {}", workers))?;
        }
        Ok(())
    }

    /// Reject configurations the workers cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        if self.container_ext.trim().is_empty() {
            bail!("container_ext must not be empty");
        }
        Ok(())
    }

    /// Directory holding job metadata records
    pub fn jobs_dir(&self) -> PathBuf {
        self.state_dir.join("jobs")
    }

    /// Directory holding task state records
    pub fn tasks_dir(&self) -> PathBuf {
        self.state_dir.join("tasks")
    }

    /// Well-known output location for one profile of one job
    pub fn output_path(&self, job_id: &str, profile_name: &str) -> PathBuf {
        self.output_dir
            .join(output_file_name(job_id, profile_name, &self.container_ext))
    }
}

/// `<job_id>_<profile>.<ext>`
pub fn output_file_name(job_id: &str, profile_name: &str, container_ext: &str) -> String {
    format!("{}_{}.{}", job_id, profile_name, container_ext)
}
