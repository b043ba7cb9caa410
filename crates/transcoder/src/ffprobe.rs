use std::path::{Path, PathBuf};
use async_trait::async_trait;
use log::{debug, warn};
use serde::Deserialize;
use tokio::process::Command;
use crate::error::ProbeError;

/// Duration used when probing fails or reports nothing usable
pub const DEFAULT_DURATION_SECS: f64 = 1.0;

/// ffprobe output restricted to the container duration
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeData {
    pub format: Option<FFProbeFormat>,
}

/// Format-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeFormat {
    /// Seconds as a decimal string, or "N/A"
    pub duration: Option<String>,
}

impl FFProbeData {
    /// Parse ffprobe's JSON output into a duration in seconds
    pub fn parse_duration(json: &str) -> Result<f64, ProbeError> {
        let data: FFProbeData = serde_json::from_str(json)
            .map_err(|e| ProbeError::Unparsable(e.to_string()))?;

        let raw = data
            .format
            .and_then(|f| f.duration)
            .ok_or(ProbeError::MissingDuration)?;

        raw.trim()
            .parse::<f64>()
            .ok()
            .filter(|d| d.is_finite())
            .ok_or_else(|| ProbeError::Unparsable(format!("duration value {:?}", raw)))
    }
}

/// Source of total media duration for a job
#[async_trait]
pub trait DurationProbe: Send + Sync {
    async fn probe_duration(&self, input: &Path) -> Result<f64, ProbeError>;
}

/// Probes container duration by running ffprobe
#[derive(Debug, Clone)]
pub struct FFProbe {
    pub ffprobe_bin: PathBuf,
}

impl FFProbe {
    pub fn new(ffprobe_bin: impl Into<PathBuf>) -> Self {
        Self {
            ffprobe_bin: ffprobe_bin.into(),
        }
    }
}

#[async_trait]
impl DurationProbe for FFProbe {
    async fn probe_duration(&self, input: &Path) -> Result<f64, ProbeError> {
        debug!("ffprobe: probing duration of {}", input.display());

        let output = Command::new(&self.ffprobe_bin)
            .arg("-v")
            .arg("error")
            .arg("-show_entries")
            .arg("format=duration")
            .arg("-of")
            .arg("json")
            .arg(input)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ProbeError::Spawn {
                bin: self.ffprobe_bin.clone(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(ProbeError::NonZeroExit {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let json_str = String::from_utf8(output.stdout)
            .map_err(|_| ProbeError::Unparsable("ffprobe output is not valid UTF-8".to_string()))?;

        FFProbeData::parse_duration(&json_str)
    }
}

/// Duration to use for percentage computation: the probed value when usable,
/// [`DEFAULT_DURATION_SECS`] otherwise.
pub fn effective_duration(probed: Result<f64, ProbeError>) -> f64 {
    match probed {
        Ok(secs) if secs.is_finite() && secs > 0.0 => secs,
        Ok(secs) => {
            debug!("ffprobe reported unusable duration {}, using default", secs);
            DEFAULT_DURATION_SECS
        }
        Err(e) => {
            warn!("Duration probe failed ({}), using default", e);
            DEFAULT_DURATION_SECS
        }
    }
}
