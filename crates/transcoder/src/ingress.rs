use std::fs;
use std::path::{Path, PathBuf};
use log::info;
use thiserror::Error;
use uuid::Uuid;
use crate::config::TranscodeConfig;
use crate::job::{JobRecord, JobStore};
use crate::worker::Submission;

#[derive(Debug, Error)]
pub enum IngressError {
    #[error("no file name given")]
    EmptyFilename,
    #[error("unsupported file type: {filename} (allowed: {allowed})")]
    UnsupportedExtension { filename: String, allowed: String },
    #[error("source file not found: {0}")]
    SourceMissing(PathBuf),
    #[error("failed to store upload at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to record job: {0}")]
    Store(#[source] anyhow::Error),
}

/// An accepted upload: the stored file and the submission to enqueue
#[derive(Debug, Clone)]
pub struct Accepted {
    pub task_id: String,
    pub filename: String,
    pub stored_path: PathBuf,
}

impl Accepted {
    pub fn submission(&self) -> Submission {
        Submission::new(self.task_id.clone(), self.stored_path.clone(), self.filename.clone())
    }
}

/// Check `filename` against the configured extension allow-list (case-insensitive)
pub fn validate_filename(filename: &str, allowed: &[String]) -> Result<(), IngressError> {
    if filename.trim().is_empty() {
        return Err(IngressError::EmptyFilename);
    }

    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    let ok = ext
        .as_deref()
        .map(|ext| allowed.iter().any(|a| a.trim_start_matches('.').eq_ignore_ascii_case(ext)))
        .unwrap_or(false);

    if ok {
        Ok(())
    } else {
        Err(IngressError::UnsupportedExtension {
            filename: filename.to_string(),
            allowed: allowed.join(", "),
        })
    }
}

/// Accepts media files into the upload area and records their jobs
pub struct Ingress<'a> {
    cfg: &'a TranscodeConfig,
    jobs: &'a dyn JobStore,
}

impl<'a> Ingress<'a> {
    pub fn new(cfg: &'a TranscodeConfig, jobs: &'a dyn JobStore) -> Self {
        Self { cfg, jobs }
    }

    /// Copy `source` into the upload directory as `<task_id>_<filename>` and
    /// create its job record. With `remove_source`, the original is deleted
    /// once the copy is in place.
    pub fn accept_file(&self, source: &Path, remove_source: bool) -> Result<Accepted, IngressError> {
        let filename = source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        validate_filename(&filename, &self.cfg.allowed_extensions)?;
        if !source.is_file() {
            return Err(IngressError::SourceMissing(source.to_path_buf()));
        }

        let task_id = Uuid::new_v4().to_string();
        fs::create_dir_all(&self.cfg.upload_dir).map_err(|e| IngressError::Io {
            path: self.cfg.upload_dir.clone(),
            source: e,
        })?;
        let stored_path = self.cfg.upload_dir.join(format!("{}_{}", task_id, filename));
        fs::copy(source, &stored_path).map_err(|e| IngressError::Io {
            path: stored_path.clone(),
            source: e,
        })?;

        self.jobs
            .create(JobRecord::new(&task_id, &filename))
            .map_err(IngressError::Store)?;

        if remove_source {
            fs::remove_file(source).map_err(|e| IngressError::Io {
                path: source.to_path_buf(),
                source: e,
            })?;
        }

        info!("Accepted {} as job {}", filename, task_id);
        Ok(Accepted {
            task_id,
            filename,
            stored_path,
        })
    }
}
