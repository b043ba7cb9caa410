use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use log::{debug, info, warn};
use walkdir::WalkDir;

/// Files modified more recently than this may still be being written
const SETTLE_TIME: Duration = Duration::from_secs(2);

/// Result of scanning one inbox file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanResult {
    /// File is ready to ingest (path, size in bytes)
    Candidate(PathBuf, u64),
    /// File is left alone this round (path, reason)
    Skipped(PathBuf, String),
}

/// Walk `inbox` for media files with an allowed extension.
/// A missing inbox is not an error; it just yields nothing.
pub fn scan_inbox(inbox: &Path, allowed_extensions: &[String]) -> Vec<ScanResult> {
    let mut results = Vec::new();
    if !inbox.exists() {
        warn!("Inbox does not exist: {}", inbox.display());
        return results;
    }

    debug!("Scanning inbox: {}", inbox.display());
    let now = SystemTime::now();

    for entry in WalkDir::new(inbox).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Error reading inbox entry: {}", e);
                continue;
            }
        };

        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if name.starts_with('.') {
            continue;
        }

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        if !allowed_extensions.iter().any(|a| a.eq_ignore_ascii_case(&ext)) {
            results.push(ScanResult::Skipped(
                path.to_path_buf(),
                format!("unsupported extension: {:?}", ext),
            ));
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!("Failed to stat {}: {}", path.display(), e);
                continue;
            }
        };

        let settled = metadata
            .modified()
            .ok()
            .and_then(|mtime| now.duration_since(mtime).ok())
            .map(|age| age >= SETTLE_TIME)
            .unwrap_or(true);
        if !settled {
            results.push(ScanResult::Skipped(path.to_path_buf(), "still being written".to_string()));
            continue;
        }

        results.push(ScanResult::Candidate(path.to_path_buf(), metadata.len()));
    }

    let candidates = results
        .iter()
        .filter(|r| matches!(r, ScanResult::Candidate(_, _)))
        .count();
    if candidates > 0 {
        info!("Inbox scan found {} candidate(s) in {}", candidates, inbox.display());
    }
    results
}
