//! Request-scoped upload files and result retention.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use uuid::Uuid;

const RESULT_PREFIX: &str = "swapped_face_";
const RESULT_EXTENSION: &str = "jpg";
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(300);
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Uploads saved for one request. Every tracked file is removed on drop.
#[derive(Debug, Default)]
pub struct UploadGuard {
    paths: Vec<PathBuf>,
}

impl UploadGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Persist `bytes` as `<dir>/<prefix>_<hex>.jpg` and track the file.
    pub async fn save(&mut self, dir: &Path, prefix: &str, bytes: &[u8]) -> io::Result<PathBuf> {
        tokio::fs::create_dir_all(dir).await?;
        let path = upload_path(dir, prefix);
        // Tracked before writing so a partial file is still cleaned up.
        self.paths.push(path.clone());
        tokio::fs::write(&path, bytes).await?;
        tracing::debug!(path = %path.display(), bytes = bytes.len(), "upload saved");
        Ok(path)
    }
}

impl Drop for UploadGuard {
    fn drop(&mut self) {
        for path in &self.paths {
            match std::fs::remove_file(path) {
                Ok(()) => tracing::debug!(path = %path.display(), "upload removed"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove upload"),
            }
        }
    }
}

/// Unique upload path: `<dir>/<prefix>_<uuid4 hex>.jpg`.
pub fn upload_path(dir: &Path, prefix: &str) -> PathBuf {
    dir.join(format!("{prefix}_{}.jpg", Uuid::new_v4().simple()))
}

/// Delete result images in `dir` last modified more than `max_age` before `now`.
/// Returns how many files were removed.
pub fn sweep_results(dir: &Path, max_age: Duration, now: SystemTime) -> io::Result<usize> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !is_result_file(&path) {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        let age = now.duration_since(modified).unwrap_or_default();
        if age > max_age {
            std::fs::remove_file(&path)?;
            tracing::debug!(path = %path.display(), age_secs = age.as_secs(), "expired result removed");
            removed += 1;
        }
    }
    Ok(removed)
}

fn is_result_file(path: &Path) -> bool {
    let name_matches = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(RESULT_PREFIX));
    let ext_matches = path.extension().and_then(|e| e.to_str()) == Some(RESULT_EXTENSION);
    name_matches && ext_matches && path.is_file()
}

/// Periodically sweep expired results. Returns `None` when retention is disabled.
pub fn spawn_result_sweeper(dir: PathBuf, retention: Duration) -> Option<tokio::task::JoinHandle<()>> {
    if retention.is_zero() {
        return None;
    }
    let period = (retention / 2).clamp(MIN_SWEEP_INTERVAL, MAX_SWEEP_INTERVAL);
    tracing::info!(dir = %dir.display(), retention_secs = retention.as_secs(), "result sweeper enabled");

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let dir = dir.clone();
            let swept = tokio::task::spawn_blocking(move || sweep_results(&dir, retention, SystemTime::now())).await;
            match swept {
                Ok(Ok(0)) => {}
                Ok(Ok(n)) => tracing::info!(removed = n, "expired results swept"),
                Ok(Err(e)) => tracing::warn!(error = %e, "result sweep failed"),
                Err(e) => tracing::warn!(error = %e, "result sweep task failed"),
            }
        }
    }))
}
