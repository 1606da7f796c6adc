//! Per-run working directories.
//!
//! Every run writes its archive into `<root>/run-<uuid>`. The directory is
//! removed at the end of the run. Leftovers from crashed runs are swept by a
//! later run once nothing in them has changed for [`STALE_AFTER`], so runs
//! sharing a root never remove each other's directories.

use crate::utils::errors::{BackupError, CleanupError};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use uuid::Uuid;

const RUN_DIR_PREFIX: &str = "run-";

/// A run directory untouched for this long belongs to a run that is gone
pub const STALE_AFTER: Duration = Duration::from_secs(12 * 60 * 60);

/// A working directory owned by one run
#[derive(Debug)]
pub struct WorkingDir {
    path: PathBuf,
}

impl WorkingDir {
    /// Create a fresh `run-<uuid>` directory under `root`
    pub fn create(root: &Path) -> Result<Self, BackupError> {
        let failed = |path: &Path, source: std::io::Error| BackupError::WorkingDirectory {
            path: path.to_path_buf(),
            source,
        };

        std::fs::create_dir_all(root).map_err(|e| failed(root, e))?;
        let path = root.join(format!("{}{}", RUN_DIR_PREFIX, Uuid::new_v4()));
        std::fs::create_dir(&path).map_err(|e| failed(&path, e))?;

        debug!("Created working directory {}", path.display());
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the directory and everything in it
    pub fn remove(self) -> Result<(), CleanupError> {
        std::fs::remove_dir_all(&self.path).map_err(|source| CleanupError {
            path: self.path.clone(),
            source,
        })?;
        info!("Removed working directory {}", self.path.display());
        Ok(())
    }
}

/// Remove `run-*` directories under `root` whose newest modification is
/// older than `older_than`. Returns how many were removed.
pub fn sweep_stale(root: &Path, older_than: Duration) -> usize {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
        Err(e) => {
            warn!("Cannot scan {} for stale working directories: {}", root.display(), e);
            return 0;
        }
    };

    let now = SystemTime::now();
    let mut removed = 0;
    for entry in entries.flatten() {
        let is_run_dir = entry.file_name().to_string_lossy().starts_with(RUN_DIR_PREFIX)
            && entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if !is_run_dir {
            continue;
        }

        let path = entry.path();
        let Some(last_touched) = last_modified(&path) else {
            continue;
        };
        // Clock skew makes a future timestamp look fresh
        let idle = now.duration_since(last_touched).unwrap_or(Duration::ZERO);
        if idle < older_than {
            debug!("Working directory {} is in use, leaving it", path.display());
            continue;
        }

        match std::fs::remove_dir_all(&path) {
            Ok(()) => {
                warn!("Removed stale working directory {}", path.display());
                removed += 1;
            }
            Err(source) => warn!("{}", CleanupError { path, source }),
        }
    }

    removed
}

/// Newest mtime of a run directory and its direct entries
fn last_modified(dir: &Path) -> Option<SystemTime> {
    let mut newest = std::fs::metadata(dir).and_then(|m| m.modified()).ok()?;
    if let Ok(entries) = std::fs::read_dir(dir) {
        for modified in entries
            .flatten()
            .filter_map(|e| e.metadata().and_then(|m| m.modified()).ok())
        {
            newest = newest.max(modified);
        }
    }
    Some(newest)
}
