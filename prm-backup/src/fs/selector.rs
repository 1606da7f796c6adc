//! Source directory listing with an inclusion policy.
//!
//! Only the top level of the source directory is considered: subdirectories
//! are logged and skipped, never descended into. A single entry that cannot
//! be stat'ed is skipped as well; only an unreadable source directory fails
//! the selection.

use crate::utils::errors::SelectError;
use chrono::{DateTime, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

/// Which regular files of the source directory are backed up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Every regular file
    #[default]
    All,

    /// Files whose modification date is the current local date
    ModifiedToday,
}

impl SelectionPolicy {
    /// Decide whether `file` is included when the local date is `today`
    pub fn admits(&self, file: &CandidateFile, today: NaiveDate) -> bool {
        match self {
            SelectionPolicy::All => true,
            SelectionPolicy::ModifiedToday => {
                DateTime::<Local>::from(file.modified).date_naive() == today
            }
        }
    }
}

impl std::fmt::Display for SelectionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectionPolicy::All => write!(f, "all files"),
            SelectionPolicy::ModifiedToday => write!(f, "modified today"),
        }
    }
}

/// A regular file discovered in the source directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFile {
    /// Full path to the file
    pub path: PathBuf,

    /// File size in bytes at selection time
    pub size: u64,

    /// Last modification time
    pub modified: SystemTime,
}

impl CandidateFile {
    /// Base name used as the archive entry name
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.to_string_lossy().into_owned())
    }

    /// Build a candidate from a directory entry.
    ///
    /// Symlinks are resolved to their target. Returns `None` for directories
    /// (including symlinks to directories) and for special files.
    fn from_entry(entry: &DirEntry) -> Result<Option<Self>, SelectError> {
        let path = entry.path().to_path_buf();
        let stat_failed = |source: std::io::Error| SelectError::StatFailed {
            path: path.clone(),
            source,
        };

        let metadata = if entry.path_is_symlink() {
            std::fs::metadata(&path).map_err(stat_failed)?
        } else {
            entry.metadata().map_err(|e| stat_failed(e.into()))?
        };

        if metadata.is_dir() {
            info!("Skipping directory {}", path.display());
            return Ok(None);
        }
        if !metadata.is_file() {
            debug!("Skipping special file {}", path.display());
            return Ok(None);
        }

        let modified = metadata.modified().map_err(stat_failed)?;

        Ok(Some(Self {
            path,
            size: metadata.len(),
            modified,
        }))
    }
}

/// List the candidate files of `source_dir` that `policy` admits today.
///
/// # Returns
/// * `Ok(Vec<CandidateFile>)` - Admitted files sorted by name; empty when nothing qualifies
/// * `Err(SelectError::DirectoryNotFound)` - If the directory is missing or unreadable
pub fn select(source_dir: &Path, policy: SelectionPolicy) -> Result<Vec<CandidateFile>, SelectError> {
    select_as_of(source_dir, policy, Local::now().date_naive())
}

/// Same as [`select`] with an explicit "today" for the policy check
pub fn select_as_of(
    source_dir: &Path,
    policy: SelectionPolicy,
    today: NaiveDate,
) -> Result<Vec<CandidateFile>, SelectError> {
    let not_found = |reason: String| SelectError::DirectoryNotFound {
        path: source_dir.to_path_buf(),
        reason,
    };

    let metadata = std::fs::metadata(source_dir).map_err(|e| not_found(e.to_string()))?;
    if !metadata.is_dir() {
        return Err(not_found("not a directory".to_string()));
    }

    let walker = WalkDir::new(source_dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
        .sort_by_file_name();

    let mut files = Vec::new();
    let mut excluded = 0usize;
    let mut skipped = 0usize;

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            // Depth 0 means the directory itself could not be read
            Err(e) if e.depth() == 0 => return Err(not_found(e.to_string())),
            Err(e) => {
                let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                warn!(
                    "{}",
                    SelectError::StatFailed {
                        path,
                        source: e.into(),
                    }
                );
                skipped += 1;
                continue;
            }
        };

        match CandidateFile::from_entry(&entry) {
            Ok(Some(candidate)) => {
                if policy.admits(&candidate, today) {
                    files.push(candidate);
                } else {
                    debug!("Excluded by policy ({}): {}", policy, candidate.path.display());
                    excluded += 1;
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!("{}", e);
                skipped += 1;
            }
        }
    }

    info!(
        "Selected {} file(s) from {} ({}; {} excluded, {} unreadable)",
        files.len(),
        source_dir.display(),
        policy,
        excluded,
        skipped
    );

    Ok(files)
}
