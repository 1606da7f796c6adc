//! Run report - what happened during one backup run.

use crate::utils::errors::BackupError;
use chrono::{DateTime, Local};
use std::fmt;
use std::path::{Path, PathBuf};

/// Orchestrator states, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStage {
    Selecting,
    NoFiles,
    Building,
    Uploading,
    Reporting,
    CleaningUp,
    Done,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStage::Selecting => "selecting",
            RunStage::NoFiles => "no_files",
            RunStage::Building => "building",
            RunStage::Uploading => "uploading",
            RunStage::Reporting => "reporting",
            RunStage::CleaningUp => "cleaning_up",
            RunStage::Done => "done",
        };
        f.write_str(name)
    }
}

/// Outcome of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunVerdict {
    Success,
    Failed,
    NothingToBackUp,
}

impl RunVerdict {
    /// Label used in notification subjects
    pub fn label(&self) -> &'static str {
        match self {
            RunVerdict::Success => "success",
            RunVerdict::Failed => "failed",
            RunVerdict::NothingToBackUp => "no backup initiated",
        }
    }

    /// Whether the process should exit successfully
    pub fn is_success(&self) -> bool {
        !matches!(self, RunVerdict::Failed)
    }
}

impl fmt::Display for RunVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Where the archive ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveOutput {
    pub remote_path: String,
    /// Size reported by the remote after upload
    pub size: u64,
    pub entries: usize,
}

/// Created at run start, filled in per stage, consumed by the notifier
#[derive(Debug)]
pub struct RunReport {
    source_dir: PathBuf,
    started_at: DateTime<Local>,
    finished_at: Option<DateTime<Local>>,
    files_selected: usize,
    nothing_found: bool,
    output: Option<ArchiveOutput>,
    failure: Option<BackupError>,
}

impl RunReport {
    pub fn begin(source_dir: &Path) -> Self {
        Self::begin_at(source_dir, Local::now())
    }

    pub fn begin_at(source_dir: &Path, started_at: DateTime<Local>) -> Self {
        Self {
            source_dir: source_dir.to_path_buf(),
            started_at,
            finished_at: None,
            files_selected: 0,
            nothing_found: false,
            output: None,
            failure: None,
        }
    }

    pub fn record_selection(&mut self, count: usize) {
        self.files_selected = count;
        self.nothing_found = count == 0;
    }

    /// Every selected file disappeared before it reached the archive
    pub fn record_nothing_archived(&mut self) {
        self.nothing_found = true;
    }

    pub fn record_output(&mut self, output: ArchiveOutput) {
        self.output = Some(output);
    }

    /// Record the cause that ended the run. The first cause is kept.
    pub fn record_failure(&mut self, error: impl Into<BackupError>) {
        if self.failure.is_none() {
            self.failure = Some(error.into());
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Local::now());
    }

    pub fn verdict(&self) -> RunVerdict {
        if self.failure.is_some() {
            RunVerdict::Failed
        } else if self.nothing_found {
            RunVerdict::NothingToBackUp
        } else if self.output.is_some() {
            RunVerdict::Success
        } else {
            RunVerdict::Failed
        }
    }

    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Local>> {
        self.finished_at
    }

    pub fn files_selected(&self) -> usize {
        self.files_selected
    }

    pub fn output(&self) -> Option<&ArchiveOutput> {
        self.output.as_ref()
    }

    pub fn failure(&self) -> Option<&BackupError> {
        self.failure.as_ref()
    }
}
