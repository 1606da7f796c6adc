//! Backup executor - orchestrates one backup run.
//!
//! Drives the selector, archive builder, transfer client and notifier in a
//! fixed order:
//!
//! ```text
//! Selecting -> (NoFiles | Building) -> Uploading -> Reporting -> CleaningUp -> Done
//! ```
//!
//! A failed stage records its cause on the [`RunReport`] and skips straight to
//! reporting. Reporting and cleanup always run.

pub mod report;
pub mod workspace;

pub use report::{ArchiveOutput, RunReport, RunStage, RunVerdict};
pub use workspace::WorkingDir;

use crate::archive::{self, ArchiveSummary};
use crate::config::BackupConfig;
use crate::fs::{self as selector, CandidateFile};
use crate::notify::Notifier;
use crate::transfer::progress::{format_bytes, format_duration, ProgressObserver};
use crate::transfer::{SftpConnector, TransferClient, TransferReceipt, Uploader};
use crate::utils::errors::{BackupError, BuildError, NotifyError};
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// How often archive progress is logged while the build runs
const BUILD_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Archive file name for a run started at `started_at`
pub fn archive_file_name(prefix: &str, started_at: DateTime<Local>) -> String {
    format!("{}-{}.zip", prefix, started_at.format("%Y-%m-%d-%H-%M"))
}

/// Main backup executor
pub struct BackupExecutor {
    config: Arc<BackupConfig>,
    uploader: Arc<dyn Uploader>,
    notifier: Notifier,
    observer: Option<ProgressObserver>,
}

impl BackupExecutor {
    pub fn new(config: BackupConfig, uploader: Arc<dyn Uploader>, notifier: Notifier) -> Self {
        Self {
            config: Arc::new(config),
            uploader,
            notifier,
            observer: None,
        }
    }

    /// Executor wired to the configured SFTP remote and mail transport
    pub fn from_config(config: BackupConfig) -> Result<Self, NotifyError> {
        let notifier = Notifier::from_config(&config)?;
        let uploader = Arc::new(TransferClient::new(SftpConnector::from_config(&config.remote)));
        Ok(Self::new(config, uploader, notifier))
    }

    /// Report per-file progress of the build and the upload to `observer`
    pub fn with_progress(mut self, observer: ProgressObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Execute one backup run. Never fails: the outcome is in the report.
    pub async fn run(&self) -> RunReport {
        let source_dir = self.config.source.dir.clone();
        let mut report = RunReport::begin(&source_dir);
        info!(
            "Starting backup of {} ({})",
            source_dir.display(),
            self.config.source.policy
        );

        transition(RunStage::Selecting);
        let files = match self.select(source_dir).await {
            Ok(files) => files,
            Err(e) => {
                error!("File selection failed: {}", e);
                report.record_failure(e);
                return self.conclude(report, None).await;
            }
        };

        report.record_selection(files.len());
        if files.is_empty() {
            transition(RunStage::NoFiles);
            info!("No files to back up");
            return self.conclude(report, None).await;
        }

        let workdir = match self.prepare_workdir().await {
            Ok(workdir) => workdir,
            Err(e) => {
                error!("{}", e);
                report.record_failure(e);
                return self.conclude(report, None).await;
            }
        };

        transition(RunStage::Building);
        let archive_path = workdir
            .path()
            .join(archive_file_name(&self.config.archive.prefix, report.started_at()));

        match self.build(files, &archive_path).await {
            Ok(summary) => self.ship(summary, &mut report).await,
            Err(e) => {
                error!("Archive build failed: {}", e);
                report.record_failure(e);
            }
        }

        self.conclude(report, Some(workdir)).await
    }

    async fn select(&self, source_dir: PathBuf) -> Result<Vec<CandidateFile>, BackupError> {
        let policy = self.config.source.policy;
        tokio::task::spawn_blocking(move || selector::select(&source_dir, policy))
            .await
            .map_err(|e| BackupError::Task(e.to_string()))?
            .map_err(BackupError::from)
    }

    async fn prepare_workdir(&self) -> Result<WorkingDir, BackupError> {
        let root = self.config.work_root();
        tokio::task::spawn_blocking(move || {
            let swept = workspace::sweep_stale(&root, workspace::STALE_AFTER);
            if swept > 0 {
                info!("Swept {} stale working director(ies) under {}", swept, root.display());
            }
            WorkingDir::create(&root)
        })
        .await
        .map_err(|e| BackupError::Task(e.to_string()))?
    }

    async fn build(&self, files: Vec<CandidateFile>, archive_path: &Path) -> Result<ArchiveSummary, BuildError> {
        let job = archive::build(
            files,
            archive_path,
            &self.config.archive_options(),
            self.observer.clone(),
        );
        let written = job.counter();
        let finished = job.finished();
        tokio::pin!(finished);

        let mut ticker = tokio::time::interval(BUILD_LOG_INTERVAL);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                result = &mut finished => return result,
                _ = ticker.tick() => {
                    info!("Archiving... {} written", format_bytes(written.load(Ordering::Relaxed)));
                }
            }
        }
    }

    /// Upload a finished archive and record where it landed
    async fn ship(&self, summary: ArchiveSummary, report: &mut RunReport) {
        if summary.entries == 0 {
            transition(RunStage::NoFiles);
            info!(
                "All {} selected file(s) vanished before they could be archived, nothing to upload",
                report.files_selected()
            );
            report.record_nothing_archived();
            return;
        }

        transition(RunStage::Uploading);
        match self.upload(summary.path.clone()).await {
            Ok(receipt) => {
                report.record_output(ArchiveOutput {
                    remote_path: receipt.remote_path,
                    size: receipt.remote_size,
                    entries: summary.entries,
                });
            }
            Err(e) => {
                error!("Upload failed: {}", e);
                report.record_failure(e);
            }
        }
    }

    async fn upload(&self, archive_path: PathBuf) -> Result<TransferReceipt, BackupError> {
        let uploader = Arc::clone(&self.uploader);
        let remote_dir = self.config.remote.dir.clone();
        let observer = self.observer.clone();

        tokio::task::spawn_blocking(move || uploader.upload(&archive_path, &remote_dir, observer.as_ref()))
            .await
            .map_err(|e| BackupError::Task(e.to_string()))?
            .map_err(BackupError::from)
    }

    /// Reporting, then cleanup, then done
    async fn conclude(&self, mut report: RunReport, workdir: Option<WorkingDir>) -> RunReport {
        report.finish();

        transition(RunStage::Reporting);
        self.notifier.notify(&report).await;

        if let Some(workdir) = workdir {
            transition(RunStage::CleaningUp);
            let removal = tokio::task::spawn_blocking(move || workdir.remove()).await;
            match removal {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("{}", e),
                Err(e) => warn!("Cleanup task failed: {}", e),
            }
        }

        transition(RunStage::Done);
        let verdict = report.verdict();
        let elapsed = report
            .finished_at()
            .map(|end| (end - report.started_at()).num_seconds().max(0) as u64)
            .unwrap_or(0);
        match verdict {
            RunVerdict::Failed => error!(verdict = %verdict, "Backup run finished in {}", format_duration(elapsed)),
            _ => info!(verdict = %verdict, "Backup run finished in {}", format_duration(elapsed)),
        }
        report
    }
}

fn transition(stage: RunStage) {
    info!(stage = %stage, "Backup stage: {}", stage);
}
