//! Archive builder - streams the selected files into one zip container.
//!
//! Appends run concurrently, bounded by a semaphore. The archive is finalized
//! only once every append has returned, and the outcome is delivered through
//! a one-shot completion signal on the [`ArchiveJob`].

pub mod sink;

pub use sink::{AppendOutcome, ArchiveSink, Compression, SinkIssue};

use crate::fs::CandidateFile;
use crate::transfer::progress::{format_bytes, ProgressObserver};
use crate::utils::errors::BuildError;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Default cap on in-flight file reads
pub const DEFAULT_MAX_CONCURRENT_FILES: usize = 8;

/// Archive build settings
#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    pub compression: Compression,
    pub compression_level: Option<i64>,
    pub max_concurrent_files: usize,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            compression: Compression::default(),
            compression_level: None,
            max_concurrent_files: DEFAULT_MAX_CONCURRENT_FILES,
        }
    }
}

/// A finalized archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub path: PathBuf,
    /// Entries written to the archive
    pub entries: usize,
    /// Candidates that vanished or collided by name
    pub skipped: usize,
    /// Uncompressed bytes appended
    pub source_bytes: u64,
    /// Size of the archive file
    pub size: u64,
}

/// An archive under construction
pub struct ArchiveJob {
    path: PathBuf,
    bytes_written: Arc<AtomicU64>,
    completion: oneshot::Receiver<Result<ArchiveSummary, BuildError>>,
}

impl ArchiveJob {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Shared handle on the bytes-written counter, usable after [`finished`](Self::finished)
    pub fn counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.bytes_written)
    }

    /// Wait for the archive to be finalized or to fail
    pub async fn finished(self) -> Result<ArchiveSummary, BuildError> {
        match self.completion.await {
            Ok(result) => result,
            Err(_) => Err(BuildError::Task(
                "archive task ended without signalling completion".to_string(),
            )),
        }
    }
}

/// Start building an archive of `files` at `destination`.
///
/// Must be called from within a tokio runtime.
pub fn build(
    files: Vec<CandidateFile>,
    destination: &Path,
    options: &ArchiveOptions,
    observer: Option<ProgressObserver>,
) -> ArchiveJob {
    let (tx, rx) = oneshot::channel();
    let bytes_written = Arc::new(AtomicU64::new(0));

    let path = destination.to_path_buf();
    let counter = Arc::clone(&bytes_written);
    let options = options.clone();

    tokio::spawn(async move {
        let result = assemble(files, path, options, observer, counter).await;
        if let Err(e) = &result {
            error!("Archive build failed: {}", e);
        }
        // The receiver may already be gone; nobody is left to tell.
        let _ = tx.send(result);
    });

    ArchiveJob {
        path: destination.to_path_buf(),
        bytes_written,
        completion: rx,
    }
}

async fn assemble(
    files: Vec<CandidateFile>,
    path: PathBuf,
    options: ArchiveOptions,
    observer: Option<ProgressObserver>,
    bytes_written: Arc<AtomicU64>,
) -> Result<ArchiveSummary, BuildError> {
    let total_files = files.len();
    let total_bytes: u64 = files.iter().map(|f| f.size).sum();
    let concurrency = options.max_concurrent_files.max(1);

    info!(
        "Archiving {} file(s), {} into {} (concurrency: {})",
        total_files,
        format_bytes(total_bytes),
        path.display(),
        concurrency
    );

    let sink = {
        let path = path.clone();
        let counter = Arc::clone(&bytes_written);
        tokio::task::spawn_blocking(move || {
            ArchiveSink::create(&path, options.compression, options.compression_level, counter)
        })
        .await
        .map_err(|e| BuildError::Task(e.to_string()))??
    };
    let sink = Arc::new(sink);

    let semaphore = Arc::new(Semaphore::new(concurrency));
    let failed = Arc::new(AtomicBool::new(false));
    let mut tasks = JoinSet::new();

    for file in files {
        let sink = Arc::clone(&sink);
        let semaphore = Arc::clone(&semaphore);
        let failed = Arc::clone(&failed);
        let observer = observer.clone();

        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| BuildError::Task(format!("Semaphore closed: {}", e)))?;

            // Another append already failed; the archive will be discarded
            if failed.load(Ordering::Acquire) {
                return Ok(None);
            }

            let result = tokio::task::spawn_blocking(move || sink.append(&file, observer.as_ref()))
                .await
                .map_err(|e| BuildError::Task(e.to_string()))
                .and_then(|r| r);

            if result.is_err() {
                failed.store(true, Ordering::Release);
            }
            result.map(Some)
        });
    }

    // Fan-in: every append must have returned before finalize or failure
    let mut first_error: Option<BuildError> = None;
    let mut entries = 0usize;
    let mut skipped = 0usize;
    let mut source_bytes = 0u64;

    while let Some(joined) = tasks.join_next().await {
        let outcome = joined.map_err(|e| BuildError::Task(e.to_string())).and_then(|r| r);
        match outcome {
            Ok(Some(AppendOutcome::Appended { bytes })) => {
                entries += 1;
                source_bytes += bytes;
            }
            Ok(Some(AppendOutcome::Skipped)) => skipped += 1,
            Ok(None) => {}
            Err(e) => {
                failed.store(true, Ordering::Release);
                if first_error.is_none() {
                    first_error = Some(e);
                } else {
                    warn!("Additional archive error: {}", e);
                }
            }
        }
    }

    if let Some(e) = first_error {
        return Err(e);
    }

    let sink = Arc::try_unwrap(sink)
        .map_err(|_| BuildError::Task("archive sink still in use at finalize".to_string()))?;
    let size = tokio::task::spawn_blocking(move || sink.finish())
        .await
        .map_err(|e| BuildError::Task(e.to_string()))??;

    info!(
        "Archive finalized: {} ({} entries, {} skipped, {} -> {})",
        path.display(),
        entries,
        skipped,
        format_bytes(source_bytes),
        format_bytes(size)
    );

    Ok(ArchiveSummary {
        path,
        entries,
        skipped,
        source_bytes,
        size,
    })
}
