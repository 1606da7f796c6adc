//! Zip output sink shared by concurrent appends.
//!
//! The zip format only allows one open entry at a time, so the sink holds its
//! writer behind a mutex and each append owns it for the length of one file.

use crate::fs::CandidateFile;
use crate::transfer::progress::{ProgressObserver, ThrottledProgress};
use crate::utils::errors::BuildError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Read buffer size for streaming a source file into the archive
const CHUNK_SIZE: usize = 64 * 1024;

/// Compression applied to archive entries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    #[default]
    Deflate,
    Zstd,
    Stored,
}

impl Compression {
    fn method(self) -> CompressionMethod {
        match self {
            Compression::Deflate => CompressionMethod::Deflated,
            Compression::Zstd => CompressionMethod::Zstd,
            Compression::Stored => CompressionMethod::Stored,
        }
    }

    /// Levels the zip writer accepts for this method. `None` when the method
    /// takes no level at all.
    pub fn level_range(self) -> Option<RangeInclusive<i64>> {
        match self {
            Compression::Deflate => Some(1..=9),
            Compression::Zstd => Some(1..=22),
            Compression::Stored => None,
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Compression::Deflate => write!(f, "deflate"),
            Compression::Zstd => write!(f, "zstd"),
            Compression::Stored => write!(f, "stored"),
        }
    }
}

/// How a problem reported while appending a file is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkIssue {
    /// The file disappeared between selection and append. Warn and skip.
    BenignRace,
    /// Anything else. Fails the archive.
    Fatal,
}

impl SinkIssue {
    pub fn classify(error: &io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::NotFound => SinkIssue::BenignRace,
            _ => SinkIssue::Fatal,
        }
    }
}

/// Result of a single append
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended { bytes: u64 },
    Skipped,
}

/// Write + Seek passthrough that counts every byte handed to the file
struct CountingWriter<W> {
    inner: W,
    written: Arc<AtomicU64>,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: Seek> Seek for CountingWriter<W> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

struct SinkState {
    writer: ZipWriter<CountingWriter<File>>,
    names: HashSet<String>,
}

/// The archive being written
pub struct ArchiveSink {
    path: PathBuf,
    options: SimpleFileOptions,
    state: Mutex<SinkState>,
}

impl ArchiveSink {
    /// Create the archive file at `path`. `written` receives the byte count.
    pub fn create(
        path: &Path,
        compression: Compression,
        compression_level: Option<i64>,
        written: Arc<AtomicU64>,
    ) -> Result<Self, BuildError> {
        let file = File::create(path).map_err(|source| BuildError::Create {
            path: path.to_path_buf(),
            source,
        })?;
        let writer = ZipWriter::new(CountingWriter {
            inner: file,
            written,
        });
        let options = SimpleFileOptions::default()
            .compression_method(compression.method())
            .compression_level(compression_level);

        Ok(Self {
            path: path.to_path_buf(),
            options,
            state: Mutex::new(SinkState {
                writer,
                names: HashSet::new(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stream one file into the archive under its base name.
    ///
    /// Blocks while another append holds the writer.
    pub fn append(
        &self,
        file: &CandidateFile,
        observer: Option<&ProgressObserver>,
    ) -> Result<AppendOutcome, BuildError> {
        let name = file.file_name();
        let read_failed = |source: io::Error| BuildError::Read {
            file: file.path.clone(),
            source,
        };
        let sink_failed = |message: String| BuildError::Sink {
            file: file.path.clone(),
            message,
        };

        let mut source = match File::open(&file.path) {
            Ok(source) => source,
            Err(e) => match SinkIssue::classify(&e) {
                SinkIssue::BenignRace => {
                    warn!("{} vanished before it could be archived, skipping", file.path.display());
                    return Ok(AppendOutcome::Skipped);
                }
                SinkIssue::Fatal => return Err(read_failed(e)),
            },
        };
        let total = source.metadata().map(|m| m.len()).unwrap_or(file.size);

        let mut state = self
            .state
            .lock()
            .map_err(|_| sink_failed("archive writer lock poisoned".to_string()))?;

        if !state.names.insert(name.clone()) {
            warn!(
                "An entry named {} is already in the archive, skipping {}",
                name,
                file.path.display()
            );
            return Ok(AppendOutcome::Skipped);
        }

        let options = self.options.large_file(total >= u32::MAX as u64);
        state
            .writer
            .start_file(name.as_str(), options)
            .map_err(|e| sink_failed(e.to_string()))?;

        let mut progress = ThrottledProgress::new(name.clone(), total, observer.cloned());
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut copied = 0u64;

        loop {
            let n = match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(read_failed(e)),
            };
            state
                .writer
                .write_all(&buf[..n])
                .map_err(|e| sink_failed(e.to_string()))?;
            copied += n as u64;
            progress.advance(copied);
        }
        progress.finish(copied);

        debug!("Appended {} ({} bytes)", name, copied);
        Ok(AppendOutcome::Appended { bytes: copied })
    }

    /// Write the central directory, flush and fsync. Returns the archive size.
    pub fn finish(self) -> Result<u64, BuildError> {
        let path = self.path;
        let finalize_failed = |message: String| BuildError::Finalize {
            path: path.clone(),
            message,
        };

        let state = self
            .state
            .into_inner()
            .map_err(|_| finalize_failed("archive writer lock poisoned".to_string()))?;
        let mut counting = state
            .writer
            .finish()
            .map_err(|e| finalize_failed(e.to_string()))?;
        counting.flush().map_err(|e| finalize_failed(e.to_string()))?;

        let file = counting.inner;
        file.sync_all().map_err(|e| finalize_failed(e.to_string()))?;
        let size = file
            .metadata()
            .map_err(|e| finalize_failed(e.to_string()))?
            .len();

        Ok(size)
    }
}
