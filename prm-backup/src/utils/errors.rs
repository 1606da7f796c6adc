//! Error types for the backup pipeline.
//!
//! Each stage has its own error enum; [`BackupError`] wraps whichever one
//! ended the run and is what the run report carries.

use std::path::PathBuf;
use thiserror::Error;

/// Configuration could not be loaded or failed validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid value for {0}: must be present and non-empty")]
    MissingField(&'static str),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// File selection errors.
#[derive(Error, Debug)]
pub enum SelectError {
    /// The source directory itself is missing or unreadable. Fatal to the run.
    #[error("Unable to find directory {path}: {reason}")]
    DirectoryNotFound { path: PathBuf, reason: String },

    /// A single entry could not be stat'ed. Logged and skipped by the selector.
    #[error("Failed to stat {path}: {source}")]
    StatFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Archive build errors. All of them are fatal to the archive.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Failed to read {file}: {source}")]
    Read {
        file: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create archive {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Archive write failed while appending {file}: {message}")]
    Sink { file: PathBuf, message: String },

    #[error("Failed to finalize archive {path}: {message}")]
    Finalize { path: PathBuf, message: String },

    #[error("Archive task failed: {0}")]
    Task(String),
}

/// Remote transfer errors.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Failed to connect to {endpoint}: {message}")]
    ConnectFailed { endpoint: String, message: String },

    #[error("Upload to {remote_path} failed{}: {message}", transferred_suffix(.bytes_transferred))]
    UploadFailed {
        remote_path: String,
        bytes_transferred: Option<u64>,
        message: String,
    },

    #[error("Failed to verify {remote_path}: {message}")]
    VerifyFailed { remote_path: String, message: String },

    /// Session teardown failed. Only ever logged; never the outcome of an upload.
    #[error("Failed to close session with {endpoint}: {message}")]
    TeardownFailed { endpoint: String, message: String },
}

fn transferred_suffix(bytes: &Option<u64>) -> String {
    match bytes {
        Some(bytes) => format!(" after {} bytes", bytes),
        None => String::new(),
    }
}

/// Notification delivery errors. Logged by the notifier, never escalated.
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Failed to set up mail transport: {0}")]
    Setup(String),

    #[error("Failed to deliver notification to {recipient}: {message}")]
    Delivery { recipient: String, message: String },

    #[error("Mail API rejected notification to {recipient} with status {status}: {body}")]
    Rejected {
        recipient: String,
        status: u16,
        body: String,
    },
}

/// Working directory removal failed. Logged only.
#[derive(Error, Debug)]
#[error("Failed to remove working directory {path}: {source}")]
pub struct CleanupError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// The cause that ended a run with a failure verdict.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    ConfigInvalid(#[from] ConfigError),

    #[error(transparent)]
    Select(#[from] SelectError),

    #[error("Archive build failed: {0}")]
    BuildFailed(#[from] BuildError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("Failed to prepare working directory {path}: {source}")]
    WorkingDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Background task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_failed_reports_transferred_bytes() {
        let err = TransferError::UploadFailed {
            remote_path: "/backups/a.zip".to_string(),
            bytes_transferred: Some(4096),
            message: "connection reset".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Upload to /backups/a.zip failed after 4096 bytes: connection reset"
        );

        let err = TransferError::UploadFailed {
            remote_path: "/backups/a.zip".to_string(),
            bytes_transferred: None,
            message: "connection reset".to_string(),
        };
        assert_eq!(err.to_string(), "Upload to /backups/a.zip failed: connection reset");
    }

    #[test]
    fn test_build_error_names_file() {
        let err = BackupError::from(BuildError::Read {
            file: PathBuf::from("/data/report.csv"),
            source: std::io::Error::new(std::io::ErrorKind::Other, "bad sector"),
        });
        let message = err.to_string();
        assert!(message.starts_with("Archive build failed"));
        assert!(message.contains("/data/report.csv"));
    }
}
