//! PRM backup runner library.
//!
//! Selects files from a source directory, zips them, uploads the archive
//! over SFTP and emails the outcome.

pub mod archive;
pub mod config;
pub mod executor;
pub mod fs;
pub mod notify;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::BackupConfig;
pub use executor::{BackupExecutor, RunReport, RunVerdict};
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;
