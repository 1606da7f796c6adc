//! Configuration management for the backup runner.
//!
//! Loads configuration from a JSON file (TOML when the file ends in `.toml`)
//! with environment variable overrides for secrets.

use crate::archive::{ArchiveOptions, Compression};
use crate::fs::SelectionPolicy;
use crate::utils::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Overrides `remote.password`
pub const ENV_REMOTE_PASSWORD: &str = "PRM_BACKUP_REMOTE_PASSWORD";

/// Overrides `notify.api_key`
pub const ENV_MAIL_API_KEY: &str = "PRM_BACKUP_MAIL_API_KEY";

/// Subject tag used when `notify.run_tag` is not set
pub const DEFAULT_RUN_TAG: &str = "PRM";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    pub source: SourceConfig,
    pub remote: RemoteConfig,
    pub notify: NotifyConfig,

    #[serde(default)]
    pub archive: ArchiveConfig,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Directory whose top-level files are backed up
    #[serde(default)]
    pub dir: PathBuf,

    /// Which files are included
    #[serde(default)]
    pub policy: SelectionPolicy,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub username: String,

    /// SFTP password (or set PRM_BACKUP_REMOTE_PASSWORD)
    #[serde(default)]
    pub password: String,

    /// Remote directory the archive is placed in
    #[serde(default)]
    pub dir: String,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub recipient: String,

    #[serde(default)]
    pub sender: String,

    /// Mail API key. Without one, notifications are only logged.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Mail API endpoint override
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Tag shown in the subject line
    #[serde(default)]
    pub run_tag: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Archive names are `<prefix>-YYYY-MM-DD-HH-MM.zip`
    #[serde(default = "default_prefix")]
    pub prefix: String,

    #[serde(default)]
    pub compression: Compression,

    #[serde(default)]
    pub compression_level: Option<i64>,

    /// Maximum files read concurrently while building the archive
    #[serde(default = "default_max_concurrent_files")]
    pub max_concurrent_files: usize,

    /// Root for per-run working directories
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_port() -> u16 {
    22
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_prefix() -> String {
    "backup".to_string()
}

fn default_max_concurrent_files() -> usize {
    crate::archive::DEFAULT_MAX_CONCURRENT_FILES
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            compression: Compression::default(),
            compression_level: None,
            max_concurrent_files: default_max_concurrent_files(),
            work_dir: None,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl std::fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("dir", &self.dir)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

impl std::fmt::Debug for NotifyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifyConfig")
            .field("recipient", &self.recipient)
            .field("sender", &self.sender)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("endpoint", &self.endpoint)
            .field("run_tag", &self.run_tag)
            .finish()
    }
}

impl BackupConfig {
    /// Load, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::parse(&content, path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse without validating. The format is picked from the extension.
    pub fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let parse_failed = |message: String| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        };

        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        if is_toml {
            toml::from_str(content).map_err(|e| parse_failed(e.to_string()))
        } else {
            serde_json::from_str(content).map_err(|e| parse_failed(e.to_string()))
        }
    }

    /// Replace secrets with values from `lookup` when present and non-empty
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(password) = value(ENV_REMOTE_PASSWORD) {
            self.remote.password = password;
        }
        if let Some(api_key) = value(ENV_MAIL_API_KEY) {
            self.notify.api_key = Some(api_key);
        }
        if self.notify.api_key.as_deref().is_some_and(str::is_empty) {
            self.notify.api_key = None;
        }
    }

    /// Check that every required field is present and non-empty
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required: [(&'static str, bool); 8] = [
            ("source.dir", self.source.dir.as_os_str().is_empty()),
            ("remote.host", self.remote.host.trim().is_empty()),
            ("remote.username", self.remote.username.is_empty()),
            ("remote.password", self.remote.password.is_empty()),
            ("remote.dir", self.remote.dir.trim().is_empty()),
            ("notify.recipient", self.notify.recipient.trim().is_empty()),
            ("notify.sender", self.notify.sender.trim().is_empty()),
            ("archive.prefix", self.archive.prefix.trim().is_empty()),
        ];
        if let Some((field, _)) = required.iter().find(|(_, missing)| *missing) {
            return Err(ConfigError::MissingField(*field));
        }

        if self.remote.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "remote.port",
                reason: "must be between 1 and 65535".to_string(),
            });
        }
        if self.remote.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "remote.connect_timeout_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.archive.max_concurrent_files == 0 {
            return Err(ConfigError::InvalidValue {
                field: "archive.max_concurrent_files",
                reason: "must be at least 1".to_string(),
            });
        }
        if let Some(level) = self.archive.compression_level {
            let compression = self.archive.compression;
            match compression.level_range() {
                None => {
                    return Err(ConfigError::InvalidValue {
                        field: "archive.compression_level",
                        reason: format!("{} compression takes no level", compression),
                    });
                }
                Some(range) if !range.contains(&level) => {
                    return Err(ConfigError::InvalidValue {
                        field: "archive.compression_level",
                        reason: format!(
                            "{} for {} compression, must be {} to {}",
                            level,
                            compression,
                            range.start(),
                            range.end()
                        ),
                    });
                }
                Some(_) => {}
            }
        }
        if self.archive.prefix.contains(['/', '\\']) {
            return Err(ConfigError::InvalidValue {
                field: "archive.prefix",
                reason: "must not contain path separators".to_string(),
            });
        }

        Ok(())
    }

    /// Directory under which per-run working directories are created
    pub fn work_root(&self) -> PathBuf {
        self.archive
            .work_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("prm-backup"))
    }

    pub fn run_tag(&self) -> &str {
        self.notify
            .run_tag
            .as_deref()
            .filter(|tag| !tag.is_empty())
            .unwrap_or(DEFAULT_RUN_TAG)
    }

    pub fn archive_options(&self) -> ArchiveOptions {
        ArchiveOptions {
            compression: self.archive.compression,
            compression_level: self.archive.compression_level,
            max_concurrent_files: self.archive.max_concurrent_files,
        }
    }
}
