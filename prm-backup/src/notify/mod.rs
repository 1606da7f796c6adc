//! Outcome notification by email.
//!
//! Delivery is best-effort: failures are logged and never change the run
//! verdict. Exactly one message is sent per run.

pub mod sendgrid;

pub use sendgrid::SendGridTransport;

use crate::config::BackupConfig;
use crate::executor::report::{RunReport, RunVerdict};
use crate::transfer::progress::format_bytes;
use crate::utils::errors::NotifyError;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{info, warn};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S %:z";

/// A plain-text email
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Delivers messages
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, message: &Message) -> Result<(), NotifyError>;
}

/// Writes messages to the log instead of sending them
pub struct LogTransport;

#[async_trait]
impl MailTransport for LogTransport {
    async fn send(&self, message: &Message) -> Result<(), NotifyError> {
        info!(
            "Mail transport not configured; notification for {}:\n{}\n\n{}",
            message.to, message.subject, message.body
        );
        Ok(())
    }
}

/// Composes and sends the run outcome message
#[derive(Clone)]
pub struct Notifier {
    transport: Arc<dyn MailTransport>,
    sender: String,
    recipient: String,
    run_tag: String,
}

impl Notifier {
    pub fn new(
        transport: Arc<dyn MailTransport>,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        run_tag: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            sender: sender.into(),
            recipient: recipient.into(),
            run_tag: run_tag.into(),
        }
    }

    /// SendGrid when an API key is configured, otherwise log-only
    pub fn from_config(config: &BackupConfig) -> Result<Self, NotifyError> {
        let transport: Arc<dyn MailTransport> = match &config.notify.api_key {
            Some(api_key) => Arc::new(SendGridTransport::new(
                api_key.clone(),
                config.notify.endpoint.clone(),
            )?),
            None => {
                warn!("No mail API key configured; notifications will only be logged");
                Arc::new(LogTransport)
            }
        };

        Ok(Self::new(
            transport,
            config.notify.sender.clone(),
            config.notify.recipient.clone(),
            config.run_tag(),
        ))
    }

    /// Build the message for `report`
    pub fn compose(&self, report: &RunReport) -> Message {
        let verdict = report.verdict();
        let subject = format!("[{}] Backup {}", self.run_tag, verdict.label());

        let mut body = String::new();
        match verdict {
            RunVerdict::NothingToBackUp => {
                let _ = writeln!(
                    body,
                    "No files to back up were found in {}. No backup was initiated.",
                    report.source_dir().display()
                );
            }
            RunVerdict::Success => {
                let _ = writeln!(body, "Backup completed successfully.");
                let _ = writeln!(body);
                if let Some(output) = report.output() {
                    let _ = writeln!(body, "Destination: {}", output.remote_path);
                    let _ = writeln!(
                        body,
                        "Size: {} bytes ({})",
                        output.size,
                        format_bytes(output.size)
                    );
                    let _ = writeln!(body, "Files: {}", output.entries);
                }
            }
            RunVerdict::Failed => {
                let _ = writeln!(body, "Backup failed. Please investigate manually.");
                let _ = writeln!(body);
                match report.failure() {
                    Some(cause) => {
                        let _ = writeln!(body, "Cause: {}", cause);
                    }
                    None => {
                        let _ = writeln!(body, "Cause: the run ended without producing an archive");
                    }
                }
                let _ = writeln!(body, "Source: {}", report.source_dir().display());
            }
        }

        let _ = writeln!(body);
        let _ = writeln!(body, "Started: {}", timestamp(report.started_at()));
        let finished = report.finished_at().unwrap_or_else(Local::now);
        let _ = writeln!(body, "Finished: {}", timestamp(finished));

        Message {
            from: self.sender.clone(),
            to: self.recipient.clone(),
            subject,
            body,
        }
    }

    /// Send the outcome of `report`. Returns whether delivery succeeded.
    pub async fn notify(&self, report: &RunReport) -> bool {
        let message = self.compose(report);
        match self.transport.send(&message).await {
            Ok(()) => {
                info!("Notification sent to {}: {}", message.to, message.subject);
                true
            }
            Err(e) => {
                warn!("{}", e);
                false
            }
        }
    }
}

fn timestamp(at: DateTime<Local>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::report::ArchiveOutput;
    use crate::utils::errors::BuildError;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<Message>>,
        fail: bool,
    }

    #[async_trait]
    impl MailTransport for Recorder {
        async fn send(&self, message: &Message) -> Result<(), NotifyError> {
            self.sent.lock().unwrap().push(message.clone());
            if self.fail {
                return Err(NotifyError::Delivery {
                    recipient: message.to.clone(),
                    message: "smtp down".to_string(),
                });
            }
            Ok(())
        }
    }

    fn notifier(recorder: Arc<Recorder>) -> Notifier {
        Notifier::new(recorder, "backup@example.com", "ops@example.com", "PRM")
    }

    #[test]
    fn test_compose_nothing_to_back_up() {
        let notifier = notifier(Arc::new(Recorder::default()));
        let mut report = RunReport::begin(Path::new("/srv/exports"));
        report.record_selection(0);
        report.finish();

        let message = notifier.compose(&report);
        assert_eq!(message.subject, "[PRM] Backup no backup initiated");
        assert!(message.body.contains("/srv/exports"));
        assert!(message.body.contains("Started: "));
        assert!(message.body.contains("Finished: "));
        assert_eq!(message.to, "ops@example.com");
        assert_eq!(message.from, "backup@example.com");
    }

    #[test]
    fn test_compose_success() {
        let notifier = notifier(Arc::new(Recorder::default()));
        let mut report = RunReport::begin(Path::new("/srv/exports"));
        report.record_selection(2);
        report.record_output(ArchiveOutput {
            remote_path: "/backups/prm-2026-10-16-02-00.zip".to_string(),
            size: 2048,
            entries: 2,
        });
        report.finish();

        let message = notifier.compose(&report);
        assert_eq!(message.subject, "[PRM] Backup success");
        assert!(message.body.contains("Destination: /backups/prm-2026-10-16-02-00.zip"));
        assert!(message.body.contains("Size: 2048 bytes (2.00 KB)"));
    }

    #[test]
    fn test_compose_failure() {
        let notifier = notifier(Arc::new(Recorder::default()));
        let mut report = RunReport::begin(Path::new("/srv/exports"));
        report.record_selection(3);
        report.record_failure(BuildError::Read {
            file: PathBuf::from("/srv/exports/locked.db"),
            source: std::io::Error::new(std::io::ErrorKind::Other, "Input/output error"),
        });
        report.finish();

        let message = notifier.compose(&report);
        assert_eq!(message.subject, "[PRM] Backup failed");
        assert!(message.body.contains("investigate manually"));
        assert!(message.body.contains("/srv/exports/locked.db"));
    }

    #[tokio::test]
    async fn test_delivery_failure_is_not_escalated() {
        let recorder = Arc::new(Recorder {
            fail: true,
            ..Recorder::default()
        });
        let notifier = notifier(Arc::clone(&recorder));
        let mut report = RunReport::begin(Path::new("/srv/exports"));
        report.record_selection(0);

        assert!(!notifier.notify(&report).await);
        assert_eq!(recorder.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_log_transport_always_succeeds() {
        let notifier = Notifier::new(Arc::new(LogTransport), "a@example.com", "b@example.com", "PRM");
        let mut report = RunReport::begin(Path::new("/srv/exports"));
        report.record_selection(0);
        assert!(notifier.notify(&report).await);
    }
}
