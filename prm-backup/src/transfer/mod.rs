//! Transfer client - uploads a finished archive to remote storage.
//!
//! A session is opened for a single upload and torn down by [`SessionGuard`]
//! on every exit path, panics included.

pub mod progress;
pub mod sftp;

pub use progress::{ProgressEvent, ProgressObserver, ThrottledProgress};
pub use sftp::{SftpConnector, SftpSession};

use crate::utils::errors::TransferError;
use progress::{format_bytes, format_speed};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use tracing::{info, warn};

/// Buffer size for streaming uploads
const CHUNK_SIZE: usize = 64 * 1024;

/// Where the archive landed and how large it is remotely
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    pub remote_path: String,
    pub remote_size: u64,
}

pub type TransferResult = Result<TransferReceipt, TransferError>;

/// Join a remote directory and a file name with a single forward slash
pub fn remote_path(remote_dir: &str, file_name: &str) -> String {
    let dir = remote_dir.trim_end_matches('/');
    if dir.is_empty() && remote_dir.starts_with('/') {
        format!("/{}", file_name)
    } else if dir.is_empty() {
        file_name.to_string()
    } else {
        format!("{}/{}", dir, file_name)
    }
}

/// Stream `reader` into `writer`, reporting progress per chunk.
///
/// On failure returns the number of bytes written before the error.
pub fn copy_with_progress<R: Read + ?Sized, W: Write + ?Sized>(
    reader: &mut R,
    writer: &mut W,
    progress: &mut ThrottledProgress,
) -> Result<u64, (u64, io::Error)> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut copied = 0u64;

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err((copied, e)),
        };
        writer.write_all(&buf[..n]).map_err(|e| (copied, e))?;
        copied += n as u64;
        progress.advance(copied);
    }
    writer.flush().map_err(|e| (copied, e))?;
    progress.finish(copied);

    Ok(copied)
}

/// An open, authenticated remote session
pub trait RemoteSession {
    /// Stream `source` to `remote_path`, creating or truncating it
    fn put(
        &mut self,
        source: &mut dyn Read,
        remote_path: &str,
        progress: &mut ThrottledProgress,
    ) -> Result<u64, TransferError>;

    /// Size of the object at `remote_path`
    fn remote_size(&mut self, remote_path: &str) -> Result<u64, TransferError>;

    /// Close the session. Called exactly once, by [`SessionGuard`].
    fn close(&mut self) -> Result<(), TransferError>;
}

/// Opens sessions against one remote endpoint
pub trait Connector: Send + Sync {
    type Session: RemoteSession;

    /// `user@host:port` style description for logs and errors
    fn endpoint(&self) -> String;

    fn connect(&self) -> Result<Self::Session, TransferError>;
}

/// Owns a session and closes it exactly once when dropped
pub struct SessionGuard<S: RemoteSession> {
    endpoint: String,
    session: Option<S>,
}

impl<S: RemoteSession> SessionGuard<S> {
    pub fn new(endpoint: String, session: S) -> Self {
        Self {
            endpoint,
            session: Some(session),
        }
    }

    pub fn session(&mut self) -> &mut S {
        // Only `Drop` takes the session out
        self.session.as_mut().unwrap_or_else(|| unreachable!("session already closed"))
    }
}

impl<S: RemoteSession> Drop for SessionGuard<S> {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take() {
            match session.close() {
                Ok(()) => info!("Closed session with {}", self.endpoint),
                Err(e) => warn!("{}", e),
            }
        }
    }
}

/// Object-safe upload entry point used by the orchestrator
pub trait Uploader: Send + Sync {
    /// Upload `local` into `remote_dir` under its base name. Blocking.
    fn upload(&self, local: &Path, remote_dir: &str, observer: Option<&ProgressObserver>) -> TransferResult;
}

/// Connect, stream, verify, tear down
pub struct TransferClient<C: Connector> {
    connector: C,
}

impl<C: Connector> TransferClient<C> {
    pub fn new(connector: C) -> Self {
        Self { connector }
    }
}

impl<C: Connector> Uploader for TransferClient<C> {
    fn upload(&self, local: &Path, remote_dir: &str, observer: Option<&ProgressObserver>) -> TransferResult {
        let file_name = local
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| local.to_string_lossy().into_owned());
        let remote_path = remote_path(remote_dir, &file_name);

        let local_failed = |e: io::Error| TransferError::UploadFailed {
            remote_path: remote_path.clone(),
            bytes_transferred: None,
            message: format!("cannot read {}: {}", local.display(), e),
        };
        let mut source = File::open(local).map_err(local_failed)?;
        let local_size = source.metadata().map_err(local_failed)?.len();

        let endpoint = self.connector.endpoint();
        info!("Connecting to {}", endpoint);
        let session = self.connector.connect()?;
        let mut guard = SessionGuard::new(endpoint, session);

        info!("Uploading {} ({}) to {}", file_name, format_bytes(local_size), remote_path);
        let mut progress = ThrottledProgress::new(file_name, local_size, observer.cloned());
        let sent = guard.session().put(&mut source, &remote_path, &mut progress)?;

        let remote_size = guard.session().remote_size(&remote_path)?;
        if remote_size != local_size {
            return Err(TransferError::VerifyFailed {
                remote_path,
                message: format!(
                    "remote size {} does not match local size {}",
                    remote_size, local_size
                ),
            });
        }

        info!(
            "Uploaded {} to {} (avg {})",
            format_bytes(sent),
            remote_path,
            format_speed(progress.average_speed(sent))
        );

        Ok(TransferReceipt {
            remote_path,
            remote_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    #[derive(Clone, Copy, PartialEq)]
    enum Fault {
        None,
        Connect,
        MidStream,
        ShortWrite,
        Close,
    }

    #[derive(Default)]
    struct Remote {
        objects: Mutex<HashMap<String, Vec<u8>>>,
        connects: AtomicUsize,
        closes: AtomicUsize,
    }

    struct FakeConnector {
        remote: Arc<Remote>,
        fault: Fault,
    }

    struct FakeSession {
        remote: Arc<Remote>,
        fault: Fault,
    }

    impl RemoteSession for FakeSession {
        fn put(
            &mut self,
            source: &mut dyn Read,
            remote_path: &str,
            progress: &mut ThrottledProgress,
        ) -> Result<u64, TransferError> {
            let mut data = Vec::new();
            let sent = copy_with_progress(source, &mut data, progress).map_err(|(n, e)| {
                TransferError::UploadFailed {
                    remote_path: remote_path.to_string(),
                    bytes_transferred: Some(n),
                    message: e.to_string(),
                }
            })?;
            match self.fault {
                Fault::MidStream => {
                    data.truncate(data.len() / 2);
                    let n = data.len() as u64;
                    self.remote.objects.lock().unwrap().insert(remote_path.to_string(), data);
                    return Err(TransferError::UploadFailed {
                        remote_path: remote_path.to_string(),
                        bytes_transferred: Some(n),
                        message: "connection reset by peer".to_string(),
                    });
                }
                Fault::ShortWrite => data.truncate(data.len() - 1),
                _ => {}
            }
            self.remote.objects.lock().unwrap().insert(remote_path.to_string(), data);
            Ok(sent)
        }

        fn remote_size(&mut self, remote_path: &str) -> Result<u64, TransferError> {
            self.remote
                .objects
                .lock()
                .unwrap()
                .get(remote_path)
                .map(|data| data.len() as u64)
                .ok_or_else(|| TransferError::VerifyFailed {
                    remote_path: remote_path.to_string(),
                    message: "no such file".to_string(),
                })
        }

        fn close(&mut self) -> Result<(), TransferError> {
            self.remote.closes.fetch_add(1, Ordering::SeqCst);
            if self.fault == Fault::Close {
                return Err(TransferError::TeardownFailed {
                    endpoint: "fake".to_string(),
                    message: "broken pipe".to_string(),
                });
            }
            Ok(())
        }
    }

    impl Connector for FakeConnector {
        type Session = FakeSession;

        fn endpoint(&self) -> String {
            "tester@fake:22".to_string()
        }

        fn connect(&self) -> Result<FakeSession, TransferError> {
            self.remote.connects.fetch_add(1, Ordering::SeqCst);
            if self.fault == Fault::Connect {
                return Err(TransferError::ConnectFailed {
                    endpoint: self.endpoint(),
                    message: "connection refused".to_string(),
                });
            }
            Ok(FakeSession {
                remote: Arc::clone(&self.remote),
                fault: self.fault,
            })
        }
    }

    fn client(fault: Fault) -> (TransferClient<FakeConnector>, Arc<Remote>) {
        let remote = Arc::new(Remote::default());
        let client = TransferClient::new(FakeConnector {
            remote: Arc::clone(&remote),
            fault,
        });
        (client, remote)
    }

    fn archive(dir: &TempDir, len: usize) -> std::path::PathBuf {
        let path = dir.path().join("prm-2026-10-16-02-00.zip");
        std::fs::write(&path, vec![7u8; len]).unwrap();
        path
    }

    #[test]
    fn test_remote_path_uses_forward_slashes() {
        assert_eq!(remote_path("/backups", "a.zip"), "/backups/a.zip");
        assert_eq!(remote_path("/backups/", "a.zip"), "/backups/a.zip");
        assert_eq!(remote_path("/", "a.zip"), "/a.zip");
        assert_eq!(remote_path("", "a.zip"), "a.zip");
        assert_eq!(remote_path("upload", "a.zip"), "upload/a.zip");
    }

    #[test]
    fn test_upload_success() {
        let temp_dir = TempDir::new().unwrap();
        let local = archive(&temp_dir, 5000);
        let (client, remote) = client(Fault::None);

        let receipt = client.upload(&local, "/backups/", None).unwrap();
        assert_eq!(receipt.remote_path, "/backups/prm-2026-10-16-02-00.zip");
        assert_eq!(receipt.remote_size, 5000);
        assert_eq!(remote.connects.load(Ordering::SeqCst), 1);
        assert_eq!(remote.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_connect_failure() {
        let temp_dir = TempDir::new().unwrap();
        let local = archive(&temp_dir, 10);
        let (client, remote) = client(Fault::Connect);

        let err = client.upload(&local, "/backups", None).unwrap_err();
        assert!(matches!(err, TransferError::ConnectFailed { .. }));
        assert_eq!(remote.closes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_mid_stream_failure_reports_bytes_and_closes() {
        let temp_dir = TempDir::new().unwrap();
        let local = archive(&temp_dir, 1000);
        let (client, remote) = client(Fault::MidStream);

        let err = client.upload(&local, "/backups", None).unwrap_err();
        match err {
            TransferError::UploadFailed { bytes_transferred, .. } => assert_eq!(bytes_transferred, Some(500)),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(remote.closes.load(Ordering::SeqCst), 1);
        // Partial objects are left in place
        assert!(remote.objects.lock().unwrap().contains_key("/backups/prm-2026-10-16-02-00.zip"));
    }

    #[test]
    fn test_size_mismatch_fails_verification() {
        let temp_dir = TempDir::new().unwrap();
        let local = archive(&temp_dir, 64);
        let (client, remote) = client(Fault::ShortWrite);

        let err = client.upload(&local, "/backups", None).unwrap_err();
        assert!(matches!(err, TransferError::VerifyFailed { .. }));
        assert_eq!(remote.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_teardown_failure_keeps_primary_outcome() {
        let temp_dir = TempDir::new().unwrap();
        let local = archive(&temp_dir, 32);
        let (client, remote) = client(Fault::Close);

        let receipt = client.upload(&local, "/backups", None).unwrap();
        assert_eq!(receipt.remote_size, 32);
        assert_eq!(remote.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_missing_local_file_never_connects() {
        let temp_dir = TempDir::new().unwrap();
        let (client, remote) = client(Fault::None);

        let err = client
            .upload(&temp_dir.path().join("absent.zip"), "/backups", None)
            .unwrap_err();
        assert!(matches!(err, TransferError::UploadFailed { bytes_transferred: None, .. }));
        assert_eq!(remote.connects.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_guard_closes_on_panic() {
        let remote = Arc::new(Remote::default());
        let session = FakeSession {
            remote: Arc::clone(&remote),
            fault: Fault::None,
        };

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = SessionGuard::new("fake".to_string(), session);
            panic!("upload blew up");
        }));
        assert!(result.is_err());
        assert_eq!(remote.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_copy_with_progress_reports_final_event() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&events);
        let observer: ProgressObserver = Arc::new(move |event: &ProgressEvent| {
            recorded.lock().unwrap().push(event.clone());
        });

        let data = vec![1u8; CHUNK_SIZE * 3 + 17];
        let mut out = Vec::new();
        let mut progress = ThrottledProgress::new("x.zip", data.len() as u64, Some(observer));
        let copied = copy_with_progress(&mut data.as_slice(), &mut out, &mut progress).unwrap();

        assert_eq!(copied, data.len() as u64);
        assert_eq!(out, data);
        let events = events.lock().unwrap();
        assert_eq!(events.last().map(|e| e.transferred), Some(data.len() as u64));
    }
}
