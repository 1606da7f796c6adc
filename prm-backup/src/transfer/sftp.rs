//! SFTP sessions over ssh2 with password authentication.

use super::{copy_with_progress, Connector, RemoteSession, ThrottledProgress};
use crate::config::RemoteConfig;
use crate::utils::errors::TransferError;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Connects to an SFTP server
pub struct SftpConnector {
    host: String,
    port: u16,
    username: String,
    password: String,
    timeout: Duration,
}

impl SftpConnector {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
            timeout,
        }
    }

    pub fn from_config(remote: &RemoteConfig) -> Self {
        Self::new(
            remote.host.clone(),
            remote.port,
            remote.username.clone(),
            remote.password.clone(),
            Duration::from_secs(remote.connect_timeout_secs),
        )
    }
}

impl Connector for SftpConnector {
    type Session = SftpSession;

    fn endpoint(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }

    fn connect(&self) -> Result<SftpSession, TransferError> {
        let endpoint = self.endpoint();
        let failed = |message: String| TransferError::ConnectFailed {
            endpoint: endpoint.clone(),
            message,
        };

        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| failed(format!("cannot resolve host: {}", e)))?
            .next()
            .ok_or_else(|| failed("host resolved to no addresses".to_string()))?;

        let tcp = TcpStream::connect_timeout(&addr, self.timeout).map_err(|e| failed(e.to_string()))?;
        let mut session = ssh2::Session::new().map_err(|e| failed(e.to_string()))?;
        session.set_timeout(self.timeout.as_millis().min(u32::MAX as u128) as u32);
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| failed(format!("SSH handshake failed: {}", e)))?;

        session
            .userauth_password(&self.username, &self.password)
            .map_err(|e| failed(format!("SSH authentication failed: {}", e)))?;
        if !session.authenticated() {
            return Err(failed("SSH authentication failed".to_string()));
        }

        let sftp = session
            .sftp()
            .map_err(|e| failed(format!("SFTP subsystem unavailable: {}", e)))?;
        debug!("SFTP session established with {}", endpoint);

        Ok(SftpSession {
            endpoint,
            session,
            sftp: Some(sftp),
        })
    }
}

/// An authenticated SFTP channel
pub struct SftpSession {
    endpoint: String,
    session: ssh2::Session,
    sftp: Option<ssh2::Sftp>,
}

impl SftpSession {
    fn sftp(&self, remote_path: &str) -> Result<&ssh2::Sftp, TransferError> {
        self.sftp.as_ref().ok_or_else(|| TransferError::UploadFailed {
            remote_path: remote_path.to_string(),
            bytes_transferred: None,
            message: "SFTP channel already closed".to_string(),
        })
    }
}

impl RemoteSession for SftpSession {
    fn put(
        &mut self,
        source: &mut dyn Read,
        remote_path: &str,
        progress: &mut ThrottledProgress,
    ) -> Result<u64, TransferError> {
        let sftp = self.sftp(remote_path)?;
        let mut remote = sftp
            .create(Path::new(remote_path))
            .map_err(|e| TransferError::UploadFailed {
                remote_path: remote_path.to_string(),
                bytes_transferred: None,
                message: e.to_string(),
            })?;

        write_remote(&mut remote, source, remote_path, progress)
    }

    fn remote_size(&mut self, remote_path: &str) -> Result<u64, TransferError> {
        let verify_failed = |message: String| TransferError::VerifyFailed {
            remote_path: remote_path.to_string(),
            message,
        };

        let sftp = self.sftp.as_ref().ok_or_else(|| verify_failed("SFTP channel already closed".to_string()))?;
        let stat = sftp
            .stat(Path::new(remote_path))
            .map_err(|e| verify_failed(e.to_string()))?;
        stat.size
            .ok_or_else(|| verify_failed("server did not report a size".to_string()))
    }

    fn close(&mut self) -> Result<(), TransferError> {
        drop(self.sftp.take());
        self.session
            .disconnect(None, "backup upload finished", None)
            .map_err(|e| TransferError::TeardownFailed {
                endpoint: self.endpoint.clone(),
                message: e.to_string(),
            })
    }
}

/// A remote file whose writes only count once the handle is closed
trait RemoteFile: Write {
    fn fsync(&mut self) -> io::Result<()>;
    fn close(&mut self) -> io::Result<()>;
}

impl RemoteFile for ssh2::File {
    fn fsync(&mut self) -> io::Result<()> {
        ssh2::File::fsync(self).map_err(io::Error::from)
    }

    fn close(&mut self) -> io::Result<()> {
        ssh2::File::close(self).map_err(io::Error::from)
    }
}

/// Stream `source` into `remote`, then sync and close the handle.
///
/// fsync needs the fsync@openssh.com extension, so a refusal is only logged.
/// A failed close fails the upload.
fn write_remote<F: RemoteFile>(
    remote: &mut F,
    source: &mut dyn Read,
    remote_path: &str,
    progress: &mut ThrottledProgress,
) -> Result<u64, TransferError> {
    let failed = |sent: u64, e: io::Error| TransferError::UploadFailed {
        remote_path: remote_path.to_string(),
        bytes_transferred: Some(sent),
        message: e.to_string(),
    };

    let sent = copy_with_progress(source, remote, progress).map_err(|(sent, e)| failed(sent, e))?;

    if let Err(e) = remote.fsync() {
        debug!("Server did not sync {}: {}", remote_path, e);
    }
    remote
        .close()
        .map_err(|e| failed(sent, io::Error::new(e.kind(), format!("closing remote file: {}", e))))?;

    debug!("Wrote and closed {} ({} bytes)", remote_path, sent);
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// In-memory remote file with switchable sync and close failures
    #[derive(Default)]
    struct MemoryFile {
        data: Vec<u8>,
        fsync_fails: bool,
        close_fails: bool,
        closed: bool,
    }

    impl Write for MemoryFile {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl RemoteFile for MemoryFile {
        fn fsync(&mut self) -> io::Result<()> {
            if self.fsync_fails {
                return Err(io::Error::new(io::ErrorKind::Unsupported, "operation not supported"));
            }
            Ok(())
        }

        fn close(&mut self) -> io::Result<()> {
            if self.close_fails {
                return Err(io::Error::new(io::ErrorKind::Other, "failure closing handle"));
            }
            self.closed = true;
            Ok(())
        }
    }

    fn progress() -> ThrottledProgress {
        ThrottledProgress::new("prm.zip".to_string(), 11, None)
    }

    #[test]
    fn test_write_remote_closes_the_handle() {
        let mut remote = MemoryFile::default();
        let sent = write_remote(&mut remote, &mut &b"hello world"[..], "/backups/prm.zip", &mut progress()).unwrap();

        assert_eq!(sent, 11);
        assert_eq!(remote.data, b"hello world");
        assert!(remote.closed);
    }

    #[test]
    fn test_missing_fsync_support_is_tolerated() {
        let mut remote = MemoryFile {
            fsync_fails: true,
            ..Default::default()
        };
        let sent = write_remote(&mut remote, &mut &b"hello world"[..], "/backups/prm.zip", &mut progress()).unwrap();

        assert_eq!(sent, 11);
        assert!(remote.closed);
    }

    #[test]
    fn test_close_failure_fails_the_upload() {
        let mut remote = MemoryFile {
            close_fails: true,
            ..Default::default()
        };
        let err = write_remote(&mut remote, &mut &b"hello world"[..], "/backups/prm.zip", &mut progress()).unwrap_err();

        match err {
            TransferError::UploadFailed {
                remote_path,
                bytes_transferred,
                message,
            } => {
                assert_eq!(remote_path, "/backups/prm.zip");
                assert_eq!(bytes_transferred, Some(11));
                assert!(message.contains("failure closing handle"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_endpoint_description() {
        let connector = SftpConnector::new("backup.example.com", 2222, "prm", "secret", Duration::from_secs(5));
        assert_eq!(connector.endpoint(), "prm@backup.example.com:2222");
    }

    #[test]
    fn test_connect_refused_is_connect_failed() {
        // Bind then drop to get a local port with nothing listening
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let connector = SftpConnector::new("127.0.0.1", port, "prm", "secret", Duration::from_secs(2));

        let err = connector.connect().err().unwrap();
        assert!(matches!(err, TransferError::ConnectFailed { .. }));
    }
}
