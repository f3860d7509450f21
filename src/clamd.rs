//! ClamAV daemon client over TCP or a local Unix socket.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Error from ClamAV operations.
#[derive(Debug, Error)]
pub enum ClamdError {
    /// Connection to clamd failed.
    #[error("Connection to clamd failed: {0}")]
    ConnectionFailed(std::io::Error),
    /// clamd accepted the connection but did not answer PING.
    #[error("clamd did not answer PING: {0}")]
    NotResponding(String),
    /// Timeout during a daemon operation.
    #[error("clamd operation timed out")]
    Timeout,
    /// I/O error during scan.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Invalid response from clamd.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    /// clamd reported an error while scanning.
    #[error("clamd scan error: {0}")]
    ScanFailed(String),
    /// No daemon is reachable and the fallback refuses to scan.
    #[error("No ClamAV daemon is reachable")]
    Unavailable,
}

impl ClamdError {
    /// Whether this error means the transport itself is unusable.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            ClamdError::ConnectionFailed(_) | ClamdError::NotResponding(_) | ClamdError::Timeout
        )
    }
}

/// Status column of a detection record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionStatus {
    Found,
}

impl fmt::Display for DetectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectionStatus::Found => f.write_str("FOUND"),
        }
    }
}

/// One detection: the status reported by clamd and the signature name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub status: DetectionStatus,
    pub signature: String,
}

/// Detections keyed by scanned path. Empty means clean.
pub type Detections = BTreeMap<String, Detection>;

/// Where the daemon listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// clamd `TCPSocket`.
    Tcp { host: String, port: u16 },
    /// clamd `LocalSocket`.
    Unix(PathBuf),
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            Transport::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

trait ClamdStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ClamdStream for T {}

/// ClamAV daemon client.
#[derive(Debug, Clone)]
pub struct ClamdClient {
    transport: Transport,
    timeout: Duration,
    chunk_size: usize,
}

impl ClamdClient {
    /// Create a new ClamAV client.
    pub fn new(transport: Transport, timeout_ms: u64, chunk_size: usize) -> Self {
        Self {
            transport,
            timeout: Duration::from_millis(timeout_ms),
            chunk_size,
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Check if clamd is available by sending PING.
    ///
    /// Transport failures during the exchange (reset, broken pipe, a reply
    /// that is not text) mean the daemon is not usable and are reported as
    /// [`ClamdError::NotResponding`].
    pub async fn ping(&self) -> Result<(), ClamdError> {
        let response = match self.command(b"nPING\n").await {
            Ok(response) => response,
            Err(ClamdError::Io(e)) => return Err(ClamdError::NotResponding(e.to_string())),
            Err(e) => return Err(e),
        };
        if response.trim() == "PONG" {
            Ok(())
        } else {
            Err(ClamdError::NotResponding(response.trim().to_string()))
        }
    }

    /// Get clamd version.
    pub async fn version(&self) -> Result<String, ClamdError> {
        let response = self.command(b"nVERSION\n").await?;
        let version = response.trim();
        if version.is_empty() {
            return Err(ClamdError::InvalidResponse("empty VERSION reply".to_string()));
        }
        Ok(version.to_string())
    }

    /// Scan a file by streaming its contents with the INSTREAM protocol.
    ///
    /// The INSTREAM protocol:
    /// 1. Send "nINSTREAM\n"
    /// 2. Send chunks as [4-byte big-endian length][data]
    /// 3. Send [0x00 0x00 0x00 0x00] to end stream
    /// 4. Read response: "stream: OK\n" or "stream: <virus> FOUND\n"
    ///
    /// The daemon never needs access to `path` itself, so this works for a
    /// remote TCP daemon as well as a local one.
    pub async fn scan_file(&self, path: &Path) -> Result<Detections, ClamdError> {
        let mut file = tokio::fs::File::open(path).await?;

        debug!(
            transport = %self.transport,
            path = %path.display(),
            "Starting ClamAV scan"
        );

        let mut stream = self.connect().await?;
        self.io(stream.write_all(b"nINSTREAM\n")).await?;

        let mut buf = vec![0u8; self.chunk_size];
        loop {
            let read = self.io(file.read(&mut buf)).await?;
            if read == 0 {
                break;
            }
            let len = (read as u32).to_be_bytes();
            self.io(stream.write_all(&len)).await?;
            self.io(stream.write_all(&buf[..read])).await?;
        }

        // Zero-length chunk terminates the stream
        self.io(stream.write_all(&[0u8; 4])).await?;
        self.io(stream.flush()).await?;

        let mut response = String::new();
        self.io(stream.read_to_string(&mut response)).await?;

        debug!(response = %response.trim(), "ClamAV response");

        let mut detections = Detections::new();
        if let Some(detection) = parse_scan_response(&response)? {
            detections.insert(path.display().to_string(), detection);
        }
        Ok(detections)
    }

    /// Send a single newline-terminated command and read the full reply.
    async fn command(&self, cmd: &[u8]) -> Result<String, ClamdError> {
        let mut stream = self.connect().await?;
        self.io(stream.write_all(cmd)).await?;

        let mut response = String::new();
        self.io(stream.read_to_string(&mut response)).await?;
        Ok(response)
    }

    async fn connect(&self) -> Result<Box<dyn ClamdStream>, ClamdError> {
        match &self.transport {
            Transport::Tcp { host, port } => {
                match timeout(self.timeout, TcpStream::connect((host.as_str(), *port))).await {
                    Ok(Ok(s)) => Ok(Box::new(s)),
                    Ok(Err(e)) => Err(ClamdError::ConnectionFailed(e)),
                    Err(_) => Err(ClamdError::Timeout),
                }
            }
            #[cfg(unix)]
            Transport::Unix(path) => {
                match timeout(self.timeout, tokio::net::UnixStream::connect(path)).await {
                    Ok(Ok(s)) => Ok(Box::new(s)),
                    Ok(Err(e)) => Err(ClamdError::ConnectionFailed(e)),
                    Err(_) => Err(ClamdError::Timeout),
                }
            }
            #[cfg(not(unix))]
            Transport::Unix(_) => Err(ClamdError::ConnectionFailed(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "Unix sockets are not supported on this platform",
            ))),
        }
    }

    /// Run one I/O step under the per-operation timeout.
    async fn io<T, F>(&self, fut: F) -> Result<T, ClamdError>
    where
        F: Future<Output = std::io::Result<T>>,
    {
        match timeout(self.timeout, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(ClamdError::Io(e)),
            Err(_) => Err(ClamdError::Timeout),
        }
    }
}

/// Parse a ClamAV INSTREAM response.
///
/// Expected formats:
/// - "stream: OK\n" - file is clean
/// - "stream: <virus_name> FOUND\n" - malware detected
/// - "stream: <error> ERROR\n" or "<message> ERROR\n" - scan error
fn parse_scan_response(response: &str) -> Result<Option<Detection>, ClamdError> {
    let response = response.trim_end_matches(['\0', '\n', '\r', ' ']);

    if response == "stream: OK" {
        return Ok(None);
    }

    if let Some(signature) = response
        .strip_prefix("stream: ")
        .and_then(|s| s.strip_suffix(" FOUND"))
    {
        return Ok(Some(Detection {
            status: DetectionStatus::Found,
            signature: signature.to_string(),
        }));
    }

    if let Some(message) = response.strip_suffix("ERROR") {
        let message = message.strip_prefix("stream: ").unwrap_or(message);
        let message = message.trim().trim_end_matches('.');
        return Err(ClamdError::ScanFailed(message.to_string()));
    }

    Err(ClamdError::InvalidResponse(response.to_string()))
}
