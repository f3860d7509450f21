//! Scanner backends and the ordered connection fallback.
//!
//! A scan is served by the first of three backends that answers a liveness
//! probe: clamd over TCP, clamd over its local socket, and finally the
//! agnostic fallback, which needs no daemon and is never probed.

use crate::clamd::{ClamdClient, ClamdError, Detections, Transport};
use crate::config::{Config, FailAction};
use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Engine version reported by the agnostic fallback.
pub const AGNOSTIC_ENGINE_VERSION: &str = "agnostic-fallback (no ClamAV daemon reachable)";

/// Operations the gateway needs from a scanning engine.
#[async_trait]
pub trait ScannerBackend: Send + Sync {
    /// Liveness probe.
    async fn ping(&self) -> Result<(), ClamdError>;

    /// Engine version string.
    async fn version(&self) -> Result<String, ClamdError>;

    /// Scan the file at `path`. An empty map means no detections.
    async fn scan_file(&self, path: &Path) -> Result<Detections, ClamdError>;
}

#[async_trait]
impl ScannerBackend for ClamdClient {
    async fn ping(&self) -> Result<(), ClamdError> {
        ClamdClient::ping(self).await
    }

    async fn version(&self) -> Result<String, ClamdError> {
        ClamdClient::version(self).await
    }

    async fn scan_file(&self, path: &Path) -> Result<Detections, ClamdError> {
        ClamdClient::scan_file(self, path).await
    }
}

/// Fallback used when no daemon transport answers.
#[derive(Debug, Clone, Copy)]
pub struct AgnosticScanner {
    fail_action: FailAction,
}

impl AgnosticScanner {
    pub fn new(fail_action: FailAction) -> Self {
        Self { fail_action }
    }
}

#[async_trait]
impl ScannerBackend for AgnosticScanner {
    async fn ping(&self) -> Result<(), ClamdError> {
        Ok(())
    }

    async fn version(&self) -> Result<String, ClamdError> {
        Ok(AGNOSTIC_ENGINE_VERSION.to_string())
    }

    async fn scan_file(&self, path: &Path) -> Result<Detections, ClamdError> {
        match self.fail_action {
            FailAction::Allow => {
                warn!(
                    path = %path.display(),
                    "No ClamAV daemon reachable, reporting upload as clean"
                );
                Ok(Detections::new())
            }
            FailAction::Block => Err(ClamdError::Unavailable),
        }
    }
}

/// Which backend a handle is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScannerKind {
    Network,
    Local,
    Agnostic,
}

impl fmt::Display for ScannerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScannerKind::Network => "network",
            ScannerKind::Local => "local",
            ScannerKind::Agnostic => "agnostic",
        };
        f.write_str(name)
    }
}

/// A backend that answered the liveness probe (or the agnostic fallback).
#[derive(Clone)]
pub struct ScannerHandle {
    kind: ScannerKind,
    backend: Arc<dyn ScannerBackend>,
}

impl ScannerHandle {
    pub fn kind(&self) -> ScannerKind {
        self.kind
    }

    pub async fn version(&self) -> Result<String, ClamdError> {
        self.backend.version().await
    }

    pub async fn scan_file(&self, path: &Path) -> Result<Detections, ClamdError> {
        self.backend.scan_file(path).await
    }
}

impl fmt::Debug for ScannerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScannerHandle")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Resolves a [`ScannerHandle`] by probing backends in a fixed order.
///
/// Nothing is cached: every call to [`connect`](Self::connect) probes again.
#[derive(Clone)]
pub struct ScannerConnector {
    network: Arc<dyn ScannerBackend>,
    local: Arc<dyn ScannerBackend>,
    agnostic: Arc<dyn ScannerBackend>,
}

impl ScannerConnector {
    pub fn new(
        network: Arc<dyn ScannerBackend>,
        local: Arc<dyn ScannerBackend>,
        agnostic: Arc<dyn ScannerBackend>,
    ) -> Self {
        Self {
            network,
            local,
            agnostic,
        }
    }

    /// Build the TCP, Unix and agnostic backends from configuration.
    pub fn from_config(config: &Config) -> Self {
        let clamd = &config.clamd;
        let network = ClamdClient::new(
            Transport::Tcp {
                host: clamd.host.clone(),
                port: clamd.port,
            },
            clamd.timeout_ms,
            clamd.chunk_size,
        );
        let local = ClamdClient::new(
            Transport::Unix(clamd.socket_path.clone()),
            clamd.timeout_ms,
            clamd.chunk_size,
        );

        Self::new(
            Arc::new(network),
            Arc::new(local),
            Arc::new(AgnosticScanner::new(config.settings.fail_action)),
        )
    }

    /// Probe network, then local; fall back to agnostic.
    ///
    /// Only connection-class failures move on to the next backend. Any other
    /// probe error is returned as is.
    pub async fn connect(&self) -> Result<ScannerHandle, ClamdError> {
        let probes = [
            (ScannerKind::Network, &self.network),
            (ScannerKind::Local, &self.local),
        ];

        for (kind, backend) in probes {
            match backend.ping().await {
                Ok(()) => {
                    debug!(scanner = %kind, "Scanner answered liveness probe");
                    return Ok(ScannerHandle {
                        kind,
                        backend: Arc::clone(backend),
                    });
                }
                Err(e) if e.is_connection_error() => {
                    debug!(scanner = %kind, error = %e, "Scanner unreachable, falling back");
                }
                Err(e) => return Err(e),
            }
        }

        warn!("No ClamAV daemon reachable, using agnostic fallback");
        Ok(ScannerHandle {
            kind: ScannerKind::Agnostic,
            backend: Arc::clone(&self.agnostic),
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn agnostic() -> Arc<dyn ScannerBackend> {
        Arc::new(AgnosticScanner::new(FailAction::Allow))
    }

    #[tokio::test]
    async fn test_network_preferred_when_up() {
        let network = FakeBackend::up(Verdict::Clean);
        let local = FakeBackend::up(Verdict::Clean);

        let handle = connector(&network, &local, agnostic()).connect().await.unwrap();

        assert_eq!(handle.kind(), ScannerKind::Network);
        assert_eq!(network.pings(), 1);
        assert_eq!(local.pings(), 0);
    }

    #[tokio::test]
    async fn test_local_used_when_network_refused() {
        let network = FakeBackend::refused();
        let local = FakeBackend::up(Verdict::Clean);

        let handle = connector(&network, &local, agnostic()).connect().await.unwrap();

        assert_eq!(handle.kind(), ScannerKind::Local);
        assert_eq!(network.pings(), 1);
        assert_eq!(local.pings(), 1);
    }

    #[tokio::test]
    async fn test_agnostic_when_both_refused() {
        let network = FakeBackend::refused();
        let local = FakeBackend::refused();

        let handle = connector(&network, &local, agnostic()).connect().await.unwrap();

        assert_eq!(handle.kind(), ScannerKind::Agnostic);
        assert_eq!(handle.version().await.unwrap(), AGNOSTIC_ENGINE_VERSION);
    }

    #[tokio::test]
    async fn test_agnostic_is_never_probed() {
        let network = FakeBackend::refused();
        let local = FakeBackend::refused();
        let fallback = FakeBackend::new(Liveness::Refused, Verdict::Clean);

        let handle = connector(&network, &local, fallback.clone())
            .connect()
            .await
            .unwrap();

        assert_eq!(handle.kind(), ScannerKind::Agnostic);
        assert_eq!(fallback.pings(), 0);
    }

    #[tokio::test]
    async fn test_non_connection_error_propagates() {
        let network = FakeBackend::new(Liveness::Broken, Verdict::Clean);
        let local = FakeBackend::up(Verdict::Clean);

        let err = connector(&network, &local, agnostic())
            .connect()
            .await
            .unwrap_err();

        assert!(matches!(err, ClamdError::InvalidResponse(_)));
        assert_eq!(local.pings(), 0);
    }

    #[tokio::test]
    async fn test_connect_reprobes_every_call() {
        let network = FakeBackend::up(Verdict::Clean);
        let local = FakeBackend::up(Verdict::Clean);
        let connector = connector(&network, &local, agnostic());

        connector.connect().await.unwrap();
        connector.connect().await.unwrap();

        assert_eq!(network.pings(), 2);
    }

    #[tokio::test]
    async fn test_agnostic_scan_follows_fail_action() {
        let path = Path::new("/nonexistent/upload.txt");

        let allow = AgnosticScanner::new(FailAction::Allow);
        assert!(allow.scan_file(path).await.unwrap().is_empty());

        let block = AgnosticScanner::new(FailAction::Block);
        assert!(matches!(
            block.scan_file(path).await,
            Err(ClamdError::Unavailable)
        ));
    }

    #[tokio::test]
    async fn test_from_config_falls_back_without_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut config = Config::default();
        config.clamd.port = port;
        config.clamd.socket_path = dir.path().join("clamd.sock");
        config.clamd.timeout_ms = 2000;

        let handle = ScannerConnector::from_config(&config).connect().await.unwrap();
        assert_eq!(handle.kind(), ScannerKind::Agnostic);
    }

    /// A TCP listener that reads the PING command and answers with `reply`,
    /// or resets the connection when `reply` is `None`.
    async fn misbehaving_daemon(reply: Option<&'static [u8]>) -> u16 {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                let mut cmd = [0u8; 6];
                let _ = sock.read_exact(&mut cmd).await;
                match reply {
                    Some(bytes) => {
                        let _ = sock.write_all(bytes).await;
                    }
                    None => {
                        let _ = sock.set_linger(Some(std::time::Duration::ZERO));
                    }
                }
            }
        });
        port
    }

    async fn connect_to_misbehaving_daemon(port: u16) -> ScannerHandle {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.clamd.port = port;
        config.clamd.socket_path = dir.path().join("clamd.sock");
        config.clamd.timeout_ms = 2000;

        ScannerConnector::from_config(&config).connect().await.unwrap()
    }

    #[tokio::test]
    async fn test_reset_during_ping_falls_back() {
        let port = misbehaving_daemon(None).await;
        let handle = connect_to_misbehaving_daemon(port).await;
        assert_eq!(handle.kind(), ScannerKind::Agnostic);
    }

    #[tokio::test]
    async fn test_non_text_ping_reply_falls_back() {
        let port = misbehaving_daemon(Some(b"\xff\xfe\n")).await;
        let handle = connect_to_misbehaving_daemon(port).await;
        assert_eq!(handle.kind(), ScannerKind::Agnostic);
    }
}
