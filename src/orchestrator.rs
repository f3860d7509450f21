//! Scan orchestration: persist, scan, normalize, clean up.

use crate::clamd::{ClamdError, Detections};
use crate::config::Config;
use crate::scanner::{ScannerConnector, ScannerHandle};
use crate::upload::{sanitize_filename, UploadRequest};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub const CLEAN_MESSAGE: &str = "File is clean";
pub const MALICIOUS_MESSAGE: &str = "Malicious file detected";

/// Normalized scan outcome returned to HTTP callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanVerdict {
    pub is_malicious: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threat_name: Option<String>,
    pub message: String,
    pub engine_version: String,
}

impl ScanVerdict {
    pub fn clean(engine_version: String) -> Self {
        Self {
            is_malicious: false,
            threat_name: None,
            message: CLEAN_MESSAGE.to_string(),
            engine_version,
        }
    }

    pub fn malicious(threat_name: String, engine_version: String) -> Self {
        Self {
            is_malicious: true,
            threat_name: Some(threat_name),
            message: MALICIOUS_MESSAGE.to_string(),
            engine_version,
        }
    }
}

/// Unrecoverable failure while scanning an accepted upload.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("{0}")]
    Scanner(#[from] ClamdError),
    #[error("could not persist upload: {0}")]
    Persist(std::io::Error),
    #[error("scan did not complete within {0:?}")]
    Timeout(Duration),
}

/// On-disk copy of an upload, living in its own scoped directory.
///
/// The directory and the file are removed by [`close`](Self::close) or, if
/// that is never reached, when the artifact is dropped.
#[derive(Debug)]
pub struct TemporaryArtifact {
    dir: TempDir,
    path: PathBuf,
}

impl TemporaryArtifact {
    /// Write `data` to `<temp_root>/<unique dir>/<filename>`.
    pub async fn persist(temp_root: &Path, filename: &str, data: &[u8]) -> std::io::Result<Self> {
        let root = temp_root.to_path_buf();
        let dir = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix("upload-scan-")
                .tempdir_in(root)
        })
        .await
        .map_err(std::io::Error::other)??;
        let path = dir.path().join(filename);
        tokio::fs::write(&path, data).await?;
        Ok(Self { dir, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the artifact, logging rather than returning failures.
    pub async fn close(self) {
        let dir = self.dir.path().to_path_buf();
        let removed = tokio::task::spawn_blocking(move || self.dir.close())
            .await
            .map_err(std::io::Error::other)
            .and_then(|result| result);
        if let Err(e) = removed {
            warn!(
                dir = %dir.display(),
                error = %e,
                "Failed to remove temporary scan artifact"
            );
        }
    }
}

/// Runs accepted uploads through the connected scanner.
#[derive(Clone)]
pub struct ScanOrchestrator {
    config: Arc<Config>,
    connector: ScannerConnector,
}

impl ScanOrchestrator {
    pub fn new(config: Arc<Config>, connector: ScannerConnector) -> Self {
        Self { config, connector }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn connector(&self) -> &ScannerConnector {
        &self.connector
    }

    /// Scan an upload that already passed validation.
    pub async fn scan(&self, upload: &UploadRequest) -> Result<ScanVerdict, ScanError> {
        let filename = sanitize_filename(&upload.filename);
        let artifact =
            TemporaryArtifact::persist(&self.config.upload.temp_dir, &filename, &upload.data)
                .await
                .map_err(ScanError::Persist)?;

        let limit = Duration::from_millis(self.config.clamd.scan_timeout_ms);
        let start = Instant::now();
        let outcome = timeout(limit, self.scan_artifact(artifact.path())).await;
        artifact.close().await;

        let verdict = match outcome {
            Ok(result) => result?,
            Err(_) => {
                warn!(filename = %filename, timeout_ms = limit.as_millis(), "Scan timed out");
                return Err(ScanError::Timeout(limit));
            }
        };
        let scan_time = start.elapsed();

        let settings = &self.config.settings;
        match &verdict.threat_name {
            Some(threat) if settings.log_detections => {
                info!(
                    filename = %filename,
                    virus = %threat,
                    size = upload.len,
                    scan_time_ms = scan_time.as_millis(),
                    "Malware detected"
                );
            }
            None if settings.log_clean => {
                debug!(
                    filename = %filename,
                    size = upload.len,
                    scan_time_ms = scan_time.as_millis(),
                    "Scan complete: clean"
                );
            }
            _ => {}
        }

        Ok(verdict)
    }

    async fn scan_artifact(&self, path: &Path) -> Result<ScanVerdict, ScanError> {
        let handle = self.connector.connect().await?;
        let detections = handle.scan_file(path).await?;
        interpret(&handle, detections).await
    }
}

async fn interpret(
    handle: &ScannerHandle,
    detections: Detections,
) -> Result<ScanVerdict, ScanError> {
    let threat = first_threat(&detections);
    let engine_version = handle.version().await?;

    Ok(match threat {
        None => ScanVerdict::clean(engine_version),
        Some(threat) => ScanVerdict::malicious(threat, engine_version),
    })
}

/// Signature of the first detection. Further entries are ignored.
fn first_threat(detections: &Detections) -> Option<String> {
    if detections.len() > 1 {
        debug!(
            entries = detections.len(),
            "Multiple detection entries, reporting the first"
        );
    }
    detections.values().next().map(|d| d.signature.clone())
}
