//! Upload gateway that scans files with a ClamAV daemon.
//!
//! Accepts multipart uploads on `/scan`, validates them, and reports the
//! verdict of the first reachable scanner (TCP, Unix socket, or the agnostic
//! fallback).

pub mod clamd;
pub mod config;
pub mod orchestrator;
pub mod scanner;
pub mod server;
pub mod upload;

pub use clamd::{ClamdClient, ClamdError, Detection, DetectionStatus, Detections, Transport};
pub use config::{Config, FailAction};
pub use orchestrator::{ScanError, ScanOrchestrator, ScanVerdict, TemporaryArtifact};
pub use scanner::{AgnosticScanner, ScannerBackend, ScannerConnector, ScannerHandle, ScannerKind};
pub use server::{create_router, AppState};
pub use upload::{sanitize_filename, validate, UploadRequest, ValidationError};
