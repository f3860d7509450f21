//! Upload requests, validation and filename sanitization.

use crate::config::UploadConfig;
use axum::http::StatusCode;
use thiserror::Error;

/// Filename used when sanitization leaves nothing behind.
const FALLBACK_FILENAME: &str = "upload";

/// A file received on `/scan`, scoped to one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    /// Filename as declared by the client. Untrusted.
    pub filename: String,
    /// Buffered contents. Not complete when `len` exceeds the ceiling.
    pub data: Vec<u8>,
    /// Measured length of the upload in bytes.
    pub len: usize,
}

impl UploadRequest {
    pub fn new(filename: impl Into<String>, data: Vec<u8>) -> Self {
        let len = data.len();
        Self {
            filename: filename.into(),
            data,
            len,
        }
    }

    /// Extension after the last `.`, if any.
    pub fn extension(&self) -> Option<&str> {
        self.filename.rsplit_once('.').map(|(_, ext)| ext)
    }
}

/// Client-caused upload rejection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("No file provided")]
    MissingFile,
    #[error("No file selected")]
    EmptyFilename,
    #[error("File size exceeds {limit_mb}MB limit")]
    TooLarge { limit_mb: usize },
    #[error("File type not allowed")]
    DisallowedType,
}

impl ValidationError {
    pub fn status(&self) -> StatusCode {
        StatusCode::BAD_REQUEST
    }
}

/// Check an upload against the configured constraints.
///
/// Rules are applied in order and the first failure wins: presence, filename,
/// size, extension. On success the accepted upload is handed back.
pub fn validate<'a>(
    upload: Option<&'a UploadRequest>,
    config: &UploadConfig,
) -> Result<&'a UploadRequest, ValidationError> {
    let upload = upload.ok_or(ValidationError::MissingFile)?;

    if upload.filename.is_empty() {
        return Err(ValidationError::EmptyFilename);
    }

    if upload.len > config.max_size {
        return Err(ValidationError::TooLarge {
            limit_mb: config.max_size_mb(),
        });
    }

    match upload.extension() {
        Some(ext) if config.is_extension_allowed(ext) => Ok(upload),
        _ => Err(ValidationError::DisallowedType),
    }
}

/// Reduce an untrusted filename to a safe basename.
///
/// Directory components (either separator) are discarded, whitespace becomes
/// `_`, anything outside `[A-Za-z0-9._-]` is dropped, and leading or trailing
/// dots and underscores are trimmed so the result can never be `.` or `..`.
pub fn sanitize_filename(filename: &str) -> String {
    let basename = filename.rsplit(['/', '\\']).next().unwrap_or(filename);

    let cleaned: String = basename
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();

    let trimmed = cleaned.trim_matches(|c| c == '.' || c == '_');
    if trimmed.is_empty() {
        FALLBACK_FILENAME.to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> UploadConfig {
        UploadConfig::default()
    }

    fn upload(name: &str, len: usize) -> UploadRequest {
        UploadRequest::new(name, vec![b'a'; len])
    }

    #[test]
    fn test_missing_upload() {
        assert_eq!(validate(None, &config()), Err(ValidationError::MissingFile));
    }

    #[test]
    fn test_empty_filename() {
        let up = upload("", 10);
        assert_eq!(
            validate(Some(&up), &config()),
            Err(ValidationError::EmptyFilename)
        );
    }

    #[test]
    fn test_oversized_rejected_before_extension() {
        let mut cfg = config();
        cfg.max_size = 2 * 1024 * 1024;
        let up = UploadRequest {
            filename: "payload.png".to_string(),
            data: Vec::new(),
            len: cfg.max_size + 1,
        };

        let err = validate(Some(&up), &cfg).unwrap_err();
        assert_eq!(err, ValidationError::TooLarge { limit_mb: 2 });
        assert_eq!(err.to_string(), "File size exceeds 2MB limit");
    }

    #[test]
    fn test_accepted_upload_is_returned() {
        let up = upload("report.pdf", 8);
        let accepted = validate(Some(&up), &config()).unwrap();
        assert!(std::ptr::eq(accepted, &up));
    }

    #[test]
    fn test_exact_ceiling_accepted() {
        let mut cfg = config();
        cfg.max_size = 1024;
        assert!(validate(Some(&upload("ok.txt", 1024)), &cfg).is_ok());
    }

    #[test]
    fn test_extension_rules() {
        let cfg = config();
        for name in ["report.pdf", "REPORT.PDF", "archive.tar.zip", "script.Ps1"] {
            assert!(validate(Some(&upload(name, 4)), &cfg).is_ok(), "{name}");
        }
        for name in ["README", "image.png", "trailingdot.", "zip", "pdf.tar.gz"] {
            assert_eq!(
                validate(Some(&upload(name, 4)), &cfg),
                Err(ValidationError::DisallowedType),
                "{name}"
            );
        }
    }

    #[test]
    fn test_validation_messages() {
        assert_eq!(ValidationError::MissingFile.to_string(), "No file provided");
        assert_eq!(ValidationError::EmptyFilename.to_string(), "No file selected");
        assert_eq!(ValidationError::DisallowedType.to_string(), "File type not allowed");
        assert_eq!(ValidationError::MissingFile.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_sanitize_strips_directories() {
        assert_eq!(sanitize_filename("../../etc/passwd.txt"), "passwd.txt");
        assert_eq!(sanitize_filename("C:\\Users\\me\\evil.exe"), "evil.exe");
        assert_eq!(sanitize_filename("/abs/path/doc.pdf"), "doc.pdf");
    }

    #[test]
    fn test_sanitize_characters() {
        assert_eq!(sanitize_filename("my cool  file.txt"), "my_cool_file.txt");
        assert_eq!(sanitize_filename("résumé.pdf"), "rsum.pdf");
        assert_eq!(sanitize_filename("a;rm -rf $(x).bat"), "arm_-rf_x.bat");
        assert_eq!(sanitize_filename(".hidden.js"), "hidden.js");
    }

    #[test]
    fn test_sanitize_never_traverses() {
        for name in ["..", ".", "../..", "..\\..", "", "///", "日本.", "__"] {
            let safe = sanitize_filename(name);
            assert_eq!(safe, "upload", "{name:?}");
        }
    }
}
