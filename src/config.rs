//! Configuration types for the upload gateway.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration for the upload gateway.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Global settings.
    #[serde(default)]
    pub settings: Settings,

    /// HTTP listener configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Upload validation and temp storage.
    #[serde(default)]
    pub upload: UploadConfig,

    /// ClamAV daemon configuration.
    #[serde(default)]
    pub clamd: ClamdConfig,
}

/// Global settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    /// What the agnostic fallback does when no daemon is reachable.
    #[serde(default)]
    pub fail_action: FailAction,

    /// Log malware detections.
    #[serde(default = "default_true")]
    pub log_detections: bool,

    /// Log clean scans.
    #[serde(default)]
    pub log_clean: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            fail_action: FailAction::default(),
            log_detections: true,
            log_clean: false,
        }
    }
}

/// Action to take when neither daemon transport is reachable.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailAction {
    /// Report uploads as clean (fail-open).
    #[default]
    Allow,
    /// Fail the scan with a server error (fail-closed).
    Block,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Bind address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Allow cross-origin requests from any origin.
    #[serde(default = "default_true")]
    pub cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors: true,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

/// Upload validation and temporary storage.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UploadConfig {
    /// Maximum accepted upload size (bytes).
    #[serde(default = "default_max_size")]
    pub max_size: usize,

    /// Accepted file extensions, compared case-insensitively.
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,

    /// Directory under which per-request scan directories are created.
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            allowed_extensions: default_allowed_extensions(),
            temp_dir: default_temp_dir(),
        }
    }
}

impl UploadConfig {
    /// Size ceiling in whole MiB, as reported to clients.
    pub fn max_size_mb(&self) -> usize {
        self.max_size / (1024 * 1024)
    }

    /// Check whether an extension (without the dot) is on the allow-list.
    pub fn is_extension_allowed(&self, extension: &str) -> bool {
        self.allowed_extensions
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(extension))
    }
}

fn default_max_size() -> usize {
    31_457_280 // 30MB
}

fn default_allowed_extensions() -> Vec<String> {
    [
        "txt", "pdf", "doc", "docx", "xls", "xlsx", "zip", "rar", "exe", "msi", "bat", "cmd",
        "js", "vbs", "ps1",
    ]
    .iter()
    .map(|ext| ext.to_string())
    .collect()
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir()
}

/// ClamAV daemon configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClamdConfig {
    /// Host of the clamd TCP listener.
    #[serde(default = "default_clamd_host")]
    pub host: String,

    /// Port of the clamd TCP listener.
    #[serde(default = "default_clamd_port")]
    pub port: u16,

    /// Path to clamd Unix socket.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Timeout for each daemon I/O operation in milliseconds.
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,

    /// Upper bound for a whole scan (connect, scan, version) in milliseconds.
    #[serde(default = "default_scan_timeout")]
    pub scan_timeout_ms: u64,

    /// Chunk size for streaming to clamd.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for ClamdConfig {
    fn default() -> Self {
        Self {
            host: default_clamd_host(),
            port: default_clamd_port(),
            socket_path: default_socket_path(),
            timeout_ms: default_timeout(),
            scan_timeout_ms: default_scan_timeout(),
            chunk_size: default_chunk_size(),
        }
    }
}

fn default_clamd_host() -> String {
    "127.0.0.1".to_string()
}

fn default_clamd_port() -> u16 {
    3310
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/var/run/clamav/clamd.ctl")
}

fn default_timeout() -> u64 {
    30000 // 30 seconds
}

fn default_scan_timeout() -> u64 {
    60000
}

fn default_chunk_size() -> usize {
    65536 // 64KB
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Config = if expanded.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(&expanded)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.upload.max_size == 0 {
            anyhow::bail!("upload.max_size must be greater than 0");
        }

        if self.upload.allowed_extensions.is_empty() {
            anyhow::bail!("upload.allowed_extensions must not be empty");
        }

        if let Some(ext) = self
            .upload
            .allowed_extensions
            .iter()
            .find(|ext| ext.is_empty() || ext.contains('.'))
        {
            anyhow::bail!(
                "upload.allowed_extensions entry {:?} must be a bare extension without a dot",
                ext
            );
        }

        if self.clamd.timeout_ms == 0 {
            anyhow::bail!("clamd.timeout_ms must be greater than 0");
        }

        if self.clamd.scan_timeout_ms == 0 {
            anyhow::bail!("clamd.scan_timeout_ms must be greater than 0");
        }

        if self.clamd.chunk_size == 0 {
            anyhow::bail!("clamd.chunk_size must be greater than 0");
        }

        Ok(())
    }

    /// Generate example configuration YAML.
    pub fn example() -> String {
        r#"# Upload Gateway Configuration

settings:
  fail_action: allow           # allow or block when no clamd transport answers
  log_detections: true
  log_clean: false

# HTTP listener
server:
  host: "0.0.0.0"
  port: 5000
  cors: true                   # permissive CORS on every route

# Upload validation
upload:
  max_size: 31457280           # 30MB
  temp_dir: "/tmp"
  allowed_extensions:
    - txt
    - pdf
    - doc
    - docx
    - xls
    - xlsx
    - zip
    - rar
    - exe
    - msi
    - bat
    - cmd
    - js
    - vbs
    - ps1

# ClamAV daemon; TCP is tried first, then the Unix socket
clamd:
  host: "127.0.0.1"            # ${VAR} references are expanded from the environment
  port: 3310
  socket_path: "/var/run/clamav/clamd.ctl"
  timeout_ms: 30000            # per daemon operation
  scan_timeout_ms: 60000       # whole scan
  chunk_size: 65536            # 64KB chunks to clamd
"#
        .to_string()
    }
}

/// Expand environment variables in the format ${VAR_NAME}.
fn expand_env_vars(content: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("static pattern is valid");
    re.replace_all(content, |cap: &regex::Captures<'_>| {
        std::env::var(&cap[1]).unwrap_or_default()
    })
    .into_owned()
}
