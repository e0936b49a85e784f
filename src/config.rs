//! Service configuration module.
//!
//! Handles loading, validating, and merging `pixshift.toml`. Stock defaults
//! are the base layer; a user file overrides any subset of keys on top.
//!
//! ## Configuration Options
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! [server]
//! host = "127.0.0.1"
//! port = 8080
//! max_upload_bytes = 52428800   # 50 MiB per file
//! cors_origins = []             # empty = allow any origin
//!
//! [sessions]
//! ttl_secs = 600                # idle lifetime of an edit session
//! sweep_interval_secs = 120     # how often expired sessions are removed
//! max_sessions = 64             # oldest session is evicted beyond this
//!
//! [memory]
//! sample_interval_secs = 15
//! warn_mb = 384
//! critical_mb = 512
//!
//! [uploads]
//! temp_dir = ""                 # empty = <system temp>/pixshift-uploads
//!
//! [defaults]
//! quality = 90                  # convert and session quality
//! compress_quality = 80         # compress without a byte budget
//!
//! [processing]
//! max_threads = 4               # batch workers (omit for auto = CPU cores)
//! ```
//!
//! Config files are sparse: override just the values you want. Unknown keys
//! are rejected to catch typos early.

use crate::governor::Thresholds;
use crate::imaging::Quality;
use crate::uploads::UploadStaging;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// File looked up in the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "pixshift.toml";

const MIB: u64 = 1024 * 1024;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Service configuration loaded from `pixshift.toml`.
///
/// All fields have sensible defaults. User config files need only specify
/// the values they want to override. Unknown keys are rejected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PixshiftConfig {
    /// HTTP listener and request limits.
    pub server: ServerConfig,
    /// Edit session lifetime and capacity.
    pub sessions: SessionsConfig,
    /// Memory governor sampling and thresholds.
    pub memory: MemoryConfig,
    /// Where multipart uploads are staged.
    pub uploads: UploadsConfig,
    /// Default encode qualities.
    pub defaults: DefaultsConfig,
    /// Batch parallelism.
    pub processing: ProcessingConfig,
}

impl PixshiftConfig {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Validation("server.port must be non-zero".into()));
        }
        if self.server.max_upload_bytes == 0 {
            return Err(ConfigError::Validation(
                "server.max_upload_bytes must be non-zero".into(),
            ));
        }
        if self.sessions.ttl_secs == 0 || self.sessions.sweep_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "sessions.ttl_secs and sessions.sweep_interval_secs must be non-zero".into(),
            ));
        }
        if self.sessions.max_sessions == 0 {
            return Err(ConfigError::Validation(
                "sessions.max_sessions must be at least 1".into(),
            ));
        }
        if self.memory.sample_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "memory.sample_interval_secs must be non-zero".into(),
            ));
        }
        if self.memory.warn_mb >= self.memory.critical_mb {
            return Err(ConfigError::Validation(
                "memory.warn_mb must be below memory.critical_mb".into(),
            ));
        }
        for (key, value) in [
            ("defaults.quality", self.defaults.quality),
            ("defaults.compress_quality", self.defaults.compress_quality),
        ] {
            if !(1..=100).contains(&value) {
                return Err(ConfigError::Validation(format!("{key} must be 1-100")));
            }
        }
        if self.processing.max_threads == Some(0) {
            return Err(ConfigError::Validation(
                "processing.max_threads must be at least 1 when set".into(),
            ));
        }
        Ok(())
    }

    /// Settings the request-handling service needs.
    pub fn service(&self) -> ServiceConfig {
        ServiceConfig {
            session_ttl: Duration::from_secs(self.sessions.ttl_secs),
            max_sessions: self.sessions.max_sessions,
            default_quality: Quality::new(self.defaults.quality),
            compress_quality: Quality::new(self.defaults.compress_quality),
        }
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            warn_bytes: self.memory.warn_mb * MIB,
            critical_bytes: self.memory.critical_mb * MIB,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Per-file upload cap in bytes. Larger uploads are rejected with 413.
    pub max_upload_bytes: u64,
    /// Allowed CORS origins. Empty allows any origin.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            max_upload_bytes: 50 * MIB,
            cors_origins: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionsConfig {
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub max_sessions: usize,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: crate::session::DEFAULT_TTL.as_secs(),
            sweep_interval_secs: crate::session::DEFAULT_SWEEP_INTERVAL.as_secs(),
            max_sessions: crate::session::DEFAULT_CAPACITY,
        }
    }
}

impl SessionsConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemoryConfig {
    pub sample_interval_secs: u64,
    pub warn_mb: u64,
    pub critical_mb: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: crate::governor::DEFAULT_SAMPLE_INTERVAL.as_secs(),
            warn_mb: crate::governor::DEFAULT_WARN_BYTES / MIB,
            critical_mb: crate::governor::DEFAULT_CRITICAL_BYTES / MIB,
        }
    }
}

impl MemoryConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UploadsConfig {
    /// Staging directory. Empty means the system temp dir.
    pub temp_dir: String,
}

impl UploadsConfig {
    pub fn staging_dir(&self) -> PathBuf {
        if self.temp_dir.trim().is_empty() {
            UploadStaging::default_dir()
        } else {
            PathBuf::from(&self.temp_dir)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DefaultsConfig {
    /// Quality for conversions and session edits (1-100).
    pub quality: u32,
    /// Quality for compression without a byte budget (1-100).
    pub compress_quality: u32,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            quality: 90,
            compress_quality: 80,
        }
    }
}

/// Parallel processing settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessingConfig {
    /// Maximum number of parallel batch workers.
    /// When absent, defaults to the number of CPU cores.
    /// Values larger than the core count are clamped down.
    pub max_threads: Option<usize>,
}

/// Resolve the effective thread count from config.
///
/// - `None` → use all available cores
/// - `Some(n)` → use `min(n, cores)` (user can constrain down, not up)
pub fn effective_threads(config: &ProcessingConfig) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    config.max_threads.map(|n| n.min(cores)).unwrap_or(cores)
}

/// What [`ImageService`](crate::service::ImageService) needs to run, in
/// resolved units.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub session_ttl: Duration,
    pub max_sessions: usize,
    pub default_quality: Quality,
    pub compress_quality: Quality,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        PixshiftConfig::default().service()
    }
}

/// Returns the stock default config as a `toml::Value::Table`.
///
/// This is the canonical representation of all default values, used as the
/// base layer for merging user overrides on top.
pub fn stock_defaults_value() -> Result<toml::Value, ConfigError> {
    Ok(toml::Value::try_from(PixshiftConfig::default())?)
}

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay replace base values entirely.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Read a config file as a raw TOML value. `Ok(None)` if it doesn't exist.
pub fn load_raw_config(path: &Path) -> Result<Option<toml::Value>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    let value: toml::Value = toml::from_str(&content)?;
    Ok(Some(value))
}

/// Merge an optional overlay onto the stock defaults, then deserialize and
/// validate.
pub fn resolve_config(overlay: Option<toml::Value>) -> Result<PixshiftConfig, ConfigError> {
    let base = stock_defaults_value()?;
    let merged = match overlay {
        Some(ov) => merge_toml(base, ov),
        None => base,
    };
    let config: PixshiftConfig = merged.try_into()?;
    config.validate()?;
    Ok(config)
}

/// Load config from `path`, falling back to stock defaults when the file
/// is missing.
pub fn load_config(path: &Path) -> Result<PixshiftConfig, ConfigError> {
    resolve_config(load_raw_config(path)?)
}

/// Returns a fully-commented stock `pixshift.toml` with all keys and
/// explanations.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# pixshift Configuration
# ======================
#
# All settings are optional. Remove or comment out any you don't need.
# Values shown below are the defaults.
#
# Unknown keys will cause an error.

# ---------------------------------------------------------------------------
# HTTP server
# ---------------------------------------------------------------------------
[server]
host = "127.0.0.1"
port = 8080

# Largest accepted upload, per file, in bytes. Bigger uploads get HTTP 413.
max_upload_bytes = 52428800

# Origins allowed by CORS. An empty list allows any origin.
cors_origins = []

# ---------------------------------------------------------------------------
# Edit sessions (resize, then rotate, then download)
# ---------------------------------------------------------------------------
[sessions]
# Seconds a session lives after its last change.
ttl_secs = 600

# Seconds between sweeps that drop expired sessions.
sweep_interval_secs = 120

# Upper bound on live sessions. The oldest one is evicted to make room.
max_sessions = 64

# ---------------------------------------------------------------------------
# Memory governor
# ---------------------------------------------------------------------------
[memory]
# Seconds between resident memory samples.
sample_interval_secs = 15

# Above this, expired sessions are swept early.
warn_mb = 384

# Above this, every session and staged upload is dropped.
critical_mb = 512

# ---------------------------------------------------------------------------
# Upload staging
# ---------------------------------------------------------------------------
[uploads]
# Directory for in-flight uploads. Empty uses the system temp directory.
temp_dir = ""

# ---------------------------------------------------------------------------
# Default qualities (1-100)
# ---------------------------------------------------------------------------
[defaults]
# Conversions and session edits.
quality = 90

# Compression when no target size is given.
compress_quality = 80

# ---------------------------------------------------------------------------
# Processing
# ---------------------------------------------------------------------------
[processing]
# Maximum parallel batch workers. Omit to use all CPU cores.
# Values above the core count are clamped down.
# max_threads = 4
"##
}
