//! Configuration file model and loading
//!
//! Settings resolve in priority order:
//! 1. Command-line argument or environment variable (highest priority)
//! 2. TOML config file
//! 3. Compiled default (fallback)
//!
//! This module owns the TOML layer. A missing config file is not an error:
//! services log a warning and continue with defaults.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable that points at an explicit config file
pub const CONFIG_PATH_ENV: &str = "AFW_CONFIG";

/// Optional settings read from `afw-pipeline.toml`
///
/// Every field is optional so partial files are valid; unset fields fall
/// through to compiled defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    /// Directory watched for incoming call recordings
    pub calls_dir: Option<PathBuf>,
    /// Scratch directory for per-artifact stage output
    pub work_dir: Option<PathBuf>,
    /// SQLite database path
    pub db_path: Option<PathBuf>,
    /// HTTP listen port
    pub port: Option<u16>,
    /// Number of queue workers
    pub worker_count: Option<i64>,
    /// Queue buffer capacity
    pub queue_size: Option<i64>,
    /// Per-job timeout in seconds
    pub job_timeout_secs: Option<u64>,
    /// Enable the directory watcher
    pub enable_watcher: Option<bool>,
    /// Watcher poll interval in milliseconds
    pub watch_interval_ms: Option<u64>,
    /// Run a backfill pass at startup
    pub backfill_enabled: Option<bool>,
    /// Maximum artifacts re-enqueued per backfill pass (0 or negative = no cap)
    pub backfill_limit: Option<i64>,
    /// How long backfill keeps retrying a full queue, in milliseconds
    pub backfill_retry_window_ms: Option<u64>,
    /// Backfill retry poll interval in milliseconds
    pub backfill_poll_interval_ms: Option<u64>,
    /// Graceful shutdown drain window in seconds
    pub shutdown_grace_secs: Option<u64>,
    /// Default tracing filter when RUST_LOG is unset
    pub log_filter: Option<String>,
}

/// Get the platform default config file path
///
/// `~/.config/afw/afw-pipeline.toml` on Linux, the platform config directory
/// elsewhere.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("afw").join("afw-pipeline.toml"))
}

/// Pick the config file to read: explicit path, then `AFW_CONFIG`, then the
/// platform default
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    default_config_path()
}

/// Load the TOML config file
///
/// Returns defaults (all `None`) when the file does not exist. Returns
/// `Error::Config` when the file exists but cannot be read or parsed.
pub fn load_toml_config(path: Option<&Path>) -> Result<TomlConfig> {
    let Some(path) = path else {
        warn!("No config file location available, using defaults");
        return Ok(TomlConfig::default());
    };

    if !path.exists() {
        warn!("Config file not found: {} (using defaults)", path.display());
        return Ok(TomlConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
    let config: TomlConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))?;

    info!("Loaded config file: {}", path.display());
    Ok(config)
}

/// Write a TOML config file, creating the parent directory if needed
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize config failed: {}", e)))?;
    std::fs::write(path, content)?;
    Ok(())
}
