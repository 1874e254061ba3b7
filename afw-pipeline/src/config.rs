//! Configuration resolution for afw-pipeline
//!
//! Priority: CLI flag / environment variable → TOML file → compiled default.
//! Numeric settings are clamped to safe ranges after resolution.

use afw_common::config::TomlConfig;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_WORKER_COUNT: usize = 4;
pub const MAX_WORKER_COUNT: usize = 64;
pub const DEFAULT_QUEUE_SIZE: usize = 128;
pub const MIN_QUEUE_SIZE: usize = 8;
pub const MAX_QUEUE_SIZE: usize = 1024;
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_WATCH_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_BACKFILL_LIMIT: i64 = 200;
pub const DEFAULT_BACKFILL_RETRY_WINDOW_MS: u64 = 5_000;
pub const DEFAULT_BACKFILL_POLL_INTERVAL_MS: u64 = 100;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;
pub const DEFAULT_LOG_FILTER: &str = "afw_pipeline=info,afw_common=info,tower_http=info";

/// Command-line arguments for afw-pipeline
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "afw-pipeline")]
#[command(about = "Call-recording processing pipeline with an idempotent job queue")]
#[command(version)]
pub struct Args {
    /// Path to the TOML config file
    #[arg(short, long, env = "AFW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory watched for incoming call recordings
    #[arg(long, env = "AFW_CALLS_DIR")]
    pub calls_dir: Option<PathBuf>,

    /// Per-artifact working directory root
    #[arg(long, env = "AFW_WORK_DIR")]
    pub work_dir: Option<PathBuf>,

    /// SQLite database file
    #[arg(long, env = "AFW_DB_PATH")]
    pub db_path: Option<PathBuf>,

    /// HTTP port
    #[arg(short, long, env = "AFW_PORT")]
    pub port: Option<u16>,

    /// Number of queue workers (1..=64)
    #[arg(long, env = "AFW_WORKER_COUNT")]
    pub worker_count: Option<i64>,

    /// Queue buffer capacity (8..=1024)
    #[arg(long, env = "AFW_QUEUE_SIZE")]
    pub queue_size: Option<i64>,

    /// Per-job timeout in seconds
    #[arg(long, env = "AFW_JOB_TIMEOUT_SECS")]
    pub job_timeout_secs: Option<u64>,

    /// Poll the calls directory for new files
    #[arg(long, env = "AFW_ENABLE_WATCHER")]
    pub enable_watcher: Option<bool>,

    /// Maximum files re-enqueued by the startup backfill (0 = no cap)
    #[arg(long, env = "AFW_BACKFILL_LIMIT", allow_hyphen_values = true)]
    pub backfill_limit: Option<i64>,
}

/// Fully resolved runtime configuration
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub calls_dir: PathBuf,
    pub work_dir: PathBuf,
    pub db_path: PathBuf,
    pub port: u16,
    pub worker_count: usize,
    pub queue_size: usize,
    pub job_timeout: Duration,
    pub enable_watcher: bool,
    pub watch_interval: Duration,
    pub backfill_enabled: bool,
    /// `0` means no cap
    pub backfill_limit: i64,
    pub backfill_retry_window: Duration,
    pub backfill_poll_interval: Duration,
    pub shutdown_grace: Duration,
    pub log_filter: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            calls_dir: PathBuf::from("./calls"),
            work_dir: PathBuf::from("./work"),
            db_path: PathBuf::from("./alert.db"),
            port: DEFAULT_PORT,
            worker_count: DEFAULT_WORKER_COUNT,
            queue_size: DEFAULT_QUEUE_SIZE,
            job_timeout: Duration::from_secs(DEFAULT_JOB_TIMEOUT_SECS),
            enable_watcher: true,
            watch_interval: Duration::from_millis(DEFAULT_WATCH_INTERVAL_MS),
            backfill_enabled: true,
            backfill_limit: DEFAULT_BACKFILL_LIMIT,
            backfill_retry_window: Duration::from_millis(DEFAULT_BACKFILL_RETRY_WINDOW_MS),
            backfill_poll_interval: Duration::from_millis(DEFAULT_BACKFILL_POLL_INTERVAL_MS),
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl PipelineConfig {
    /// Merge CLI/env, TOML and defaults, then clamp
    pub fn resolve(args: &Args, toml: &TomlConfig) -> Self {
        let defaults = Self::default();

        let worker_count = args.worker_count.or(toml.worker_count);
        let queue_size = args.queue_size.or(toml.queue_size);
        let job_timeout_secs = args
            .job_timeout_secs
            .or(toml.job_timeout_secs)
            .unwrap_or(DEFAULT_JOB_TIMEOUT_SECS);
        let backfill_limit = args
            .backfill_limit
            .or(toml.backfill_limit)
            .unwrap_or(DEFAULT_BACKFILL_LIMIT);

        Self {
            calls_dir: args
                .calls_dir
                .clone()
                .or_else(|| toml.calls_dir.clone())
                .unwrap_or(defaults.calls_dir),
            work_dir: args
                .work_dir
                .clone()
                .or_else(|| toml.work_dir.clone())
                .unwrap_or(defaults.work_dir),
            db_path: args
                .db_path
                .clone()
                .or_else(|| toml.db_path.clone())
                .unwrap_or(defaults.db_path),
            port: args.port.or(toml.port).unwrap_or(DEFAULT_PORT),
            worker_count: worker_count.map(clamp_worker_count).unwrap_or(DEFAULT_WORKER_COUNT),
            queue_size: queue_size.map(clamp_queue_size).unwrap_or(DEFAULT_QUEUE_SIZE),
            job_timeout: Duration::from_secs(job_timeout_secs.max(1)),
            enable_watcher: args.enable_watcher.or(toml.enable_watcher).unwrap_or(true),
            watch_interval: Duration::from_millis(
                toml.watch_interval_ms.unwrap_or(DEFAULT_WATCH_INTERVAL_MS).max(10),
            ),
            backfill_enabled: toml.backfill_enabled.unwrap_or(true),
            backfill_limit: normalize_backfill_limit(backfill_limit),
            backfill_retry_window: Duration::from_millis(
                toml.backfill_retry_window_ms
                    .unwrap_or(DEFAULT_BACKFILL_RETRY_WINDOW_MS),
            ),
            backfill_poll_interval: Duration::from_millis(
                toml.backfill_poll_interval_ms
                    .unwrap_or(DEFAULT_BACKFILL_POLL_INTERVAL_MS)
                    .max(1),
            ),
            shutdown_grace: Duration::from_secs(
                toml.shutdown_grace_secs.unwrap_or(DEFAULT_SHUTDOWN_GRACE_SECS),
            ),
            log_filter: toml
                .log_filter
                .clone()
                .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
        }
    }
}

pub fn clamp_worker_count(value: i64) -> usize {
    let clamped = value.clamp(1, MAX_WORKER_COUNT as i64) as usize;
    if clamped as i64 != value {
        warn!(requested = value, using = clamped, "worker_count out of range, clamped");
    }
    clamped
}

pub fn clamp_queue_size(value: i64) -> usize {
    let clamped = value.clamp(MIN_QUEUE_SIZE as i64, MAX_QUEUE_SIZE as i64) as usize;
    if clamped as i64 != value {
        warn!(requested = value, using = clamped, "queue_size out of range, clamped");
    }
    clamped
}

/// Negative limits mean "no cap", same as zero
pub fn normalize_backfill_limit(value: i64) -> i64 {
    value.max(0)
}
