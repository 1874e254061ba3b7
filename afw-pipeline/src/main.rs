//! afw-pipeline - call-recording processing service
//!
//! Watches a calls directory, drives each recording through the registered
//! stages via a bounded, idempotent job queue, and serves a small status API.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use afw_common::config::{load_toml_config, resolve_config_path};
use afw_common::events::EventBus;
use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use afw_pipeline::backfill::{BackfillLauncher, DirectoryRepository};
use afw_pipeline::config::{Args, PipelineConfig};
use afw_pipeline::db::JobStore;
use afw_pipeline::jobs::JobRunner;
use afw_pipeline::queue::{WorkQueue, CANCEL_GRACE};
use afw_pipeline::watcher::DirectoryWatcher;
use afw_pipeline::{build_router, stages, AppState};

/// Time for completion callbacks to persist `cancelled` after a forced stop
const CANCEL_RECORD_WAIT: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = resolve_config_path(args.config.as_deref());
    let toml_config = load_toml_config(config_path.as_deref()).context("Failed to load config file")?;
    let config = PipelineConfig::resolve(&args, &toml_config);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_filter.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting afw-pipeline v{}", env!("CARGO_PKG_VERSION"));
    if let Some(path) = &config_path {
        info!("Config file: {}", path.display());
    }
    info!(
        calls_dir = %config.calls_dir.display(),
        work_dir = %config.work_dir.display(),
        db_path = %config.db_path.display(),
        workers = config.worker_count,
        queue_size = config.queue_size,
        job_timeout_secs = config.job_timeout.as_secs(),
        "Configuration resolved"
    );

    for dir in [&config.calls_dir, &config.work_dir] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
    }

    let store = JobStore::open(&config.db_path)
        .await
        .context("Failed to open job store")?;
    info!("Database connection established");

    let event_bus = EventBus::new(256);
    let registry = stages::build_registry(&config);
    info!(stages = ?registry.stages(), "Stage registry built");

    // Root lifetime for workers, watcher and backfill
    let shutdown = CancellationToken::new();

    let queue = WorkQueue::new(config.queue_size, config.worker_count, config.job_timeout);
    queue.start(shutdown.clone());

    let runner = JobRunner::new(store, registry, queue.clone(), event_bus.clone());

    let watcher_handle = if config.enable_watcher {
        let watcher = DirectoryWatcher::new(
            config.calls_dir.clone(),
            config.watch_interval,
            runner.clone(),
        );
        Some(watcher.spawn(shutdown.child_token()))
    } else {
        info!("Directory watcher disabled");
        None
    };

    let repo = DirectoryRepository::new(
        config.calls_dir.clone(),
        runner.clone(),
        event_bus.clone(),
        config.backfill_retry_window,
        config.backfill_poll_interval,
    );
    let backfill = BackfillLauncher::new(Arc::new(repo), shutdown.child_token(), config.backfill_limit);

    if config.backfill_enabled {
        // Fire-and-forget; the summary lands in the launcher's tracker
        let _ = backfill.launch(None);
    } else {
        info!("Startup backfill disabled");
    }

    let state = AppState::new(runner, backfill, event_bus);
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("HTTP server stopped, draining queue");
    if let Some(handle) = watcher_handle {
        handle.abort();
    }
    if !queue.stop(config.shutdown_grace).await {
        warn!(
            grace_secs = config.shutdown_grace.as_secs(),
            "Queue did not drain in time, cancelling in-flight jobs"
        );
        queue.cancel_and_wait(CANCEL_GRACE + CANCEL_RECORD_WAIT).await;
    }
    shutdown.cancel();

    info!("Shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
