//! Hive coordinator binary.
//!
//! Serves the worker lifecycle API and routes requests to workers.

use anyhow::Context;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use hive_coordinator::{api, store, AppState, CoordinatorConfig, HttpBackend, MemoryKv};

#[derive(Debug, Parser)]
#[command(name = "hive-coordinator", version, about)]
struct Cli {
    /// Configuration file (defaults to ./coordinator.toml when present).
    #[arg(short, long, env = "HIVE_COORDINATOR_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    info!("Hive coordinator starting");

    let config = match &cli.config {
        Some(path) => CoordinatorConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CoordinatorConfig::load().context("loading coordinator.toml")?,
    };
    info!(
        listen_addr = %config.api.listen_addr,
        soft_timeout_secs = config.liveness.soft_timeout.as_secs(),
        hard_timeout_secs = config.liveness.hard_timeout.as_secs(),
        max_writes = config.persistence.max_writes,
        "Configuration loaded"
    );

    let prometheus = if config.metrics.enabled {
        match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "Failed to install metrics recorder");
                None
            }
        }
    } else {
        None
    };

    let kv = match store::connect(&config.store).await {
        Ok(kv) => kv,
        Err(e) => {
            error!(error = %e, "Failed to connect to store, using in-memory store");
            Arc::new(MemoryKv::new())
        }
    };

    let flush_interval = config.persistence.flush_interval;
    let listen_addr = config.api.listen_addr;
    let mut state = AppState::new(config, kv, Arc::new(HttpBackend::new()));
    if let Some(handle) = prometheus {
        state = state.with_prometheus(handle);
    }
    let state = Arc::new(state);

    match state.registry.restore().await {
        Ok(report) => info!(workers = report.workers, "Registry restored"),
        Err(e) => error!(error = %e, "Failed to restore registry, starting empty"),
    }

    // Background tasks
    let cancel = CancellationToken::new();
    let sweeper = tokio::spawn(state.sweeper.clone().run(cancel.clone()));
    let flusher = tokio::spawn(
        state
            .store
            .clone()
            .run_flusher(flush_interval, cancel.clone()),
    );

    let app = api::router(state);
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("binding {listen_addr}"))?;
    info!(addr = %listen_addr, "Coordinator API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel.cancel();
    for (name, task) in [("sweeper", sweeper), ("flusher", flusher)] {
        if let Err(e) = task.await {
            error!(task = name, error = %e, "Background task failed");
        }
    }

    info!("Coordinator shutdown complete");
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "debug,hyper=info,tower=info"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            info!("received SIGTERM, initiating shutdown");
        }
    }
}
