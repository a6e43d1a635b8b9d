//! Hive agent binary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use hive_proto::{RegisterRequest, DEFAULT_HEARTBEAT_GROUP};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use hive_agent::probe::detect_capabilities;
use hive_agent::{
    relay, AgentConfig, CoordinatorApi, CoordinatorClient, HeartbeatRelay, HeartbeatTask,
    PeerRelay, ServiceProber, WorkerIdentity,
};

#[derive(Debug, Parser)]
#[command(name = "hive-agent", version, about)]
struct Cli {
    /// Configuration file (defaults to ./agent.toml when present).
    #[arg(short, long, env = "HIVE_AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match &cli.config {
        Some(path) => AgentConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => AgentConfig::load().context("loading agent.toml")?,
    };

    let identity = WorkerIdentity::load_or_create(&config.worker.identity_path)
        .await
        .context("loading worker identity")?;
    info!(
        worker_id = %identity.worker_id(),
        coordinator = %config.coordinator.url,
        services = config.services.len(),
        "Hive agent starting"
    );

    let group = config
        .worker
        .heartbeat_group
        .clone()
        .unwrap_or_else(|| DEFAULT_HEARTBEAT_GROUP.to_owned());

    let mut registration = RegisterRequest::new(&config.worker.address)
        .with_worker_id(identity.worker_id())
        .with_capabilities(detect_capabilities(config.capabilities.clone()))
        .with_heartbeat_group(&group);
    for service in &config.services {
        registration = registration.with_service(service.declaration());
    }

    let api: Arc<dyn CoordinatorApi> = Arc::new(CoordinatorClient::new(&config.coordinator)?);
    let prober = ServiceProber::new(config.services.clone(), config.probe.timeout())?;
    let mut task = HeartbeatTask::new(api.clone(), Arc::new(prober), registration);

    let cancel = CancellationToken::new();
    let mut background = Vec::new();

    if config.relay.enabled {
        let relay = Arc::new(HeartbeatRelay::new(identity.worker_id(), &group));
        let listener = TcpListener::bind(config.relay.listen_addr)
            .await
            .with_context(|| format!("binding {}", config.relay.listen_addr))?;
        info!(addr = %config.relay.listen_addr, group = %group, "Heartbeat relay listening");

        let app = relay::router(relay.clone());
        let server_cancel = cancel.clone();
        background.push((
            "relay",
            tokio::spawn(async move {
                let shutdown = async move { server_cancel.cancelled().await };
                if let Err(e) = axum::serve(listener, app)
                    .with_graceful_shutdown(shutdown)
                    .await
                {
                    error!(error = %e, "Relay server failed");
                }
            }),
        ));
        background.push((
            "relay-flusher",
            tokio::spawn(relay.clone().run_flusher(
                api.clone(),
                config.relay.flush_interval(),
                cancel.clone(),
            )),
        ));
        task = task.with_relay(relay);
    }

    if let Some(peer_url) = &config.relay.peer_url {
        let timeout = std::time::Duration::from_secs(config.coordinator.timeout_secs);
        task = task.with_peer(PeerRelay::new(peer_url, timeout)?);
    }

    let heartbeat = tokio::spawn(task.run(cancel.clone()));

    shutdown_signal().await;
    cancel.cancel();

    if let Err(e) = heartbeat.await {
        error!(error = %e, "Heartbeat task failed");
    }
    for (name, handle) in background {
        if let Err(e) = handle.await {
            error!(task = name, error = %e, "Background task failed");
        }
    }

    info!("Agent shutdown complete");
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "debug,hyper=info,reqwest=info"
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
        () = ctrl_c => info!("received Ctrl+C, shutting down"),
        () = terminate => info!("received SIGTERM, shutting down"),
    }
}
