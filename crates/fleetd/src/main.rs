//! fleetd — the FleetGrid daemon.
//!
//! Single binary that assembles the rollout engine:
//! - State store (redb)
//! - Update orchestrator + dispatch event processor
//! - HTTP collaborators (dispatcher, repo builder, notification bus)
//! - REST API
//!
//! # Usage
//!
//! ```text
//! fleetd serve --config /etc/fleetgrid/fleetd.toml
//! fleetd recover --data-dir /var/lib/fleetgrid
//! ```

mod config;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fleetgrid_api::{ApiState, build_router};
use fleetgrid_clients::{FilePublisher, HttpDispatcher, HttpEventBus, HttpRepoBuilder};
use fleetgrid_rollout::{
    Collaborators, DispatchEventProcessor, Notifier, RolloutSupervisor, UpdateOrchestrator,
    recover_interrupted_rollouts,
};
use fleetgrid_state::StateStore;

use crate::config::FleetdConfig;

const DB_FILE: &str = "fleetgrid.redb";

#[derive(Parser)]
#[command(name = "fleetd", about = "FleetGrid rollout daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the API and rollout engine.
    Serve {
        /// Path to the fleetd.toml configuration file.
        #[arg(long, default_value = "/etc/fleetgrid/fleetd.toml")]
        config: PathBuf,

        /// Override the configured listen port.
        #[arg(long)]
        port: Option<u16>,

        /// Override the configured data directory.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Mark rollouts left in `building` by a previous process as failed, then exit.
    Recover {
        /// Data directory holding the state database.
        #[arg(long, default_value = "/var/lib/fleetgrid")]
        data_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,fleetd=debug,fleetgrid=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            port,
            data_dir,
        } => {
            let mut config = FleetdConfig::from_file(&config)?;
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(data_dir) = data_dir {
                config.server.data_dir = data_dir;
            }
            run_serve(config).await
        }
        Command::Recover { data_dir } => {
            let store = open_store(&data_dir)?;
            let recovered = recover_interrupted_rollouts(&store)?;
            info!(count = recovered.len(), ids = ?recovered, "recovery sweep complete");
            Ok(())
        }
    }
}

fn open_store(data_dir: &Path) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join(DB_FILE);
    info!(path = %db_path.display(), "opening state store");
    Ok(StateStore::open(&db_path)?)
}

fn build_notifier(config: &FleetdConfig) -> anyhow::Result<Notifier> {
    match &config.notifications {
        Some(notifications) => {
            info!(url = %notifications.url, "notifications enabled");
            let bus = HttpEventBus::new(
                notifications.url.clone(),
                Duration::from_secs(notifications.timeout_secs),
            )?;
            Ok(Notifier::new(Arc::new(bus), notifications.settings.clone()))
        }
        None => {
            info!("notifications disabled");
            Ok(Notifier::disabled())
        }
    }
}

async fn run_serve(config: FleetdConfig) -> anyhow::Result<()> {
    info!("FleetGrid daemon starting");

    // ── State store ────────────────────────────────────────────
    let store = open_store(&config.server.data_dir)?;
    let recovered = recover_interrupted_rollouts(&store)?;
    if !recovered.is_empty() {
        warn!(ids = ?recovered, "marked interrupted rollouts as failed");
    }

    // ── Collaborators ──────────────────────────────────────────
    let collaborators = Collaborators {
        builder: Arc::new(HttpRepoBuilder::new(
            &config.repo_builder.url,
            Duration::from_secs(config.repo_builder.timeout_secs),
        )?),
        publisher: Arc::new(FilePublisher::new(
            config.scripts.dir.clone(),
            &config.scripts.public_url,
            config.scripts.fleet_env.clone(),
        )),
        dispatcher: Arc::new(HttpDispatcher::new(
            &config.dispatcher.url,
            Duration::from_secs(config.dispatcher.timeout_secs),
        )?),
    };
    let notifier = build_notifier(&config)?;

    // ── Rollout engine ─────────────────────────────────────────
    let shutdown = CancellationToken::new();
    let supervisor = Arc::new(RolloutSupervisor::new(store.clone(), shutdown.clone()));
    let orchestrator = Arc::new(UpdateOrchestrator::new(
        store.clone(),
        collaborators,
        notifier.clone(),
        supervisor.clone(),
        config.rollout.remote_name.clone(),
    ));
    let processor = Arc::new(DispatchEventProcessor::new(
        store.clone(),
        notifier,
        supervisor.clone(),
        config.rollout.reboot_grace(),
    ));

    // ── Start API server ───────────────────────────────────────
    let state = ApiState::new(store.clone(), orchestrator, processor);
    let tasks = state.tasks.clone();
    let router = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server starting");

    let signal_token = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            signal_token.cancel();
        })
        .await?;

    // ── Drain ──────────────────────────────────────────────────
    let grace = config.rollout.shutdown_grace();
    if !supervisor.wait_drained(grace).await {
        warn!(
            in_flight = supervisor.in_flight(),
            "rollouts still in flight after shutdown grace"
        );
    }
    tasks.close();
    if tokio::time::timeout(grace, tasks.wait()).await.is_err() {
        warn!(pending = tasks.len(), "background tasks abandoned at shutdown");
    }
    if !supervisor.wait_watchers(grace).await {
        warn!("rollout watchers still running after shutdown grace");
    }
    let recovered = recover_interrupted_rollouts(&store)?;
    if !recovered.is_empty() {
        warn!(ids = ?recovered, "marked rollouts still building at exit as failed");
    }

    info!("FleetGrid daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
