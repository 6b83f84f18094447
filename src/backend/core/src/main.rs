//! wmsnotes daemon - main entry point
//!
//! Opens the local replica, derives note titles and, when a remote replica is
//! configured, synchronizes with it periodically until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use wmsnotes_core::{
    command::{CommandBus, CommandExecutor},
    config::Config,
    policy::NoteTitlePolicy,
    replica::Replica,
    sync::{SynchronizationTask, SynchronizerState},
    telemetry,
};

#[derive(Parser, Debug)]
#[command(name = "wmsnotes-daemon", version, about = "Runs a wmsnotes replica in the background")]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "WMSNOTES_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_file(&path.to_string_lossy())?,
        None => Config::load()?,
    };

    let metrics = telemetry::init_telemetry(&config.logging, &config.metrics)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        metrics = metrics.is_enabled(),
        "Starting wmsnotes daemon"
    );

    let local = Replica::open("local", &config.storage, &config.commands).await?;

    let executor: Arc<dyn CommandExecutor> = Arc::clone(local.processor()) as Arc<dyn CommandExecutor>;
    let bus = Arc::new(CommandBus::start(
        executor,
        config.commands.bus_capacity,
        config.commands.result_timeout,
    ));

    let policy = NoteTitlePolicy::new(Arc::clone(local.log()), Arc::clone(&bus) as Arc<dyn CommandExecutor>);
    policy.start();

    let sync = match &config.sync.remote_dir {
        Some(remote_dir) => {
            let remote = Replica::open("remote", &config.storage.at(remote_dir), &config.commands).await?;
            let state_file = config.sync.state_file_in(&config.storage.data_dir);
            let state = SynchronizerState::load(&state_file).await?;

            let synchronizer = Arc::new(local.synchronizer(&remote, &config.sync).with_state(state));
            let task = SynchronizationTask::new(Arc::clone(&synchronizer), config.sync.interval)
                .with_state_path(&state_file);
            task.start();
            tracing::info!(remote = %remote_dir.display(), interval = ?config.sync.interval, "Synchronization enabled");
            Some((task, synchronizer, state_file))
        }
        None => {
            tracing::info!("No remote replica configured, synchronization disabled");
            None
        }
    };

    shutdown_signal().await;

    if let Some((task, synchronizer, state_file)) = sync {
        task.shutdown().await;
        synchronizer.state().save(&state_file).await?;
        tracing::info!(state_file = %state_file.display(), "Synchronizer state saved");
    }
    policy.shutdown().await;
    bus.shutdown().await;

    tracing::info!("Daemon shutdown complete");
    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
