//! jobcenterd: the JobCenter daemon.
//!
//! One binary for both roles:
//! - **server**: database, scheduler, control socket and statistics API
//! - **worker**: runs dispatched jobs in docker containers
//!
//! # Usage
//!
//! ```text
//! jobcenterd server --config /etc/jobcenter/server.yaml
//! jobcenterd worker --config /etc/jobcenter/worker.yaml
//! jobcenterd worker -k            # ask the local worker to stop
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use jobcenter_control::{
    CommandSet, ControlClient, KillCommand, ServerCommand, WorkerCommand,
};
use jobcenter_core::{ServerConfig, WorkerConfig};
use jobcenter_server::JobCenter;
use jobcenter_worker::{DockerCliRuntime, WorkerDaemon};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::info;

#[derive(Parser)]
#[command(name = "jobcenterd", about = "JobCenter daemon", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the central scheduling server.
    Server {
        #[arg(short, long, default_value = "/etc/jobcenter/server.yaml")]
        config: PathBuf,

        /// Send KillCommand to the running server and exit.
        #[arg(short, long)]
        kill: bool,
    },
    /// Run a worker on this machine.
    Worker {
        #[arg(short, long, default_value = "/etc/jobcenter/worker.yaml")]
        config: PathBuf,

        /// Send KillCommand to the running worker and exit.
        #[arg(short, long)]
        kill: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new("info,jobcenter=debug"))?,
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Server { config, kill } => {
            let config = load(&config, ServerConfig::from_file)?;
            if kill {
                let kill = ServerCommand::Kill(KillCommand {});
                return send_kill(&config.control_socket, &kill).await;
            }
            run_server(config).await?;
        }
        Command::Worker { config, kill } => {
            let config = load(&config, WorkerConfig::from_file)?;
            if kill {
                let kill = WorkerCommand::Kill(KillCommand {});
                return send_kill(&config.control_socket, &kill).await;
            }
            run_worker(config).await?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn load<T, E>(path: &Path, read: impl FnOnce(&Path) -> Result<T, E>) -> anyhow::Result<T>
where
    E: std::error::Error + Send + Sync + 'static,
{
    read(path).with_context(|| format!("loading {}", path.display()))
}

async fn send_kill<C: CommandSet>(socket: &Path, kill: &C) -> anyhow::Result<ExitCode> {
    let response = ControlClient::local(socket)
        .send(kill)
        .await
        .with_context(|| format!("contacting {}", socket.display()))?;
    println!("{}", response.result_string);
    Ok(if response.is_success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Flip the returned channel on SIGTERM or SIGINT.
fn signal_shutdown() -> std::io::Result<watch::Receiver<bool>> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("received SIGINT, shutting down"),
        }
        let _ = tx.send(true);
    });
    Ok(rx)
}

async fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    info!(socket = %config.control_socket.display(), "JobCenter server starting");
    let center = JobCenter::open(config)?;
    let connector = center.socket_connector();
    center.run(connector, signal_shutdown()?).await?;
    Ok(())
}

async fn run_worker(config: WorkerConfig) -> anyhow::Result<()> {
    info!(socket = %config.control_socket.display(), "JobCenter worker starting");
    let runtime = Arc::new(DockerCliRuntime::default());
    WorkerDaemon::new(config, runtime)
        .run(signal_shutdown()?)
        .await?;
    Ok(())
}
