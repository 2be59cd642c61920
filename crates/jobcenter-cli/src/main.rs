use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use jobcenter_control::ControlClient;
use jobcenter_core::config::DEFAULT_SERVER_SOCKET;

mod commands;

#[derive(Parser)]
#[command(name = "jc", about = "JobCenter: submit and manage container jobs", version)]
struct Cli {
    /// Control socket of the JobCenter server.
    #[arg(long, global = true, default_value = DEFAULT_SERVER_SOCKET)]
    socket: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit the job described by a YAML file.
    Submit {
        /// Job description (`scheduling_constraints`, `docker_constraints`, `docker_context`, ...)
        file: PathBuf,
    },
    /// Cancel one of your jobs.
    Cancel {
        #[command(flatten)]
        target: commands::Target,
    },
    /// Show a job's current entry.
    Query {
        #[command(flatten)]
        target: commands::Target,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("jc=warn".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let command = match cli.command {
        Commands::Submit { file } => commands::submit(&file)?,
        Commands::Cancel { target } => commands::cancel(target)?,
        Commands::Query { target } => commands::query(target)?,
    };
    let response = ControlClient::local(&cli.socket).send(&command).await?;
    println!("{}", commands::render(&response));
    Ok(if response.is_success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
