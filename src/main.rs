//! transporter - expose a private TCP service through a public server
//!
//! `transporter server` accepts agents and opens one public port per agent.
//! `transporter agent` keeps a control connection to the server and forwards
//! every public connection to a local service.

mod config;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use config::ConfigFile;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use transporter_agent::Agent;
use transporter_server::TunnelServer;

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_TIME"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "transporter")]
#[command(about = "Reverse TCP tunnel: public server and private agent")]
#[command(version = VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept agents and expose each one on its own public port
    Server(ConfigArgs),

    /// Connect to a server and forward public traffic to a local service
    Agent(ConfigArgs),
}

#[derive(Args, Debug)]
struct ConfigArgs {
    /// Path to the YAML configuration file
    #[arg(
        short = 'f',
        long = "file",
        env = "TT_CONFIG_FILE",
        default_value = "./tunnel-config.yaml"
    )]
    file: PathBuf,
}

/// Install the global subscriber; `RUST_LOG` wins over the configured level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(log_level)
            .with_context(|| format!("Invalid log level: {}", log_level))?,
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Cancel `shutdown` on Ctrl+C
fn cancel_on_ctrl_c(shutdown: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down..."),
            Err(e) => warn!(error = %e, "Failed to listen for Ctrl+C"),
        }
        shutdown.cancel();
    });
}

async fn run_server(config: ConfigFile, shutdown: CancellationToken) -> Result<()> {
    let section = config
        .server
        .context("Configuration file has no `server` section")?;
    let server_config = section.to_server_config()?;

    let server = TunnelServer::bind(server_config)
        .await
        .context("Failed to start tunnel server")?;
    server.run(shutdown).await?;

    info!("Server stopped");
    Ok(())
}

async fn run_agent(config: ConfigFile, shutdown: CancellationToken) -> Result<()> {
    let section = config
        .agent
        .context("Configuration file has no `agent` section")?;
    let agent_config = section.to_agent_config()?;

    info!(
        agent_id = %agent_config.identity.id,
        server = %agent_config.server_addr,
        local = %agent_config.local_addr,
        auth = %agent_config.auth.mode(),
        "Agent starting"
    );

    let agent = Agent::new(agent_config)?;
    agent.run(shutdown).await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (Commands::Server(args) | Commands::Agent(args)) = &cli.command;
    let config = ConfigFile::load(&args.file)?;
    setup_logging(&config.log.level)?;

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());

    match cli.command {
        Commands::Server(_) => run_server(config, shutdown).await,
        Commands::Agent(_) => run_agent(config, shutdown).await,
    }
}
