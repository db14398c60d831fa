use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use iotscope::agent::Agent;
use iotscope::compute::designate;
use iotscope::config::Config;
use iotscope::version;

/// Household network monitoring client.
#[derive(Parser)]
#[command(name = "iotscope", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Never exit because of server quit directives or UI inactivity.
    #[arg(long)]
    raspberry_pi_mode: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,

    /// Designate client processes for a secure computation.
    Designate {
        /// PID of the process that initiates the computation.
        initiator: u32,

        /// PIDs of the processes that assist as peers.
        #[arg(long, num_args = 1..)]
        peers: Vec<u32>,

        /// Data directory of the client processes (defaults to the config's).
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    match &cli.command {
        Some(Command::Version) => {
            println!("iotscope {}", version::full());
            return Ok(());
        }
        Some(Command::Designate {
            initiator,
            peers,
            data_dir,
        }) => {
            let root = data_dir
                .as_ref()
                .map(|dir| dir.join("configs"))
                .unwrap_or_else(|| cfg.marker_root());
            for marker in designate(&root, *initiator, peers)? {
                println!("{}", marker.display());
            }
            return Ok(());
        }
        None => {}
    }

    let log_level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level: {log_level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    // The client cannot run on defaults alone.
    if cli.config.is_none() {
        anyhow::bail!("--config is required (use --help for usage)");
    }

    let mut cfg = cfg;
    cfg.raspberry_pi_mode |= cli.raspberry_pi_mode;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting iotscope",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    let mut agent = Agent::new(cfg)?;
    let state = agent.start().await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
        _ = state.quit_signalled() => {
            tracing::info!("quit directive received, shutting down");
        }
    }

    agent.stop().await?;

    tracing::info!("iotscope stopped");

    Ok(())
}
