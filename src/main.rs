use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use repo_transfer::config::default_working_dir;
use repo_transfer::transfer::status::status_report;
use repo_transfer::{
    request_stop, ArtifactoryClient, StopSignal, ThreadSettings, TransferCoordinator,
    TransferConfig, TransferError,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Resumable migration of repositories between artifact servers
#[derive(Parser)]
#[command(name = "repo-transfer")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding the transfer state (default: ~/.repo-transfer)
    #[arg(long, global = true, env = "REPO_TRANSFER_WORKING_DIR")]
    working_dir: Option<PathBuf>,

    /// Verbose output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start or resume transferring repositories
    Start {
        /// TOML configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Discard the state of previous runs and start over
        #[arg(long)]
        ignore_state: bool,

        /// Only transfer repositories matching these patterns
        #[arg(long, value_delimiter = ',')]
        include: Vec<String>,

        /// Skip repositories matching these patterns
        #[arg(long, value_delimiter = ',')]
        exclude: Vec<String>,
    },

    /// Show the progress of the running transfer
    Status,

    /// Gracefully stop the running transfer
    Stop,

    /// Change settings of a running or future transfer
    Settings {
        /// Number of working threads
        #[arg(long)]
        threads: usize,
    },
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn working_dir(cli_dir: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match cli_dir {
        Some(dir) => Ok(dir),
        None => Ok(default_working_dir()?),
    }
}

/// Resolves on Ctrl-C or SIGTERM. False if no signal can be listened for.
#[cfg(unix)]
async fn shutdown_signal() -> bool {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
            true
        }
        Err(e) => {
            tracing::warn!("Could not listen for SIGTERM: {}", e);
            tokio::signal::ctrl_c().await.is_ok()
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> bool {
    tokio::signal::ctrl_c().await.is_ok()
}

fn spawn_signal_handler(stop: StopSignal) {
    tokio::spawn(async move {
        if shutdown_signal().await {
            tracing::info!("Received a stop signal");
            stop.trigger();
        }
    });
}

async fn start(
    config_path: PathBuf,
    cli_dir: Option<PathBuf>,
    ignore_state: bool,
    include: Vec<String>,
    exclude: Vec<String>,
) -> anyhow::Result<()> {
    let mut config = TransferConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    if cli_dir.is_some() {
        config.working_dir = cli_dir;
    }
    config.ignore_state |= ignore_state;
    config.include_repos.extend(include);
    config.exclude_repos.extend(exclude);

    let source = Arc::new(ArtifactoryClient::new(&config.source)?);
    let target = Arc::new(ArtifactoryClient::new(&config.target)?);
    let coordinator = TransferCoordinator::new(config, source, target)?;
    spawn_signal_handler(coordinator.stop_signal());

    match coordinator.run().await {
        Err(TransferError::AlreadyRunning) => {
            anyhow::bail!(
                "a transfer is already running from {}",
                coordinator.working_dir().display()
            )
        }
        result => Ok(result?),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    match cli.command {
        Commands::Start {
            config,
            ignore_state,
            include,
            exclude,
        } => {
            start(config, cli.working_dir, ignore_state, include, exclude).await?;
        }
        Commands::Status => {
            let dir = working_dir(cli.working_dir)?;
            print!("{}", status_report(&dir)?);
        }
        Commands::Stop => {
            let dir = working_dir(cli.working_dir)?;
            match request_stop(&dir) {
                Ok(()) => println!(
                    "{}",
                    "Gracefully stopping files transfer. This may take a few minutes...".green()
                ),
                Err(e @ (TransferError::NotRunning | TransferError::StopInProgress)) => {
                    println!("{}", e.to_string().yellow())
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Settings { threads } => {
            let dir = working_dir(cli.working_dir)?;
            ThreadSettings {
                threads_number: threads,
            }
            .save(&dir)?;
            println!("Working threads set to {threads}");
        }
    }

    Ok(())
}
