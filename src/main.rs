//! Simultaneous CLI - runs the task supervisor server.
//!
//! This is the main binary entry point. See the `simultaneous` library
//! for the server, client and task helpers.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use simultaneous::{Config, Server};

/// Global allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "simultaneous")]
#[command(version = VERSION)]
#[command(about = "Launches background tasks and relays their events to subscribed clients")]
struct Cli {
    /// JSON configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server until SIGINT or SIGTERM
    Serve {
        /// Listening address: `host:port` or a Unix socket path
        #[arg(long)]
        connection: Option<String>,
        /// Directory for per-task stdout/stderr logs
        #[arg(long)]
        task_log_dir: Option<PathBuf>,
    },
    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve {
            connection,
            task_log_dir,
        } => {
            if let Some(connection) = connection {
                config.connection = connection;
            }
            if task_log_dir.is_some() {
                config.task_log_dir = task_log_dir;
            }
            serve(&config)
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

#[tokio::main]
async fn serve(config: &Config) -> Result<()> {
    if let Some(dir) = &config.task_log_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create task log directory {}", dir.display()))?;
    }

    let server = Server::start(config)
        .await
        .with_context(|| format!("Failed to listen on {}", config.connection))?;

    wait_for_signal().await?;
    log::info!("Shutdown signal received");
    server.shutdown().await;
    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
    Ok(())
}
