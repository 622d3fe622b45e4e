//! arenad: the Arena control-plane daemon.
//!
//! Single binary that assembles every control-plane subsystem:
//! - State store (redb) and capacity ledger
//! - Orchestrator backend
//! - Reconciler, watcher and failure detector loops
//! - HTTP API (inspection + supervisor reporting)
//!
//! # Usage
//!
//! ```text
//! arenad run --config /etc/arena/arena.toml --data-dir /var/lib/arena
//! arenad check --config /etc/arena/arena.toml
//! ```

mod control_plane;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "arenad", about = "Arena game-server control plane")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane.
    Run {
        /// Path to arena.toml.
        #[arg(long, default_value = "/etc/arena/arena.toml")]
        config: PathBuf,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/arena")]
        data_dir: PathBuf,

        /// Override `daemon.api_port` from the config file.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Validate the configuration and catalog, then exit.
    Check {
        /// Path to arena.toml.
        #[arg(long, default_value = "/etc/arena/arena.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,arenad=debug,arena=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            data_dir,
            port,
        } => control_plane::run_control_plane(&config, data_dir, port).await,
        Command::Check { config } => control_plane::check_config(&config),
    }
}
