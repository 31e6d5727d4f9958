//! virtflowd — the virtflow daemon.
//!
//! Single binary that assembles all virtflow subsystems:
//! - Status store (redb)
//! - Node inventory + refresh loop
//! - Task queue, worker pool, and retry scheduler
//! - REST API
//!
//! # Usage
//!
//! ```text
//! virtflowd standalone --config virtflow.toml --port 8080 --data-dir /var/lib/virtflow
//! virtflowd check-config --config virtflow.toml
//! ```

mod standalone;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use virtflow_core::VirtflowConfig;

const DEFAULT_LOG_FILTER: &str = "info,virtflowd=debug,virtflow=debug";

#[derive(Parser)]
#[command(name = "virtflowd", about = "virtflow VM placement daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every subsystem in one process.
    Standalone {
        /// Path to virtflow.toml. Missing file means defaults.
        #[arg(long, default_value = "virtflow.toml")]
        config: PathBuf,

        /// Port to listen on.
        #[arg(long, default_value = "8080")]
        port: u16,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/virtflow")]
        data_dir: PathBuf,

        /// Number of workers; overrides `worker.count`.
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Load and validate the configuration, then exit.
    CheckConfig {
        #[arg(long, default_value = "virtflow.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Standalone {
            config,
            port,
            data_dir,
            workers,
        } => {
            let config = load_config(&config, workers)?;
            standalone::run(config, port, data_dir).await
        }
        Command::CheckConfig { config: path } => {
            let config = load_config(&path, None)?;
            println!("configuration OK: {}", path.display());
            println!("  node source:   {}", standalone::describe_source(&config.inventory));
            println!("  refresh:       {}s", config.inventory.refresh_interval_secs);
            println!("  strategy:      {:?}", config.placement.strategy);
            println!(
                "  retries:       {} (base {}ms, jitter up to {}ms)",
                config.retry.max_retries, config.retry.base_delay_ms, config.retry.jitter_ceiling_ms
            );
            println!("  workers:       {}", config.worker.count);
            Ok(())
        }
    }
}

/// Load config with environment and CLI overrides. Any error is fatal.
fn load_config(path: &std::path::Path, workers: Option<usize>) -> anyhow::Result<VirtflowConfig> {
    let mut config = VirtflowConfig::load(Some(path))?;
    if let Some(count) = workers {
        config.worker.count = count;
        config.validate()?;
    }
    Ok(config)
}
