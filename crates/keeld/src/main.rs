//! keeld — the keel daemon.
//!
//! Single binary that assembles all keel subsystems:
//! - Revisioned keyspace and checkpoint store (redb)
//! - Owner collector (cascading delete)
//! - One controller per configured parent kind
//! - Periodic history compaction
//! - REST API
//!
//! # Usage
//!
//! ```text
//! keeld run --config /etc/keel/keel.toml --port 8480 --data-dir /var/lib/keel
//! keeld default-config > keel.toml
//! ```

mod daemon;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use keel_core::KeelConfig;

#[derive(Parser)]
#[command(name = "keeld", about = "keel reconciliation daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the keyspace, controllers and API in one process.
    Run {
        /// Path to keel.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for persistent state (overrides the config).
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Port to listen on (overrides the config).
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the default configuration as TOML.
    DefaultConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,keeld=debug,keel=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            data_dir,
            port,
        } => {
            let mut config = match config {
                Some(path) => KeelConfig::from_file(&path)?,
                None => KeelConfig::default(),
            };
            if let Some(data_dir) = data_dir {
                config.store.data_dir = data_dir;
            }
            if let Some(port) = port {
                config.api.port = port;
            }
            daemon::run_daemon(config).await
        }
        Command::DefaultConfig => {
            print!("{}", KeelConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}
