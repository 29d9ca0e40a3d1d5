//! `tarsy` — AI-driven incident response gateway.

mod api;
mod bootstrap;
mod state;
mod ws;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tarsy", version, about = "AI-driven incident response engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway: HTTP API, WebSocket hub, worker pool and sweepers.
    Serve {
        /// Path to the YAML configuration file.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Address to bind.
        #[arg(long, default_value = "0.0.0.0:8000")]
        bind: SocketAddr,
    },
    /// Validate a configuration file and print the startup warnings.
    CheckConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("TARSY_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config, bind } => {
            let config = bootstrap::load_config(config.as_deref())?;
            bootstrap::run(config, bind).await
        }
        Command::CheckConfig { config } => {
            let config = bootstrap::load_config(config.as_deref())?;
            let warnings = config.validate()?;
            if warnings.is_empty() {
                println!("configuration ok");
            } else {
                for warning in warnings {
                    println!("warning: {warning}");
                }
            }
            Ok(())
        }
    }
}
