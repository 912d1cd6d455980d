#![warn(clippy::all)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lmninja_engine::config::Config;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Local inference sidecar for LMNinja.
#[derive(Parser, Debug)]
#[command(name = "lmninja-engine")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP service
    Serve {
        /// Bind address (overrides config and LMNINJA_HOST)
        #[arg(long)]
        host: Option<String>,

        /// Port (overrides config and LMNINJA_PORT)
        #[arg(short, long)]
        port: Option<u16>,

        /// Config file path
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Config file path
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { host, port, config } => {
            let mut config = Config::load(config.as_deref())?;
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            config.validate()?;
            lmninja_engine::gateway::run_gateway(config).await
        }
        Commands::Config { config } => {
            let config = Config::load(config.as_deref())?;
            let rendered =
                toml::to_string_pretty(&config).context("failed to render configuration")?;
            println!("{rendered}");
            Ok(())
        }
    }
}
