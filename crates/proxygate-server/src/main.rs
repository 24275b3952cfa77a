#![warn(missing_docs)]

//! proxygate relay

use anyhow::Result;
use clap::Parser;
use proxygate_server::cli::Cli;
use proxygate_server::Server;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if config.log_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    if !cli.config.exists() {
        tracing::warn!("Config file not found, using defaults: {}", cli.config.display());
    }
    tracing::info!("proxygate starting...");

    let server = Server::bind(&config).await?;
    server.run().await
}
