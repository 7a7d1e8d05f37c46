//! Autohost - plugin automation host
//!
//! CLI entry point for the Autohost daemon.

#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;

mod cli;
mod server;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let cli = cli::Cli::parse();
    let config = server::load_config()?;

    // Keeps the non-blocking file writer flushing until exit
    let _log_guard = server::init_logging(&config.logging)?;

    cli::run(cli, config).await
}
