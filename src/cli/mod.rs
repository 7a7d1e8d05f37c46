//! CLI module for Autohost
//!
//! Provides commands:
//! - `run`: Start the host and block until a shutdown signal (default)
//! - `jobs`: List persisted jobs with their last outcome
//! - `history`: Show recent runs of one job
//! - `config`: Print the effective configuration

use clap::{Parser, Subcommand};

use crate::server::AppConfig;

pub mod jobs;

/// Autohost CLI
#[derive(Parser, Debug)]
#[command(name = "autohost")]
#[command(about = "Plugin automation host with scheduled jobs")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the host (default)
    Run,
    /// List jobs recorded in the database
    Jobs,
    /// Show recent runs of a job
    History {
        /// Job id
        job_id: String,
        /// Number of runs to show
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },
    /// Print the effective configuration as TOML
    Config,
}

/// Run the CLI command
pub async fn run(cli: Cli, config: AppConfig) -> anyhow::Result<()> {
    match cli.command {
        Some(Commands::Run) | None => crate::server::run(config).await,
        Some(Commands::Jobs) => jobs::list(&config).await,
        Some(Commands::History { job_id, limit }) => jobs::history(&config, &job_id, limit).await,
        Some(Commands::Config) => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
