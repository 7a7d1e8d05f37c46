//! Host initialization and main run loop
//!
//! Contains the main `run()` function that builds the host and serves until
//! a shutdown signal arrives.

use super::config::AppConfig;
use super::loader::load_config;
use anyhow::{Context, Result};
use autohost_core::AutomationHost;
use tracing::{info, warn};

/// Run the host
pub async fn run(config: AppConfig) -> Result<()> {
    info!("Starting Autohost v{}", env!("CARGO_PKG_VERSION"));

    let db_path = config.database.resolve_path()?;
    info!("Database: {}", db_path.display());

    let mut builder = AutomationHost::builder()
        .config(config.host.clone())
        .database_path(&db_path);
    for (name, value) in &config.plugins {
        builder = builder.plugin_config(name.clone(), value.clone());
    }
    for (job_id, overrides) in &config.jobs {
        builder = builder.job_override(job_id.clone(), overrides.clone());
    }

    let host = builder.build().await.context("Failed to build host")?;
    host.start().await.context("Failed to start host")?;
    info!(
        plugins = host.list_plugins().len(),
        jobs = host.jobs().len(),
        "Autohost running"
    );

    let served = serve(&host).await;

    info!("Shutting down");
    host.shutdown().await;
    info!("Autohost stopped");
    served
}

/// Wait for Ctrl+C or SIGTERM. SIGHUP re-reads the configuration.
#[cfg(unix)]
async fn serve(host: &AutomationHost) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl+C")?;
                info!("Received Ctrl+C signal");
                return Ok(());
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM signal");
                return Ok(());
            }
            _ = hangup.recv() => {
                info!("Received SIGHUP signal, reloading configuration");
                reload_config(host).await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn serve(_host: &AutomationHost) -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C signal");
    Ok(())
}

/// Apply `[jobs]` overrides now; `[plugins]` tables take effect on the
/// plugin's next start or reload.
async fn reload_config(host: &AutomationHost) {
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            warn!("Configuration reload failed, keeping current settings: {:#}", e);
            return;
        }
    };

    for (name, value) in config.plugins {
        host.plugins().set_plugin_config(&name, value);
    }

    match host.apply_job_overrides(config.jobs).await {
        Ok(changed) if changed.is_empty() => info!("Configuration reloaded, no job changes"),
        Ok(changed) => info!(jobs = ?changed, "Configuration reloaded"),
        Err(e) => warn!("Failed to apply job overrides: {}", e),
    }
}
