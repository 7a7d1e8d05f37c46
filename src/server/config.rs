//! Application configuration types
//!
//! `host` is passed straight to the core; `plugins` and `jobs` are the
//! per-plugin tables and per-job overrides read at startup and on reload.

use anyhow::{Context, Result};
use autohost_core::{HostConfig, JobOverride};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub host: HostConfig,
    /// `[plugins.<name>]` tables, handed to each plugin's context
    #[serde(default)]
    pub plugins: HashMap<String, Value>,
    /// `[jobs.<id>]` overrides
    #[serde(default)]
    pub jobs: HashMap<String, JobOverride>,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directives; `RUST_LOG` takes precedence
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Directory for daily-rotated JSON log files; stdout only when unset
    #[serde(default)]
    pub file_dir: Option<String>,
}

fn default_log_filter() -> String {
    "autohost=info,autohost_core=info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            format: LogFormat::default(),
            file_dir: None,
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file; defaults to `<data dir>/autohost/autohost.db`
    #[serde(default)]
    pub path: Option<String>,
}

impl DatabaseConfig {
    /// Path of the job store
    pub fn resolve_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.path {
            return Ok(PathBuf::from(path));
        }
        let base = dirs::data_dir().context("Could not determine a data directory")?;
        Ok(base.join("autohost").join("autohost.db"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_database_path() {
        let config = DatabaseConfig {
            path: Some("/tmp/jobs.db".into()),
        };
        assert_eq!(config.resolve_path().unwrap(), PathBuf::from("/tmp/jobs.db"));
    }

    #[test]
    fn test_sections_default_when_missing() {
        let config: AppConfig = toml::from_str(
            r#"
            [logging]
            format = "json"

            [jobs."reports.daily"]
            enabled = false
            "#,
        )
        .unwrap();
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.filter, "autohost=info,autohost_core=info");
        assert_eq!(config.host.worker_pool_size, 4);
        assert_eq!(config.jobs["reports.daily"].enabled, Some(false));
        assert!(config.plugins.is_empty());
    }
}
