//! Host configuration
//!
//! Every field has a serde default so a partial TOML table deserializes
//! cleanly; the `with_*` builders are for programmatic construction.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::utils::RetryPolicy;

/// Scheduler and lifecycle settings for one [`AutomationHost`](crate::AutomationHost)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Global bound on in-flight runs across all jobs
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    /// Due signals waiting for a worker; the oldest is dropped beyond this
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Per-job backlog of event-triggered signals held at the concurrency limit
    #[serde(default = "default_event_queue_depth")]
    pub event_queue_depth: usize,
    /// Maximum age of a dependency's last success for it to count
    #[serde(default = "default_freshness_secs")]
    pub dependency_freshness_secs: u64,
    /// Timeout applied to jobs that do not set one
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Retry policy applied to jobs that do not set one
    #[serde(default)]
    pub default_retry: RetryPolicy,
    /// Re-queue behaviour while an owning plugin is not running
    #[serde(default)]
    pub deferral: DeferralConfig,
    /// Plugin supervision
    #[serde(default)]
    pub plugins: PluginPolicyConfig,
    /// Run history retention
    #[serde(default)]
    pub history: HistoryConfig,
}

fn default_worker_pool_size() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    256
}

fn default_event_queue_depth() -> usize {
    16
}

fn default_freshness_secs() -> u64 {
    3_600
}

fn default_timeout_secs() -> u64 {
    3_600
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: default_worker_pool_size(),
            queue_capacity: default_queue_capacity(),
            event_queue_depth: default_event_queue_depth(),
            dependency_freshness_secs: default_freshness_secs(),
            default_timeout_secs: default_timeout_secs(),
            default_retry: RetryPolicy::default(),
            deferral: DeferralConfig::default(),
            plugins: PluginPolicyConfig::default(),
            history: HistoryConfig::default(),
        }
    }
}

impl HostConfig {
    /// Create a configuration with defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker pool size
    #[must_use]
    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size;
        self
    }

    /// Set the due-queue capacity
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the per-job event backlog depth
    #[must_use]
    pub fn with_event_queue_depth(mut self, depth: usize) -> Self {
        self.event_queue_depth = depth;
        self
    }

    /// Set the dependency freshness window
    #[must_use]
    pub fn with_dependency_freshness(mut self, window: Duration) -> Self {
        self.dependency_freshness_secs = window.as_secs();
        self
    }

    /// Set the deferral policy
    #[must_use]
    pub fn with_deferral(mut self, deferral: DeferralConfig) -> Self {
        self.deferral = deferral;
        self
    }

    /// Set the plugin supervision policy
    #[must_use]
    pub fn with_plugin_policy(mut self, plugins: PluginPolicyConfig) -> Self {
        self.plugins = plugins;
        self
    }

    /// Set the history retention policy
    #[must_use]
    pub fn with_history(mut self, history: HistoryConfig) -> Self {
        self.history = history;
        self
    }

    /// Dependency freshness window
    #[must_use]
    pub fn dependency_freshness(&self) -> Duration {
        Duration::from_secs(self.dependency_freshness_secs)
    }

    /// Timeout for jobs without their own
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    /// Reject values the scheduler cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.worker_pool_size == 0 {
            return Err(Error::InvalidConfig("worker_pool_size must be > 0".into()));
        }
        if self.queue_capacity == 0 {
            return Err(Error::InvalidConfig("queue_capacity must be > 0".into()));
        }
        if self.plugins.health_check_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "plugins.health_check_interval_ms must be > 0".into(),
            ));
        }
        if self.plugins.failure_threshold == 0 {
            return Err(Error::InvalidConfig(
                "plugins.failure_threshold must be > 0".into(),
            ));
        }
        if self.default_retry.max_attempts == 0 {
            return Err(Error::InvalidConfig(
                "default_retry.max_attempts must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// How due signals for a not-running plugin are re-queued
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeferralConfig {
    /// Deferrals before the signal is recorded as skipped
    #[serde(default = "default_max_deferrals")]
    pub max_deferrals: u32,
    /// First re-queue delay
    #[serde(default = "default_deferral_initial_ms")]
    pub initial_delay_ms: u64,
    /// Cap for re-queue delays
    #[serde(default = "default_deferral_max_ms")]
    pub max_delay_ms: u64,
}

fn default_max_deferrals() -> u32 {
    5
}

fn default_deferral_initial_ms() -> u64 {
    250
}

fn default_deferral_max_ms() -> u64 {
    5_000
}

impl Default for DeferralConfig {
    fn default() -> Self {
        Self {
            max_deferrals: default_max_deferrals(),
            initial_delay_ms: default_deferral_initial_ms(),
            max_delay_ms: default_deferral_max_ms(),
        }
    }
}

impl DeferralConfig {
    /// Backoff used between deferrals
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_attempts(self.max_deferrals.saturating_add(1))
            .with_initial_delay(Duration::from_millis(self.initial_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
    }
}

/// Plugin health checking, stopping and restarting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginPolicyConfig {
    /// Interval between health checks while running
    #[serde(default = "default_health_interval_ms")]
    pub health_check_interval_ms: u64,
    /// Consecutive failed checks before the plugin is marked failed
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long `stop` waits for in-flight runs before cancelling them
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    /// Automatic restart of failed plugins
    #[serde(default)]
    pub auto_restart: AutoRestartConfig,
}

fn default_health_interval_ms() -> u64 {
    30_000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_stop_grace_ms() -> u64 {
    10_000
}

impl Default for PluginPolicyConfig {
    fn default() -> Self {
        Self {
            health_check_interval_ms: default_health_interval_ms(),
            failure_threshold: default_failure_threshold(),
            stop_grace_ms: default_stop_grace_ms(),
            auto_restart: AutoRestartConfig::default(),
        }
    }
}

impl PluginPolicyConfig {
    /// Health check interval
    #[must_use]
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Grace period for in-flight runs on stop
    #[must_use]
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

/// Restart policy for plugins that reach `Failed` through health checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoRestartConfig {
    /// Whether failed plugins are restarted at all
    #[serde(default)]
    pub enabled: bool,
    /// Restart attempts before the plugin stays failed
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// Delay before the first restart
    #[serde(default = "default_restart_initial_ms")]
    pub initial_backoff_ms: u64,
    /// Cap on the restart delay
    #[serde(default = "default_restart_max_ms")]
    pub max_backoff_ms: u64,
    /// Growth factor between restart delays
    #[serde(default = "default_restart_multiplier")]
    pub multiplier: f64,
}

fn default_max_restarts() -> u32 {
    5
}

fn default_restart_initial_ms() -> u64 {
    1_000
}

fn default_restart_max_ms() -> u64 {
    60_000
}

fn default_restart_multiplier() -> f64 {
    2.0
}

impl Default for AutoRestartConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_restarts: default_max_restarts(),
            initial_backoff_ms: default_restart_initial_ms(),
            max_backoff_ms: default_restart_max_ms(),
            multiplier: default_restart_multiplier(),
        }
    }
}

impl AutoRestartConfig {
    /// Backoff used between restart attempts
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_attempts(self.max_restarts)
            .with_initial_delay(Duration::from_millis(self.initial_backoff_ms))
            .with_max_delay(Duration::from_millis(self.max_backoff_ms))
            .with_multiplier(self.multiplier)
    }
}

/// Run history retention
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Keep at most this many runs per job
    #[serde(default = "default_max_runs_per_job")]
    pub max_runs_per_job: Option<u32>,
    /// Drop runs older than this many days
    #[serde(default = "default_max_age_days")]
    pub max_age_days: Option<u32>,
    /// How often the retention job runs
    #[serde(default = "default_retention_interval_secs")]
    pub retention_interval_secs: u64,
}

fn default_max_runs_per_job() -> Option<u32> {
    Some(100)
}

fn default_max_age_days() -> Option<u32> {
    Some(30)
}

fn default_retention_interval_secs() -> u64 {
    3_600
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_runs_per_job: default_max_runs_per_job(),
            max_age_days: default_max_age_days(),
            retention_interval_secs: default_retention_interval_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HostConfig::default();
        assert_eq!(config.worker_pool_size, 4);
        assert_eq!(config.plugins.failure_threshold, 3);
        assert!(!config.plugins.auto_restart.enabled);
        assert_eq!(config.history.max_runs_per_job, Some(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_deserialization() {
        let config: HostConfig = serde_json::from_value(serde_json::json!({
            "worker_pool_size": 8,
            "plugins": { "failure_threshold": 5 }
        }))
        .unwrap();
        assert_eq!(config.worker_pool_size, 8);
        assert_eq!(config.plugins.failure_threshold, 5);
        assert_eq!(config.plugins.stop_grace_ms, 10_000);
        assert_eq!(config.queue_capacity, 256);
    }

    #[test]
    fn test_validate_rejects_zero_pool() {
        let config = HostConfig::new().with_worker_pool_size(0);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_zero_health_interval() {
        let config = HostConfig::new().with_plugin_policy(PluginPolicyConfig {
            health_check_interval_ms: 0,
            ..PluginPolicyConfig::default()
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("health_check_interval_ms"));
    }

    #[test]
    fn test_deferral_policy_allows_budget_plus_one_attempts() {
        let deferral = DeferralConfig {
            max_deferrals: 2,
            initial_delay_ms: 10,
            max_delay_ms: 15,
        };
        let policy = deferral.policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay_for(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for(3), Duration::from_millis(15));
    }
}
