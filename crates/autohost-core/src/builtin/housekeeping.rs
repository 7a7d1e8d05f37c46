//! Housekeeping plugin
//!
//! Registers two jobs:
//! - `housekeeping.history_retention` prunes run history by count and age
//! - `housekeeping.plugin_health_report` summarises plugin states every ten
//!   minutes and warns about failed plugins

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::HistoryConfig;
use crate::plugin::{host_version, Plugin, PluginContext, PluginDescriptor, PluginState, PluginStateView};
use crate::scheduler::{work_fn, JobDefinition, JobRegistration, JobStore, TriggerType};
use crate::utils::RetryPolicy;

/// Plugin name
pub const HOUSEKEEPING_PLUGIN: &str = "housekeeping";
/// History retention job id
pub const RETENTION_JOB: &str = "housekeeping.history_retention";
/// Plugin health report job id
pub const HEALTH_REPORT_JOB: &str = "housekeeping.plugin_health_report";

const HEALTH_REPORT_CRON: &str = "*/10 * * * *";

/// Built-in maintenance plugin
pub struct Housekeeping {
    store: Arc<JobStore>,
    history: HistoryConfig,
    plugins: PluginStateView,
}

impl Housekeeping {
    /// Create the plugin over the host's store and plugin states
    pub fn new(store: Arc<JobStore>, history: HistoryConfig, plugins: PluginStateView) -> Self {
        Self {
            store,
            history,
            plugins,
        }
    }

    fn retention_job(&self) -> JobRegistration {
        let period = Duration::from_secs(self.history.retention_interval_secs.max(1));
        let definition = JobDefinition::new(RETENTION_JOB, HOUSEKEEPING_PLUGIN, TriggerType::interval(period))
            .with_name("History retention")
            .with_description("Prune job run history by count and age")
            .with_retry(RetryPolicy::none())
            .with_tag("builtin");

        let store = self.store.clone();
        let history = self.history.clone();
        let work = work_fn(move |_ctx| {
            let store = store.clone();
            let history = history.clone();
            async move {
                let older_than = history
                    .max_age_days
                    .map(|days| Utc::now() - chrono::Duration::days(i64::from(days)));
                let deleted = store
                    .prune_history(history.max_runs_per_job, older_than)
                    .await?;
                if deleted > 0 {
                    info!(deleted, "Pruned job run history");
                }
                Ok(json!({ "deleted": deleted }))
            }
        });

        JobRegistration::new(definition, work)
    }

    fn health_report_job(&self) -> JobRegistration {
        let definition = JobDefinition::new(
            HEALTH_REPORT_JOB,
            HOUSEKEEPING_PLUGIN,
            TriggerType::cron(HEALTH_REPORT_CRON),
        )
        .with_name("Plugin health report")
        .with_retry(RetryPolicy::none())
        .with_tag("builtin");

        let plugins = self.plugins.clone();
        let work = work_fn(move |_ctx| {
            let report = health_report(&plugins);
            async move { Ok(report) }
        });

        JobRegistration::new(definition, work)
    }
}

/// Plugin states keyed by name, plus the names of failed plugins
fn health_report(plugins: &PluginStateView) -> Value {
    let snapshot = plugins.snapshot();
    let failed: Vec<&str> = snapshot
        .iter()
        .filter(|(_, state)| *state == PluginState::Failed)
        .map(|(name, _)| name.as_str())
        .collect();
    if !failed.is_empty() {
        warn!(plugins = ?failed, "Plugins in failed state");
    }

    let states: serde_json::Map<String, Value> = snapshot
        .iter()
        .map(|(name, state)| (name.clone(), json!(state)))
        .collect();
    json!({ "plugins": states, "failed": failed })
}

#[async_trait]
impl Plugin for Housekeeping {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor::new(HOUSEKEEPING_PLUGIN, host_version())
            .with_description("Run history retention and plugin health reporting")
            .with_category("maintenance")
    }

    fn jobs(&self, _ctx: &PluginContext) -> Vec<JobRegistration> {
        vec![self.retention_job(), self.health_report_job()]
    }
}
