//! Automation host
//!
//! [`AutomationHost`] is the one process-wide context object: it owns the
//! event bus, the job store, the lifecycle manager, the trigger engine and
//! the job executor, and defines their start-up and teardown order.
//!
//! ```ignore
//! let host = AutomationHost::builder()
//!     .config(HostConfig::default())
//!     .database_path("data/autohost.db")
//!     .plugin(Arc::new(MyPlugin::default()))
//!     .build()
//!     .await?;
//! host.start().await?;
//! // ...
//! host.shutdown().await;
//! ```

use async_trait::async_trait;
use dashmap::DashMap;
use semver::Version;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::builtin::Housekeeping;
use crate::config::HostConfig;
use crate::error::{Error, RegistrationError, Result};
use crate::event_bus::{topics, EventBus};
use crate::plugin::{
    topological_order, DependencyResolver, LifecycleManager, Plugin, PluginHooks, PluginState,
    PluginStateView, PluginStatus,
};
use crate::scheduler::{
    DueSignal, JobDefinition, JobExecutor, JobOverride, JobRegistration, JobRun, JobStatus,
    JobStore, TriggerEngine,
};

/// Runs shown in [`AutomationHost::job_status`]
const RECENT_RUNS: u32 = 10;

/// Builder for [`AutomationHost`]
pub struct AutomationHostBuilder {
    config: HostConfig,
    database: Option<PathBuf>,
    store: Option<Arc<JobStore>>,
    plugins: Vec<Arc<dyn Plugin>>,
    plugin_configs: HashMap<String, Value>,
    overrides: HashMap<String, JobOverride>,
    host_version: Option<Version>,
    housekeeping: bool,
}

impl Default for AutomationHostBuilder {
    fn default() -> Self {
        Self {
            config: HostConfig::default(),
            database: None,
            store: None,
            plugins: Vec::new(),
            plugin_configs: HashMap::new(),
            overrides: HashMap::new(),
            host_version: None,
            housekeeping: true,
        }
    }
}

impl AutomationHostBuilder {
    /// Host configuration
    #[must_use]
    pub fn config(mut self, config: HostConfig) -> Self {
        self.config = config;
        self
    }

    /// SQLite database file. Without one the store lives in memory.
    #[must_use]
    pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database = Some(path.into());
        self
    }

    /// Use an already opened store
    #[must_use]
    pub fn store(mut self, store: Arc<JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Add a plugin
    #[must_use]
    pub fn plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Private configuration for the plugin called `name`
    #[must_use]
    pub fn plugin_config(mut self, name: impl Into<String>, config: Value) -> Self {
        self.plugin_configs.insert(name.into(), config);
        self
    }

    /// Operator overrides applied when `job_id` is registered
    #[must_use]
    pub fn job_override(mut self, job_id: impl Into<String>, overrides: JobOverride) -> Self {
        self.overrides.insert(job_id.into(), overrides);
        self
    }

    /// Check plugins against `version` instead of this crate's version
    #[must_use]
    pub fn host_version(mut self, version: Version) -> Self {
        self.host_version = Some(version);
        self
    }

    /// Leave out the built-in `housekeeping` plugin
    #[must_use]
    pub fn without_housekeeping(mut self) -> Self {
        self.housekeeping = false;
        self
    }

    /// Open the store, resolve the plugin graph and load every plugin.
    ///
    /// Resolution failures abort before any plugin is loaded.
    pub async fn build(self) -> Result<AutomationHost> {
        self.config.validate()?;

        let store = match (self.store, &self.database) {
            (Some(store), _) => store,
            (None, Some(path)) => Arc::new(JobStore::from_path(path).await?),
            (None, None) => Arc::new(JobStore::in_memory().await?),
        };
        let interrupted = store.mark_interrupted_runs().await?;
        if interrupted > 0 {
            warn!(runs = interrupted, "Marked runs interrupted by the previous shutdown");
        }

        let resolver = match self.host_version {
            Some(version) => DependencyResolver::with_host_version(version),
            None => DependencyResolver::new(),
        };
        let bus = EventBus::new();
        let view = PluginStateView::new();

        let mut plugins = self.plugins;
        if self.housekeeping {
            plugins.push(Arc::new(Housekeeping::new(
                store.clone(),
                self.config.history.clone(),
                view.clone(),
            )));
        }
        let descriptors: Vec<_> = plugins.iter().map(|p| p.descriptor()).collect();
        let order = resolver.resolve(&descriptors)?;
        info!(plugins = ?order, "Plugin load order resolved");

        let (due_tx, due_rx) = mpsc::unbounded_channel();
        let inner = Arc::new_cyclic(|weak: &Weak<HostInner>| {
            let hooks: Weak<dyn PluginHooks> = weak.clone();
            let lifecycle = LifecycleManager::new(
                self.config.plugins.clone(),
                bus.clone(),
                store.clone(),
                view.clone(),
                hooks,
            )
            .with_resolver(resolver.clone());
            for (name, config) in self.plugin_configs {
                lifecycle.set_plugin_config(&name, config);
            }

            HostInner {
                triggers: TriggerEngine::new(store.clone(), bus.clone(), due_tx.clone()),
                executor: JobExecutor::new(
                    self.config.clone(),
                    store.clone(),
                    bus.clone(),
                    view.clone(),
                    due_tx,
                ),
                lifecycle,
                resolver,
                config: self.config,
                bus,
                store,
                overrides: self.overrides.into_iter().collect(),
                order: Mutex::new(Vec::new()),
                due_rx: Mutex::new(Some(due_rx)),
                tasks: Mutex::new(Vec::new()),
                shutdown: CancellationToken::new(),
            }
        });

        let mut by_name: HashMap<String, Arc<dyn Plugin>> = plugins
            .into_iter()
            .map(|p| (p.descriptor().name, p))
            .collect();
        for name in &order {
            if let Some(plugin) = by_name.remove(name) {
                inner.lifecycle.load(plugin).await?;
            }
        }
        *inner.lock_order() = order;

        Ok(AutomationHost { inner })
    }
}

struct HostInner {
    config: HostConfig,
    bus: EventBus,
    store: Arc<JobStore>,
    lifecycle: LifecycleManager,
    resolver: DependencyResolver,
    triggers: TriggerEngine,
    executor: JobExecutor,
    overrides: DashMap<String, JobOverride>,
    // Dependency order of loaded plugins
    order: Mutex<Vec<String>>,
    due_rx: Mutex<Option<mpsc::UnboundedReceiver<DueSignal>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

/// Process-wide scheduler and plugin context
#[derive(Clone)]
pub struct AutomationHost {
    inner: Arc<HostInner>,
}

impl std::fmt::Debug for AutomationHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutomationHost")
            .field("plugins", &self.inner.lock_order())
            .field("jobs", &self.inner.executor.jobs().len())
            .finish()
    }
}

impl AutomationHost {
    /// Start building a host
    #[must_use]
    pub fn builder() -> AutomationHostBuilder {
        AutomationHostBuilder::default()
    }

    /// Start the trigger engine and executor, then every autostart plugin
    /// in dependency order. A plugin that fails to start is left `Failed`;
    /// the rest still start.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let Some(due_rx) = inner.lock_due_rx().take() else {
            return Err(Error::InvalidConfig("host already started".into()));
        };

        let triggers = inner.triggers.clone();
        let token = inner.shutdown.child_token();
        let engine = tokio::spawn(async move { triggers.run(token).await });

        let executor = inner.executor.clone();
        let token = inner.shutdown.child_token();
        let dispatcher = tokio::spawn(async move { executor.run(due_rx, token).await });
        inner.lock_tasks().extend([engine, dispatcher]);

        let order = inner.lock_order().clone();
        for name in order {
            let autostart = inner
                .lifecycle
                .instance(&name)
                .is_some_and(|status| status.descriptor.autostart);
            if !autostart {
                debug!(plugin = %name, "Autostart disabled, leaving plugin loaded");
                continue;
            }
            if let Err(e) = inner.lifecycle.start(&name).await {
                warn!(plugin = %name, error = %e, "Plugin failed to start");
            }
        }

        info!(jobs = inner.executor.jobs().len(), "Automation host started");
        Ok(())
    }

    /// Stop plugins in reverse dependency order, keeping their job
    /// definitions, then stop the scheduler and close the store
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        info!("Automation host shutting down");

        let order = inner.lock_order().clone();
        inner.lifecycle.shutdown_all(&order).await;
        inner.shutdown.cancel();

        let tasks: Vec<JoinHandle<()>> = inner.lock_tasks().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Scheduler task ended abnormally");
            }
        }
        inner.store.close().await;
        info!("Automation host stopped");
    }

    /// Host configuration
    #[must_use]
    pub fn config(&self) -> &HostConfig {
        &self.inner.config
    }

    /// Event bus
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Job store
    #[must_use]
    pub fn store(&self) -> &Arc<JobStore> {
        &self.inner.store
    }

    /// Lifecycle manager
    #[must_use]
    pub fn plugins(&self) -> &LifecycleManager {
        &self.inner.lifecycle
    }

    /// Job executor
    #[must_use]
    pub fn executor(&self) -> &JobExecutor {
        &self.inner.executor
    }

    /// Trigger engine
    #[must_use]
    pub fn triggers(&self) -> &TriggerEngine {
        &self.inner.triggers
    }

    /// Load a plugin into a built host. Its dependencies must already be
    /// loaded.
    pub async fn load_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        let inner = &self.inner;
        let descriptor = plugin.descriptor();
        let available = inner.lifecycle.descriptors();
        inner
            .resolver
            .resolve_with(std::slice::from_ref(&descriptor), &available)?;
        inner.lifecycle.load(plugin).await?;
        inner.lock_order().push(descriptor.name);
        Ok(())
    }

    /// Start a loaded plugin
    pub async fn start_plugin(&self, name: &str) -> Result<()> {
        Ok(self.inner.lifecycle.start(name).await?)
    }

    /// Stop a plugin, draining its runs and removing its jobs
    pub async fn stop_plugin(&self, name: &str) -> Result<()> {
        Ok(self.inner.lifecycle.stop(name).await?)
    }

    /// Stop and restart a running plugin, keeping its jobs
    pub async fn reload_plugin(&self, name: &str) -> Result<()> {
        Ok(self.inner.lifecycle.reload(name).await?)
    }

    /// Swap in a new instance of a loaded plugin, rolling back on failure
    pub async fn replace_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        self.inner.lifecycle.replace(plugin).await
    }

    /// Remove a plugin and its jobs, stopping it first if it is running.
    /// Refused while running plugins depend on it.
    pub async fn unload_plugin(&self, name: &str) -> Result<()> {
        self.inner.lifecycle.unload(name).await?;
        self.inner.lock_order().retain(|loaded| loaded != name);
        Ok(())
    }

    /// Current state of a plugin
    #[must_use]
    pub fn plugin_status(&self, name: &str) -> Option<PluginState> {
        self.inner.lifecycle.status(name)
    }

    /// Status snapshots of every plugin
    #[must_use]
    pub fn list_plugins(&self) -> Vec<PluginStatus> {
        self.inner.lifecycle.list()
    }

    /// Register a job for `plugin`. Replaces an existing job of the same
    /// owner; configured overrides are applied first.
    pub async fn register_job(&self, plugin: &str, registration: JobRegistration) -> Result<()> {
        self.inner.register_job(plugin, registration).await
    }

    /// Remove a job and cancel its scheduled and in-flight runs. Run history
    /// is kept.
    pub async fn unregister_job(&self, job_id: &str) -> Result<bool> {
        self.inner.unregister_job(job_id).await
    }

    /// Every registered job, by id
    #[must_use]
    pub fn jobs(&self) -> Vec<JobDefinition> {
        self.inner.executor.jobs()
    }

    /// Fire a job now. It still goes through admission.
    pub fn run_now(&self, job_id: &str, payload: Option<Value>) -> Result<()> {
        if self.inner.executor.run_now(job_id, payload) {
            Ok(())
        } else {
            Err(RegistrationError::UnknownJob(job_id.to_string()).into())
        }
    }

    /// Cancel a running attempt
    pub fn cancel_run(&self, run_id: Uuid) -> bool {
        self.inner.executor.cancel(run_id)
    }

    /// Enable or disable a job without touching its schedule
    pub async fn set_job_enabled(&self, job_id: &str, enabled: bool) -> Result<()> {
        let inner = &self.inner;
        if !inner.executor.set_enabled(job_id, enabled) {
            return Err(RegistrationError::UnknownJob(job_id.to_string()).into());
        }
        inner.triggers.set_enabled(job_id, enabled);
        if let Some(definition) = inner.executor.definition(job_id) {
            inner.store.save_job(&definition).await?;
        }
        info!(job_id, enabled, "Job enabled flag changed");
        Ok(())
    }

    /// Definition, trigger state, in-flight count and recent runs of a job
    pub async fn job_status(&self, job_id: &str) -> Result<Option<JobStatus>> {
        let inner = &self.inner;
        let Some(definition) = inner.executor.definition(job_id) else {
            return Ok(None);
        };
        let trigger = match inner.triggers.state(job_id) {
            Some(state) => Some(state),
            None => inner.store.get_trigger_state(job_id).await?,
        };
        Ok(Some(JobStatus {
            definition,
            trigger,
            in_flight: inner.executor.in_flight(job_id),
            recent_runs: inner.store.recent_runs(job_id, RECENT_RUNS).await?,
        }))
    }

    /// Full run history of a job, oldest first
    pub async fn history(&self, job_id: &str) -> Result<Vec<JobRun>> {
        Ok(self.inner.executor.history(job_id).await?)
    }

    /// Apply configuration overrides to registered jobs and remember them
    /// for jobs registered later. Publishes `config_changed` with the ids
    /// that changed.
    pub async fn apply_job_overrides(&self, overrides: HashMap<String, JobOverride>) -> Result<Vec<String>> {
        self.inner.apply_job_overrides(overrides).await
    }
}

impl HostInner {
    fn lock_order(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.order.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_due_rx(&self) -> std::sync::MutexGuard<'_, Option<mpsc::UnboundedReceiver<DueSignal>>> {
        self.due_rx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn register_job(&self, plugin: &str, registration: JobRegistration) -> Result<()> {
        let JobRegistration {
            mut definition,
            work,
        } = registration;
        if let Some(overrides) = self.overrides.get(&definition.id) {
            definition.apply(overrides.value());
        }
        let previous = self.validate_job(plugin, &definition)?;

        self.store.save_job(&definition).await?;
        self.executor.register(JobRegistration::new(definition.clone(), work));
        match previous {
            Some(previous) if previous.trigger != definition.trigger => {
                self.triggers.reschedule(&definition).await?
            }
            _ => self.triggers.register(&definition).await?,
        }

        info!(
            job_id = %definition.id,
            plugin,
            trigger = definition.trigger.kind(),
            enabled = definition.enabled,
            "Job registered"
        );
        Ok(())
    }

    /// Check a definition against the registered set. Returns the
    /// definition it replaces, if any.
    fn validate_job(&self, plugin: &str, job: &JobDefinition) -> Result<Option<JobDefinition>> {
        if job.id.trim().is_empty() {
            return Err(RegistrationError::EmptyId.into());
        }
        if !self.lifecycle.contains(plugin) {
            return Err(RegistrationError::UnknownPlugin(plugin.to_string()).into());
        }
        if job.plugin != plugin {
            return Err(RegistrationError::OwnerMismatch {
                job: job.id.clone(),
                declared: job.plugin.clone(),
                registering: plugin.to_string(),
            }
            .into());
        }

        let previous = self.executor.definition(&job.id);
        if let Some(existing) = &previous {
            if existing.plugin != plugin {
                return Err(RegistrationError::DuplicateJob {
                    id: job.id.clone(),
                    owner: existing.plugin.clone(),
                }
                .into());
            }
        }

        job.trigger
            .validate()
            .map_err(|reason| RegistrationError::InvalidTrigger {
                job: job.id.clone(),
                reason,
            })?;
        if job.max_concurrent == 0 {
            return Err(RegistrationError::InvalidPolicy {
                job: job.id.clone(),
                reason: "max_concurrent must be at least 1".into(),
            }
            .into());
        }
        if job.retry.as_ref().is_some_and(|r| r.max_attempts == 0) {
            return Err(RegistrationError::InvalidPolicy {
                job: job.id.clone(),
                reason: "retry.max_attempts must be at least 1".into(),
            }
            .into());
        }

        let mut graph: BTreeMap<String, Vec<String>> = self
            .executor
            .jobs()
            .into_iter()
            .map(|j| (j.id, j.dependencies))
            .collect();
        for dependency in &job.dependencies {
            if dependency == &job.id || !graph.contains_key(dependency) {
                return Err(RegistrationError::UnknownDependency {
                    job: job.id.clone(),
                    dependency: dependency.clone(),
                }
                .into());
            }
        }
        graph.insert(job.id.clone(), job.dependencies.clone());
        if let Err(cycle) = topological_order(&graph) {
            return Err(RegistrationError::CyclicJobDependency { cycle }.into());
        }

        Ok(previous)
    }

    async fn unregister_job(&self, job_id: &str) -> Result<bool> {
        self.triggers.unregister(job_id);
        let removed = self.executor.unregister(job_id).is_some();
        let deleted = self.store.delete_job(job_id).await?;
        if removed || deleted {
            info!(job_id, "Job unregistered");
        }
        Ok(removed || deleted)
    }

    async fn apply_job_overrides(&self, overrides: HashMap<String, JobOverride>) -> Result<Vec<String>> {
        let mut changed = Vec::new();
        let mut ids: Vec<&String> = overrides.keys().collect();
        ids.sort();

        for id in ids {
            let Some(job_override) = overrides.get(id) else {
                continue;
            };
            self.overrides.insert(id.clone(), job_override.clone());
            let Some(current) = self.executor.definition(id) else {
                debug!(job_id = %id, "Override stored for unregistered job");
                continue;
            };

            let mut updated = current.clone();
            updated.apply(job_override);
            if let Err(e) = self.validate_override(&updated) {
                warn!(job_id = %id, error = %e, "Rejected job override");
                continue;
            }
            if updated.trigger == current.trigger
                && updated.enabled == current.enabled
                && updated.timeout_ms == current.timeout_ms
                && updated.retry == current.retry
                && updated.max_concurrent == current.max_concurrent
            {
                continue;
            }

            self.store.save_job(&updated).await?;
            self.executor.update_definition(updated.clone());
            if updated.trigger != current.trigger {
                self.triggers.reschedule(&updated).await?;
            }
            self.triggers.set_enabled(id, updated.enabled);
            info!(job_id = %id, "Job override applied");
            changed.push(id.clone());
        }

        if !changed.is_empty() {
            self.bus.publish(topics::CONFIG_CHANGED, json!({ "jobs": changed }));
        }
        Ok(changed)
    }

    fn validate_override(&self, job: &JobDefinition) -> std::result::Result<(), RegistrationError> {
        job.trigger
            .validate()
            .map_err(|reason| RegistrationError::InvalidTrigger {
                job: job.id.clone(),
                reason,
            })?;
        if job.max_concurrent == 0 || job.retry.as_ref().is_some_and(|r| r.max_attempts == 0) {
            return Err(RegistrationError::InvalidPolicy {
                job: job.id.clone(),
                reason: "limits must be at least 1".into(),
            });
        }
        Ok(())
    }

    async fn remove_plugin_jobs(&self, plugin: &str) {
        for job_id in self.executor.jobs_for(plugin) {
            if let Err(e) = self.unregister_job(&job_id).await {
                warn!(job_id = %job_id, plugin, error = %e, "Failed to remove job");
            }
        }
    }
}

#[async_trait]
impl PluginHooks for HostInner {
    async fn on_initialized(&self, plugin: &str, jobs: Vec<JobRegistration>) {
        let declared: HashSet<String> = jobs.iter().map(|r| r.definition.id.clone()).collect();
        for registration in jobs {
            let job_id = registration.definition.id.clone();
            if let Err(e) = self.register_job(plugin, registration).await {
                warn!(job_id = %job_id, plugin, error = %e, "Job registration rejected");
                self.bus.publish(
                    topics::JOB_REJECTED,
                    json!({ "job_id": job_id, "plugin": plugin, "error": e.to_string() }),
                );
            }
        }

        // Jobs kept across a reload or replace that this instance no longer declares
        for job_id in self.executor.jobs_for(plugin) {
            if declared.contains(&job_id) {
                continue;
            }
            info!(job_id = %job_id, plugin, "Removing job no longer declared by plugin");
            if let Err(e) = self.unregister_job(&job_id).await {
                warn!(job_id = %job_id, plugin, error = %e, "Failed to remove job");
            }
        }
    }

    async fn on_stopping(&self, plugin: &str, grace: Duration) {
        let cancelled = self.executor.drain_plugin(plugin, grace).await;
        if cancelled > 0 {
            warn!(plugin, cancelled, "Cancelled in-flight runs on stop");
        }
    }

    async fn on_stopped(&self, plugin: &str, retain_jobs: bool) {
        if !retain_jobs {
            self.remove_plugin_jobs(plugin).await;
        }
    }
}
