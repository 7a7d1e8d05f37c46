//! Plugin Lifecycle Manager
//!
//! Owns one instance per plugin name and drives it through
//! `Discovered → Loaded → Initialized → Running → Stopping → Stopped`, with
//! `Failed` reachable whenever a capability hook errors. Transitions on one
//! plugin are serialized by a per-plugin async lock; different plugins never
//! contend.
//!
//! Scheduler side effects (job registration, draining in-flight runs) go
//! through [`PluginHooks`], implemented by the host.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt;
use serde_json::{json, Value};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    DependencyResolver, HealthStatus, Plugin, PluginContext, PluginDescriptor, PluginState,
    PluginStateView, PluginStatus,
};
use crate::config::PluginPolicyConfig;
use crate::error::LifecycleError;
use crate::event_bus::{topics, EventBus};
use crate::scheduler::{JobRegistration, JobStore};
use crate::utils::retry_with_backoff;

type LifecycleResult<T> = std::result::Result<T, LifecycleError>;

/// Scheduler callbacks at lifecycle boundaries
#[async_trait]
pub trait PluginHooks: Send + Sync + 'static {
    /// The plugin initialized and declared `jobs`. Rejected jobs must not
    /// fail the plugin.
    async fn on_initialized(&self, plugin: &str, jobs: Vec<JobRegistration>);

    /// The plugin left `Running`; wait for or cancel its in-flight runs
    async fn on_stopping(&self, plugin: &str, grace: Duration);

    /// The plugin is no longer running. `retain_jobs` is false for an
    /// explicit stop, which removes its jobs.
    async fn on_stopped(&self, plugin: &str, retain_jobs: bool);
}

struct Live {
    plugin: Arc<dyn Plugin>,
    ctx: PluginContext,
    health: Option<CancellationToken>,
}

struct PluginSlot {
    name: String,
    // Held for the whole of a transition
    live: tokio::sync::Mutex<Live>,
    status: Mutex<PluginStatus>,
}

impl PluginSlot {
    fn status(&self) -> MutexGuard<'_, PluginStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> PluginState {
        self.status().state
    }

    fn descriptor(&self) -> PluginDescriptor {
        self.status().descriptor.clone()
    }
}

struct LifecycleInner {
    config: PluginPolicyConfig,
    bus: EventBus,
    store: Arc<JobStore>,
    view: PluginStateView,
    resolver: DependencyResolver,
    hooks: Weak<dyn PluginHooks>,
    plugins: DashMap<String, Arc<PluginSlot>>,
    plugin_configs: DashMap<String, Value>,
    shutdown: CancellationToken,
}

/// Loads, starts, stops and supervises plugin instances
#[derive(Clone)]
pub struct LifecycleManager {
    inner: Arc<LifecycleInner>,
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("plugins", &self.inner.plugins.len())
            .finish()
    }
}

impl LifecycleManager {
    /// Create a manager. `view` is updated on every transition.
    pub fn new(
        config: PluginPolicyConfig,
        bus: EventBus,
        store: Arc<JobStore>,
        view: PluginStateView,
        hooks: Weak<dyn PluginHooks>,
    ) -> Self {
        Self {
            inner: Arc::new(LifecycleInner {
                config,
                bus,
                store,
                view,
                resolver: DependencyResolver::new(),
                hooks,
                plugins: DashMap::new(),
                plugin_configs: DashMap::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Use `resolver` for host-version and replacement checks
    #[must_use]
    pub fn with_resolver(mut self, resolver: DependencyResolver) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.resolver = resolver;
        }
        self
    }

    /// Private configuration handed to `name` on its next start
    pub fn set_plugin_config(&self, name: &str, config: Value) {
        self.inner.plugin_configs.insert(name.to_string(), config);
    }

    /// Read view of plugin states
    #[must_use]
    pub fn view(&self) -> &PluginStateView {
        &self.inner.view
    }

    /// Load a plugin: `Discovered → Loaded`
    pub async fn load(&self, plugin: Arc<dyn Plugin>) -> LifecycleResult<()> {
        self.inner.load(plugin).await
    }

    /// Start a plugin from `Loaded`, `Stopped` or `Failed`. Every declared
    /// dependency must already be running. Resets the auto-restart count.
    pub async fn start(&self, name: &str) -> LifecycleResult<()> {
        self.inner.slot(name)?.status().restart_count = 0;
        self.inner.start(name).await
    }

    /// Stop a running plugin, draining its runs and removing its jobs
    pub async fn stop(&self, name: &str) -> LifecycleResult<()> {
        let slot = self.inner.slot(name)?;
        let mut live = slot.live.lock().await;
        self.inner.stop_locked(&slot, &mut live, false).await
    }

    /// Stop and start a running plugin as one transition, keeping its jobs
    pub async fn reload(&self, name: &str) -> LifecycleResult<()> {
        let slot = self.inner.slot(name)?;
        let mut live = slot.live.lock().await;
        let state = slot.state();
        if state != PluginState::Running {
            return Err(LifecycleError::InvalidTransition {
                name: name.to_string(),
                from: state,
                action: "reload",
            });
        }
        info!(plugin = name, "Reloading plugin");
        slot.status().restart_count = 0;
        self.inner.stop_locked(&slot, &mut live, true).await?;
        self.inner.start_locked(&slot, &mut live).await
    }

    /// Swap in a new instance of an already loaded plugin.
    ///
    /// A running plugin is stopped, replaced and started again; if the new
    /// instance fails to start, the previous instance is restored and
    /// started. If that also fails the plugin is left `Failed`.
    pub async fn replace(&self, plugin: Arc<dyn Plugin>) -> crate::Result<()> {
        self.inner.replace(plugin).await
    }

    /// Remove a plugin from the host.
    ///
    /// A running plugin is stopped first. Its jobs are removed in every case.
    /// Refused while running plugins depend on it. The name can be loaded
    /// again afterwards.
    pub async fn unload(&self, name: &str) -> LifecycleResult<()> {
        self.inner.unload(name).await
    }

    /// Current state of `name`
    #[must_use]
    pub fn status(&self, name: &str) -> Option<PluginState> {
        self.inner.view.get(name)
    }

    /// Snapshot of one instance
    #[must_use]
    pub fn instance(&self, name: &str) -> Option<PluginStatus> {
        self.inner.plugins.get(name).map(|slot| slot.status().clone())
    }

    /// Snapshots of every instance, by name
    #[must_use]
    pub fn list(&self) -> Vec<PluginStatus> {
        let mut all: Vec<PluginStatus> = self
            .inner
            .plugins
            .iter()
            .map(|slot| slot.status().clone())
            .collect();
        all.sort_by(|a, b| a.descriptor.name.cmp(&b.descriptor.name));
        all
    }

    /// Descriptors of every loaded plugin
    #[must_use]
    pub fn descriptors(&self) -> Vec<PluginDescriptor> {
        self.list().into_iter().map(|s| s.descriptor).collect()
    }

    /// Whether `name` is loaded
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.inner.plugins.contains_key(name)
    }

    /// Stop every running plugin in reverse of `order`, keeping their jobs,
    /// and end health checks and pending restarts
    pub async fn shutdown_all(&self, order: &[String]) {
        self.inner.shutdown.cancel();
        for name in order.iter().rev() {
            let Ok(slot) = self.inner.slot(name) else {
                continue;
            };
            let mut live = slot.live.lock().await;
            if slot.state() != PluginState::Running {
                continue;
            }
            if let Err(e) = self.inner.stop_locked(&slot, &mut live, true).await {
                warn!(plugin = %name, error = %e, "Plugin did not stop cleanly");
            }
        }
    }
}

impl LifecycleInner {
    fn slot(&self, name: &str) -> LifecycleResult<Arc<PluginSlot>> {
        self.plugins
            .get(name)
            .map(|slot| slot.clone())
            .ok_or_else(|| LifecycleError::NotFound(name.to_string()))
    }

    /// Whether `slot` is still the registered instance slot for its name
    fn is_current(&self, slot: &Arc<PluginSlot>) -> bool {
        self.plugins
            .get(&slot.name)
            .is_some_and(|current| Arc::ptr_eq(current.value(), slot))
    }

    fn context_for(&self, name: &str) -> PluginContext {
        let config = self
            .plugin_configs
            .get(name)
            .map(|c| c.clone())
            .unwrap_or(Value::Null);
        PluginContext::new(name, config, self.bus.clone())
    }

    async fn load(&self, plugin: Arc<dyn Plugin>) -> LifecycleResult<()> {
        let descriptor = plugin.descriptor();
        let name = descriptor.name.clone();

        if let Some(required) = &descriptor.min_host_version {
            if !descriptor.supports_host(self.resolver.host_version()) {
                return Err(LifecycleError::IncompatibleHost {
                    plugin: name,
                    required: required.to_string(),
                });
            }
        }

        let slot = Arc::new(PluginSlot {
            name: name.clone(),
            live: tokio::sync::Mutex::new(Live {
                plugin,
                ctx: self.context_for(&name),
                health: None,
            }),
            status: Mutex::new(PluginStatus {
                descriptor: descriptor.clone(),
                state: PluginState::Discovered,
                last_error: None,
                started_at: None,
                restart_count: 0,
                health: Default::default(),
            }),
        });

        match self.plugins.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(LifecycleError::AlreadyLoaded(name));
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(slot.clone());
            }
        }

        info!(plugin = %name, version = %descriptor.version, "Plugin discovered");
        self.transition(&slot, PluginState::Loaded).await;
        Ok(())
    }

    async fn start(self: &Arc<Self>, name: &str) -> LifecycleResult<()> {
        let slot = self.slot(name)?;
        let mut live = slot.live.lock().await;
        self.start_locked(&slot, &mut live).await
    }

    async fn start_locked(
        self: &Arc<Self>,
        slot: &Arc<PluginSlot>,
        live: &mut Live,
    ) -> LifecycleResult<()> {
        self.run_start_hooks(slot, live).await?;
        live.health = Some(self.spawn_health(slot.clone(), live.plugin.clone()));
        Ok(())
    }

    async fn run_start_hooks(&self, slot: &PluginSlot, live: &mut Live) -> LifecycleResult<()> {
        let name = slot.name.as_str();
        let state = slot.state();
        if !state.can_start() {
            return Err(LifecycleError::InvalidTransition {
                name: name.to_string(),
                from: state,
                action: "start",
            });
        }

        let descriptor = slot.descriptor();
        for dependency in &descriptor.dependencies {
            if !self.view.is_running(&dependency.name) {
                return Err(LifecycleError::DependencyNotRunning {
                    plugin: name.to_string(),
                    dependency: dependency.name.clone(),
                });
            }
        }

        if state != PluginState::Loaded {
            self.transition(slot, PluginState::Loaded).await;
        }

        live.ctx = self.context_for(name);
        if let Err(e) = guarded(live.plugin.initialize(&live.ctx)).await {
            return Err(self.fail(slot, live, "initialize", e).await);
        }
        self.transition(slot, PluginState::Initialized).await;

        let jobs = live.plugin.jobs(&live.ctx);
        debug!(plugin = name, jobs = jobs.len(), "Registering plugin jobs");
        if let Some(hooks) = self.hooks.upgrade() {
            hooks.on_initialized(name, jobs).await;
        }

        if let Err(e) = guarded(live.plugin.start(&live.ctx)).await {
            if let Err(cleanup) = guarded(live.plugin.cleanup(&live.ctx)).await {
                warn!(plugin = name, error = %cleanup, "Cleanup after failed start errored");
            }
            return Err(self.fail(slot, live, "start", e).await);
        }

        {
            let mut status = slot.status();
            status.started_at = Some(Utc::now());
            status.last_error = None;
            status.health = Default::default();
        }
        self.transition(slot, PluginState::Running).await;
        info!(plugin = name, "Plugin running");
        Ok(())
    }

    async fn stop_locked(&self, slot: &PluginSlot, live: &mut Live, retain_jobs: bool) -> LifecycleResult<()> {
        let name = slot.name.as_str();
        let state = slot.state();
        if state != PluginState::Running {
            return Err(LifecycleError::InvalidTransition {
                name: name.to_string(),
                from: state,
                action: "stop",
            });
        }

        if let Some(health) = live.health.take() {
            health.cancel();
        }
        // No new admissions from here on
        self.transition(slot, PluginState::Stopping).await;

        let hooks = self.hooks.upgrade();
        if let Some(hooks) = &hooks {
            hooks.on_stopping(name, self.config.stop_grace()).await;
        }

        let stopped = match guarded(live.plugin.stop(&live.ctx)).await {
            Ok(()) => guarded(live.plugin.cleanup(&live.ctx))
                .await
                .map_err(|e| ("cleanup", e)),
            Err(e) => Err(("stop", e)),
        };

        let result = match stopped {
            Ok(()) => {
                let released = live.ctx.release_subscriptions();
                debug!(plugin = name, released, "Plugin subscriptions released");
                self.transition(slot, PluginState::Stopped).await;
                info!(plugin = name, "Plugin stopped");
                Ok(())
            }
            Err((phase, e)) => Err(self.fail(slot, live, phase, e).await),
        };

        if let Some(hooks) = &hooks {
            hooks.on_stopped(name, retain_jobs).await;
        }
        result
    }

    async fn replace(self: &Arc<Self>, plugin: Arc<dyn Plugin>) -> crate::Result<()> {
        let new_descriptor = plugin.descriptor();
        let name = new_descriptor.name.clone();
        let slot = self.slot(&name)?;
        let mut live = slot.live.lock().await;

        let dependents: Vec<PluginDescriptor> = self
            .plugins
            .iter()
            .filter(|other| other.name != name && other.state() == PluginState::Running)
            .map(|other| other.descriptor())
            .filter(|d| d.dependencies.iter().any(|dep| dep.name == name))
            .collect();
        self.resolver.check_replacement(&new_descriptor, &dependents)?;

        slot.status().restart_count = 0;
        let state = slot.state();
        if state != PluginState::Running {
            if !state.can_start() {
                return Err(LifecycleError::InvalidTransition {
                    name,
                    from: state,
                    action: "replace",
                }
                .into());
            }
            live.plugin = plugin;
            slot.status().descriptor = new_descriptor.clone();
            info!(plugin = %name, version = %new_descriptor.version, "Plugin instance replaced");
            self.transition(&slot, PluginState::Loaded).await;
            return Ok(());
        }

        let previous_descriptor = slot.descriptor();
        info!(
            plugin = %name,
            from = %previous_descriptor.version,
            to = %new_descriptor.version,
            "Replacing running plugin"
        );
        self.stop_locked(&slot, &mut live, true).await?;

        let previous = std::mem::replace(&mut live.plugin, plugin);
        slot.status().descriptor = new_descriptor;

        let Err(e) = self.start_locked(&slot, &mut live).await else {
            return Ok(());
        };

        warn!(plugin = %name, error = %e, "Replacement failed to start, rolling back");
        live.plugin = previous;
        slot.status().descriptor = previous_descriptor;
        if let Err(rollback) = self.start_locked(&slot, &mut live).await {
            error!(plugin = %name, error = %rollback, "Rollback failed, plugin left failed");
        }
        Err(e.into())
    }

    async fn unload(&self, name: &str) -> LifecycleResult<()> {
        let slot = self.slot(name)?;
        let mut live = slot.live.lock().await;
        // A concurrent unload may have won the lock first
        if !self.is_current(&slot) {
            return Err(LifecycleError::NotFound(name.to_string()));
        }

        let mut dependents: Vec<String> = self
            .plugins
            .iter()
            .filter(|other| other.name != name && other.state() == PluginState::Running)
            .filter(|other| other.descriptor().dependencies.iter().any(|dep| dep.name == name))
            .map(|other| other.name.clone())
            .collect();
        if !dependents.is_empty() {
            dependents.sort();
            return Err(LifecycleError::InUse {
                name: name.to_string(),
                dependents,
            });
        }

        let descriptor = slot.descriptor();
        if slot.state() == PluginState::Running {
            self.stop_locked(&slot, &mut live, false).await?;
        } else if let Some(hooks) = self.hooks.upgrade() {
            hooks.on_stopped(name, false).await;
        }
        live.ctx.release_subscriptions();

        self.plugins.remove(name);
        self.view.remove(name);
        if let Err(e) = self.store.delete_plugin(name).await {
            warn!(plugin = name, error = %e, "Failed to delete plugin record");
        }

        info!(plugin = name, version = %descriptor.version, "Plugin unloaded");
        self.bus.publish(
            topics::PLUGIN_UNLOADED,
            json!({ "plugin": name, "version": descriptor.version.to_string() }),
        );
        Ok(())
    }

    /// Best-effort `stop` and `cleanup` for an instance that already failed
    async fn wind_down(&self, name: &str, live: &Live) {
        if let Err(e) = guarded(live.plugin.stop(&live.ctx)).await {
            warn!(plugin = name, error = %e, "Stop after failure errored");
        }
        if let Err(e) = guarded(live.plugin.cleanup(&live.ctx)).await {
            warn!(plugin = name, error = %e, "Cleanup after failure errored");
        }
    }

    /// Record a hook failure: `Failed`, event, subscriptions released
    async fn fail(&self, slot: &PluginSlot, live: &mut Live, phase: &'static str, e: anyhow::Error) -> LifecycleError {
        let name = slot.name.clone();
        let reason = format!("{:#}", e);
        error!(plugin = %name, phase, error = %reason, "Plugin hook failed");

        if let Some(health) = live.health.take() {
            health.cancel();
        }
        live.ctx.release_subscriptions();
        slot.status().last_error = Some(format!("{}: {}", phase, reason));
        self.transition(slot, PluginState::Failed).await;
        self.bus.publish(
            topics::PLUGIN_FAILED,
            json!({ "plugin": name, "phase": phase, "error": reason }),
        );

        LifecycleError::HookFailed {
            name,
            phase,
            reason,
        }
    }

    async fn transition(&self, slot: &PluginSlot, to: PluginState) {
        let (from, descriptor) = {
            let mut status = slot.status();
            let from = status.state;
            status.state = to;
            (from, status.descriptor.clone())
        };
        self.view.set(&slot.name, to);
        debug!(plugin = %slot.name, %from, %to, "Plugin state changed");

        if let Err(e) = self.store.save_plugin(&descriptor, to).await {
            warn!(plugin = %slot.name, error = %e, "Failed to persist plugin state");
        }

        let topic = match to {
            PluginState::Loaded => topics::PLUGIN_LOADED,
            PluginState::Running => topics::PLUGIN_STARTED,
            PluginState::Stopped => topics::PLUGIN_STOPPED,
            // Failed is published with its cause by `fail`
            _ => return,
        };
        self.bus.publish(
            topic,
            json!({
                "plugin": slot.name,
                "version": descriptor.version.to_string(),
                "from": from,
            }),
        );
    }

    fn spawn_health(self: &Arc<Self>, slot: Arc<PluginSlot>, plugin: Arc<dyn Plugin>) -> CancellationToken {
        let token = self.shutdown.child_token();
        let cancelled = token.clone();
        let weak = Arc::downgrade(self);
        let interval = self.config.health_check_interval();
        let threshold = self.config.failure_threshold;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }

                let health = AssertUnwindSafe(plugin.health_check())
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| HealthStatus::Unhealthy("health check panicked".into()));
                if cancelled.is_cancelled() {
                    return;
                }

                let failures = {
                    let mut status = slot.status();
                    let now = Utc::now();
                    status.health.last_checked = Some(now);
                    if health.is_healthy() {
                        status.health.last_success = Some(now);
                        status.health.consecutive_failures = 0;
                    } else {
                        status.health.consecutive_failures += 1;
                    }
                    status.health.consecutive_failures
                };

                let HealthStatus::Unhealthy(reason) = health else {
                    continue;
                };
                warn!(plugin = %slot.name, failures, threshold, reason = %reason, "Health check failed");
                if failures < threshold {
                    continue;
                }

                if let Some(inner) = weak.upgrade() {
                    inner.health_failed(&slot, &cancelled, reason).await;
                }
                return;
            }
        });

        token
    }

    async fn health_failed(self: &Arc<Self>, slot: &Arc<PluginSlot>, token: &CancellationToken, reason: String) {
        let mut live = slot.live.lock().await;
        // A stop or restart may have won the lock first
        if token.is_cancelled() || slot.state() != PluginState::Running {
            return;
        }
        live.health = None;

        let threshold = self.config.failure_threshold;
        let e = anyhow::anyhow!("{} consecutive health check failures: {}", threshold, reason);
        self.fail(slot, &mut live, "health_check", e).await;
        if let Some(hooks) = self.hooks.upgrade() {
            hooks.on_stopping(&slot.name, self.config.stop_grace()).await;
        }
        self.wind_down(&slot.name, &live).await;
        drop(live);

        let policy = &self.config.auto_restart;
        if !policy.enabled {
            return;
        }
        let restarts = slot.status().restart_count;
        if restarts >= policy.max_restarts {
            error!(
                plugin = %slot.name,
                restarts,
                limit = policy.max_restarts,
                "Restart limit reached, plugin stays failed"
            );
            return;
        }
        self.schedule_restart(slot.clone());
    }

    fn schedule_restart(self: &Arc<Self>, slot: Arc<PluginSlot>) {
        let policy = self.config.auto_restart.policy();
        let limit = self.config.auto_restart.max_restarts;
        let weak = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let name = slot.name.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(policy.delay_for(1)) => {}
            }

            let result = retry_with_backoff(
                &policy,
                |attempt| {
                    let weak = weak.clone();
                    let slot = slot.clone();
                    let shutdown = shutdown.clone();
                    async move {
                        let inner = match weak.upgrade() {
                            Some(inner) if !shutdown.is_cancelled() && inner.is_current(&slot) => inner,
                            _ => return Err(LifecycleError::NotFound(slot.name.clone())),
                        };
                        let restarts = {
                            let mut status = slot.status();
                            if status.restart_count >= limit {
                                return Err(LifecycleError::RestartLimit {
                                    name: slot.name.clone(),
                                    limit,
                                });
                            }
                            status.restart_count += 1;
                            status.restart_count
                        };
                        info!(plugin = %slot.name, attempt, restarts, "Restarting failed plugin");
                        inner.start(&slot.name).await
                    }
                },
                |e| {
                    !matches!(
                        e,
                        LifecycleError::InvalidTransition { .. }
                            | LifecycleError::NotFound(_)
                            | LifecycleError::RestartLimit { .. }
                    )
                },
            )
            .await;

            match result {
                Ok(()) => info!(plugin = %name, "Plugin restarted"),
                Err(e) => error!(
                    plugin = %name,
                    attempts = e.attempts,
                    error = %e.last_error,
                    "Plugin restart abandoned"
                ),
            }
        });
    }
}

/// Run a plugin hook, turning a panic into an error
async fn guarded<F>(hook: F) -> anyhow::Result<()>
where
    F: Future<Output = anyhow::Result<()>>,
{
    match AssertUnwindSafe(hook).catch_unwind().await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!("hook panicked")),
    }
}
