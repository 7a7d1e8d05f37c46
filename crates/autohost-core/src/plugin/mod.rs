//! Plugin model
//!
//! A plugin is a fixed capability interface ([`Plugin`]) plus an immutable
//! [`PluginDescriptor`]. The [`LifecycleManager`] owns every instance and is
//! the only component that changes a plugin's [`PluginState`]; everything else
//! reads state through a [`PluginStateView`].

mod lifecycle;
mod resolver;

#[cfg(test)]
mod tests;

pub use lifecycle::{LifecycleManager, PluginHooks};
pub use resolver::{topological_order, DependencyResolver};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::one::Ref;
use dashmap::DashMap;
use semver::{Version, VersionReq};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};

use crate::event_bus::{EventBus, EventHandler, Subscription, TopicPattern};
use crate::scheduler::JobRegistration;

/// Version of this host, compared against [`PluginDescriptor::min_host_version`]
pub const HOST_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Parsed [`HOST_VERSION`]
#[must_use]
pub fn host_version() -> Version {
    Version::parse(HOST_VERSION).unwrap_or_else(|_| Version::new(0, 0, 0))
}

/// Lifecycle state of a plugin instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    /// Known but not yet loaded
    Discovered,
    /// Loaded, capability hooks not yet run
    Loaded,
    /// `initialize` succeeded
    Initialized,
    /// `start` succeeded; jobs are admitted
    Running,
    /// Draining in-flight runs before `stop`
    Stopping,
    /// Stopped cleanly
    Stopped,
    /// A hook failed or health checks gave up
    Failed,
}

impl PluginState {
    /// Lowercase name, as persisted
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Loaded => "loaded",
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }

    /// Whether `start` may be called from this state
    #[must_use]
    pub fn can_start(&self) -> bool {
        matches!(self, Self::Loaded | Self::Stopped | Self::Failed)
    }
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PluginState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discovered" => Ok(Self::Discovered),
            "loaded" => Ok(Self::Loaded),
            "initialized" => Ok(Self::Initialized),
            "running" => Ok(Self::Running),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown plugin state: {}", other)),
        }
    }
}

/// Dependency on another plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDependency {
    /// Plugin name
    pub name: String,
    /// Accepted versions
    pub version_req: VersionReq,
}

/// Identity and requirements of a plugin. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    /// Unique plugin name
    pub name: String,
    /// Plugin version
    pub version: Version,
    /// Short description
    #[serde(default)]
    pub description: String,
    /// Author
    #[serde(default)]
    pub author: String,
    /// Free-form category (e.g. "security", "monitoring")
    #[serde(default)]
    pub category: Option<String>,
    /// Plugins that must be running first
    #[serde(default)]
    pub dependencies: Vec<PluginDependency>,
    /// Oldest host this plugin works with
    #[serde(default)]
    pub min_host_version: Option<Version>,
    /// Started by `AutomationHost::start`
    #[serde(default = "default_autostart")]
    pub autostart: bool,
}

fn default_autostart() -> bool {
    true
}

impl PluginDescriptor {
    /// Create a descriptor with no dependencies
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            version,
            description: String::new(),
            author: String::new(),
            category: None,
            dependencies: Vec::new(),
            min_host_version: None,
            autostart: true,
        }
    }

    /// Set description
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set author
    #[must_use]
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    /// Set category
    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Declare a dependency
    #[must_use]
    pub fn depends_on(mut self, name: impl Into<String>, version_req: VersionReq) -> Self {
        self.dependencies.push(PluginDependency {
            name: name.into(),
            version_req,
        });
        self
    }

    /// Require a minimum host version
    #[must_use]
    pub fn with_min_host_version(mut self, version: Version) -> Self {
        self.min_host_version = Some(version);
        self
    }

    /// Set the autostart flag
    #[must_use]
    pub fn with_autostart(mut self, autostart: bool) -> Self {
        self.autostart = autostart;
        self
    }

    /// Whether this plugin can run on `host`
    #[must_use]
    pub fn supports_host(&self, host: &Version) -> bool {
        self.min_host_version.as_ref().map_or(true, |min| host >= min)
    }
}

/// Result of a plugin health check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum HealthStatus {
    /// Plugin is working
    Healthy,
    /// Plugin is degraded
    Unhealthy(String),
}

impl HealthStatus {
    /// Whether the check passed
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// Health bookkeeping for one instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthRecord {
    /// Last passing check
    pub last_success: Option<DateTime<Utc>>,
    /// Last check of any result
    pub last_checked: Option<DateTime<Utc>>,
    /// Failed checks since the last passing one
    pub consecutive_failures: u32,
}

/// Snapshot of a plugin instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginStatus {
    /// Descriptor the instance was loaded with
    pub descriptor: PluginDescriptor,
    /// Current state
    pub state: PluginState,
    /// Error from the last failed transition
    pub last_error: Option<String>,
    /// When the instance last entered `Running`
    pub started_at: Option<DateTime<Utc>>,
    /// Automatic restarts attempted
    pub restart_count: u32,
    /// Health check record
    pub health: HealthRecord,
}

/// Capability interface every plugin implements.
///
/// Hooks return `anyhow::Result`; an error from any hook moves the plugin
/// to [`PluginState::Failed`].
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    /// Identity and requirements
    fn descriptor(&self) -> PluginDescriptor;

    /// Prepare resources. Called on every start, including restarts.
    async fn initialize(&self, _ctx: &PluginContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Begin operating
    async fn start(&self, _ctx: &PluginContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Stop operating. In-flight runs have already been drained.
    async fn stop(&self, _ctx: &PluginContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Release resources acquired in `initialize`
    async fn cleanup(&self, _ctx: &PluginContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called on a fixed interval while running
    async fn health_check(&self) -> HealthStatus {
        HealthStatus::Healthy
    }

    /// Jobs to register once initialized
    fn jobs(&self, _ctx: &PluginContext) -> Vec<JobRegistration> {
        Vec::new()
    }
}

/// Handle given to plugin hooks: private configuration and the event bus
#[derive(Clone)]
pub struct PluginContext {
    name: String,
    config: Arc<Value>,
    bus: EventBus,
    subscriptions: Arc<Mutex<Vec<Subscription>>>,
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}

impl PluginContext {
    /// Create a context for `name`
    pub fn new(name: impl Into<String>, config: Value, bus: EventBus) -> Self {
        Self {
            name: name.into(),
            config: Arc::new(config),
            bus,
            subscriptions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Plugin name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Plugin-private configuration (`Value::Null` when none)
    #[must_use]
    pub fn config(&self) -> &Value {
        &self.config
    }

    /// Deserialize the private configuration
    pub fn config_as<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        Ok(serde_json::from_value((*self.config).clone())?)
    }

    /// Event bus handle
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Publish an event with this plugin as source
    pub fn emit_event(&self, topic: &str, payload: Value) -> usize {
        self.bus.emit(&self.name, topic, payload)
    }

    /// Subscribe to events; the subscription is dropped when the plugin stops
    pub fn subscribe_event(
        &self,
        pattern: impl Into<TopicPattern>,
        handler: Arc<dyn EventHandler>,
    ) -> Subscription {
        let subscription = self.bus.subscribe(pattern, handler);
        if let Ok(mut subs) = self.subscriptions.lock() {
            subs.push(subscription.clone());
        }
        subscription
    }

    /// Remove every subscription made through this context
    pub(crate) fn release_subscriptions(&self) -> usize {
        let subs = match self.subscriptions.lock() {
            Ok(mut subs) => std::mem::take(&mut *subs),
            Err(_) => return 0,
        };
        subs.iter().filter(|s| self.bus.unsubscribe(s)).count()
    }
}

/// Shared read view of plugin states.
///
/// Written only by the [`LifecycleManager`]; the executor reads it during
/// admission. Holding a [`PluginStateView::running_guard`] blocks state
/// writes for that plugin.
#[derive(Debug, Clone, Default)]
pub struct PluginStateView {
    states: Arc<DashMap<String, PluginState>>,
}

impl PluginStateView {
    /// Create an empty view
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of `name`
    #[must_use]
    pub fn get(&self, name: &str) -> Option<PluginState> {
        self.states.get(name).map(|s| *s)
    }

    /// Whether `name` is running
    #[must_use]
    pub fn is_running(&self, name: &str) -> bool {
        self.get(name) == Some(PluginState::Running)
    }

    /// Read guard held across admission so a concurrent stop cannot interleave
    pub(crate) fn running_guard(&self, name: &str) -> Option<Ref<'_, String, PluginState>> {
        self.states
            .get(name)
            .filter(|state| **state == PluginState::Running)
    }

    /// All known plugins and their states
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, PluginState)> {
        let mut all: Vec<_> = self
            .states
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub(crate) fn set(&self, name: &str, state: PluginState) {
        self.states.insert(name.to_string(), state);
    }

    pub(crate) fn remove(&self, name: &str) {
        self.states.remove(name);
    }
}
