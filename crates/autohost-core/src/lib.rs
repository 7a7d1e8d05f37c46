//! Autohost Core - Job Scheduling and Plugin Lifecycle
//!
//! This crate provides the engine of the Autohost automation host:
//! - Event Bus: process-wide publish/subscribe with isolated handlers
//! - Plugins: lifecycle state machine, health checks, auto-restart, hot replace
//! - Dependency Resolver: deterministic, version-checked plugin load order
//! - Scheduler: cron/interval/one-shot/event triggers, bounded executor,
//!   retry, timeout and SQLite persistence
//! - Host: the process-wide context tying the components together
//! - Builtin: the `housekeeping` plugin

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod builtin;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod host;
pub mod plugin;
pub mod scheduler;
pub mod utils;

pub use config::{AutoRestartConfig, DeferralConfig, HistoryConfig, HostConfig, PluginPolicyConfig};
pub use error::{
    DependencyError, Error, ExecutionError, LifecycleError, RegistrationError, Result, SkipReason,
    StoreError,
};
pub use event_bus::{handler_fn, topics, Event, EventBus, EventHandler, Subscription, TopicPattern};
pub use host::{AutomationHost, AutomationHostBuilder};
pub use plugin::{
    DependencyResolver, HealthStatus, LifecycleManager, Plugin, PluginContext, PluginDescriptor,
    PluginState, PluginStatus,
};
pub use scheduler::{
    work_fn, JobDefinition, JobOverride, JobRegistration, JobRun, JobStatus, JobStore, RunOutcome,
    TriggerType, WorkContext,
};
pub use utils::RetryPolicy;
