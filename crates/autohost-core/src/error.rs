//! Error types for autohost-core
//!
//! One enum per failure family. Registration and resolution errors are
//! fatal only to the plugin or job they name; per-run failures never leave
//! the executor loop and are recorded in run history instead.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::plugin::PluginState;

/// Core error type
#[derive(Debug, Error)]
pub enum Error {
    /// Bad job or plugin definition
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    /// Plugin graph could not be resolved
    #[error(transparent)]
    Dependency(#[from] DependencyError),

    /// Plugin lifecycle transition failed
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// Persistence failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Invalid host configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Rejected job or plugin definition. Never scheduled.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistrationError {
    /// Job id is empty
    #[error("job id must not be empty")]
    EmptyId,

    /// Job id already registered
    #[error("job '{id}' is already registered by plugin '{owner}'")]
    DuplicateJob {
        /// Job id
        id: String,
        /// Plugin that owns the existing definition
        owner: String,
    },

    /// Job depends on an id that is not defined yet
    #[error("job '{job}' depends on undefined job '{dependency}'")]
    UnknownDependency {
        /// Job id
        job: String,
        /// Missing dependency id
        dependency: String,
    },

    /// Job dependency graph would contain a cycle
    #[error("job dependency cycle: {}", cycle.join(" -> "))]
    CyclicJobDependency {
        /// Members of the cycle, in order
        cycle: Vec<String>,
    },

    /// Trigger specification is invalid
    #[error("invalid trigger for job '{job}': {reason}")]
    InvalidTrigger {
        /// Job id
        job: String,
        /// Why the trigger was rejected
        reason: String,
    },

    /// Retry, timeout or concurrency settings are invalid
    #[error("invalid policy for job '{job}': {reason}")]
    InvalidPolicy {
        /// Job id
        job: String,
        /// Why the policy was rejected
        reason: String,
    },

    /// Owning plugin is not loaded
    #[error("plugin '{0}' is not loaded")]
    UnknownPlugin(String),

    /// Job definition names a different owner than the registering plugin
    #[error("job '{job}' declares owner '{declared}' but was registered by '{registering}'")]
    OwnerMismatch {
        /// Job id
        job: String,
        /// Owner on the definition
        declared: String,
        /// Plugin performing the registration
        registering: String,
    },

    /// Job id does not exist
    #[error("job '{0}' not found")]
    UnknownJob(String),
}

/// Plugin graph resolution failure. Aborts before anything is loaded.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DependencyError {
    /// Dependency cycle between plugins
    #[error("cyclic plugin dependency: {}", members.join(" -> "))]
    CyclicDependency {
        /// Plugins forming the cycle
        members: Vec<String>,
    },

    /// Dependency version outside the declared range
    #[error("plugin '{plugin}' requires {dependency} {required}, found {found}")]
    VersionMismatch {
        /// Dependent plugin
        plugin: String,
        /// Dependency name
        dependency: String,
        /// Declared version range
        required: String,
        /// Version actually present
        found: String,
    },

    /// Dependency is not part of the plugin set
    #[error("plugin '{plugin}' depends on missing plugin '{dependency}'")]
    MissingDependency {
        /// Dependent plugin
        plugin: String,
        /// Missing dependency name
        dependency: String,
    },

    /// Plugin requires a newer host
    #[error("plugin '{plugin}' requires host >= {required}, host is {host}")]
    IncompatibleHost {
        /// Plugin name
        plugin: String,
        /// Minimum host version
        required: String,
        /// Running host version
        host: String,
    },

    /// Same plugin name declared twice
    #[error("plugin '{0}' declared more than once")]
    DuplicatePlugin(String),
}

/// Plugin lifecycle failure
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LifecycleError {
    /// No instance with that name
    #[error("plugin '{0}' not found")]
    NotFound(String),

    /// An instance with that name is already live
    #[error("plugin '{0}' is already loaded")]
    AlreadyLoaded(String),

    /// Operation not allowed from the current state
    #[error("cannot {action} plugin '{name}' in state {from}")]
    InvalidTransition {
        /// Plugin name
        name: String,
        /// Current state
        from: PluginState,
        /// Requested operation
        action: &'static str,
    },

    /// A declared dependency is not running
    #[error("plugin '{plugin}' depends on '{dependency}' which is not running")]
    DependencyNotRunning {
        /// Plugin being started
        plugin: String,
        /// Dependency that is not running
        dependency: String,
    },

    /// A capability hook returned an error; the plugin is now `Failed`
    #[error("plugin '{name}' failed during {phase}: {reason}")]
    HookFailed {
        /// Plugin name
        name: String,
        /// Hook that failed
        phase: &'static str,
        /// Error text from the plugin
        reason: String,
    },

    /// Running plugins still depend on this one
    #[error("plugin '{name}' is required by running plugins: {}", dependents.join(", "))]
    InUse {
        /// Plugin name
        name: String,
        /// Running dependents, by name
        dependents: Vec<String>,
    },

    /// Auto-restart gave up; the plugin stays `Failed` until started by hand
    #[error("plugin '{name}' reached its restart limit of {limit}")]
    RestartLimit {
        /// Plugin name
        name: String,
        /// Configured `max_restarts`
        limit: u32,
    },

    /// Plugin requires a newer host
    #[error("plugin '{plugin}' requires host >= {required}")]
    IncompatibleHost {
        /// Plugin name
        plugin: String,
        /// Minimum host version
        required: String,
    },
}

/// Unit-of-work failure, as recorded on a run
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionError {
    /// The work returned an error
    #[error("{0}")]
    Failed(String),

    /// The run exceeded its budget
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The run was cancelled
    #[error("cancelled")]
    Cancelled,

    /// The work panicked
    #[error("panicked: {0}")]
    Panicked(String),
}

/// Persistence failure
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Row could not be decoded
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// Migration or transaction failure
    #[error("transaction error: {0}")]
    Transaction(String),

    /// Filesystem error preparing the database location
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a due job was not executed. Recorded on the run, never counted as a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// Owning plugin stayed unavailable past the deferral budget
    PluginUnavailable,
    /// A dependency has no fresh successful run
    DependencyUnmet {
        /// The dependency that was not satisfied
        dependency: String,
    },
    /// Per-job concurrency limit reached
    ConcurrencyLimit,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PluginUnavailable => write!(f, "plugin unavailable"),
            Self::DependencyUnmet { dependency } => write!(f, "dependency unmet: {}", dependency),
            Self::ConcurrencyLimit => write!(f, "concurrency limit"),
        }
    }
}
