//! Scheduler data model
//!
//! Contains job definitions, run records, trigger state and the row types
//! used by the store.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::triggers::TriggerType;
use crate::error::{SkipReason, StoreError};
use crate::event_bus::EventBus;
use crate::utils::RetryPolicy;

/// Callable unit of work owned by a plugin
pub type UnitOfWork = Arc<dyn Fn(WorkContext) -> WorkFuture + Send + Sync>;

/// Future returned by a [`UnitOfWork`]
pub type WorkFuture = BoxFuture<'static, anyhow::Result<Value>>;

/// Wrap an async closure as a [`UnitOfWork`]
pub fn work_fn<F, Fut>(f: F) -> UnitOfWork
where
    F: Fn(WorkContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move |ctx| -> WorkFuture { Box::pin(f(ctx)) })
}

/// What a unit of work receives for one attempt
#[derive(Debug, Clone)]
pub struct WorkContext {
    /// Job being run
    pub job_id: String,
    /// This attempt's run id
    pub run_id: Uuid,
    /// Shared by every attempt of the same due signal
    pub invocation_id: Uuid,
    /// Attempt number, starting at 1
    pub attempt: u32,
    /// Payload of the triggering event, if any
    pub payload: Option<Value>,
    /// Cancelled on timeout, explicit cancel or plugin stop
    pub cancel: CancellationToken,
    /// Event bus handle
    pub bus: EventBus,
}

/// A job definition plus the work it runs
#[derive(Clone)]
pub struct JobRegistration {
    /// Definition
    pub definition: JobDefinition,
    /// Unit of work
    pub work: UnitOfWork,
}

impl JobRegistration {
    /// Pair a definition with its work
    pub fn new(definition: JobDefinition, work: UnitOfWork) -> Self {
        Self { definition, work }
    }
}

impl std::fmt::Debug for JobRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistration")
            .field("definition", &self.definition)
            .finish_non_exhaustive()
    }
}

fn default_max_concurrent() -> u32 {
    1
}

fn default_enabled() -> bool {
    true
}

/// Scheduled job definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    /// Unique job id
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Description
    #[serde(default)]
    pub description: Option<String>,
    /// Owning plugin
    pub plugin: String,
    /// When the job becomes due
    pub trigger: TriggerType,
    /// Jobs whose last run must have succeeded recently
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Retry policy; the host default applies when absent
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Per-attempt timeout; the host default applies when absent
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Maximum concurrent invocations
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    /// Whether due signals are acted on
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Free-form labels
    #[serde(default)]
    pub tags: Vec<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl JobDefinition {
    /// Create a job owned by `plugin`
    pub fn new(id: impl Into<String>, plugin: impl Into<String>, trigger: TriggerType) -> Self {
        let id = id.into();
        let now = Utc::now();
        Self {
            name: id.clone(),
            id,
            description: None,
            plugin: plugin.into(),
            trigger,
            dependencies: Vec::new(),
            retry: None,
            timeout_ms: None,
            max_concurrent: default_max_concurrent(),
            enabled: true,
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Set name
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set description
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Add a dependency on a previously defined job
    #[must_use]
    pub fn depends_on(mut self, job_id: impl Into<String>) -> Self {
        self.dependencies.push(job_id.into());
        self
    }

    /// Set retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Set per-attempt timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Set concurrency limit
    #[must_use]
    pub fn with_max_concurrent(mut self, max: u32) -> Self {
        self.max_concurrent = max;
        self
    }

    /// Set enabled flag
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Add a tag
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Timeout, falling back to `default`
    #[must_use]
    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout_ms.map(Duration::from_millis).unwrap_or(default)
    }

    /// Apply a configuration override
    pub fn apply(&mut self, overrides: &JobOverride) {
        if let Some(enabled) = overrides.enabled {
            self.enabled = enabled;
        }
        if let Some(trigger) = &overrides.trigger {
            self.trigger = trigger.clone();
        }
        if let Some(timeout_ms) = overrides.timeout_ms {
            self.timeout_ms = Some(timeout_ms);
        }
        if let Some(retry) = &overrides.retry {
            self.retry = Some(retry.clone());
        }
        if let Some(max) = overrides.max_concurrent {
            self.max_concurrent = max;
        }
        self.updated_at = Utc::now();
    }
}

/// Operator overrides for one job, from `[jobs.<id>]` configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOverride {
    /// Enable or disable
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Replace the trigger
    #[serde(default)]
    pub trigger: Option<TriggerType>,
    /// Replace the timeout
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Replace the retry policy
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Replace the concurrency limit
    #[serde(default)]
    pub max_concurrent: Option<u32>,
}

/// Outcome of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Still executing
    InProgress,
    /// Work returned Ok
    Success,
    /// Work returned an error or panicked
    Failed,
    /// Work exceeded its timeout
    Timeout,
    /// Cancelled explicitly or by plugin stop
    Cancelled,
    /// Not executed; not a failure
    Skipped(SkipReason),
}

impl RunOutcome {
    /// Persisted name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Skipped(_) => "skipped",
        }
    }

    /// Whether the run has ended
    #[must_use]
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::InProgress)
    }

    /// Whether the outcome counts as a failed attempt
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Timeout)
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Skipped(reason) => write!(f, "skipped: {}", reason),
            other => f.write_str(other.as_str()),
        }
    }
}

/// One execution attempt of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    /// Run id
    pub id: Uuid,
    /// Job id
    pub job_id: String,
    /// Logical invocation; retries share it
    pub invocation_id: Uuid,
    /// Attempt number (0 for skips)
    pub attempt: u32,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// End time
    pub finished_at: Option<DateTime<Utc>>,
    /// Outcome
    pub outcome: RunOutcome,
    /// Error detail for failed, timed out or cancelled runs
    pub error: Option<String>,
    /// Result payload of a successful run
    pub result: Option<Value>,
}

impl JobRun {
    /// Start a new in-progress attempt
    pub fn start(job_id: impl Into<String>, invocation_id: Uuid, attempt: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id: job_id.into(),
            invocation_id,
            attempt,
            started_at: Utc::now(),
            finished_at: None,
            outcome: RunOutcome::InProgress,
            error: None,
            result: None,
        }
    }

    /// A finished record for a due signal that was not executed
    pub fn skipped(job_id: impl Into<String>, reason: SkipReason) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_id: job_id.into(),
            invocation_id: Uuid::new_v4(),
            attempt: 0,
            started_at: now,
            finished_at: Some(now),
            outcome: RunOutcome::Skipped(reason),
            error: None,
            result: None,
        }
    }

    /// Mark finished with `outcome`
    pub fn finish(&mut self, outcome: RunOutcome, error: Option<String>, result: Option<Value>) {
        self.finished_at = Some(Utc::now());
        self.outcome = outcome;
        self.error = error;
        self.result = result;
    }

    /// Wall-clock duration, if finished
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|end| end - self.started_at)
    }
}

/// Per-job trigger bookkeeping, owned by the trigger engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerState {
    /// Job id
    pub job_id: String,
    /// Next due time for time-based triggers
    pub next_due: Option<DateTime<Utc>>,
    /// Last time the trigger fired
    pub last_fired: Option<DateTime<Utc>>,
    /// Total fires
    pub fire_count: u64,
    /// Subscription token for event triggers
    pub subscription: Option<String>,
}

impl TriggerState {
    /// Fresh state for `job_id`
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            next_due: None,
            last_fired: None,
            fire_count: 0,
            subscription: None,
        }
    }
}

/// Where a due signal came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DueSource {
    /// Cron, interval or one-shot deadline
    Timer,
    /// Event Bus message
    Event,
    /// `run_now`
    Manual,
}

/// "This job should be considered for execution now"
#[derive(Debug, Clone)]
pub struct DueSignal {
    /// Job id
    pub job_id: String,
    /// When the trigger was scheduled to fire
    pub scheduled_at: DateTime<Utc>,
    /// Signal origin
    pub source: DueSource,
    /// Event payload for event triggers
    pub payload: Option<Value>,
    /// Times this signal was re-queued waiting for the owning plugin
    pub deferrals: u32,
}

impl DueSignal {
    /// A signal from `source` due now
    pub fn new(job_id: impl Into<String>, source: DueSource) -> Self {
        Self {
            job_id: job_id.into(),
            scheduled_at: Utc::now(),
            source,
            payload: None,
            deferrals: 0,
        }
    }

    /// Attach an event payload
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Status report for one job
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    /// Current definition
    pub definition: JobDefinition,
    /// Trigger bookkeeping, if registered with the engine
    pub trigger: Option<TriggerState>,
    /// Invocations admitted and not yet finished
    pub in_flight: usize,
    /// Most recent runs, oldest first
    pub recent_runs: Vec<JobRun>,
}

/// Internal row type for job queries
#[derive(FromRow)]
pub(crate) struct JobRow {
    pub definition_json: String,
    pub enabled: bool,
}

impl TryFrom<JobRow> for JobDefinition {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, StoreError> {
        let mut definition: JobDefinition = serde_json::from_str(&row.definition_json)?;
        definition.enabled = row.enabled;
        Ok(definition)
    }
}

/// Internal row type for run queries
#[derive(FromRow)]
pub(crate) struct RunRow {
    pub id: String,
    pub job_id: String,
    pub invocation_id: String,
    pub attempt: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: String,
    pub detail: Option<String>,
    pub result_json: Option<String>,
}

impl TryFrom<RunRow> for JobRun {
    type Error = StoreError;

    fn try_from(row: RunRow) -> Result<Self, StoreError> {
        let parse_id = |s: &str, what: &str| {
            Uuid::parse_str(s).map_err(|e| StoreError::Corrupt(format!("invalid {} '{}': {}", what, s, e)))
        };

        let (outcome, error) = match row.outcome.as_str() {
            "in_progress" => (RunOutcome::InProgress, row.detail),
            "success" => (RunOutcome::Success, row.detail),
            "failed" => (RunOutcome::Failed, row.detail),
            "timeout" => (RunOutcome::Timeout, row.detail),
            "cancelled" => (RunOutcome::Cancelled, row.detail),
            "skipped" => {
                let detail = row
                    .detail
                    .ok_or_else(|| StoreError::Corrupt(format!("skipped run {} has no reason", row.id)))?;
                (RunOutcome::Skipped(serde_json::from_str(&detail)?), None)
            }
            other => return Err(StoreError::Corrupt(format!("unknown run outcome '{}'", other))),
        };

        Ok(JobRun {
            id: parse_id(&row.id, "run id")?,
            job_id: row.job_id,
            invocation_id: parse_id(&row.invocation_id, "invocation id")?,
            attempt: u32::try_from(row.attempt)
                .map_err(|_| StoreError::Corrupt(format!("invalid attempt {}", row.attempt)))?,
            started_at: row.started_at,
            finished_at: row.finished_at,
            outcome,
            error,
            result: row.result_json.map(|json| serde_json::from_str(&json)).transpose()?,
        })
    }
}

/// Internal row type for trigger state queries
#[derive(FromRow)]
pub(crate) struct TriggerStateRow {
    pub job_id: String,
    pub next_due: Option<DateTime<Utc>>,
    pub last_fired: Option<DateTime<Utc>>,
    pub fire_count: i64,
    pub subscription: Option<String>,
}

impl From<TriggerStateRow> for TriggerState {
    fn from(row: TriggerStateRow) -> Self {
        TriggerState {
            job_id: row.job_id,
            next_due: row.next_due,
            last_fired: row.last_fired,
            fire_count: u64::try_from(row.fire_count).unwrap_or_default(),
            subscription: row.subscription,
        }
    }
}

/// Internal row type for plugin queries
#[derive(FromRow)]
pub(crate) struct PluginRow {
    pub descriptor_json: String,
    pub state: String,
    pub updated_at: DateTime<Utc>,
}
