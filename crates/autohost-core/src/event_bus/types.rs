use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Topics the core guarantees to publish.
pub mod topics {
    /// Plugin reached `Loaded`
    pub const PLUGIN_LOADED: &str = "plugin_loaded";
    /// Plugin reached `Running`
    pub const PLUGIN_STARTED: &str = "plugin_started";
    /// Plugin reached `Stopped`
    pub const PLUGIN_STOPPED: &str = "plugin_stopped";
    /// Plugin reached `Failed`
    pub const PLUGIN_FAILED: &str = "plugin_failed";
    /// Plugin was removed from the host
    pub const PLUGIN_UNLOADED: &str = "plugin_unloaded";
    /// A run attempt began
    pub const JOB_STARTED: &str = "job_started";
    /// An invocation finished successfully
    pub const JOB_COMPLETED: &str = "job_completed";
    /// An invocation exhausted its attempts, or was cancelled
    pub const JOB_FAILED: &str = "job_failed";
    /// A due signal was skipped
    pub const JOB_SKIPPED: &str = "job_skipped";
    /// A job definition was rejected at registration
    pub const JOB_REJECTED: &str = "job_rejected";
    /// Job definitions changed through a configuration reload
    pub const CONFIG_CHANGED: &str = "config_changed";
    /// The executor due-queue dropped its oldest signal
    pub const QUEUE_OVERFLOW: &str = "queue_overflow";
}

/// Source name used for events published by the core itself.
pub const CORE_SOURCE: &str = "core";

/// A message on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event id
    pub id: Uuid,
    /// Topic the event was published on
    pub topic: String,
    /// Publisher (`core` or a plugin name)
    pub source: String,
    /// Arbitrary JSON payload
    pub payload: Value,
    /// Publish time
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Create an event stamped with the current time
    pub fn new(source: impl Into<String>, topic: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            source: source.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Topic filter used by subscriptions.
///
/// `*` matches any run of characters, so `plugin_*` matches every plugin
/// lifecycle topic and `*` matches everything. Anything else is an exact match.
#[derive(Debug, Clone)]
pub struct TopicPattern {
    raw: String,
    matcher: Matcher,
}

#[derive(Debug, Clone)]
enum Matcher {
    Any,
    Exact,
    Glob(Regex),
}

impl TopicPattern {
    /// Parse a topic or wildcard pattern
    pub fn new(pattern: impl Into<String>) -> Self {
        let raw = pattern.into();
        let matcher = if raw == "*" {
            Matcher::Any
        } else if raw.contains('*') {
            let escaped = regex::escape(&raw).replace(r"\*", ".*");
            match Regex::new(&format!("^{}$", escaped)) {
                Ok(re) => Matcher::Glob(re),
                Err(_) => Matcher::Exact,
            }
        } else {
            Matcher::Exact
        };
        Self { raw, matcher }
    }

    /// Whether `topic` is selected by this pattern
    #[must_use]
    pub fn matches(&self, topic: &str) -> bool {
        match &self.matcher {
            Matcher::Any => true,
            Matcher::Exact => self.raw == topic,
            Matcher::Glob(re) => re.is_match(topic),
        }
    }

    /// The pattern as written
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl From<&str> for TopicPattern {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TopicPattern {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}
