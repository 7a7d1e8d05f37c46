//! Trigger specifications - rules that make a job due
//!
//! Supports:
//! - Cron: wall-clock schedule from a five or six field expression
//! - Interval: fixed period, computed from the scheduled time so it never drifts
//! - OneShot: a single fire at a given instant
//! - Event: an Event Bus topic, optionally filtered by a payload predicate

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::time::Duration;

use crate::event_bus::TopicPattern;

/// Longest accepted interval period (100 years)
pub const MAX_INTERVAL_MS: u64 = 100 * 365 * 24 * 60 * 60 * 1000;

/// Trigger types for jobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerType {
    /// Cron-based scheduling (e.g., "0 9 * * *" for 9 AM daily)
    Cron(CronTrigger),
    /// Fixed interval scheduling
    Interval(IntervalTrigger),
    /// Single execution at a specific time
    OneShot(OneShotTrigger),
    /// Event Bus message
    Event(EventTrigger),
}

impl TriggerType {
    /// Create a cron trigger
    pub fn cron(expression: impl Into<String>) -> Self {
        Self::Cron(CronTrigger {
            expression: expression.into(),
        })
    }

    /// Create an interval trigger
    pub fn interval(period: Duration) -> Self {
        Self::Interval(IntervalTrigger {
            period_ms: period.as_millis() as u64,
            immediate: false,
        })
    }

    /// Create an interval trigger that also fires on registration
    pub fn interval_immediate(period: Duration) -> Self {
        Self::Interval(IntervalTrigger {
            period_ms: period.as_millis() as u64,
            immediate: true,
        })
    }

    /// Create a one-shot trigger
    pub fn one_shot(at: DateTime<Utc>) -> Self {
        Self::OneShot(OneShotTrigger { at })
    }

    /// Create an event trigger without a predicate
    pub fn event(topic: impl Into<String>) -> Self {
        Self::Event(EventTrigger {
            topic: topic.into(),
            predicate: None,
        })
    }

    /// Create an event trigger that only fires when `predicate` holds
    pub fn event_where(topic: impl Into<String>, predicate: PayloadPredicate) -> Self {
        Self::Event(EventTrigger {
            topic: topic.into(),
            predicate: Some(predicate),
        })
    }

    /// Short name of the trigger kind
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Cron(_) => "cron",
            Self::Interval(_) => "interval",
            Self::OneShot(_) => "one_shot",
            Self::Event(_) => "event",
        }
    }

    /// Whether the trigger fires on the clock rather than on events
    #[must_use]
    pub fn is_time_based(&self) -> bool {
        !matches!(self, Self::Event(_))
    }

    /// Reject malformed parameters
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Cron(cron) => cron.schedule().map(|_| ()),
            Self::Interval(interval) if interval.period_ms == 0 => {
                Err("interval period must be greater than zero".into())
            }
            Self::Interval(interval) if interval.period_ms > MAX_INTERVAL_MS => Err(format!(
                "interval period {}ms exceeds the maximum of {}ms",
                interval.period_ms, MAX_INTERVAL_MS
            )),
            Self::Interval(_) | Self::OneShot(_) => Ok(()),
            Self::Event(event) => {
                if event.topic.trim().is_empty() {
                    return Err("event topic must not be empty".into());
                }
                match &event.predicate {
                    Some(p) if !p.pointer.is_empty() && !p.pointer.starts_with('/') => Err(format!(
                        "predicate pointer '{}' must be empty or start with '/'",
                        p.pointer
                    )),
                    _ => Ok(()),
                }
            }
        }
    }

    /// First due time for a freshly registered trigger
    #[must_use]
    pub fn first_due(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Cron(cron) => cron.next_after(now),
            Self::Interval(interval) if interval.immediate => Some(now),
            Self::Interval(interval) => now.checked_add_signed(interval.period()),
            Self::OneShot(one_shot) => Some(one_shot.at),
            Self::Event(_) => None,
        }
    }

    /// Due time following a fire that was scheduled for `scheduled`.
    ///
    /// Intervals advance from the scheduled time, never from `now`; slots
    /// already in the past are skipped rather than fired in a burst.
    #[must_use]
    pub fn next_after(&self, scheduled: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Cron(cron) => cron.next_after(scheduled.max(now)),
            Self::Interval(interval) => {
                let period = interval.period();
                if period <= ChronoDuration::zero() {
                    return None;
                }
                let next = scheduled.checked_add_signed(period)?;
                if next >= now {
                    return Some(next);
                }
                let step = period.num_milliseconds();
                let behind = (now - scheduled).num_milliseconds();
                let periods = behind / step + i64::from(behind % step != 0);
                let offset = step.checked_mul(periods)?;
                scheduled.checked_add_signed(ChronoDuration::milliseconds(offset))
            }
            Self::OneShot(_) | Self::Event(_) => None,
        }
    }

    /// Due time to resume from after a restart, given the persisted one
    #[must_use]
    pub fn resume_from(&self, persisted: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if persisted > now {
            return Some(persisted);
        }
        match self {
            Self::OneShot(_) => Some(persisted),
            _ => self.next_after(persisted, now),
        }
    }
}

/// Cron-based trigger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronTrigger {
    /// Cron expression, evaluated in UTC
    /// Format: "minute hour day month weekday" or with a leading seconds field
    /// Examples:
    ///   "0 9 * * *" - Every day at 9:00 AM
    ///   "*/10 * * * *" - Every 10 minutes
    ///   "0 0 * * 1" - Every Monday at midnight
    pub expression: String,
}

impl CronTrigger {
    /// Parse the expression
    pub fn schedule(&self) -> Result<Schedule, String> {
        let normalized = normalize_cron_expression(&self.expression)?;
        Schedule::from_str(&normalized)
            .map_err(|e| format!("invalid cron expression '{}': {}", self.expression, e))
    }

    /// Next matching time strictly after `after`
    #[must_use]
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule().ok()?.after(&after).next()
    }
}

/// Convert a standard five-field expression into the seconds-first form the
/// `cron` crate parses. Numeric weekdays follow Unix numbering (0 or 7 is
/// Sunday) and are rewritten as names.
fn normalize_cron_expression(expr: &str) -> Result<String, String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    match fields.len() {
        5 => {
            let weekday = unix_weekdays_to_names(fields[4])?;
            Ok(format!("0 {} {} {} {} {}", fields[0], fields[1], fields[2], fields[3], weekday))
        }
        6 | 7 => Ok(fields.join(" ")),
        n => Err(format!("cron expression must have 5 or 6 fields, got {}", n)),
    }
}

const WEEKDAYS: [&str; 8] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

fn unix_weekdays_to_names(field: &str) -> Result<String, String> {
    let name = |token: &str| -> Result<String, String> {
        match token.parse::<usize>() {
            Ok(n) if n < WEEKDAYS.len() => Ok(WEEKDAYS[n].to_string()),
            Ok(n) => Err(format!("weekday {} out of range 0-7", n)),
            Err(_) => Ok(token.to_string()),
        }
    };

    let parts = field
        .split(',')
        .map(|part| {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (part, None),
            };
            let range = match range.split_once('-') {
                // Sunday is the first weekday for the parser, so "x-7" wraps
                Some((start, "7")) if start != "0" => format!("{}-Sat,Sun", name(start)?),
                Some((start, end)) => format!("{}-{}", name(start)?, name(end)?),
                None => name(range)?,
            };
            Ok(match step {
                Some(step) => format!("{}/{}", range, step),
                None => range,
            })
        })
        .collect::<Result<Vec<String>, String>>()?;
    Ok(parts.join(","))
}

/// Interval-based trigger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalTrigger {
    /// Period in milliseconds
    pub period_ms: u64,
    /// Fire once immediately on registration
    #[serde(default)]
    pub immediate: bool,
}

impl IntervalTrigger {
    fn period(&self) -> ChronoDuration {
        ChronoDuration::milliseconds(self.period_ms.min(i64::MAX as u64) as i64)
    }
}

/// One-shot trigger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneShotTrigger {
    /// Fire time (UTC); a past time fires once on registration
    pub at: DateTime<Utc>,
}

/// Event Bus trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventTrigger {
    /// Topic or glob pattern
    pub topic: String,
    /// Optional filter on the event payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<PayloadPredicate>,
}

impl EventTrigger {
    /// Topic as a bus pattern
    #[must_use]
    pub fn pattern(&self) -> TopicPattern {
        TopicPattern::new(&self.topic)
    }

    /// Whether an event payload should fire this trigger
    #[must_use]
    pub fn accepts(&self, payload: &Value) -> bool {
        self.predicate.as_ref().map_or(true, |p| p.matches(payload))
    }
}

/// Condition on a JSON payload: `payload[pointer] <op> value`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadPredicate {
    /// JSON pointer into the payload ("" is the whole payload)
    pub pointer: String,
    /// Comparison operator
    pub op: Comparison,
    /// Right-hand side (ignored by `exists`)
    #[serde(default)]
    pub value: Value,
}

impl PayloadPredicate {
    /// `payload[pointer] == value`
    pub fn equals(pointer: impl Into<String>, value: Value) -> Self {
        Self {
            pointer: pointer.into(),
            op: Comparison::Equal,
            value,
        }
    }

    /// Evaluate against `payload`
    #[must_use]
    pub fn matches(&self, payload: &Value) -> bool {
        let Some(actual) = payload.pointer(&self.pointer) else {
            return false;
        };
        self.op.check(actual, &self.value)
    }
}

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    /// Equal to value
    Equal,
    /// Not equal to value
    NotEqual,
    /// Numerically greater than value
    GreaterThan,
    /// Numerically less than value
    LessThan,
    /// Pointer resolves to anything
    Exists,
}

impl Comparison {
    /// Check if `actual` satisfies the comparison against `expected`
    #[must_use]
    pub fn check(&self, actual: &Value, expected: &Value) -> bool {
        match self {
            Comparison::Equal => actual == expected,
            Comparison::NotEqual => actual != expected,
            Comparison::GreaterThan => match (actual.as_f64(), expected.as_f64()) {
                (Some(a), Some(b)) => a > b,
                _ => false,
            },
            Comparison::LessThan => match (actual.as_f64(), expected.as_f64()) {
                (Some(a), Some(b)) => a < b,
                _ => false,
            },
            Comparison::Exists => true,
        }
    }
}
