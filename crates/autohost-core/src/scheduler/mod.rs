//! Job scheduling
//!
//! Decides when, in what order and how many times a plugin's unit of work
//! runs:
//!
//! - **Cron triggers**: five or six field expressions
//! - **Interval triggers**: fixed period, drift-corrected from the scheduled time
//! - **One-shot triggers**: a single fire at a given time
//! - **Event triggers**: fire on an Event Bus topic, with an optional payload predicate
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐  due signals  ┌─────────────────┐
//! │  TriggerEngine  │──────────────▶│   JobExecutor   │  admission, workers,
//! └────────┬────────┘               └────────┬────────┘  timeout, retry
//!          │                                 │
//!          ▼                                 ▼
//! ┌─────────────────────────────────────────────────────┐
//! │                      JobStore                       │  SQLite persistence
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use autohost_core::scheduler::{work_fn, JobDefinition, JobRegistration, TriggerType};
//!
//! let job = JobDefinition::new("rotate_logs", "housekeeping", TriggerType::cron("0 3 * * *"))
//!     .with_timeout(Duration::from_secs(300));
//! let work = work_fn(|ctx| async move {
//!     rotate(&ctx.cancel).await?;
//!     Ok(serde_json::json!({ "rotated": true }))
//! });
//! host.register_job("housekeeping", JobRegistration::new(job, work)).await?;
//! ```

mod executor;
mod store;
mod trigger_engine;
mod triggers;
mod types;

pub use executor::JobExecutor;
pub use store::{JobStore, PluginRecord, StoreResult};
pub use trigger_engine::TriggerEngine;
pub use triggers::{
    Comparison, CronTrigger, EventTrigger, IntervalTrigger, OneShotTrigger, PayloadPredicate,
    TriggerType,
};
pub use types::{
    work_fn, DueSignal, DueSource, JobDefinition, JobOverride, JobRegistration, JobRun, JobStatus,
    RunOutcome, TriggerState, UnitOfWork, WorkContext, WorkFuture,
};
