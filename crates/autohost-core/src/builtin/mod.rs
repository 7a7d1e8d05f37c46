//! Built-in plugins
//!
//! - housekeeping: run history retention and a periodic plugin health report

mod housekeeping;

pub use housekeeping::{Housekeeping, HEALTH_REPORT_JOB, HOUSEKEEPING_PLUGIN, RETENTION_JOB};
