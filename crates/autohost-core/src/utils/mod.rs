//! Utility modules for autohost-core
//!
//! - retry: exponential backoff shared by job retries, deferrals and plugin restarts

mod retry;

pub use retry::{retry_with_backoff, RetryError, RetryPolicy};
