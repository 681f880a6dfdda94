//! Restart and backoff policies for supervised processes.
//!
//! This module groups the knobs that control **whether** a crashed process is
//! relaunched and **how long** to wait before doing so.
//!
//! ## Contents
//! - [`RetryPolicy`]   bounded retry budget (`max_retries`) plus backoff
//! - [`BackoffPolicy`] how restart delays grow (`base × factor^(attempt-1)`, capped)
//! - [`JitterPolicy`]  optional randomization of the delay
//!
//! ## Quick wiring
//! ```text
//! ProcessConfig { retry: RetryPolicy { max_retries, backoff } }
//!      └─► process::ProcessMonitor uses:
//!           - retry.allows(retry_count) to decide relaunch/give up
//!           - retry.backoff.next(retry_count) to schedule the relaunch
//! ```
//!
//! ## Defaults
//! - `max_retries = 5`
//! - `BackoffPolicy::default()` → base=1s, factor=2.0, max=30s, jitter=None.

mod backoff;
mod jitter;
mod retry;

pub use backoff::BackoffPolicy;
pub use jitter::JitterPolicy;
pub use retry::RetryPolicy;
