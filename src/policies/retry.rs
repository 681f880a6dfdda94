//! # Bounded retry budget for crashed processes.
//!
//! Unlike a general task restart policy, a tunnel backend is always expected
//! to run: every exit that was not requested is a crash. [`RetryPolicy`] only
//! decides how many of those we tolerate before declaring the layer failed.
//!
//! ```text
//! launch #1 ── exit ── retry 1 ── launch #2 ── exit ── ... ── retry N ── launch #N+1 ── exit ── give up
//! ```

use crate::policies::BackoffPolicy;

/// Retry budget plus the backoff applied between relaunches.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of relaunches after the initial launch.
    ///
    /// `0` disables restarts: the first crash is final.
    pub max_retries: u32,
    /// Delay schedule between relaunches.
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    /// `max_retries = 5` with the default doubling backoff.
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl RetryPolicy {
    /// Returns `true` if a process that has crashed `retry_count` times may be relaunched.
    #[inline]
    pub fn allows(&self, retry_count: u32) -> bool {
        retry_count <= self.max_retries
    }
}
