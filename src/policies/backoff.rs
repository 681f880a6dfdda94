//! # Backoff policy for process restarts.
//!
//! [`BackoffPolicy`] controls how relaunch delays grow after repeated crashes.
//! It is parameterized by:
//! - [`BackoffPolicy::base`] the delay before the first relaunch;
//! - [`BackoffPolicy::factor`] the multiplicative growth factor;
//! - [`BackoffPolicy::max`] the maximum delay cap.
//!
//! The delay for restart attempt `n` (1-based) is `base × factor^(n-1)`, clamped
//! to `max`, then jitter is applied. The base delay is derived purely from the
//! attempt number, so jitter output never feeds back into later delays.
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use chainvisor::{BackoffPolicy, JitterPolicy};
//!
//! let backoff = BackoffPolicy {
//!     base: Duration::from_millis(500),
//!     max: Duration::from_secs(10),
//!     factor: 2.0,
//!     jitter: JitterPolicy::None,
//! };
//!
//! assert_eq!(backoff.next(1), Duration::from_millis(500));
//! assert_eq!(backoff.next(2), Duration::from_secs(1));
//! assert_eq!(backoff.next(3), Duration::from_secs(2));
//! // 500ms × 2^9 = 256s → capped
//! assert_eq!(backoff.next(10), Duration::from_secs(10));
//! ```

use std::time::Duration;

use crate::policies::jitter::JitterPolicy;

/// Restart backoff policy.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first relaunch.
    pub base: Duration,
    /// Maximum delay cap.
    pub max: Duration,
    /// Multiplicative growth factor (`2.0` gives the classic doubling).
    pub factor: f64,
    /// Randomization applied after clamping.
    pub jitter: JitterPolicy,
}

impl Default for BackoffPolicy {
    /// Returns a strategy with:
    /// - `base = 1s`;
    /// - `factor = 2.0` (doubling);
    /// - `max = 30s`.
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            factor: 2.0,
            jitter: JitterPolicy::None,
        }
    }
}

impl BackoffPolicy {
    /// Computes the delay before restart attempt `attempt` (1-based).
    ///
    /// `attempt = 0` is treated as `1`. Non-finite or negative intermediate
    /// values clamp to [`BackoffPolicy::max`].
    pub fn next(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let max_secs = self.max.as_secs_f64();
        let unclamped = self.base.as_secs_f64() * self.factor.powi(exp);

        let clamped = if !unclamped.is_finite() || unclamped < 0.0 || unclamped > max_secs {
            self.max
        } else {
            Duration::from_secs_f64(unclamped)
        };
        self.jitter.apply(clamped)
    }
}
