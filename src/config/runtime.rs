//! # Supervisor runtime configuration.
//!
//! [`RuntimeConfig`] is used in two ways:
//! 1. **Chain creation**: `ChainSupervisor::builder(runtime)`
//! 2. **Process defaults**: every process-backed layer derives its
//!    [`ProcessConfig`] from [`RuntimeConfig::process_config`].
//!
//! ## Notes
//! All fields are public. Prefer the accessors over checking sentinels
//! (`0`) at call sites.

use std::path::PathBuf;
use std::time::Duration;

use crate::policies::RetryPolicy;

/// Settings for one supervised external process.
///
/// ## Field semantics
/// - `startup_grace`: how long a fresh process must survive before launch succeeds
/// - `retry`: relaunch budget and backoff after crashes
/// - `terminate_grace`: wait after the graceful signal before escalating
/// - `kill_timeout`: wait after the forced signal before giving up
/// - `health_interval`: `0s` disables health probing
#[derive(Clone, Debug)]
pub struct ProcessConfig {
    /// Roots that binaries, configs, logs and working dirs must stay inside.
    pub allowed_dirs: Vec<PathBuf>,
    /// Immediate-crash detection window.
    pub startup_grace: Duration,
    /// Relaunch budget.
    pub retry: RetryPolicy,
    /// Wait after SIGTERM.
    pub terminate_grace: Duration,
    /// Wait after SIGKILL.
    pub kill_timeout: Duration,
    /// Byte bound on the log tail captured for startup failures.
    pub log_tail_bytes: usize,
    /// Line bound on the same tail.
    pub log_tail_lines: usize,
    /// Sleep between log-file polls.
    pub log_poll_interval: Duration,
    /// Health probe period (`0s` = disabled).
    pub health_interval: Duration,
    /// Per-probe timeout.
    pub health_timeout: Duration,
    /// Consecutive failed probes before the process is killed and restarted.
    pub health_failure_threshold: u32,
}

impl Default for ProcessConfig {
    /// - `startup_grace = 500ms`
    /// - `retry = 5 retries, 1s doubling to 30s`
    /// - `terminate_grace = 3s`, `kill_timeout = 2s`
    /// - `log_tail = 4 KiB / 20 lines`, polled every 500ms
    /// - `health = every 15s, 2s timeout, 3 strikes`
    fn default() -> Self {
        Self {
            allowed_dirs: Vec::new(),
            startup_grace: Duration::from_millis(500),
            retry: RetryPolicy::default(),
            terminate_grace: Duration::from_secs(3),
            kill_timeout: Duration::from_secs(2),
            log_tail_bytes: 4096,
            log_tail_lines: 20,
            log_poll_interval: Duration::from_millis(500),
            health_interval: Duration::from_secs(15),
            health_timeout: Duration::from_secs(2),
            health_failure_threshold: 3,
        }
    }
}

impl ProcessConfig {
    /// Health probe period as an `Option` (`None` when disabled).
    #[inline]
    pub fn health_interval(&self) -> Option<Duration> {
        if self.health_interval.is_zero() {
            None
        } else {
            Some(self.health_interval)
        }
    }

    /// Failure threshold clamped to a minimum of 1.
    #[inline]
    pub fn health_threshold_clamped(&self) -> u32 {
        self.health_failure_threshold.max(1)
    }
}

/// Global configuration for one chain supervisor.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Directory for generated configs, logs and per-process HOME/TMPDIR.
    pub work_dir: PathBuf,
    /// Per-process defaults. `work_dir` is added to its allowed roots.
    pub process: ProcessConfig,
    /// Fastest monitor tick (clean ticks decay toward it).
    pub monitor_floor: Duration,
    /// Slowest monitor tick (failing ticks grow toward it).
    pub monitor_ceiling: Duration,
    /// Event bus ring size (min 1).
    pub bus_capacity: usize,
    /// Snapshots kept for late route-feed subscribers.
    pub route_replay: usize,
    /// Live route-feed channel size (min 1).
    pub route_feed_capacity: usize,
    /// Fixed wait between control-channel reconnect attempts.
    pub channel_reconnect: Duration,
    /// Upper bound on the routing engine's config dry run.
    pub dry_run_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir().join("chainvisor"),
            process: ProcessConfig::default(),
            monitor_floor: Duration::from_secs(1),
            monitor_ceiling: Duration::from_secs(10),
            bus_capacity: 1024,
            route_replay: 16,
            route_feed_capacity: 64,
            channel_reconnect: Duration::from_secs(1),
            dry_run_timeout: Duration::from_secs(10),
        }
    }
}

impl RuntimeConfig {
    /// Runtime rooted at `work_dir` with default tunables.
    pub fn with_work_dir(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            ..Self::default()
        }
    }

    /// Process settings with the work dir appended to the permitted roots.
    pub fn process_config(&self) -> ProcessConfig {
        let mut cfg = self.process.clone();
        if !cfg.allowed_dirs.contains(&self.work_dir) {
            cfg.allowed_dirs.push(self.work_dir.clone());
        }
        cfg
    }

    /// Bus capacity clamped to a minimum of 1.
    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }

    /// Monitor bounds with `floor <= ceiling` enforced.
    #[inline]
    pub fn monitor_bounds(&self) -> (Duration, Duration) {
        let floor = self.monitor_floor.max(Duration::from_millis(1));
        (floor, self.monitor_ceiling.max(floor))
    }
}
