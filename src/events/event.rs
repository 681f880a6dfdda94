//! # Runtime events emitted by the chain, its processes and the routing store.
//!
//! The [`EventKind`] enum classifies event types across four categories:
//! - **Chain events**: aggregate state transitions
//! - **Layer events**: per-layer start/stop outcomes
//! - **Process events**: launches, exits, restarts, terminations
//! - **Channel events**: control-channel loss and recovery
//!
//! The [`Event`] struct carries optional metadata (layer name, reason, pid,
//! exit code, restart delay) depending on the kind.
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases
//! monotonically. Use it to restore order when events are delivered out of order.
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use chainvisor::{Event, EventKind};
//!
//! let ev = Event::new(EventKind::RestartScheduled)
//!     .with_layer("xray")
//!     .with_attempt(2)
//!     .with_delay(Duration::from_secs(2));
//!
//! assert_eq!(ev.kind, EventKind::RestartScheduled);
//! assert_eq!(ev.layer.as_deref(), Some("xray"));
//! assert_eq!(ev.delay_ms, Some(2000));
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, SystemTime};

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of runtime events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    // === Chain events ===
    /// Chain entered `Starting`.
    ChainStarting,
    /// Chain reached `Running` (every configured layer up).
    ChainRunning,
    /// Chain reached `Degraded`.
    ///
    /// Sets:
    /// - `reason`: which optional layers are down
    ChainDegraded,
    /// A critical layer failed while the chain was serving. The chain is
    /// `Degraded` but carries no traffic until restarted.
    ///
    /// Sets:
    /// - `layer`: the failed critical layer
    ChainCriticalDown,
    /// Chain start aborted (validation or critical layer failure).
    ///
    /// Sets:
    /// - `reason`: aggregate error message
    ChainStartFailed,
    /// Chain entered `Stopping`.
    ChainStopping,
    /// Chain reached `Stopped`.
    ChainStopped,
    /// A monitoring tick failed; the poll interval grows.
    ///
    /// Sets:
    /// - `reason`: failure message
    /// - `delay_ms`: next poll interval
    MonitorTickFailed,

    // === Layer events ===
    /// Layer start requested.
    ///
    /// Sets:
    /// - `layer`: layer name
    LayerStarting,
    /// Layer started.
    LayerStarted,
    /// Layer failed to start or stop.
    ///
    /// Sets:
    /// - `layer`: layer name
    /// - `reason`: error message
    LayerFailed,
    /// Layer stopped.
    LayerStopped,

    // === Process events ===
    /// External process spawned and survived the startup grace period.
    ///
    /// Sets:
    /// - `layer`: owning layer
    /// - `pid`: process id
    /// - `attempt`: launch number (1-based)
    ProcessLaunched,
    /// External process exited during its startup grace period.
    ///
    /// Sets:
    /// - `layer`, `exit_code`, `reason` (sanitized log tail)
    ProcessStartupFailed,
    /// External process exited without being asked to.
    ///
    /// Sets:
    /// - `layer`, `pid`, `exit_code`
    ProcessExited,
    /// Relaunch scheduled after a crash.
    ///
    /// Sets:
    /// - `layer`: owning layer
    /// - `attempt`: retry number (1-based)
    /// - `delay_ms`: backoff delay
    RestartScheduled,
    /// Retry budget spent; the process stays down.
    ///
    /// Sets:
    /// - `layer`, `attempt` (launches performed), `exit_code`
    RetriesExhausted,
    /// Health probe failed.
    ///
    /// Sets:
    /// - `layer`, `attempt` (consecutive failures), `reason`
    HealthCheckFailed,
    /// Graceful termination timed out; forced kill sent.
    TerminateEscalated,
    /// Pid-based termination refused (identity checks failed).
    ///
    /// Sets:
    /// - `layer`, `pid`, `reason`
    TerminateRefused,

    // === Channel events ===
    /// Control channel to the data plane was severed.
    ChannelLost,
    /// Control channel re-established and consumers re-registered.
    ChannelRestored,

    // === Subscriber events ===
    /// Subscriber panicked during event processing.
    ///
    /// Sets:
    /// - `layer`: subscriber name
    /// - `reason`: panic info
    SubscriberPanicked,
    /// Subscriber dropped an event (queue full or worker closed).
    SubscriberOverflow,
}

impl EventKind {
    /// Short stable label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            EventKind::ChainStarting => "chain-starting",
            EventKind::ChainRunning => "chain-running",
            EventKind::ChainDegraded => "chain-degraded",
            EventKind::ChainCriticalDown => "chain-critical-down",
            EventKind::ChainStartFailed => "chain-start-failed",
            EventKind::ChainStopping => "chain-stopping",
            EventKind::ChainStopped => "chain-stopped",
            EventKind::MonitorTickFailed => "monitor-tick-failed",
            EventKind::LayerStarting => "layer-starting",
            EventKind::LayerStarted => "layer-started",
            EventKind::LayerFailed => "layer-failed",
            EventKind::LayerStopped => "layer-stopped",
            EventKind::ProcessLaunched => "process-launched",
            EventKind::ProcessStartupFailed => "process-startup-failed",
            EventKind::ProcessExited => "process-exited",
            EventKind::RestartScheduled => "restart-scheduled",
            EventKind::RetriesExhausted => "retries-exhausted",
            EventKind::HealthCheckFailed => "health-check-failed",
            EventKind::TerminateEscalated => "terminate-escalated",
            EventKind::TerminateRefused => "terminate-refused",
            EventKind::ChannelLost => "channel-lost",
            EventKind::ChannelRestored => "channel-restored",
            EventKind::SubscriberPanicked => "subscriber-panicked",
            EventKind::SubscriberOverflow => "subscriber-overflow",
        }
    }
}

/// Runtime event with optional metadata.
#[derive(Clone, Debug)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// Event classification.
    pub kind: EventKind,
    /// Layer (or subscriber) name, if applicable.
    pub layer: Option<Arc<str>>,
    /// Human-readable reason (errors, log tails, overflow details).
    pub reason: Option<Arc<str>>,
    /// Attempt or retry count.
    pub attempt: Option<u32>,
    /// Delay in milliseconds (backoff, next poll interval).
    pub delay_ms: Option<u32>,
    /// OS process id.
    pub pid: Option<u32>,
    /// Process exit code; absent when the process was killed by a signal.
    pub exit_code: Option<i32>,
}

impl Event {
    /// Creates a new event of the given kind with current timestamp and next sequence number.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            layer: None,
            reason: None,
            attempt: None,
            delay_ms: None,
            pid: None,
            exit_code: None,
        }
    }

    /// Attaches a layer name.
    #[inline]
    pub fn with_layer(mut self, layer: impl Into<Arc<str>>) -> Self {
        self.layer = Some(layer.into());
        self
    }

    /// Attaches a human-readable reason.
    #[inline]
    pub fn with_reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attaches an attempt count.
    #[inline]
    pub fn with_attempt(mut self, n: u32) -> Self {
        self.attempt = Some(n);
        self
    }

    /// Attaches a delay (stored as milliseconds, saturating).
    #[inline]
    pub fn with_delay(mut self, d: Duration) -> Self {
        self.delay_ms = Some(d.as_millis().min(u128::from(u32::MAX)) as u32);
        self
    }

    /// Attaches a process id.
    #[inline]
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    /// Attaches an exit code when one is known.
    #[inline]
    pub fn with_exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }

    /// Creates a subscriber overflow event.
    #[inline]
    pub fn subscriber_overflow(subscriber: &'static str, reason: &'static str) -> Self {
        Event::new(EventKind::SubscriberOverflow)
            .with_layer(subscriber)
            .with_reason(format!("subscriber={subscriber} reason={reason}"))
    }

    /// Creates a subscriber panic event.
    #[inline]
    pub fn subscriber_panicked(subscriber: &'static str, info: String) -> Self {
        Event::new(EventKind::SubscriberPanicked)
            .with_layer(subscriber)
            .with_reason(info)
    }

    /// True for events emitted by the subscriber machinery itself.
    #[inline]
    pub fn is_subscriber_internal(&self) -> bool {
        matches!(
            self.kind,
            EventKind::SubscriberOverflow | EventKind::SubscriberPanicked
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_is_monotonic() {
        let a = Event::new(EventKind::LayerStarting);
        let b = Event::new(EventKind::LayerStarted);
        assert!(b.seq > a.seq);
    }

    #[test]
    fn delay_saturates() {
        let ev = Event::new(EventKind::RestartScheduled).with_delay(Duration::from_secs(u64::MAX / 2));
        assert_eq!(ev.delay_ms, Some(u32::MAX));
    }
}
