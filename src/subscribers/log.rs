//! # LogWriter: renders events through `tracing`
//!
//! ## Example output
//! ```text
//! INFO  chainvisor::events: [layer-started] layer=reality
//! WARN  chainvisor::events: [process-exited] layer=xray pid=4242 code=Some(2)
//! INFO  chainvisor::events: [restart-scheduled] layer=xray attempt=1 delay_ms=1000
//! ERROR chainvisor::events: [retries-exhausted] layer=xray attempt=6
//! ```

use async_trait::async_trait;

use crate::events::{Event, EventKind};
use crate::subscribers::Subscribe;

/// Event writer subscriber.
#[derive(Default)]
pub struct LogWriter;

impl LogWriter {
    /// Construct a new [`LogWriter`].
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, e: &Event) {
        let label = e.kind.as_label();
        let layer = e.layer.as_deref().unwrap_or("-");
        let reason = e.reason.as_deref().unwrap_or("");
        match e.kind {
            EventKind::RetriesExhausted
            | EventKind::ChainStartFailed
            | EventKind::ChainCriticalDown
            | EventKind::TerminateRefused
            | EventKind::SubscriberPanicked => {
                tracing::error!(target: "chainvisor::events", "[{label}] layer={layer} attempt={:?} code={:?} {reason}", e.attempt, e.exit_code);
            }
            EventKind::ProcessExited
            | EventKind::ProcessStartupFailed
            | EventKind::LayerFailed
            | EventKind::ChainDegraded
            | EventKind::HealthCheckFailed
            | EventKind::TerminateEscalated
            | EventKind::MonitorTickFailed
            | EventKind::ChannelLost
            | EventKind::SubscriberOverflow => {
                tracing::warn!(target: "chainvisor::events", "[{label}] layer={layer} pid={:?} code={:?} {reason}", e.pid, e.exit_code);
            }
            EventKind::RestartScheduled => {
                tracing::info!(target: "chainvisor::events", "[{label}] layer={layer} attempt={:?} delay_ms={:?}", e.attempt, e.delay_ms);
            }
            EventKind::ProcessLaunched => {
                tracing::info!(target: "chainvisor::events", "[{label}] layer={layer} pid={:?} attempt={:?}", e.pid, e.attempt);
            }
            _ => {
                tracing::info!(target: "chainvisor::events", "[{label}] layer={layer} {reason}");
            }
        }
    }

    fn name(&self) -> &'static str {
        "LogWriter"
    }
}
