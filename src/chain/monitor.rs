//! # Periodic health and metrics sweep of a running chain.
//!
//! One [`ChainMonitor`] runs per successful start, under the chain token.
//! Each tick:
//! 1. refreshes uptime;
//! 2. reads every configured layer's metrics and sums them (saturating);
//! 3. folds each layer's health into its status entry;
//! 4. flips `Running` to `Degraded` when any layer reports `Failed`, and
//!    marks the chain critically down when that layer is critical.
//!
//! The sleep between ticks adapts: a clean tick halves it toward the floor,
//! a failing tick (some layer's metrics unreadable) doubles it toward the
//! ceiling and publishes [`EventKind::MonitorTickFailed`].

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio::select;
use tokio_util::sync::CancellationToken;

use crate::chain::state::{ChainState, StatusCell};
use crate::events::{Bus, Event, EventKind};
use crate::layers::{LayerHealth, LayerKind, LayerSet};

/// Next sleep after a tick.
pub(crate) fn next_interval(current: Duration, clean: bool, floor: Duration, ceiling: Duration) -> Duration {
    let next = if clean {
        current / 2
    } else {
        current.saturating_mul(2)
    };
    next.clamp(floor, ceiling)
}

pub(crate) struct ChainMonitor {
    layers: LayerSet,
    status: Arc<StatusCell>,
    bus: Bus,
    started: Instant,
    floor: Duration,
    ceiling: Duration,
}

impl ChainMonitor {
    pub(crate) fn new(
        layers: LayerSet,
        status: Arc<StatusCell>,
        bus: Bus,
        started: Instant,
        (floor, ceiling): (Duration, Duration),
    ) -> Self {
        Self {
            layers,
            status,
            bus,
            started,
            floor,
            ceiling,
        }
    }

    /// Ticks until `token` is cancelled.
    pub(crate) async fn run(self, token: CancellationToken) {
        let mut interval = self.floor;
        loop {
            let clean = match self.tick() {
                Ok(()) => true,
                Err(failures) => {
                    let reason = failures.join("; ");
                    tracing::warn!(%reason, "chain monitor tick failed");
                    let next = next_interval(interval, false, self.floor, self.ceiling);
                    self.bus.publish(
                        Event::new(EventKind::MonitorTickFailed)
                            .with_reason(reason)
                            .with_delay(next),
                    );
                    false
                }
            };
            interval = next_interval(interval, clean, self.floor, self.ceiling);

            select! {
                _ = tokio::time::sleep(interval) => {}
                _ = token.cancelled() => break,
            }
        }
    }

    /// One sweep. `Err` lists the layers whose metrics could not be read.
    pub(crate) fn tick(&self) -> Result<(), Vec<String>> {
        let mut failures = Vec::new();
        let mut degraded_by = None;
        let mut critical_by = None;

        self.status.update(|status| {
            if !status.state.is_serving() {
                return;
            }
            status.uptime = self.started.elapsed();

            let (mut up, mut down) = (0u64, 0u64);
            for (kind, layer) in self.layers.in_order() {
                let name = kind.name();
                let Some(entry) = status.layers.get_mut(name) else {
                    continue;
                };

                match layer.metrics() {
                    Ok(m) => {
                        up = up.saturating_add(m.bytes_up);
                        down = down.saturating_add(m.bytes_down);
                        entry.metrics = m;
                    }
                    Err(e) => failures.push(format!("{name}: {e}")),
                }

                let health = layer.health();
                let running = health.is_up();
                let changed = entry.is_running != running;
                entry.is_running = running;
                if let LayerHealth::Failed(msg) = &health {
                    if entry.last_error.as_deref() != Some(msg.as_str()) {
                        entry.last_error = Some(msg.clone());
                        entry.last_update = SystemTime::now();
                    }
                    if status.state == ChainState::Running {
                        degraded_by.get_or_insert(kind);
                    }
                    if kind.is_critical() && status.critical_down.is_none() {
                        status.critical_down = Some(name.to_string());
                        critical_by = Some(kind);
                    }
                } else if changed {
                    entry.last_update = SystemTime::now();
                }
            }
            status.cumulative_bytes_up = up;
            status.cumulative_bytes_down = down;

            if degraded_by.is_some() {
                status.state = ChainState::Degraded;
            }
        });

        if let Some(kind) = degraded_by {
            self.report_degraded(kind);
        }
        if let Some(kind) = critical_by {
            tracing::error!(layer = kind.name(), "critical layer failed; chain carries no traffic");
            self.bus.publish(
                Event::new(EventKind::ChainCriticalDown)
                    .with_layer(kind.name())
                    .with_reason("critical layer failed while running"),
            );
        }
        if failures.is_empty() { Ok(()) } else { Err(failures) }
    }

    fn report_degraded(&self, kind: LayerKind) {
        tracing::warn!(layer = kind.name(), "layer failed while running; chain degraded");
        self.bus.publish(
            Event::new(EventKind::ChainDegraded)
                .with_layer(kind.name())
                .with_reason("layer failed while running"),
        );
    }
}
