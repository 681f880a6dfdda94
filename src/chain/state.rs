//! # Chain status model and the cell that publishes it.
//!
//! [`StatusCell`] serializes writers behind a short mutex and hands every
//! committed version to readers as an `Arc<ChainStatus>` through a
//! [`watch`] channel. Readers never lock and never observe a half-applied
//! update.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::layers::LayerMetrics;

/// Aggregate lifecycle state of a chain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ChainState {
    /// Nothing running. Initial and terminal state.
    #[default]
    Stopped,
    /// Layers are being brought up.
    Starting,
    /// Every configured layer is up.
    Running,
    /// Critical layers are up, at least one optional layer is not.
    ///
    /// Also entered when a critical layer fails after start; that case is
    /// told apart by [`ChainStatus::critical_down`].
    Degraded,
    /// Layers are being torn down.
    Stopping,
}

impl ChainState {
    /// Stable lowercase label.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainState::Stopped => "stopped",
            ChainState::Starting => "starting",
            ChainState::Running => "running",
            ChainState::Degraded => "degraded",
            ChainState::Stopping => "stopping",
        }
    }

    /// `Running` or `Degraded`.
    pub fn is_serving(&self) -> bool {
        matches!(self, ChainState::Running | ChainState::Degraded)
    }
}

impl fmt::Display for ChainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one layer as last observed by the chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayerStatus {
    /// Layer name (`reality`, `hysteria2`, `pepper`, `xray`).
    pub name: String,
    /// Whether the layer currently serves traffic.
    pub is_running: bool,
    /// Most recent failure, kept until the next start of the chain.
    pub last_error: Option<String>,
    /// Last time this entry changed.
    pub last_update: SystemTime,
    /// Byte counters reported by the layer on the last monitor tick.
    pub metrics: LayerMetrics,
}

impl LayerStatus {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            is_running: false,
            last_error: None,
            last_update: SystemTime::now(),
            metrics: LayerMetrics::default(),
        }
    }
}

/// Point-in-time view of a chain.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChainStatus {
    /// Aggregate state.
    pub state: ChainState,
    /// Per-layer status keyed by layer name; only configured layers appear.
    pub layers: BTreeMap<String, LayerStatus>,
    /// Time since the last successful start; zero while stopped.
    pub uptime: Duration,
    /// Sum of `bytes_up` over all layers.
    pub cumulative_bytes_up: u64,
    /// Sum of `bytes_down` over all layers.
    pub cumulative_bytes_down: u64,
    /// First critical layer seen `Failed` since the last start. While set the
    /// chain does not carry traffic whatever `state` says.
    pub critical_down: Option<String>,
}

impl ChainStatus {
    /// Serving with every critical layer up.
    pub fn is_functional(&self) -> bool {
        self.state.is_serving() && self.critical_down.is_none()
    }

    /// Status of the layer named `name`.
    pub fn layer(&self, name: &str) -> Option<&LayerStatus> {
        self.layers.get(name)
    }

    pub(crate) fn layer_mut(&mut self, name: &str) -> &mut LayerStatus {
        self.layers
            .entry(name.to_string())
            .or_insert_with(|| LayerStatus::new(name))
    }
}

/// Single-writer, many-reader holder of the current [`ChainStatus`].
pub(crate) struct StatusCell {
    current: Mutex<ChainStatus>,
    tx: watch::Sender<Arc<ChainStatus>>,
}

impl StatusCell {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(ChainStatus::default()));
        Self {
            current: Mutex::new(ChainStatus::default()),
            tx,
        }
    }

    /// Latest published status.
    pub(crate) fn snapshot(&self) -> Arc<ChainStatus> {
        Arc::clone(&self.tx.borrow())
    }

    pub(crate) fn state(&self) -> ChainState {
        self.tx.borrow().state
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Arc<ChainStatus>> {
        self.tx.subscribe()
    }

    /// Applies `f` and publishes the result.
    ///
    /// Publishing happens under the writer lock so versions reach readers in
    /// commit order.
    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut ChainStatus) -> R) -> R {
        let mut current = self.current.lock();
        let out = f(&mut current);
        self.tx.send_replace(Arc::new(current.clone()));
        out
    }

    pub(crate) fn set_state(&self, state: ChainState) {
        self.update(|s| s.state = state);
    }

    /// Records a layer outcome.
    pub(crate) fn set_layer(&self, name: &str, is_running: bool, error: Option<String>) {
        self.update(|s| {
            let layer = s.layer_mut(name);
            layer.is_running = is_running;
            if error.is_some() {
                layer.last_error = error;
            }
            layer.last_update = SystemTime::now();
        });
    }
}
