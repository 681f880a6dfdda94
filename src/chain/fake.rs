//! Scriptable in-memory layer for chain tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::ChainConfig;
use crate::error::LayerError;
use crate::layers::{Endpoint, Layer, LayerContext, LayerHealth, LayerKind, LayerMetrics, SocketPair};

pub(crate) struct FakeLayer {
    kind: LayerKind,
    endpoint_port: u16,
    fds: Option<SocketPair>,
    start_error: Mutex<Option<fn() -> LayerError>>,
    stop_error: Mutex<Option<String>>,
    metrics_error: Mutex<Option<String>>,
    health_override: Mutex<Option<LayerHealth>>,
    metrics: Mutex<LayerMetrics>,
    running: Mutex<bool>,
    upstreams: Mutex<Vec<Option<Endpoint>>>,
    inits: AtomicU32,
    starts: AtomicU32,
    stops: AtomicU32,
    journal: Option<Arc<Mutex<Vec<String>>>>,
}

impl FakeLayer {
    pub(crate) fn new(kind: LayerKind) -> Arc<Self> {
        Arc::new(Self::build(kind, None))
    }

    /// Fake that appends `start:<name>` / `stop:<name>` to `journal`.
    pub(crate) fn journaled(kind: LayerKind, journal: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self::build(kind, Some(Arc::clone(journal))))
    }

    pub(crate) fn with_fds(kind: LayerKind, fds: SocketPair) -> Arc<Self> {
        Arc::new(Self {
            fds: Some(fds),
            ..Self::build(kind, None)
        })
    }

    fn build(kind: LayerKind, journal: Option<Arc<Mutex<Vec<String>>>>) -> Self {
        let endpoint_port = match kind {
            LayerKind::Relay => 10_800,
            LayerKind::Accelerator => 10_900,
            LayerKind::Shaper => 0,
            LayerKind::RoutingEngine => 11_000,
        };
        Self {
            kind,
            endpoint_port,
            fds: None,
            start_error: Mutex::new(None),
            stop_error: Mutex::new(None),
            metrics_error: Mutex::new(None),
            health_override: Mutex::new(None),
            metrics: Mutex::new(LayerMetrics::default()),
            running: Mutex::new(false),
            upstreams: Mutex::new(Vec::new()),
            inits: AtomicU32::new(0),
            starts: AtomicU32::new(0),
            stops: AtomicU32::new(0),
            journal,
        }
    }

    pub(crate) fn fail_start(&self, err: fn() -> LayerError) {
        *self.start_error.lock() = Some(err);
    }

    pub(crate) fn fail_stop(&self, msg: &str) {
        *self.stop_error.lock() = Some(msg.to_string());
    }

    pub(crate) fn fail_metrics(&self, msg: &str) {
        *self.metrics_error.lock() = Some(msg.to_string());
    }

    pub(crate) fn set_health(&self, health: LayerHealth) {
        *self.health_override.lock() = Some(health);
    }

    pub(crate) fn set_metrics(&self, m: LayerMetrics) {
        *self.metrics.lock() = m;
    }

    pub(crate) fn inits(&self) -> u32 {
        self.inits.load(Ordering::SeqCst)
    }

    pub(crate) fn starts(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    pub(crate) fn stops(&self) -> u32 {
        self.stops.load(Ordering::SeqCst)
    }

    pub(crate) fn is_running(&self) -> bool {
        *self.running.lock()
    }

    /// Upstream handed to the most recent `start`.
    pub(crate) fn last_upstream(&self) -> Option<Endpoint> {
        self.upstreams.lock().last().cloned().flatten()
    }

    fn note(&self, what: &str) {
        if let Some(j) = &self.journal {
            j.lock().push(format!("{what}:{}", self.kind.name()));
        }
    }
}

#[async_trait]
impl Layer for FakeLayer {
    fn kind(&self) -> LayerKind {
        self.kind
    }

    async fn init(&self, _ctx: &LayerContext) -> Result<(), LayerError> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn start(&self, _cfg: &ChainConfig, upstream: Option<Endpoint>) -> Result<(), LayerError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.upstreams.lock().push(upstream);
        self.note("start");
        if let Some(err) = *self.start_error.lock() {
            return Err(err());
        }
        *self.running.lock() = true;
        Ok(())
    }

    async fn stop(&self) -> Result<(), LayerError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.note("stop");
        *self.running.lock() = false;
        match self.stop_error.lock().clone() {
            Some(msg) => Err(LayerError::Unavailable(msg)),
            None => Ok(()),
        }
    }

    fn endpoint(&self) -> Option<Endpoint> {
        if !*self.running.lock() || self.endpoint_port == 0 {
            return None;
        }
        Some(Endpoint {
            fds: self.fds,
            ..Endpoint::local(self.endpoint_port)
        })
    }

    fn metrics(&self) -> Result<LayerMetrics, LayerError> {
        if let Some(msg) = self.metrics_error.lock().clone() {
            return Err(LayerError::Unavailable(msg));
        }
        Ok(*self.metrics.lock())
    }

    fn health(&self) -> LayerHealth {
        if let Some(h) = self.health_override.lock().clone() {
            return h;
        }
        if *self.running.lock() {
            LayerHealth::Running
        } else {
            LayerHealth::Stopped
        }
    }
}
