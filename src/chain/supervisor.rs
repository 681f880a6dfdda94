//! # ChainSupervisor: brings a layered chain up, watches it, tears it down.
//!
//! The supervisor owns the event bus, the [`SubscriberSet`], the shared
//! [`RouteStore`] and one adapter per stage. `start`/`stop` are serialized
//! through one async lock; status reads go through the [`StatusCell`] and
//! never wait on them.
//!
//! ## High-level architecture
//! ```text
//! start(ChainConfig)
//!   validate ──errors──► ChainStartFailed, Err(ConfigValidation)
//!      │
//!      ▼  state = Starting, layer.init(ctx) for every adapter
//!   reality ──endpoint──► hysteria2 ──endpoint──┐
//!      │                     │                  ▼
//!      │                     └──fds──► pepper  (best effort)
//!      └──────(no accelerator)──────────────► xray ◄── RouteStore
//!      │
//!      ├─ critical failure ─► stop started layers in reverse, state = Stopped, Err(LayerStart)
//!      ├─ optional failure ─► state = Degraded
//!      └─ all up ───────────► state = Running
//!                                   └─► ChainMonitor::run(chain_token)
//!
//! Event flow:
//!   layers / processes / monitor / channel watcher ── publish ──► Bus
//!        └──► event listener ──► SubscriberSet::emit(&Event) ──► per-subscriber queues
//!
//! Shutdown path:
//!   shutdown() ─► stop() ─► root_token.cancel()
//!                            ├─► event listener exits
//!                            ├─► channel watcher exits
//!                            └─► any process monitor still alive exits
//! ```
//!
//! ## Example
//! ```rust,no_run
//! use chainvisor::{ChainConfig, ChainSupervisor, RoutingEngineConfig, RuntimeConfig};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let sup = ChainSupervisor::builder(RuntimeConfig::with_work_dir("/data/chain")).build();
//!
//!     let cfg = ChainConfig {
//!         name: "home".into(),
//!         routing_engine: Some(RoutingEngineConfig {
//!             binary: "/data/bin/xray".into(),
//!             config_path: "/data/chain/xray.json".into(),
//!         }),
//!         ..ChainConfig::default()
//!     };
//!     sup.start(cfg).await?;
//!     println!("{}", sup.status().state);
//!     sup.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::chain::builder::ChainBuilder;
use crate::chain::monitor::ChainMonitor;
use crate::chain::state::{ChainState, ChainStatus, StatusCell};
use crate::config::{ChainConfig, RuntimeConfig};
use crate::error::{ChainError, LayerError};
use crate::events::{Bus, Event, EventKind};
use crate::layers::{Endpoint, LayerContext, LayerKind, LayerSet};
use crate::routing::{RouteDecision, RouteQuery, RouteStore};
use crate::subscribers::SubscriberSet;

/// Per-start bookkeeping, guarded by the lifecycle lock.
#[derive(Default)]
struct Session {
    token: Option<CancellationToken>,
    monitor: Option<JoinHandle<()>>,
}

/// Orchestrates one layered chain.
pub struct ChainSupervisor {
    runtime: RuntimeConfig,
    layers: LayerSet,
    store: Arc<RouteStore>,
    ctx: LayerContext,
    bus: Bus,
    status: Arc<StatusCell>,
    session: tokio::sync::Mutex<Session>,
    root: CancellationToken,
    background: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl ChainSupervisor {
    /// Builder for a supervisor using `runtime`.
    pub fn builder(runtime: RuntimeConfig) -> ChainBuilder {
        ChainBuilder::new(runtime)
    }

    pub(crate) fn new_internal(
        runtime: RuntimeConfig,
        layers: LayerSet,
        store: Arc<RouteStore>,
        ctx: LayerContext,
        root: CancellationToken,
    ) -> Self {
        Self {
            bus: ctx.bus.clone(),
            runtime,
            layers,
            store,
            ctx,
            status: Arc::new(StatusCell::new()),
            session: tokio::sync::Mutex::new(Session::default()),
            root,
            background: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Forwards bus events to the subscribers until shutdown.
    pub(crate) fn spawn_event_listener(&self, set: Arc<SubscriberSet>) {
        let mut rx = self.bus.subscribe();
        let token = self.root.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    ev = rx.recv() => match ev {
                        Ok(ev) => set.emit(&ev),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::debug!(skipped = n, "event listener lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = token.cancelled() => break,
                }
            }
            // Drain what was published before cancellation.
            while let Ok(ev) = rx.try_recv() {
                set.emit(&ev);
            }
            if let Some(set) = Arc::into_inner(set) {
                set.shutdown().await;
            }
        });
        self.background.lock().push(handle);
    }

    pub(crate) fn spawn_background(&self, handle: JoinHandle<()>) {
        self.background.lock().push(handle);
    }

    pub(crate) fn root_token(&self) -> &CancellationToken {
        &self.root
    }

    /// Starts the chain described by `cfg`.
    ///
    /// Fails with [`ChainError::AlreadyRunning`] unless the chain is
    /// `Stopped`. Optional-layer failures do not fail the call; they leave
    /// the chain `Degraded`.
    pub async fn start(&self, cfg: ChainConfig) -> Result<(), ChainError> {
        let mut session = self.session.lock().await;
        if self.root.is_cancelled() {
            return Err(ChainError::ShutDown);
        }
        if self.status.state() != ChainState::Stopped {
            return Err(ChainError::AlreadyRunning);
        }

        let chain = cfg.display_name().to_string();
        let report = cfg.validate();
        for w in &report.warnings {
            tracing::warn!(chain = %chain, warning = %w, "chain config warning");
        }
        if !report.is_ok() {
            let err = ChainError::ConfigValidation {
                errors: report.errors,
            };
            tracing::error!(chain = %chain, error = %err, "chain config rejected");
            self.bus
                .publish(Event::new(EventKind::ChainStartFailed).with_reason(err.as_message()));
            return Err(err);
        }

        self.status.update(|s| {
            s.state = ChainState::Starting;
            s.uptime = Duration::ZERO;
            s.cumulative_bytes_up = 0;
            s.cumulative_bytes_down = 0;
            s.layers.clear();
            s.critical_down = None;
            for kind in LayerKind::ORDER.into_iter().filter(|k| k.is_configured(&cfg)) {
                s.layer_mut(kind.name());
            }
        });
        tracing::info!(chain = %chain, "chain starting");
        self.bus.publish(Event::new(EventKind::ChainStarting).with_reason(chain.clone()));

        let degraded = match self.start_layers(&cfg).await {
            Ok(degraded) => degraded,
            Err(err) => {
                self.status.update(|s| {
                    s.state = ChainState::Stopped;
                    s.uptime = Duration::ZERO;
                });
                tracing::error!(chain = %chain, error = %err, "chain start failed");
                self.bus
                    .publish(Event::new(EventKind::ChainStartFailed).with_reason(err.as_message()));
                return Err(err);
            }
        };

        let started = Instant::now();
        let (state, kind) = if degraded {
            (ChainState::Degraded, EventKind::ChainDegraded)
        } else {
            (ChainState::Running, EventKind::ChainRunning)
        };
        self.status.set_state(state);
        tracing::info!(chain = %chain, state = %state, "chain up");
        self.bus.publish(Event::new(kind).with_reason(chain));

        let token = self.root.child_token();
        let monitor = ChainMonitor::new(
            self.layers.clone(),
            Arc::clone(&self.status),
            self.bus.clone(),
            started,
            self.runtime.monitor_bounds(),
        );
        session.monitor = Some(tokio::spawn(monitor.run(token.clone())));
        session.token = Some(token);
        Ok(())
    }

    /// Runs every configured stage in order. `Ok(true)` when an optional
    /// stage failed.
    async fn start_layers(&self, cfg: &ChainConfig) -> Result<bool, ChainError> {
        for (_, layer) in self.layers.in_order() {
            if let Err(e) = layer.init(&self.ctx).await {
                tracing::warn!(layer = layer.kind().name(), error = %e, "layer init failed");
            }
        }

        let mut started: Vec<LayerKind> = Vec::new();
        let mut degraded = false;

        for kind in LayerKind::ORDER {
            if !kind.is_configured(cfg) {
                continue;
            }
            let name = kind.name();
            let critical = self.layers.get(kind).map_or(kind.is_critical(), |l| l.is_critical());

            self.bus.publish(Event::new(EventKind::LayerStarting).with_layer(name));
            let outcome = match self.layers.get(kind) {
                Some(layer) => layer.start(cfg, self.upstream_for(kind)).await,
                None => Err(LayerError::Unavailable(format!("{name}: no adapter installed"))),
            };

            match outcome {
                Ok(()) => {
                    started.push(kind);
                    self.status.set_layer(name, true, None);
                    tracing::info!(layer = name, "layer started");
                    self.bus.publish(Event::new(EventKind::LayerStarted).with_layer(name));
                }
                Err(e) => {
                    self.status.set_layer(name, false, Some(e.as_message()));
                    self.bus.publish(
                        Event::new(EventKind::LayerFailed)
                            .with_layer(name)
                            .with_reason(e.as_message()),
                    );
                    if critical {
                        tracing::error!(layer = name, error = %e, "critical layer failed, rolling back");
                        self.stop_layers(started.iter().rev().copied()).await;
                        return Err(ChainError::LayerStart {
                            layer: name.to_string(),
                            cause: e,
                        });
                    }
                    tracing::warn!(layer = name, error = %e, "optional layer failed, chain degraded");
                    degraded = true;
                }
            }
        }
        Ok(degraded)
    }

    /// Endpoint the stage `kind` chains through.
    fn upstream_for(&self, kind: LayerKind) -> Option<Endpoint> {
        let endpoint = |k: LayerKind| self.layers.get(k).and_then(|l| l.endpoint());
        match kind {
            LayerKind::Relay => None,
            LayerKind::Accelerator => endpoint(LayerKind::Relay),
            LayerKind::Shaper => [LayerKind::Accelerator, LayerKind::Relay]
                .into_iter()
                .filter_map(endpoint)
                .find(|e| e.fds.is_some()),
            LayerKind::RoutingEngine => {
                endpoint(LayerKind::Accelerator).or_else(|| endpoint(LayerKind::Relay))
            }
        }
    }

    /// Stops `kinds` in the given order. Returns one entry per failure.
    async fn stop_layers(&self, kinds: impl Iterator<Item = LayerKind>) -> Vec<String> {
        let mut failures = Vec::new();
        for kind in kinds {
            let Some(layer) = self.layers.get(kind) else {
                continue;
            };
            let name = kind.name();
            match layer.stop().await {
                Ok(()) => {
                    self.status.set_layer(name, false, None);
                    self.bus.publish(Event::new(EventKind::LayerStopped).with_layer(name));
                }
                Err(e) => {
                    tracing::warn!(layer = name, error = %e, "layer stop failed");
                    self.status.set_layer(name, false, Some(e.as_message()));
                    self.bus.publish(
                        Event::new(EventKind::LayerFailed)
                            .with_layer(name)
                            .with_reason(e.as_message()),
                    );
                    failures.push(format!("{name}: {}", e.as_message()));
                }
            }
        }
        failures
    }

    /// Stops the chain. A no-op when already `Stopped`.
    ///
    /// Every layer is asked to stop even if an earlier one fails; the chain
    /// ends `Stopped` either way and the failures come back as
    /// [`ChainError::StopIncomplete`].
    pub async fn stop(&self) -> Result<(), ChainError> {
        let mut session = self.session.lock().await;
        if self.status.state() == ChainState::Stopped {
            return Ok(());
        }

        self.status.set_state(ChainState::Stopping);
        tracing::info!("chain stopping");
        self.bus.publish(Event::new(EventKind::ChainStopping));

        if let Some(token) = session.token.take() {
            token.cancel();
        }
        if let Some(monitor) = session.monitor.take() {
            let _ = monitor.await;
        }

        let configured: Vec<LayerKind> = {
            let status = self.status.snapshot();
            LayerKind::ORDER
                .into_iter()
                .rev()
                .filter(|k| status.layers.contains_key(k.name()))
                .collect()
        };
        let failures = self.stop_layers(configured.into_iter()).await;

        self.status.update(|s| {
            s.state = ChainState::Stopped;
            s.uptime = Duration::ZERO;
        });
        tracing::info!(failures = failures.len(), "chain stopped");
        self.bus.publish(Event::new(EventKind::ChainStopped));

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ChainError::StopIncomplete { failures })
        }
    }

    /// `stop()` followed by `start(cfg)`.
    pub async fn restart(&self, cfg: ChainConfig) -> Result<(), ChainError> {
        if let Err(e) = self.stop().await {
            tracing::warn!(error = %e, "restart: previous chain did not stop cleanly");
        }
        self.start(cfg).await
    }

    /// Latest status snapshot.
    pub fn status(&self) -> Arc<ChainStatus> {
        self.status.snapshot()
    }

    /// Receiver that observes every status change.
    pub fn subscribe_status(&self) -> watch::Receiver<Arc<ChainStatus>> {
        self.status.subscribe()
    }

    /// Receiver for runtime events published after this call.
    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }

    /// Routing state shared with the routing engine.
    pub fn route_store(&self) -> &Arc<RouteStore> {
        &self.store
    }

    /// Resolves `query` against the current routing table.
    pub fn route(&self, query: &RouteQuery) -> RouteDecision {
        self.store.resolve(query)
    }

    /// Stops the chain and every background task. Idempotent.
    ///
    /// Queued events are delivered to subscribers before this returns.
    pub async fn shutdown(&self) {
        if let Err(e) = self.stop().await {
            tracing::warn!(error = %e, "shutdown: chain did not stop cleanly");
        }
        self.root.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.background.lock());
        for h in handles {
            let _ = h.await;
        }
    }
}

impl Drop for ChainSupervisor {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use crate::chain::fake::FakeLayer;
    use crate::config::{AcceleratorConfig, RelayConfig, RoutingEngineConfig, ShaperConfig};
    use crate::layers::{LayerHealth, LayerMetrics, SocketPair};

    fn relay_block() -> RelayConfig {
        RelayConfig {
            binary: "/opt/chain/reality".into(),
            server: "relay.example.net".into(),
            port: 443,
            uuid: "b831381d-6324-4d53-ad4f-8cda48b30811".into(),
            server_name: String::new(),
            public_key: "Z84J2IelR9ch3k8VtlVhhs5ycBUlXA7wHBWcBrjqnAw".into(),
            short_id: "6ba85179e30d4fc2".into(),
            fingerprint: "chrome".into(),
            local_port: 10_800,
        }
    }

    fn accelerator_block() -> AcceleratorConfig {
        AcceleratorConfig {
            binary: None,
            server: "quic.example.net".into(),
            port: 8443,
            auth: "hunter2".into(),
            obfs_password: None,
            up_mbps: 0,
            down_mbps: 0,
            local_port: 10_900,
        }
    }

    fn engine_block() -> RoutingEngineConfig {
        RoutingEngineConfig {
            binary: "/opt/chain/xray".into(),
            config_path: "/opt/chain/xray.json".into(),
        }
    }

    fn shaper_block() -> ShaperConfig {
        ShaperConfig {
            mode: Default::default(),
            target_rate_bps: 8_000_000,
            max_burst_bytes: 64 * 1024,
            loss_aware_backoff: true,
            enable_pacing: true,
            min_pacing_interval_us: 0,
        }
    }

    fn full_config() -> ChainConfig {
        ChainConfig {
            name: "test".into(),
            relay: Some(relay_block()),
            accelerator: Some(accelerator_block()),
            shaper: None,
            routing_engine: Some(engine_block()),
            ..ChainConfig::default()
        }
    }

    struct Fixture {
        sup: Arc<ChainSupervisor>,
        relay: Arc<FakeLayer>,
        accelerator: Arc<FakeLayer>,
        shaper: Arc<FakeLayer>,
        engine: Arc<FakeLayer>,
        _dir: tempfile::TempDir,
    }

    fn runtime(dir: &Path) -> RuntimeConfig {
        RuntimeConfig {
            monitor_floor: Duration::from_millis(10),
            monitor_ceiling: Duration::from_millis(50),
            ..RuntimeConfig::with_work_dir(dir.join("work"))
        }
    }

    fn fixture_with(shaper: Arc<FakeLayer>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let relay = FakeLayer::new(LayerKind::Relay);
        let accelerator = FakeLayer::new(LayerKind::Accelerator);
        let engine = FakeLayer::new(LayerKind::RoutingEngine);
        let layers = LayerSet::default()
            .with(relay.clone())
            .with(accelerator.clone())
            .with(shaper.clone())
            .with(engine.clone());
        let sup = ChainSupervisor::builder(runtime(dir.path()))
            .with_layers(layers)
            .build();
        Fixture {
            sup,
            relay,
            accelerator,
            shaper,
            engine,
            _dir: dir,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(FakeLayer::new(LayerKind::Shaper))
    }

    #[tokio::test]
    async fn full_chain_runs() {
        let f = fixture();
        f.sup.start(full_config()).await.unwrap();

        let s = f.sup.status();
        assert_eq!(s.state, ChainState::Running);
        assert_eq!(
            s.layers.keys().map(String::as_str).collect::<Vec<_>>(),
            ["hysteria2", "reality", "xray"]
        );
        assert!(s.layers.values().all(|l| l.is_running && l.last_error.is_none()));
        assert_eq!(f.shaper.starts(), 0);
        assert_eq!(f.relay.inits(), 1);

        assert_eq!(f.accelerator.last_upstream().unwrap().addr.port(), 10_800);
        assert_eq!(f.engine.last_upstream().unwrap().addr.port(), 10_900);

        f.sup.shutdown().await;
    }

    #[tokio::test]
    async fn second_start_is_refused_without_duplicates() {
        let f = fixture();
        f.sup.start(full_config()).await.unwrap();
        let again = f.sup.start(full_config()).await;
        assert!(matches!(again, Err(ChainError::AlreadyRunning)));
        assert_eq!(f.relay.starts(), 1);
        assert_eq!(f.engine.starts(), 1);
        assert_eq!(f.sup.status().state, ChainState::Running);
        f.sup.shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_starts_run_one_chain() {
        let f = fixture();
        let (a, b) = tokio::join!(f.sup.start(full_config()), f.sup.start(full_config()));
        assert!(a.is_ok() ^ b.is_ok());
        assert!(matches!(a.err().or(b.err()), Some(ChainError::AlreadyRunning)));
        assert_eq!(f.relay.starts(), 1);
        f.sup.shutdown().await;
    }

    #[tokio::test]
    async fn relay_bind_failure_aborts_before_accelerator() {
        let f = fixture();
        f.relay.fail_start(|| LayerError::Bind {
            port: 10_800,
            error: "address in use".into(),
        });

        let err = f.sup.start(full_config()).await.unwrap_err();
        match err {
            ChainError::LayerStart { layer, cause } => {
                assert_eq!(layer, "reality");
                assert!(matches!(cause, LayerError::Bind { port: 10_800, .. }));
            }
            other => panic!("unexpected: {other:?}"),
        }

        let s = f.sup.status();
        assert_eq!(s.state, ChainState::Stopped);
        assert!(!s.layers["reality"].is_running);
        assert!(s.layers["reality"].last_error.as_deref().unwrap().contains("address in use"));
        assert_eq!(f.accelerator.starts(), 0);
        assert_eq!(f.engine.starts(), 0);
        assert_eq!(s.uptime, Duration::ZERO);
    }

    #[tokio::test]
    async fn engine_failure_rolls_back_in_reverse() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let engine = FakeLayer::journaled(LayerKind::RoutingEngine, &journal);
        engine.fail_start(|| LayerError::DryRunFailed {
            output: "invalid outbound".into(),
        });
        let layers = LayerSet::default()
            .with(FakeLayer::journaled(LayerKind::Relay, &journal))
            .with(FakeLayer::journaled(LayerKind::Accelerator, &journal))
            .with(engine);
        let sup = ChainSupervisor::builder(runtime(dir.path())).with_layers(layers).build();

        let err = sup.start(full_config()).await.unwrap_err();
        assert!(matches!(err, ChainError::LayerStart { ref layer, .. } if layer == "xray"));
        assert_eq!(
            *journal.lock(),
            [
                "start:reality",
                "start:hysteria2",
                "start:xray",
                "stop:hysteria2",
                "stop:reality",
            ]
        );
        let s = sup.status();
        assert_eq!(s.state, ChainState::Stopped);
        assert!(s.layers.values().all(|l| !l.is_running));
        assert_eq!(s.layers["xray"].last_error.as_deref(), Some("config dry-run failed: invalid outbound"));
    }

    #[tokio::test]
    async fn optional_failure_degrades() {
        let f = fixture();
        f.accelerator.fail_start(|| LayerError::Unavailable("quic blocked".into()));

        f.sup.start(full_config()).await.unwrap();
        let s = f.sup.status();
        assert_eq!(s.state, ChainState::Degraded);
        assert!(!s.layers["hysteria2"].is_running);
        assert!(s.layers["reality"].is_running);
        assert!(s.layers["xray"].is_running);
        // Engine falls back to the relay.
        assert_eq!(f.engine.last_upstream().unwrap().addr.port(), 10_800);
        f.sup.shutdown().await;
    }

    #[tokio::test]
    async fn validation_errors_start_nothing() {
        let f = fixture();
        let mut events = f.sup.subscribe_events();
        let err = f.sup.start(ChainConfig::default()).await.unwrap_err();
        assert!(matches!(err, ChainError::ConfigValidation { ref errors } if !errors.is_empty()));
        assert_eq!(f.relay.starts() + f.engine.starts(), 0);
        assert_eq!(f.sup.status().state, ChainState::Stopped);
        assert_eq!(events.recv().await.unwrap().kind, EventKind::ChainStartFailed);
    }

    #[tokio::test]
    async fn missing_adapter_for_critical_stage_fails() {
        let dir = tempfile::tempdir().unwrap();
        let relay = FakeLayer::new(LayerKind::Relay);
        let sup = ChainSupervisor::builder(runtime(dir.path()))
            .with_layers(LayerSet::default().with(relay.clone()))
            .build();
        let err = sup.start(full_config()).await.unwrap_err();
        assert!(matches!(
            err,
            ChainError::LayerStart { ref layer, cause: LayerError::Unavailable(_) } if layer == "xray"
        ));
        assert!(!relay.is_running());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let f = fixture();
        f.sup.stop().await.unwrap();
        f.sup.start(full_config()).await.unwrap();
        f.sup.stop().await.unwrap();
        f.sup.stop().await.unwrap();

        let s = f.sup.status();
        assert_eq!(s.state, ChainState::Stopped);
        assert_eq!(s.uptime, Duration::ZERO);
        assert!(s.layers.values().all(|l| !l.is_running));
        assert_eq!(f.relay.stops(), 1);
        assert_eq!(f.engine.stops(), 1);
    }

    #[tokio::test]
    async fn stop_collects_failures_and_still_stops() {
        let f = fixture();
        f.sup.start(full_config()).await.unwrap();
        f.accelerator.fail_stop("process survived SIGKILL");

        let err = f.sup.stop().await.unwrap_err();
        match err {
            ChainError::StopIncomplete { failures } => {
                assert_eq!(failures.len(), 1);
                assert!(failures[0].starts_with("hysteria2:"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(f.relay.stops(), 1);
        assert_eq!(f.engine.stops(), 1);
        assert_eq!(f.sup.status().state, ChainState::Stopped);
    }

    #[tokio::test]
    async fn restart_cycles_layers() {
        let f = fixture();
        f.sup.start(full_config()).await.unwrap();
        f.sup.restart(full_config()).await.unwrap();
        assert_eq!(f.relay.starts(), 2);
        assert_eq!(f.relay.stops(), 1);
        assert_eq!(f.sup.status().state, ChainState::Running);
        f.sup.shutdown().await;
    }

    #[tokio::test]
    async fn restart_after_failure_clears_errors() {
        let f = fixture();
        f.accelerator.fail_start(|| LayerError::Unavailable("quic blocked".into()));
        f.sup.start(full_config()).await.unwrap();
        assert_eq!(f.sup.status().state, ChainState::Degraded);

        let mut cfg = full_config();
        cfg.accelerator = None;
        f.sup.restart(cfg).await.unwrap();
        let s = f.sup.status();
        assert_eq!(s.state, ChainState::Running);
        assert!(!s.layers.contains_key("hysteria2"));
        f.sup.shutdown().await;
    }

    #[tokio::test]
    async fn shaper_attaches_to_descriptor_endpoint() {
        let shaper = FakeLayer::new(LayerKind::Shaper);
        let dir = tempfile::tempdir().unwrap();
        let fds = SocketPair { read_fd: 7, write_fd: 8 };
        let layers = LayerSet::default()
            .with(FakeLayer::with_fds(LayerKind::Relay, fds))
            .with(FakeLayer::new(LayerKind::Accelerator))
            .with(shaper.clone())
            .with(FakeLayer::new(LayerKind::RoutingEngine));
        let sup = ChainSupervisor::builder(runtime(dir.path())).with_layers(layers).build();

        let cfg = ChainConfig {
            shaper: Some(shaper_block()),
            ..full_config()
        };
        sup.start(cfg).await.unwrap();
        let up = shaper.last_upstream().unwrap();
        assert_eq!(up.addr.port(), 10_800);
        assert_eq!(up.fds, Some(fds));
        assert!(sup.status().layers["pepper"].is_running);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn shaper_without_descriptors_gets_no_upstream() {
        let f = fixture();
        let cfg = ChainConfig {
            shaper: Some(shaper_block()),
            ..full_config()
        };
        f.sup.start(cfg).await.unwrap();
        assert_eq!(f.shaper.starts(), 1);
        assert!(f.shaper.last_upstream().is_none());
        f.sup.shutdown().await;
    }

    #[tokio::test]
    async fn monitor_sums_metrics_into_status() {
        let f = fixture();
        f.relay.set_metrics(LayerMetrics { bytes_up: 100, bytes_down: 200 });
        f.engine.set_metrics(LayerMetrics { bytes_up: 50, bytes_down: 25 });

        let mut rx = f.sup.subscribe_status();
        f.sup.start(full_config()).await.unwrap();
        let s = rx
            .wait_for(|s| s.cumulative_bytes_up == 150)
            .await
            .unwrap()
            .clone();
        assert_eq!(s.cumulative_bytes_down, 225);
        f.sup.shutdown().await;
    }

    #[tokio::test]
    async fn monitor_degrades_on_failed_layer() {
        let f = fixture();
        let mut rx = f.sup.subscribe_status();
        f.sup.start(full_config()).await.unwrap();
        f.accelerator.set_health(LayerHealth::Failed("crashed 5 times".into()));

        let s = tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| s.state == ChainState::Degraded),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        assert_eq!(s.layers["hysteria2"].last_error.as_deref(), Some("crashed 5 times"));
        f.sup.shutdown().await;
    }

    #[tokio::test]
    async fn events_trace_the_lifecycle() {
        let f = fixture();
        let mut events = f.sup.subscribe_events();
        f.sup.start(full_config()).await.unwrap();
        f.sup.stop().await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(ev) = events.try_recv() {
            kinds.push(ev.kind);
        }
        assert_eq!(kinds.first(), Some(&EventKind::ChainStarting));
        assert!(kinds.contains(&EventKind::ChainRunning));
        assert_eq!(kinds.iter().filter(|k| **k == EventKind::LayerStarted).count(), 3);
        assert_eq!(kinds.iter().filter(|k| **k == EventKind::LayerStopped).count(), 3);
        assert_eq!(kinds.last(), Some(&EventKind::ChainStopped));
    }

    #[tokio::test]
    async fn shutdown_without_start_is_safe_and_final() {
        let f = fixture();
        f.sup.shutdown().await;
        f.sup.shutdown().await;
        assert_eq!(f.sup.status().state, ChainState::Stopped);
        assert!(matches!(f.sup.start(full_config()).await, Err(ChainError::ShutDown)));
        assert_eq!(f.relay.starts(), 0);
    }
}
