use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::chain::supervisor::ChainSupervisor;
use crate::config::RuntimeConfig;
use crate::events::Bus;
use crate::layers::{
    AcceleratorLayer, CryptoProvider, LayerContext, LayerSet, RelayLayer, RoutingEngineLayer,
    ShaperLayer,
};
use crate::routing::{ChannelConnector, ChannelWatcher, RouteStore};
use crate::subscribers::{Subscribe, SubscriberSet};

/// Builder for a [`ChainSupervisor`] with optional collaborators.
pub struct ChainBuilder {
    runtime: RuntimeConfig,
    layers: Option<LayerSet>,
    store: Option<Arc<RouteStore>>,
    subscribers: Vec<Arc<dyn Subscribe>>,
    crypto: Option<Arc<dyn CryptoProvider>>,
    connector: Option<Arc<dyn ChannelConnector>>,
}

impl ChainBuilder {
    /// Creates a new builder with the given runtime configuration.
    pub fn new(runtime: RuntimeConfig) -> Self {
        Self {
            runtime,
            layers: None,
            store: None,
            subscribers: Vec::new(),
            crypto: None,
            connector: None,
        }
    }

    /// Replaces the stock adapters.
    ///
    /// Slots left empty fail the stage when its config block is present.
    pub fn with_layers(mut self, layers: LayerSet) -> Self {
        self.layers = Some(layers);
        self
    }

    /// Shares an existing route store instead of creating one.
    pub fn with_route_store(mut self, store: Arc<RouteStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets event subscribers.
    ///
    /// Subscribers receive runtime events (chain transitions, layer and
    /// process lifecycle, channel changes) through dedicated workers with
    /// bounded queues.
    pub fn with_subscribers(mut self, subscribers: Vec<Arc<dyn Subscribe>>) -> Self {
        self.subscribers = subscribers;
        self
    }

    /// Crypto backend used to mint local listener credentials.
    pub fn with_crypto(mut self, crypto: Arc<dyn CryptoProvider>) -> Self {
        self.crypto = Some(crypto);
        self
    }

    /// Keeps a control channel connected for the supervisor's lifetime.
    pub fn with_channel_connector(mut self, connector: Arc<dyn ChannelConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Builds the supervisor and spawns its background tasks.
    ///
    /// This consumes the builder and initializes:
    /// - event bus and subscriber workers
    /// - route store (unless one was supplied)
    /// - stock adapters (unless a [`LayerSet`] was supplied)
    /// - control-channel watcher (if a connector was supplied)
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Arc<ChainSupervisor> {
        let bus = Bus::new(self.runtime.bus_capacity_clamped());
        let subs = Arc::new(SubscriberSet::new(self.subscribers, bus.clone()));
        let root = CancellationToken::new();

        let store = self.store.unwrap_or_else(|| {
            Arc::new(RouteStore::new(
                self.runtime.route_replay,
                self.runtime.route_feed_capacity,
            ))
        });
        let layers = self.layers.unwrap_or_else(|| stock_layers(&store));

        let ctx = LayerContext {
            work_dir: self.runtime.work_dir.clone(),
            runtime: self.runtime.clone(),
            bus: bus.clone(),
            crypto: self.crypto,
            token: root.clone(),
        };

        let sup = Arc::new(ChainSupervisor::new_internal(
            self.runtime.clone(),
            layers,
            Arc::clone(&store),
            ctx,
            root,
        ));
        sup.spawn_event_listener(subs);

        if let Some(connector) = self.connector {
            let watcher = ChannelWatcher::new(store, connector, self.runtime.channel_reconnect, bus);
            let token = sup.root_token().child_token();
            sup.spawn_background(tokio::spawn(watcher.run(token)));
        }
        sup
    }
}

/// Process-backed relay and accelerator, pacing shaper, engine on `store`.
fn stock_layers(store: &Arc<RouteStore>) -> LayerSet {
    LayerSet::default()
        .with(Arc::new(RelayLayer::new()))
        .with(Arc::new(AcceleratorLayer::process()))
        .with(Arc::new(ShaperLayer::pacing()))
        .with(Arc::new(RoutingEngineLayer::new(Arc::clone(store))))
}
