//! # ChannelWatcher: keeps the data-plane control channel alive.
//!
//! ```text
//! loop {
//!   connect() ── err ──► sleep(backoff) ──► retry
//!      │
//!      ▼ ok
//!   register every callback, on_connected()
//!   store.set_connection(Connected)        (full snapshot re-emitted)
//!   [ChannelRestored if this is a reconnect]
//!   wait: closed() | new callback | cancelled
//!      │
//!      ▼ closed
//!   invalidate decision cache, on_disconnected()
//!   store.set_connection(Disconnected), ChannelLost
//!   sleep(backoff)
//! }
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::{select, time};
use tokio_util::sync::CancellationToken;

use crate::events::{Bus, Event, EventKind};
use crate::routing::channel::{CallbackId, ChannelConnector, ControlChannel};
use crate::routing::store::RouteStore;
use crate::routing::table::ConnectionStatus;

/// Name used for channel events.
const CHANNEL: &str = "control-channel";

/// Reconnect loop for one store and one connector.
pub struct ChannelWatcher {
    store: Arc<RouteStore>,
    connector: Arc<dyn ChannelConnector>,
    backoff: Duration,
    bus: Bus,
}

impl ChannelWatcher {
    /// Watcher with a fixed reconnect backoff.
    pub fn new(
        store: Arc<RouteStore>,
        connector: Arc<dyn ChannelConnector>,
        backoff: Duration,
        bus: Bus,
    ) -> Self {
        Self {
            store,
            connector,
            backoff,
            bus,
        }
    }

    /// Runs until `token` is cancelled.
    pub async fn run(self, token: CancellationToken) {
        let mut lost_before = false;
        loop {
            let connected = select! {
                r = self.connector.connect() => r,
                _ = token.cancelled() => break,
            };
            let channel = match connected {
                Ok(channel) => channel,
                Err(e) => {
                    tracing::debug!(error = %e, "control channel connect failed");
                    if !self.pause(&token).await {
                        break;
                    }
                    continue;
                }
            };

            let mut registered = HashSet::new();
            let mut changes = self.store.watch_callbacks();
            changes.mark_unchanged();
            self.register_new(channel.as_ref(), &mut registered).await;
            self.store.set_connection(ConnectionStatus::Connected);
            if lost_before {
                tracing::info!("control channel restored");
                self.bus
                    .publish(Event::new(EventKind::ChannelRestored).with_layer(CHANNEL));
            }

            loop {
                select! {
                    _ = channel.closed() => break,
                    Ok(()) = changes.changed() => {
                        self.register_new(channel.as_ref(), &mut registered).await;
                    }
                    _ = token.cancelled() => return,
                }
            }

            self.store.invalidate_cache();
            for (_, cb) in self.store.callbacks() {
                cb.on_disconnected();
            }
            self.store.set_connection(ConnectionStatus::Disconnected);
            tracing::warn!("control channel lost");
            self.bus.publish(
                Event::new(EventKind::ChannelLost)
                    .with_layer(CHANNEL)
                    .with_reason("remote endpoint terminated"),
            );
            lost_before = true;

            if !self.pause(&token).await {
                break;
            }
        }
    }

    async fn register_new(&self, channel: &dyn ControlChannel, registered: &mut HashSet<CallbackId>) {
        for (id, cb) in self.store.callbacks() {
            if registered.contains(&id) {
                continue;
            }
            match channel.register(Arc::clone(&cb)).await {
                Ok(()) => {
                    registered.insert(id);
                    cb.on_connected();
                }
                Err(e) => {
                    tracing::warn!(error = %e, "callback registration failed");
                    cb.on_error(&e);
                }
            }
        }
    }

    /// Sleeps the reconnect backoff; `false` if cancelled meanwhile.
    async fn pause(&self, token: &CancellationToken) -> bool {
        select! {
            _ = time::sleep(self.backoff) => true,
            _ = token.cancelled() => false,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio_util::sync::CancellationToken;

    use crate::error::ChannelError;
    use crate::routing::channel::ChannelCallback;

    /// In-memory channel whose death is driven by the test.
    pub(crate) struct MemChannel {
        dead: CancellationToken,
        pub(crate) registered: Mutex<Vec<Arc<dyn ChannelCallback>>>,
    }

    #[async_trait]
    impl ControlChannel for MemChannel {
        async fn register(&self, cb: Arc<dyn ChannelCallback>) -> Result<(), ChannelError> {
            if self.dead.is_cancelled() {
                return Err(ChannelError::Disconnected);
            }
            self.registered.lock().push(cb);
            Ok(())
        }
        async fn closed(&self) {
            self.dead.cancelled().await;
        }
        fn is_alive(&self) -> bool {
            !self.dead.is_cancelled()
        }
    }

    /// Hands out channels and remembers them so the test can kill them.
    #[derive(Default)]
    pub(crate) struct MemConnector {
        pub(crate) channels: Mutex<Vec<Arc<MemChannel>>>,
        pub(crate) fail_next: AtomicU32,
    }

    impl MemConnector {
        pub(crate) fn kill_current(&self) {
            if let Some(ch) = self.channels.lock().last() {
                ch.dead.cancel();
            }
        }
    }

    #[async_trait]
    impl ChannelConnector for MemConnector {
        async fn connect(&self) -> Result<Arc<dyn ControlChannel>, ChannelError> {
            if self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ChannelError::ConnectFailed("refused".into()));
            }
            let ch = Arc::new(MemChannel {
                dead: CancellationToken::new(),
                registered: Mutex::new(Vec::new()),
            });
            self.channels.lock().push(Arc::clone(&ch));
            Ok(ch)
        }
    }

    #[derive(Default)]
    struct Probe {
        connected: AtomicU32,
        disconnected: AtomicU32,
    }

    impl ChannelCallback for Probe {
        fn on_connected(&self) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }
        fn on_disconnected(&self) {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_and_reregisters() {
        let store = Arc::new(RouteStore::new(16, 16));
        let probe = Arc::new(Probe::default());
        store.register_callback(probe.clone());
        let connector = Arc::new(MemConnector::default());
        connector.fail_next.store(1, Ordering::SeqCst);
        let bus = Bus::new(16);
        let mut events = bus.subscribe();

        let watcher = ChannelWatcher::new(
            Arc::clone(&store),
            connector.clone(),
            Duration::from_millis(100),
            bus,
        );
        let token = CancellationToken::new();
        let task = tokio::spawn(watcher.run(token.clone()));

        time::sleep(Duration::from_millis(150)).await;
        settle().await;
        assert_eq!(store.connection_status(), ConnectionStatus::Connected);
        assert_eq!(probe.connected.load(Ordering::SeqCst), 1);

        // Decisions cached before the loss must not survive it.
        store.resolve(&crate::routing::RouteQuery::domain("a.example"));
        assert_eq!(store.cached_decisions(), 1);

        connector.kill_current();
        settle().await;
        assert_eq!(store.connection_status(), ConnectionStatus::Disconnected);
        assert_eq!(store.cached_decisions(), 0);
        assert_eq!(probe.disconnected.load(Ordering::SeqCst), 1);
        assert_eq!(events.recv().await.unwrap().kind, EventKind::ChannelLost);

        time::sleep(Duration::from_millis(150)).await;
        settle().await;
        assert_eq!(store.connection_status(), ConnectionStatus::Connected);
        assert_eq!(probe.connected.load(Ordering::SeqCst), 2);
        assert_eq!(events.recv().await.unwrap().kind, EventKind::ChannelRestored);
        {
            let channels = connector.channels.lock();
            assert_eq!(channels.len(), 2);
            assert_eq!(channels[1].registered.lock().len(), 1);
        }

        // Snapshot trail: Connected, Disconnected, Connected.
        let mut sub = store.subscribe();
        let mut trail = Vec::new();
        while let Some(s) = sub.try_recv() {
            trail.push(s.connection);
        }
        assert_eq!(
            trail,
            vec![
                ConnectionStatus::Connected,
                ConnectionStatus::Disconnected,
                ConnectionStatus::Connected
            ]
        );

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn late_callbacks_join_live_channel() {
        let store = Arc::new(RouteStore::new(4, 4));
        let connector = Arc::new(MemConnector::default());
        let watcher = ChannelWatcher::new(
            Arc::clone(&store),
            connector.clone(),
            Duration::from_millis(100),
            Bus::new(4),
        );
        let token = CancellationToken::new();
        let task = tokio::spawn(watcher.run(token.clone()));
        settle().await;

        let probe = Arc::new(Probe::default());
        store.register_callback(probe.clone());
        settle().await;
        assert_eq!(probe.connected.load(Ordering::SeqCst), 1);
        assert_eq!(connector.channels.lock()[0].registered.lock().len(), 1);

        token.cancel();
        task.await.unwrap();
    }
}
