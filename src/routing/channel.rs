//! Control channel to the data-plane process.
//!
//! The data plane pushes connect/disconnect/error/traffic notifications to
//! registered [`ChannelCallback`]s. The channel can die at any time; the
//! [`ChannelWatcher`](crate::ChannelWatcher) reconnects through a
//! [`ChannelConnector`] and re-registers every callback.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ChannelError;

/// Receiver of data-plane notifications. All methods must return quickly.
pub trait ChannelCallback: Send + Sync + 'static {
    /// Channel (re)established and this callback registered on it.
    fn on_connected(&self) {}
    /// Channel lost.
    fn on_disconnected(&self) {}
    /// Data plane reported an error.
    fn on_error(&self, _error: &ChannelError) {}
    /// Byte counters since the previous traffic notification.
    fn on_traffic(&self, _up: u64, _down: u64) {}
}

/// A live connection to the data plane.
#[async_trait]
pub trait ControlChannel: Send + Sync + 'static {
    /// Registers a callback on this connection.
    async fn register(&self, callback: Arc<dyn ChannelCallback>) -> Result<(), ChannelError>;
    /// Resolves once the remote end has terminated.
    async fn closed(&self);
    /// Cheap liveness check.
    fn is_alive(&self) -> bool;
}

/// Opens control channels.
#[async_trait]
pub trait ChannelConnector: Send + Sync + 'static {
    /// Connects to the data plane.
    async fn connect(&self) -> Result<Arc<dyn ControlChannel>, ChannelError>;
}

/// Identifier returned by [`RouteStore::register_callback`](crate::RouteStore::register_callback).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(pub(crate) u64);
