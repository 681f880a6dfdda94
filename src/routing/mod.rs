//! # Routing state store.
//!
//! - [`RouteStore`] holds the current [`RouteTable`] behind an atomic pointer;
//!   updates are compare-and-swap retries over pure functions.
//! - Every update publishes a [`RouteSnapshot`] on a feed with a bounded
//!   replay buffer ([`FeedSubscription`]).
//! - [`ChannelWatcher`] keeps the control channel to the data plane alive and
//!   resynchronizes after it dies.
//!
//! ```text
//! callers ─► add/remove/update/clear/apply ─► update_table ─► ArcSwap<RouteTable>
//!                                                  │
//!                                                  ├─► decision cache invalidated
//!                                                  └─► SnapshotFeed ─► subscribers
//! data plane ◄─► ControlChannel ◄─ ChannelWatcher ─► set_connection / callbacks
//! ```

mod cache;
mod channel;
mod feed;
mod rule;
mod store;
mod table;
mod unix;
pub(crate) mod watcher;

pub use channel::{CallbackId, ChannelCallback, ChannelConnector, ControlChannel};
pub use feed::{FeedSubscription, SnapshotFeed};
pub use rule::{DEFAULT_OUTBOUND, RouteDecision, RouteQuery, RouteRule, RuleMatcher};
pub use store::RouteStore;
pub use table::{ConnectionStatus, RouteSnapshot, RouteTable};
pub use unix::UnixChannelConnector;
pub use watcher::ChannelWatcher;
