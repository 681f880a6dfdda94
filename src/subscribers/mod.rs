//! # Event subscribers.
//!
//! A [`Subscribe`] implementation receives every runtime [`Event`](crate::Event)
//! published on the chain's bus: state transitions, process crashes, restart
//! schedules, channel loss. Use it for UI notifications, metrics, or audit.
//!
//! ## Architecture
//! ```text
//! Bus ──► chain event listener ──► SubscriberSet::emit(&Event)
//!                                     ├──► [queue S1] ─► worker S1 ─► on_event()
//!                                     ├──► [queue S2] ─► worker S2 ─► on_event()
//!                                     └──► [queue SN] ─► worker SN ─► on_event()
//! ```

#[cfg(feature = "logging")]
mod log;
mod set;
mod subscribe;

#[cfg(feature = "logging")]
pub use log::LogWriter;
pub use set::SubscriberSet;
pub use subscribe::Subscribe;
