//! Runtime events: types and broadcast bus.
//!
//! This module groups the event **data model** and the **bus** used to
//! publish/subscribe to events emitted by the chain supervisor, the process
//! supervisors backing each layer, and the routing store's channel watcher.
//!
//! ## Contents
//! - [`EventKind`], [`Event`] event classification and payload metadata
//! - [`Bus`] thin wrapper over `tokio::sync::broadcast`
//!
//! ## Quick reference
//! - **Publishers**: `ChainSupervisor` (state and layer transitions),
//!   `ProcessSupervisor`/`ProcessMonitor` (launch, exit, restart, terminate),
//!   `ChannelWatcher` (control channel loss/restore), `SubscriberSet` workers.
//! - **Consumers**: the chain's event listener (fans out to `SubscriberSet`)
//!   and anyone holding `ChainSupervisor::subscribe_events()`.

mod bus;
mod event;

pub use bus::Bus;
pub use event::{Event, EventKind};
