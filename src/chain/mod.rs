//! # Chain supervision.
//!
//! - [`ChainSupervisor`] drives the layers through start, monitoring and stop.
//! - [`ChainBuilder`] is the composition root: runtime config, adapters,
//!   route store, subscribers, crypto and control channel.
//! - [`ChainStatus`] / [`LayerStatus`] are the immutable snapshots readers get.
//!
//! ## State machine
//! ```text
//!            start()                 all layers up
//! Stopped ───────────► Starting ───────────────────► Running
//!    ▲                    │  │   optional layer failed    │
//!    │   critical failure │  └──────────────► Degraded ◄──┘ layer failed
//!    │◄───────────────────┘                     │          while running
//!    │                                          │
//!    │        stop()                            │
//!    └──────── Stopping ◄───────────────────────┴── (from Running too)
//! ```

mod builder;
mod monitor;
mod state;
mod supervisor;

#[cfg(test)]
mod fake;

pub use builder::ChainBuilder;
pub use state::{ChainState, ChainStatus, LayerStatus};
pub use supervisor::ChainSupervisor;
