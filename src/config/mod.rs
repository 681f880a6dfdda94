//! Configuration: what to start and how to supervise it.
//!
//! - [`ChainConfig`] is the immutable per-connection input handed over by the
//!   upstream converter. It holds an optional block per layer plus the TLS
//!   implementation selector, and validates itself into a [`ValidationReport`].
//! - [`RuntimeConfig`] centralizes supervisor tunables (grace periods, retry
//!   budget, poll intervals, permitted directories). [`ProcessConfig`] is the
//!   subset each process supervisor needs.
//!
//! ## Sentinel values
//! - `ProcessConfig::health_interval = 0s` → health probing disabled
//! - `RuntimeConfig::route_replay = 0` → late subscribers get no history

mod chain;
mod runtime;

pub use chain::{
    AcceleratorConfig, ChainConfig, RelayConfig, RoutingEngineConfig, ShaperConfig, ShaperMode,
    TlsImplementation, ValidationReport,
};
pub use runtime::{ProcessConfig, RuntimeConfig};
