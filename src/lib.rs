//! # chainvisor
//!
//! **Chainvisor** supervises a layered tunnel chain on a mobile device:
//! a TLS-mimicking relay, an optional QUIC accelerator, an optional traffic
//! shaper and a routing engine, started in dependency order and each fed
//! the local endpoint of the layer before it.
//!
//! The crate does not implement any tunnel protocol. It launches and
//! watches the external binaries that do, wires their endpoints together,
//! keeps a lock-free routing table they consult, and reports one aggregate
//! status upward.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!                        ChainConfig (per connection)
//!                                 │
//!                                 ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  ChainSupervisor                                                  │
//! │  - StatusCell (watch<Arc<ChainStatus>>)                           │
//! │  - Bus (broadcast events) ──► SubscriberSet (per-sub queues)      │
//! │  - RouteStore (ArcSwap<RouteTable>, snapshot feed, decision cache)│
//! │  - ChainMonitor (adaptive metrics/health sweep)                   │
//! └──────┬───────────────┬────────────────┬──────────────┬────────────┘
//!        ▼               ▼                ▼              ▼
//!   ┌──────────┐   ┌───────────┐    ┌──────────┐   ┌──────────┐
//!   │ reality  │──►│ hysteria2 │──► │  pepper  │   │   xray   │◄── RouteStore
//!   │ (relay)  │   │ (accel.)  │    │ (shaper) │   │ (engine) │
//!   └────┬─────┘   └─────┬─────┘    └──────────┘   └────┬─────┘
//!        │               │                              │
//!        ▼               ▼                              ▼
//!  ProcessSupervisor  AcceleratorBackend          ProcessSupervisor
//!   launch ─► monitor ─► restart (backoff) ─► terminate (TERM, KILL)
//! ```
//!
//! ### Lifecycle
//! ```text
//! start(cfg)
//!   ├─► validate (errors abort, warnings logged)
//!   ├─► Starting
//!   ├─► reality ─► hysteria2 ─► pepper ─► xray
//!   │      critical failure ─► stop started layers in reverse ─► Stopped, Err
//!   │      optional failure ─► continue, Degraded
//!   └─► Running | Degraded ─► monitor loop until stop()
//!
//! stop()
//!   └─► Stopping ─► cancel monitor ─► stop layers in reverse ─► Stopped
//! ```
//!
//! ## Features
//! | Area              | Description                                                   | Key types / traits                         |
//! |-------------------|---------------------------------------------------------------|--------------------------------------------|
//! | **Chain**         | Ordered start, rollback, degraded mode, status snapshots.     | [`ChainSupervisor`], [`ChainStatus`]       |
//! | **Layers**        | Uniform adapter contract, one adapter per stage.              | [`Layer`], [`LayerSet`], [`AcceleratorBackend`], [`ShaperBackend`] |
//! | **Processes**     | Launch checks, crash restarts with backoff, graceful stop.    | [`ProcessSupervisor`], [`SupervisedProcess`] |
//! | **Routing**       | Lock-free rule table, snapshot feed, control channel.         | [`RouteStore`], [`ChannelWatcher`]         |
//! | **Subscriber API**| Hook into runtime events (logging, metrics, UI).              | [`Subscribe`], [`Event`]                   |
//! | **Policies**      | Restart budget and backoff shape.                             | [`RetryPolicy`], [`BackoffPolicy`]         |
//! | **Errors**        | Typed errors per concern.                                     | [`ChainError`], [`LayerError`]             |
//!
//! ## Optional features
//! - `logging`: exports the built-in [`LogWriter`] subscriber.
//!
//! ## Platform
//! Unix only: process identity checks and signals go through `libc`.
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use chainvisor::{ChainConfig, ChainSupervisor, RouteRule, RuleMatcher, RuntimeConfig};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     #[cfg(feature = "logging")]
//!     let subs: Vec<Arc<dyn chainvisor::Subscribe>> = vec![Arc::new(chainvisor::LogWriter::new())];
//!     #[cfg(not(feature = "logging"))]
//!     let subs: Vec<Arc<dyn chainvisor::Subscribe>> = Vec::new();
//!
//!     let sup = ChainSupervisor::builder(RuntimeConfig::with_work_dir("/data/chain"))
//!         .with_subscribers(subs)
//!         .build();
//!
//!     sup.route_store().add_rule(RouteRule::new(
//!         "ads",
//!         RuleMatcher::Geosite("category-ads".into()),
//!         "block",
//!     ));
//!
//!     let cfg = ChainConfig::from_json(&std::fs::read_to_string("/data/chain/chain.json")?)?;
//!     sup.start(cfg).await?;
//!
//!     let mut status = sup.subscribe_status();
//!     while status.changed().await.is_ok() {
//!         let s = status.borrow_and_update().clone();
//!         println!("{} up={} down={}", s.state, s.cumulative_bytes_up, s.cumulative_bytes_down);
//!     }
//!     sup.shutdown().await;
//!     Ok(())
//! }
//! ```

#[cfg(not(unix))]
compile_error!("chainvisor supports unix targets only");

mod chain;
mod config;
mod error;
mod events;
mod layers;
mod policies;
mod process;
mod routing;
mod subscribers;

// ---- Public re-exports ----

pub use chain::{ChainBuilder, ChainState, ChainStatus, ChainSupervisor, LayerStatus};
pub use config::{
    AcceleratorConfig, ChainConfig, ProcessConfig, RelayConfig, RoutingEngineConfig, RuntimeConfig,
    ShaperConfig, ShaperMode, TlsImplementation, ValidationReport,
};
pub use error::{ChainError, ChannelError, LaunchError, LayerError, PathError, ProcessError};
pub use events::{Bus, Event, EventKind};
pub use layers::{
    AcceleratorBackend, AcceleratorLayer, CryptoProvider, Endpoint, Layer, LayerContext,
    LayerHealth, LayerKind, LayerMetrics, LayerSet, LocalCredential, PacingParams, PacingShaper,
    ProcessAccelerator, RelayLayer, RoutingEngineLayer, ShaperBackend, ShaperHandle, ShaperLayer,
    ShaperStats, SocketPair,
};
pub use policies::{BackoffPolicy, JitterPolicy, RetryPolicy};
pub use process::{
    HealthProbe, LaunchSpec, LogTail, ProcessHandle, ProcessState, ProcessSupervisor,
    SupervisedProcess, TcpProbe, ensure_within, filter_path, identity_matches, is_alive,
    is_executable, read_tail, sanitize,
};
pub use routing::{
    CallbackId, ChannelCallback, ChannelConnector, ChannelWatcher, ConnectionStatus,
    ControlChannel, DEFAULT_OUTBOUND, FeedSubscription, RouteDecision, RouteQuery, RouteRule,
    RouteSnapshot, RouteStore, RouteTable, RuleMatcher, SnapshotFeed, UnixChannelConnector,
};
pub use subscribers::{Subscribe, SubscriberSet};

// Optional: built-in subscriber that renders events through `tracing`.
// Enable with: `--features logging`
#[cfg(feature = "logging")]
pub use subscribers::LogWriter;
