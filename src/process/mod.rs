//! # Process supervision for external backends.
//!
//! - [`ProcessSupervisor`] launches one executable inside the permitted
//!   directories with a restricted environment and terminates it safely.
//! - [`SupervisedProcess`] keeps it alive: crash detection, bounded
//!   exponential relaunch, log following and optional health probing, all
//!   scoped to one cancellation token.
//!
//! ```text
//! Layer ──► SupervisedProcess::spawn(supervisor, token, probe)
//!              ├─► ProcessSupervisor::launch()   (grace-period check)
//!              ├─► ProcessMonitor  ─► exit → backoff → relaunch … → Failed
//!              ├─► LogTail         ─► tracing::debug!(layer, line)
//!              └─► HealthLoop      ─► N failures → recycle request
//! ```

mod health;
mod identity;
mod log_tail;
mod monitor;
mod paths;
mod sanitize;
pub(crate) mod supervisor;

pub use health::{HealthProbe, TcpProbe};
pub use identity::{identity_matches, is_alive};
pub use log_tail::LogTail;
pub use monitor::{ProcessState, SupervisedProcess};
pub use paths::{ensure_within, filter_path, is_executable};
pub use sanitize::{read_tail, sanitize};
pub use supervisor::{LaunchSpec, ProcessHandle, ProcessSupervisor};
