//! Error types used by the chain runtime, its layers and the routing store.
//!
//! This module defines one enum per concern:
//!
//! - [`ChainError`]: errors surfaced to callers of the chain supervisor.
//! - [`LayerError`]: per-layer start/stop failures (values, never panics).
//! - [`LaunchError`]: failures to bring an external process up.
//! - [`ProcessError`]: a supervised process that kept crashing.
//! - [`PathError`]: a resolved path escaping the permitted directories.
//! - [`ChannelError`]: control-channel failures.
//!
//! All types provide `as_label` (stable snake_case, for logs/metrics).
//! [`ChainError`] and [`LayerError`] also provide `as_message`.

use std::path::PathBuf;

use thiserror::Error;

/// # Errors returned by the chain supervisor.
///
/// Configuration errors and critical-layer failures abort a chain start and
/// surface here. Optional-layer failures never do; they are recorded in the
/// layer's status and the chain proceeds in `Degraded`.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ChainError {
    /// `start` was called while the chain was not `Stopped`.
    #[error("chain already running")]
    AlreadyRunning,

    /// Structural configuration problems, rejected before any process starts.
    #[error("invalid chain config: {}", errors.join("; "))]
    ConfigValidation {
        /// Every hard error found by validation.
        errors: Vec<String>,
    },

    /// A critical layer failed to start.
    #[error("layer '{layer}' failed to start: {cause}")]
    LayerStart {
        /// Name of the failed layer.
        layer: String,
        /// Underlying cause.
        #[source]
        cause: LayerError,
    },

    /// A resolved path escaped the permitted directory tree.
    #[error(transparent)]
    PathTraversal(#[from] PathError),

    /// Control channel failure.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Some layers could not be confirmed stopped; the chain is `Stopped` anyway.
    #[error("stop incomplete: {}", failures.join("; "))]
    StopIncomplete {
        /// One `layer: cause` entry per layer that failed to stop.
        failures: Vec<String>,
    },

    /// `shutdown` already ran; the supervisor accepts no more starts.
    #[error("chain supervisor is shut down")]
    ShutDown,
}

impl ChainError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use chainvisor::ChainError;
    ///
    /// assert_eq!(ChainError::AlreadyRunning.as_label(), "chain_already_running");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            ChainError::AlreadyRunning => "chain_already_running",
            ChainError::ConfigValidation { .. } => "chain_config_invalid",
            ChainError::LayerStart { .. } => "chain_layer_start_failed",
            ChainError::PathTraversal(_) => "chain_path_traversal",
            ChainError::Channel(_) => "chain_channel",
            ChainError::StopIncomplete { .. } => "chain_stop_incomplete",
            ChainError::ShutDown => "chain_shut_down",
        }
    }

    /// Returns a human-readable aggregate message.
    pub fn as_message(&self) -> String {
        match self {
            ChainError::AlreadyRunning => "chain is already running; stop it first".to_string(),
            ChainError::ConfigValidation { errors } => {
                format!("config rejected ({} errors): {}", errors.len(), errors.join("; "))
            }
            ChainError::LayerStart { layer, cause } => {
                format!("critical layer {layer} failed: {}", cause.as_message())
            }
            ChainError::PathTraversal(e) => e.to_string(),
            ChainError::Channel(e) => e.to_string(),
            ChainError::StopIncomplete { failures } => {
                format!("{} layers did not stop cleanly: {}", failures.len(), failures.join("; "))
            }
            ChainError::ShutDown => "chain supervisor is shut down".to_string(),
        }
    }
}

/// # Errors produced by a single layer adapter.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum LayerError {
    /// The layer was asked to start without its configuration block.
    #[error("layer not configured")]
    NotConfigured,

    /// The layer could not bind its local listener.
    #[error("cannot bind local port {port}: {error}")]
    Bind {
        /// Requested local port.
        port: u16,
        /// OS error text.
        error: String,
    },

    /// The backing process could not be launched.
    #[error(transparent)]
    Launch(#[from] LaunchError),

    /// The backing process crashed and exhausted its retries.
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// The layer's configuration could not be materialized.
    #[error("invalid layer config: {0}")]
    ConfigInvalid(String),

    /// The routing engine rejected its configuration during the dry run.
    #[error("config dry-run failed: {output}")]
    DryRunFailed {
        /// Sanitized tail of the engine's output.
        output: String,
    },

    /// A required backend or resource is not available.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// A path resolved outside the permitted directories.
    #[error(transparent)]
    Path(#[from] PathError),

    /// Filesystem or socket failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl LayerError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            LayerError::NotConfigured => "layer_not_configured",
            LayerError::Bind { .. } => "layer_bind_failed",
            LayerError::Launch(_) => "layer_launch_failed",
            LayerError::Process(_) => "layer_process_crashed",
            LayerError::ConfigInvalid(_) => "layer_config_invalid",
            LayerError::DryRunFailed { .. } => "layer_dry_run_failed",
            LayerError::Unavailable(_) => "layer_unavailable",
            LayerError::Path(_) => "layer_path_traversal",
            LayerError::Io(_) => "layer_io",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        match self {
            LayerError::Launch(LaunchError::StartupFailure { exit_code, log_tail }) => {
                format!("process exited during startup (code {exit_code:?}): {log_tail}")
            }
            other => other.to_string(),
        }
    }
}

/// # Errors produced while launching an external process.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum LaunchError {
    /// The binary is missing, not a regular file, or lacks the execute bit.
    #[error("binary not executable: {path}")]
    BinaryNotExecutable {
        /// Path that was checked.
        path: PathBuf,
    },

    /// The binary, log file or working dir escapes the permitted directories.
    #[error(transparent)]
    PathNotAllowed(#[from] PathError),

    /// The OS refused to spawn the process.
    #[error("spawn failed: {0}")]
    SpawnFailed(#[source] std::io::Error),

    /// The process exited within the startup grace period.
    #[error("exited during startup with code {exit_code:?}")]
    StartupFailure {
        /// Exit code, `None` when killed by a signal.
        exit_code: Option<i32>,
        /// Bounded, sanitized tail of the process log.
        log_tail: String,
    },
}

impl LaunchError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            LaunchError::BinaryNotExecutable { .. } => "launch_binary_not_executable",
            LaunchError::PathNotAllowed(_) => "launch_path_not_allowed",
            LaunchError::SpawnFailed(_) => "launch_spawn_failed",
            LaunchError::StartupFailure { .. } => "launch_startup_failure",
        }
    }
}

/// # Errors produced by a supervised process after a successful launch.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum ProcessError {
    /// The process kept exiting and the retry budget is spent.
    #[error("process crashed {attempts} times; last exit code {exit_code:?}")]
    Crashed {
        /// Last observed exit code.
        exit_code: Option<i32>,
        /// Number of launches performed.
        attempts: u32,
    },
}

impl ProcessError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            ProcessError::Crashed { .. } => "process_crashed",
        }
    }
}

/// # Path confinement errors.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    /// The resolved path is outside every permitted root.
    #[error("path escapes permitted directories: {path}")]
    Traversal {
        /// Resolved path.
        path: PathBuf,
    },

    /// The path (or its parent) could not be resolved.
    #[error("cannot resolve path {path}: {error}")]
    Unresolvable {
        /// Requested path.
        path: PathBuf,
        /// OS error text.
        error: String,
    },
}

impl PathError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            PathError::Traversal { .. } => "path_traversal",
            PathError::Unresolvable { .. } => "path_unresolvable",
        }
    }
}

/// # Control channel errors.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The remote endpoint terminated.
    #[error("control channel disconnected")]
    Disconnected,

    /// Connecting to the data plane failed.
    #[error("control channel connect failed: {0}")]
    ConnectFailed(String),

    /// The remote sent something we could not understand.
    #[error("control channel protocol error: {0}")]
    Protocol(String),
}

impl ChannelError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            ChannelError::Disconnected => "channel_disconnected",
            ChannelError::ConnectFailed(_) => "channel_connect_failed",
            ChannelError::Protocol(_) => "channel_protocol",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_message_joins_errors() {
        let err = ChainError::ConfigValidation {
            errors: vec!["relay: missing server".into(), "xray: missing config".into()],
        };
        assert_eq!(err.as_label(), "chain_config_invalid");
        assert!(err.to_string().contains("relay: missing server; xray: missing config"));
        assert!(err.as_message().starts_with("config rejected (2 errors)"));
    }

    #[test]
    fn layer_start_keeps_layer_name() {
        let err = ChainError::LayerStart {
            layer: "reality".into(),
            cause: LayerError::Bind {
                port: 10808,
                error: "address in use".into(),
            },
        };
        assert!(err.to_string().contains("reality"));
        assert!(err.as_message().contains("10808"));
    }

    #[test]
    fn startup_failure_message_carries_tail() {
        let err = LayerError::Launch(LaunchError::StartupFailure {
            exit_code: Some(23),
            log_tail: "bad config".into(),
        });
        assert_eq!(err.as_label(), "layer_launch_failed");
        assert!(err.as_message().contains("bad config"));
        assert!(err.as_message().contains("23"));
    }
}
