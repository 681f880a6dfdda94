//! Shared plumbing for process-backed layers.
//!
//! [`ProcessSlot`] owns at most one [`SupervisedProcess`]. Start/stop go
//! through an async mutex; health reads only touch a cloned state receiver
//! so they never wait behind a slow stop.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::LayerError;
use crate::layers::{LayerContext, LayerHealth, LayerKind};
use crate::process::{HealthProbe, LaunchSpec, ProcessState, ProcessSupervisor, SupervisedProcess};

pub(crate) struct ProcessSlot {
    process: tokio::sync::Mutex<Option<SupervisedProcess>>,
    state: Mutex<Option<watch::Receiver<ProcessState>>>,
}

impl ProcessSlot {
    pub(crate) fn new() -> Self {
        Self {
            process: tokio::sync::Mutex::new(None),
            state: Mutex::new(None),
        }
    }

    /// Spawns `supervisor` under the chain token, replacing any previous process.
    pub(crate) async fn spawn(
        &self,
        ctx: &LayerContext,
        supervisor: Arc<ProcessSupervisor>,
        probe: Option<Box<dyn HealthProbe>>,
    ) -> Result<(), LayerError> {
        let mut guard = self.process.lock().await;
        if let Some(mut old) = guard.take() {
            old.stop().await;
        }
        let proc = SupervisedProcess::spawn(supervisor, &ctx.token, probe).await?;
        *self.state.lock() = Some(proc.subscribe());
        *guard = Some(proc);
        Ok(())
    }

    /// Stops the process if one is installed. `false` if it could not be
    /// confirmed gone.
    pub(crate) async fn stop(&self) -> bool {
        let mut guard = self.process.lock().await;
        let gone = match guard.take() {
            Some(mut proc) => proc.stop().await,
            None => true,
        };
        *self.state.lock() = None;
        gone
    }

    pub(crate) fn health(&self) -> LayerHealth {
        let state = self.state.lock();
        let Some(rx) = state.as_ref() else {
            return LayerHealth::Stopped;
        };
        let current = rx.borrow().clone();
        match current {
            ProcessState::Running { .. } => LayerHealth::Running,
            ProcessState::Restarting { attempt, .. } => LayerHealth::Restarting { attempt },
            ProcessState::Stopped => LayerHealth::Stopped,
            failed @ ProcessState::Failed { .. } => LayerHealth::Failed(
                failed
                    .failure()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "process failed".to_string()),
            ),
        }
    }
}

/// Creates the layer's directory under the work dir.
pub(crate) async fn prepare_dir(ctx: &LayerContext, kind: LayerKind) -> Result<PathBuf, LayerError> {
    let dir = ctx.layer_dir(kind);
    tokio::fs::create_dir_all(&dir).await?;
    Ok(dir)
}

/// Writes a pretty-printed JSON document next to the layer's logs.
pub(crate) async fn write_json(path: &Path, doc: &serde_json::Value) -> Result<(), LayerError> {
    let bytes = serde_json::to_vec_pretty(doc).map_err(|e| LayerError::ConfigInvalid(e.to_string()))?;
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

/// Supervisor for a layer binary run with `args` inside `dir`.
pub(crate) fn supervisor(
    ctx: &LayerContext,
    kind: LayerKind,
    binary: &Path,
    dir: &Path,
    args: Vec<OsString>,
    env: &[(&str, &str)],
) -> Arc<ProcessSupervisor> {
    let mut spec = LaunchSpec::new(kind.name(), binary, dir, dir.join(format!("{}.log", kind.name())))
        .with_args(args);
    for (k, v) in env {
        spec = spec.with_env(*k, *v);
    }
    Arc::new(ProcessSupervisor::new(
        spec,
        ctx.runtime.process_config(),
        ctx.bus.clone(),
    ))
}

/// Checks that `port` on loopback is free right now.
pub(crate) fn check_bind(port: u16) -> Result<(), LayerError> {
    std::net::TcpListener::bind(("127.0.0.1", port))
        .map(drop)
        .map_err(|e| LayerError::Bind {
            port,
            error: e.to_string(),
        })
}
