//! # ProcessMonitor: crash detection and bounded relaunch.
//!
//! Owns the [`ProcessHandle`] for the lifetime of one supervised process and
//! reacts to three wake-ups:
//!
//! ```text
//! loop {
//!   select! {
//!     child exits        ─► ProcessExited, retry_count += 1
//!                           ├─► retry_count <= max_retries
//!                           │     RestartScheduled ─ sleep(backoff) ─ relaunch
//!                           │     (a failed relaunch is one more crash)
//!                           └─► otherwise RetriesExhausted, state = Failed, exit
//!     health recycle     ─► kill child (next wake-up is its exit)
//!     token cancelled    ─► terminate(handle), state = Stopped, exit
//!   }
//! }
//! ```
//!
//! ## Rules
//! - Relaunches reuse the original arguments and environment.
//! - A first launch that dies inside its grace period is crash #1 and is
//!   retried the same way.
//! - A process that always dies is launched exactly `max_retries + 1` times.
//! - Cancellation is observed during the exit wait and the backoff sleep.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::{select, time};
use tokio_util::sync::CancellationToken;

use crate::error::{LaunchError, ProcessError};
use crate::events::{Event, EventKind};
use crate::process::health::{HealthLoop, HealthProbe};
use crate::process::log_tail::LogTail;
use crate::process::supervisor::{ProcessHandle, ProcessSupervisor, exit_code};

/// Observable lifecycle of a supervised process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessState {
    /// Process is up.
    Running {
        /// Current pid.
        pid: u32,
        /// Launches performed so far (1 = never restarted).
        launches: u32,
    },
    /// Waiting out the backoff before relaunch `attempt`.
    Restarting {
        /// Retry number (1-based).
        attempt: u32,
        /// Backoff being waited.
        delay: Duration,
    },
    /// Retry budget spent; the process stays down.
    Failed {
        /// Last observed exit code.
        exit_code: Option<i32>,
        /// Launches performed.
        attempts: u32,
    },
    /// Terminated on request.
    Stopped,
}

impl ProcessState {
    /// True while the process is up.
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running { .. })
    }

    /// Crash error once retries are exhausted.
    pub fn failure(&self) -> Option<ProcessError> {
        match *self {
            ProcessState::Failed {
                exit_code,
                attempts,
            } => Some(ProcessError::Crashed {
                exit_code,
                attempts,
            }),
            _ => None,
        }
    }
}

enum Wake {
    Exited(std::io::Result<std::process::ExitStatus>),
    Recycle,
    Cancelled,
}

struct ProcessMonitor {
    supervisor: Arc<ProcessSupervisor>,
    handle: ProcessHandle,
    launches: u32,
    state: watch::Sender<ProcessState>,
    recycle: mpsc::Receiver<()>,
}

impl ProcessMonitor {
    fn layer(&self) -> &str {
        &self.supervisor.spec().name
    }

    fn publish(&self, ev: Event) {
        self.supervisor.bus().publish(ev.with_layer(self.layer()));
    }

    /// Returns whether the process was confirmed gone when the loop ended.
    async fn run(mut self, token: CancellationToken) -> bool {
        loop {
            let wake = match self.handle.child.as_mut() {
                Some(child) => select! {
                    status = child.wait() => Wake::Exited(status),
                    Some(()) = self.recycle.recv() => Wake::Recycle,
                    _ = token.cancelled() => Wake::Cancelled,
                },
                None => Wake::Exited(Err(std::io::ErrorKind::NotFound.into())),
            };

            let status = match wake {
                Wake::Cancelled => {
                    let gone = self.supervisor.terminate(&mut self.handle).await;
                    self.state.send_replace(ProcessState::Stopped);
                    return gone;
                }
                Wake::Recycle => {
                    tracing::warn!(layer = %self.layer(), pid = self.handle.pid, "recycling unhealthy process");
                    if let Some(child) = self.handle.child.as_mut() {
                        let _ = child.start_kill();
                    }
                    continue;
                }
                Wake::Exited(status) => status,
            };

            let last_code = exit_code(&status);
            self.handle.child = None;
            tracing::warn!(layer = %self.layer(), pid = self.handle.pid, exit_code = ?last_code, "process exited unexpectedly");
            self.publish(
                Event::new(EventKind::ProcessExited)
                    .with_pid(self.handle.pid)
                    .with_exit_code(last_code),
            );

            let mut budget = Budget {
                retry_count: self.handle.retry_count,
                launches: self.launches,
            };
            let outcome = relaunch(&self.supervisor, &self.state, &token, &mut budget, last_code).await;
            self.launches = budget.launches;
            match outcome {
                Relaunch::Up(fresh) => self.handle = fresh,
                Relaunch::Exhausted(_) | Relaunch::Cancelled => return true,
            }
        }
    }
}

/// Crash accounting shared by the first launch and later relaunches.
struct Budget {
    retry_count: u32,
    launches: u32,
}

enum Relaunch {
    Up(ProcessHandle),
    /// Budget spent; carries the last launch error, if a relaunch was tried.
    Exhausted(Option<LaunchError>),
    Cancelled,
}

/// Relaunches with backoff until one launch survives its grace period or
/// the retry budget is spent. Each failed launch counts as one more crash.
async fn relaunch(
    supervisor: &ProcessSupervisor,
    state: &watch::Sender<ProcessState>,
    token: &CancellationToken,
    budget: &mut Budget,
    mut last_code: Option<i32>,
) -> Relaunch {
    let layer = supervisor.spec().name.as_str();
    let retry = supervisor.config().retry;
    let mut last_error = None;
    loop {
        budget.retry_count += 1;
        if !retry.allows(budget.retry_count) {
            tracing::error!(layer, launches = budget.launches, "retries exhausted");
            supervisor.bus().publish(
                Event::new(EventKind::RetriesExhausted)
                    .with_layer(layer)
                    .with_attempt(budget.launches)
                    .with_exit_code(last_code),
            );
            state.send_replace(ProcessState::Failed {
                exit_code: last_code,
                attempts: budget.launches,
            });
            return Relaunch::Exhausted(last_error);
        }

        let attempt = budget.retry_count;
        let delay = retry.backoff.next(attempt);
        supervisor.bus().publish(
            Event::new(EventKind::RestartScheduled)
                .with_layer(layer)
                .with_attempt(attempt)
                .with_delay(delay),
        );
        state.send_replace(ProcessState::Restarting { attempt, delay });

        select! {
            _ = time::sleep(delay) => {}
            _ = token.cancelled() => {
                state.send_replace(ProcessState::Stopped);
                return Relaunch::Cancelled;
            }
        }

        budget.launches += 1;
        match supervisor.launch().await {
            Ok(fresh) => {
                supervisor.bus().publish(
                    Event::new(EventKind::ProcessLaunched)
                        .with_layer(layer)
                        .with_pid(fresh.pid)
                        .with_attempt(budget.launches),
                );
                state.send_replace(ProcessState::Running {
                    pid: fresh.pid,
                    launches: budget.launches,
                });
                return Relaunch::Up(ProcessHandle {
                    retry_count: budget.retry_count,
                    ..fresh
                });
            }
            Err(e) => {
                last_code = match &e {
                    LaunchError::StartupFailure { exit_code, .. } => *exit_code,
                    other => {
                        tracing::warn!(layer, error = %other, "relaunch failed");
                        None
                    }
                };
                last_error = Some(e);
            }
        }
    }
}

/// A launched process with its monitor, log follower and optional health probe.
///
/// Dropping it without [`stop`](Self::stop) cancels the background tasks;
/// the child is then killed when the monitor drops it.
pub struct SupervisedProcess {
    supervisor: Arc<ProcessSupervisor>,
    token: CancellationToken,
    state: watch::Receiver<ProcessState>,
    monitor: Option<JoinHandle<bool>>,
    aux: Vec<JoinHandle<()>>,
}

impl SupervisedProcess {
    /// Launches the process and starts supervising it under a child of `parent`.
    ///
    /// A crash inside the grace period goes through the same retry budget as
    /// a later crash; the startup error is returned only once that budget is
    /// spent. Path, permission and spawn errors are returned at once. Nothing
    /// keeps running when an error is returned.
    pub async fn spawn(
        supervisor: Arc<ProcessSupervisor>,
        parent: &CancellationToken,
        probe: Option<Box<dyn HealthProbe>>,
    ) -> Result<Self, LaunchError> {
        let token = parent.child_token();
        let spec = supervisor.spec();
        let cfg = supervisor.config();
        let (state_tx, state_rx) = watch::channel(ProcessState::Stopped);
        let mut budget = Budget {
            retry_count: 0,
            launches: 1,
        };

        let handle = match supervisor.launch().await {
            Ok(handle) => {
                supervisor.bus().publish(
                    Event::new(EventKind::ProcessLaunched)
                        .with_layer(spec.name.as_str())
                        .with_pid(handle.pid)
                        .with_attempt(1),
                );
                state_tx.send_replace(ProcessState::Running {
                    pid: handle.pid,
                    launches: 1,
                });
                handle
            }
            Err(LaunchError::StartupFailure {
                exit_code,
                log_tail,
            }) => {
                let first = LaunchError::StartupFailure {
                    exit_code,
                    log_tail,
                };
                match relaunch(&supervisor, &state_tx, &token, &mut budget, exit_code).await {
                    Relaunch::Up(handle) => handle,
                    Relaunch::Exhausted(last) => return Err(last.unwrap_or(first)),
                    Relaunch::Cancelled => return Err(first),
                }
            }
            Err(e) => return Err(e),
        };

        let (recycle_tx, recycle_rx) = mpsc::channel(1);

        let mut aux = Vec::new();
        let tail = LogTail::new(spec.name.as_str(), &spec.log_file, cfg.log_poll_interval);
        aux.push(tokio::spawn(tail.run(token.clone())));
        if let Some(probe) = probe {
            if let Some(health) =
                HealthLoop::new(&spec.name, probe, cfg, recycle_tx, supervisor.bus().clone())
            {
                aux.push(tokio::spawn(health.run(token.clone())));
            }
        }

        let monitor = ProcessMonitor {
            supervisor: Arc::clone(&supervisor),
            handle,
            launches: budget.launches,
            state: state_tx,
            recycle: recycle_rx,
        };
        let monitor = tokio::spawn(monitor.run(token.clone()));

        Ok(Self {
            supervisor,
            token,
            state: state_rx,
            monitor: Some(monitor),
            aux,
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProcessState {
        self.state.borrow().clone()
    }

    /// Watch over lifecycle changes.
    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.state.clone()
    }

    /// Current pid, if running.
    pub fn pid(&self) -> Option<u32> {
        match *self.state.borrow() {
            ProcessState::Running { pid, .. } => Some(pid),
            _ => None,
        }
    }

    /// Supervisor driving this process.
    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    /// Terminates the process and joins the background tasks. Idempotent.
    ///
    /// Returns `false` only if the process could not be confirmed gone.
    pub async fn stop(&mut self) -> bool {
        self.token.cancel();
        let gone = match self.monitor.take() {
            Some(monitor) => monitor.await.unwrap_or(false),
            None => true,
        };
        for task in self.aux.drain(..) {
            let _ = task.await;
        }
        gone
    }
}

impl Drop for SupervisedProcess {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use crate::config::ProcessConfig;
    use crate::events::Bus;
    use crate::policies::{BackoffPolicy, RetryPolicy};
    use crate::process::supervisor::LaunchSpec;
    use crate::process::supervisor::tests::{fast_cfg, script};

    fn crash_cfg(dir: &Path, max_retries: u32) -> ProcessConfig {
        ProcessConfig {
            startup_grace: Duration::from_millis(30),
            retry: RetryPolicy {
                max_retries,
                backoff: BackoffPolicy {
                    base: Duration::from_millis(10),
                    max: Duration::from_millis(40),
                    ..BackoffPolicy::default()
                },
            },
            ..fast_cfg(dir)
        }
    }

    async fn wait_for(
        rx: &mut watch::Receiver<ProcessState>,
        f: impl Fn(&ProcessState) -> bool,
    ) -> ProcessState {
        time::timeout(Duration::from_secs(15), rx.wait_for(|s| f(s)))
            .await
            .expect("state reached in time")
            .expect("monitor alive")
            .clone()
    }

    #[tokio::test]
    async fn crash_loop_launches_max_retries_plus_one() {
        let dir = tempfile::tempdir().unwrap();
        let count = dir.path().join("launches");
        let body = format!("echo x >> {}\nsleep 0.2\nexit 3", count.display());
        let bin = script(dir.path(), "crashy", &body);
        let spec = LaunchSpec::new("xray", bin, dir.path().join("w"), dir.path().join("x.log"));
        let bus = Bus::new(64);
        let mut events = bus.subscribe();
        let sup = Arc::new(ProcessSupervisor::new(spec, crash_cfg(dir.path(), 3), bus));

        let root = CancellationToken::new();
        let mut proc = SupervisedProcess::spawn(sup, &root, None).await.expect("first launch");
        let mut rx = proc.subscribe();
        let end = wait_for(&mut rx, |s| matches!(s, ProcessState::Failed { .. })).await;

        assert_eq!(
            end,
            ProcessState::Failed {
                exit_code: Some(3),
                attempts: 4
            }
        );
        assert_eq!(std::fs::read_to_string(&count).unwrap().lines().count(), 4);
        assert!(matches!(
            end.failure(),
            Some(ProcessError::Crashed { attempts: 4, .. })
        ));

        let mut restarts = Vec::new();
        while let Ok(ev) = events.try_recv() {
            if ev.kind == EventKind::RestartScheduled {
                restarts.push((ev.attempt, ev.delay_ms));
            }
        }
        assert_eq!(
            restarts,
            vec![(Some(1), Some(10)), (Some(2), Some(20)), (Some(3), Some(40))]
        );
        assert!(proc.stop().await);
    }

    #[tokio::test]
    async fn relaunch_that_dies_in_grace_counts_as_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let count = dir.path().join("launches");
        // First launch survives; every later one dies immediately.
        let body = format!(
            "echo x >> {c}\nif [ $(wc -l < {c}) -eq 1 ]; then sleep 0.2; fi\nexit 1",
            c = count.display()
        );
        let bin = script(dir.path(), "flaky", &body);
        let spec = LaunchSpec::new("reality", bin, dir.path().join("w"), dir.path().join("r.log"));
        let sup = Arc::new(ProcessSupervisor::new(spec, crash_cfg(dir.path(), 2), Bus::new(64)));

        let root = CancellationToken::new();
        let proc = SupervisedProcess::spawn(sup, &root, None).await.expect("first launch");
        let mut rx = proc.subscribe();
        let end = wait_for(&mut rx, |s| matches!(s, ProcessState::Failed { .. })).await;

        assert_eq!(
            end,
            ProcessState::Failed {
                exit_code: Some(1),
                attempts: 3
            }
        );
        assert_eq!(std::fs::read_to_string(&count).unwrap().lines().count(), 3);
    }

    #[tokio::test]
    async fn instant_crash_uses_the_whole_budget_before_failing() {
        let dir = tempfile::tempdir().unwrap();
        let count = dir.path().join("launches");
        let body = format!("echo x >> {}\nexit 3", count.display());
        let bin = script(dir.path(), "instant", &body);
        let spec = LaunchSpec::new("reality", bin, dir.path().join("w"), dir.path().join("r.log"));
        let bus = Bus::new(64);
        let mut events = bus.subscribe();
        let sup = Arc::new(ProcessSupervisor::new(spec, crash_cfg(dir.path(), 3), bus));

        let root = CancellationToken::new();
        match SupervisedProcess::spawn(sup, &root, None).await {
            Err(LaunchError::StartupFailure { exit_code, .. }) => assert_eq!(exit_code, Some(3)),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("a process that always dies must not come up"),
        }
        assert_eq!(std::fs::read_to_string(&count).unwrap().lines().count(), 4);

        let mut restarts = Vec::new();
        let mut exhausted = None;
        while let Ok(ev) = events.try_recv() {
            match ev.kind {
                EventKind::RestartScheduled => restarts.push((ev.attempt, ev.delay_ms)),
                EventKind::RetriesExhausted => exhausted = ev.attempt,
                _ => {}
            }
        }
        assert_eq!(
            restarts,
            vec![(Some(1), Some(10)), (Some(2), Some(20)), (Some(3), Some(40))]
        );
        assert_eq!(exhausted, Some(4));
    }

    #[tokio::test]
    async fn instant_crash_recovers_within_budget() {
        let dir = tempfile::tempdir().unwrap();
        let count = dir.path().join("launches");
        // First launch dies at once; the second one stays up.
        let body = format!(
            "echo x >> {c}\nif [ $(wc -l < {c}) -eq 1 ]; then exit 2; fi\nexec sleep 30",
            c = count.display()
        );
        let bin = script(dir.path(), "slow-start", &body);
        let spec = LaunchSpec::new("xray", bin, dir.path().join("w"), dir.path().join("x.log"));
        let sup = Arc::new(ProcessSupervisor::new(spec, crash_cfg(dir.path(), 2), Bus::new(64)));

        let root = CancellationToken::new();
        let mut proc = SupervisedProcess::spawn(sup, &root, None).await.expect("second launch survives");
        assert!(matches!(proc.state(), ProcessState::Running { launches: 2, .. }));
        assert!(proc.stop().await);
        assert_eq!(proc.state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn parent_cancellation_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let bin = script(dir.path(), "steady", "exec sleep 30");
        let spec = LaunchSpec::new("reality", bin, dir.path().join("w"), dir.path().join("r.log"));
        let sup = Arc::new(ProcessSupervisor::new(spec, fast_cfg(dir.path()), Bus::new(16)));

        let root = CancellationToken::new();
        let mut proc = SupervisedProcess::spawn(sup, &root, None).await.expect("launch");
        let pid = proc.pid().expect("running");

        root.cancel();
        let mut rx = proc.subscribe();
        wait_for(&mut rx, |s| *s == ProcessState::Stopped).await;
        assert!(!crate::process::identity::is_alive(pid));
        assert!(proc.stop().await);
        assert!(proc.stop().await);
    }
}
