//! # ProcessSupervisor: launch and safe termination of one executable.
//!
//! ```text
//! launch()
//!   ├─► confine binary / log / working dir to allowed roots
//!   ├─► check execute bit
//!   ├─► spawn with restricted env, stdout+stderr → log (append)
//!   └─► wait startup_grace
//!         ├─► still running → ProcessHandle
//!         └─► exited        → StartupFailure { exit_code, sanitized tail }
//!
//! terminate(handle)
//!   ├─► child owned  → SIGTERM ─ wait grace ─► SIGKILL ─ wait kill_timeout
//!   └─► child gone   → pid alive? pid == recorded? /proc identity ok?
//!                        ├─► all yes → same escalation by pid
//!                        └─► any no  → refuse (TerminateRefused)
//! ```
//!
//! The supervisor remembers the pid of the process it last launched
//! (`recorded_pid`) independently of any handle, so a handle that outlived
//! its process (or a handle rebuilt after the owner was recreated) is
//! checked against it before a pid-based signal is sent.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};
use tokio::time;

use crate::config::ProcessConfig;
use crate::error::LaunchError;
use crate::events::{Bus, Event, EventKind};
use crate::process::{identity, paths, sanitize};

/// Poll step while waiting for a pid we do not own to disappear.
const PID_POLL: Duration = Duration::from_millis(50);

/// What to run and where.
#[derive(Clone, Debug)]
pub struct LaunchSpec {
    /// Owning layer name (used in events and logs).
    pub name: String,
    /// Binary to execute.
    pub executable: PathBuf,
    /// Arguments, reused verbatim on every relaunch.
    pub args: Vec<OsString>,
    /// Extra environment on top of the restricted base.
    pub env: HashMap<String, String>,
    /// Working directory; also HOME and TMPDIR of the child.
    pub working_dir: PathBuf,
    /// Combined stdout/stderr destination (appended).
    pub log_file: PathBuf,
    /// Name the identity check expects; defaults to the executable's file name.
    pub expected_name: Option<String>,
}

impl LaunchSpec {
    /// Spec with no extra args or env.
    pub fn new(
        name: impl Into<String>,
        executable: impl Into<PathBuf>,
        working_dir: impl Into<PathBuf>,
        log_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            executable: executable.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: working_dir.into(),
            log_file: log_file.into(),
            expected_name: None,
        }
    }

    /// Appends arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Adds one environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Name used by the identity check.
    pub fn expected_name(&self) -> String {
        self.expected_name.clone().unwrap_or_else(|| {
            self.executable
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        })
    }
}

/// One launched process.
///
/// `pid` stays valid after `child` is gone so the fallback termination path
/// has something to verify.
#[derive(Debug)]
pub struct ProcessHandle {
    /// OS pid at launch time.
    pub pid: u32,
    /// Live child, `None` once reaped or when the handle was rebuilt from a pid.
    pub child: Option<Child>,
    /// Crashes observed so far for this logical process.
    pub retry_count: u32,
    /// Resolved executable.
    pub executable: PathBuf,
    /// Launch instant.
    pub launched_at: Instant,
}

impl ProcessHandle {
    /// Handle that only knows a pid (owner was recreated, child object lost).
    pub fn detached(pid: u32, executable: impl Into<PathBuf>) -> Self {
        Self {
            pid,
            child: None,
            retry_count: 0,
            executable: executable.into(),
            launched_at: Instant::now(),
        }
    }
}

/// Launches and terminates one external executable.
pub struct ProcessSupervisor {
    spec: LaunchSpec,
    cfg: ProcessConfig,
    bus: Bus,
    recorded_pid: AtomicU32,
}

impl ProcessSupervisor {
    /// Creates a supervisor; nothing is spawned yet.
    pub fn new(spec: LaunchSpec, cfg: ProcessConfig, bus: Bus) -> Self {
        Self {
            spec,
            cfg,
            bus,
            recorded_pid: AtomicU32::new(0),
        }
    }

    /// Launch spec.
    pub fn spec(&self) -> &LaunchSpec {
        &self.spec
    }

    /// Process settings.
    pub fn config(&self) -> &ProcessConfig {
        &self.cfg
    }

    pub(crate) fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Pid of the process this supervisor last launched (`None` if none is live).
    pub fn recorded_pid(&self) -> Option<u32> {
        match self.recorded_pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Re-adopts a pid persisted by a previous owner and returns a detached
    /// handle for it. The pid still has to pass the identity check before
    /// [`terminate`](Self::terminate) will signal it.
    ///
    /// The recorded pid is only replaced when none is recorded or the recorded
    /// one is dead. While a different live pid is recorded the returned
    /// handle fails the recorded-pid check.
    pub fn adopt_pid(&self, pid: u32) -> ProcessHandle {
        let current = self.recorded_pid.load(Ordering::Acquire);
        if current == 0 || current == pid || !identity::is_alive(current) {
            let _ = self.recorded_pid.compare_exchange(
                current,
                pid,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        } else {
            tracing::warn!(layer = %self.spec.name, pid, recorded = current, "not adopting pid over a live recorded process");
        }
        ProcessHandle::detached(pid, self.spec.executable.clone())
    }

    /// Confines paths and builds the restricted command for `args`.
    async fn command(&self, args: &[OsString]) -> Result<(Command, PathBuf, PathBuf), LaunchError> {
        let roots = &self.cfg.allowed_dirs;
        let executable = paths::ensure_within(&self.spec.executable, roots)?;
        let log_file = paths::ensure_within(&self.spec.log_file, roots)?;
        let working_dir = paths::ensure_within(&self.spec.working_dir, roots)?;

        if !paths::is_executable(&executable) {
            return Err(LaunchError::BinaryNotExecutable { path: executable });
        }

        tokio::fs::create_dir_all(&working_dir)
            .await
            .map_err(LaunchError::SpawnFailed)?;
        let stdout = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .map_err(LaunchError::SpawnFailed)?;
        let stderr = stdout.try_clone().map_err(LaunchError::SpawnFailed)?;

        let mut cmd = Command::new(&executable);
        cmd.args(args)
            .current_dir(&working_dir)
            .env_clear()
            .env("HOME", &working_dir)
            .env("TMPDIR", &working_dir)
            .env(
                "PATH",
                paths::filter_path(&std::env::var_os("PATH").unwrap_or_default()),
            )
            .envs(&self.spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);
        Ok((cmd, executable, log_file))
    }

    /// Runs the executable once with `args` (instead of the launch
    /// arguments) and waits up to `limit` for it to finish.
    ///
    /// Returns the exit code (`None` if killed or timed out) and the
    /// sanitized tail of what it wrote. Used for configuration dry runs.
    pub async fn check_run(
        &self,
        args: &[OsString],
        limit: Duration,
    ) -> Result<(Option<i32>, String), LaunchError> {
        let (mut cmd, _, log_file) = self.command(args).await?;
        let mut child = cmd.spawn().map_err(LaunchError::SpawnFailed)?;
        let code = match time::timeout(limit, child.wait()).await {
            Ok(status) => exit_code(&status),
            Err(_elapsed) => {
                let _ = child.kill().await;
                tracing::warn!(layer = %self.spec.name, ?limit, "check run timed out");
                None
            }
        };
        let tail = sanitize::read_tail(&log_file, self.cfg.log_tail_bytes, self.cfg.log_tail_lines).await;
        Ok((code, tail))
    }

    /// Starts the process and waits out the startup grace period.
    pub async fn launch(&self) -> Result<ProcessHandle, LaunchError> {
        let (mut cmd, executable, log_file) = self.command(&self.spec.args).await?;
        let mut child = cmd.spawn().map_err(LaunchError::SpawnFailed)?;
        let pid = child.id().unwrap_or_default();

        match time::timeout(self.cfg.startup_grace, child.wait()).await {
            Err(_elapsed) => {
                self.recorded_pid.store(pid, Ordering::Release);
                tracing::info!(layer = %self.spec.name, pid, "process launched");
                Ok(ProcessHandle {
                    pid,
                    child: Some(child),
                    retry_count: 0,
                    executable,
                    launched_at: Instant::now(),
                })
            }
            Ok(status) => {
                let exit_code = status.ok().and_then(|s| s.code());
                let log_tail = sanitize::read_tail(
                    &log_file,
                    self.cfg.log_tail_bytes,
                    self.cfg.log_tail_lines,
                )
                .await;
                tracing::warn!(layer = %self.spec.name, ?exit_code, "process exited during startup");
                self.bus.publish(
                    Event::new(EventKind::ProcessStartupFailed)
                        .with_layer(self.spec.name.as_str())
                        .with_exit_code(exit_code)
                        .with_reason(log_tail.as_str()),
                );
                Err(LaunchError::StartupFailure {
                    exit_code,
                    log_tail,
                })
            }
        }
    }

    /// Stops the process behind `handle`. Returns `true` once it is gone.
    ///
    /// With a live child the escalation is SIGTERM, `terminate_grace`,
    /// SIGKILL, `kill_timeout`. Without one the same escalation runs by pid,
    /// but only after the pid passes the liveness, recorded-pid and identity
    /// checks; otherwise nothing is signalled and `false` is returned.
    pub async fn terminate(&self, handle: &mut ProcessHandle) -> bool {
        let gone = match handle.child.as_mut() {
            Some(child) => self.terminate_child(handle.pid, child).await,
            None => self.terminate_by_pid(handle.pid).await,
        };
        if gone {
            handle.child = None;
            let _ = self.recorded_pid.compare_exchange(
                handle.pid,
                0,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
        gone
    }

    async fn terminate_child(&self, pid: u32, child: &mut Child) -> bool {
        if let Ok(Some(_)) = child.try_wait() {
            return true;
        }
        if let Some(live) = child.id() {
            identity::send_signal(live, libc::SIGTERM);
        }
        if let Ok(Ok(_)) = time::timeout(self.cfg.terminate_grace, child.wait()).await {
            tracing::debug!(layer = %self.spec.name, pid, "process exited after SIGTERM");
            return true;
        }

        self.bus.publish(
            Event::new(EventKind::TerminateEscalated)
                .with_layer(self.spec.name.as_str())
                .with_pid(pid),
        );
        if let Err(e) = child.start_kill() {
            tracing::warn!(layer = %self.spec.name, pid, error = %e, "SIGKILL failed");
        }
        matches!(
            time::timeout(self.cfg.kill_timeout, child.wait()).await,
            Ok(Ok(_))
        )
    }

    async fn terminate_by_pid(&self, pid: u32) -> bool {
        let expected = self.spec.expected_name();
        let refusal = if !identity::is_alive(pid) {
            Some("pid not alive")
        } else if self.recorded_pid() != Some(pid) {
            Some("pid does not match the recorded pid")
        } else if !identity::identity_matches(pid, &expected) {
            Some("pid belongs to a different executable")
        } else {
            None
        };

        if let Some(reason) = refusal {
            tracing::warn!(layer = %self.spec.name, pid, reason, "refusing pid-based termination");
            self.bus.publish(
                Event::new(EventKind::TerminateRefused)
                    .with_layer(self.spec.name.as_str())
                    .with_pid(pid)
                    .with_reason(reason),
            );
            return false;
        }

        identity::send_signal(pid, libc::SIGTERM);
        if wait_pid_gone(pid, self.cfg.terminate_grace).await {
            return true;
        }
        self.bus.publish(
            Event::new(EventKind::TerminateEscalated)
                .with_layer(self.spec.name.as_str())
                .with_pid(pid),
        );
        identity::send_signal(pid, libc::SIGKILL);
        wait_pid_gone(pid, self.cfg.kill_timeout).await
    }
}

async fn wait_pid_gone(pid: u32, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    loop {
        if !identity::is_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        time::sleep(PID_POLL).await;
    }
}

/// Exit code of a finished child, `None` when killed by a signal.
pub(crate) fn exit_code(status: &std::io::Result<ExitStatus>) -> Option<i32> {
    status.as_ref().ok().and_then(|s| s.code())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    pub(crate) fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    pub(crate) fn fast_cfg(dir: &Path) -> ProcessConfig {
        ProcessConfig {
            allowed_dirs: vec![dir.to_path_buf()],
            startup_grace: Duration::from_millis(100),
            terminate_grace: Duration::from_millis(500),
            kill_timeout: Duration::from_millis(500),
            health_interval: Duration::ZERO,
            ..ProcessConfig::default()
        }
    }

    fn supervisor(dir: &Path, name: &str, body: &str) -> ProcessSupervisor {
        let bin = script(dir, name, body);
        let spec = LaunchSpec::new("xray", bin, dir.join("work"), dir.join("xray.log"));
        ProcessSupervisor::new(spec, fast_cfg(dir), Bus::new(16))
    }

    #[tokio::test]
    async fn launch_and_terminate() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), "fake-xray", "exec sleep 30");

        let mut handle = sup.launch().await.expect("launch");
        assert_eq!(sup.recorded_pid(), Some(handle.pid));
        assert!(identity::is_alive(handle.pid));

        assert!(sup.terminate(&mut handle).await);
        assert!(handle.child.is_none());
        assert_eq!(sup.recorded_pid(), None);
    }

    #[tokio::test]
    async fn immediate_exit_is_a_startup_failure() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(
            dir.path(),
            "fake-xray",
            "echo 'bad uuid b831381d-6324-4d53-ad4f-8cda48b30811'\nexit 23",
        );
        let mut events = sup.bus().subscribe();

        match sup.launch().await {
            Err(LaunchError::StartupFailure { exit_code, log_tail }) => {
                assert_eq!(exit_code, Some(23));
                assert_eq!(log_tail, "bad uuid ***");
            }
            other => panic!("unexpected: {other:?}"),
        }
        let ev = events.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::ProcessStartupFailed);
        assert_eq!(sup.recorded_pid(), None);
    }

    #[tokio::test]
    async fn restricted_environment() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("env.out");
        let body = format!(
            "echo \"$HOME|$TMPDIR|$LAYER|${{CARGO_PKG_NAME:-unset}}\" > {}\nexec sleep 30",
            out.display()
        );
        let bin = script(dir.path(), "env-probe", &body);
        let work = dir.path().join("work");
        let spec = LaunchSpec::new("reality", bin, &work, dir.path().join("r.log"))
            .with_env("LAYER", "reality");
        let sup = ProcessSupervisor::new(spec, fast_cfg(dir.path()), Bus::new(16));

        let mut handle = sup.launch().await.expect("launch");
        let seen = std::fs::read_to_string(&out).unwrap();
        let work = std::fs::canonicalize(&work).unwrap();
        assert_eq!(
            seen.trim(),
            format!("{}|{}|reality|unset", work.display(), work.display())
        );
        assert!(sup.terminate(&mut handle).await);
    }

    #[tokio::test]
    async fn rejects_binary_outside_allowed_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let spec = LaunchSpec::new("xray", "/bin/sh", dir.path(), dir.path().join("x.log"));
        let sup = ProcessSupervisor::new(spec, fast_cfg(dir.path()), Bus::new(4));
        assert!(matches!(
            sup.launch().await,
            Err(LaunchError::PathNotAllowed(_))
        ));
    }

    #[tokio::test]
    async fn rejects_non_executable() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("xray");
        std::fs::write(&bin, "not a program").unwrap();
        let spec = LaunchSpec::new("xray", &bin, dir.path(), dir.path().join("x.log"));
        let sup = ProcessSupervisor::new(spec, fast_cfg(dir.path()), Bus::new(4));
        assert!(matches!(
            sup.launch().await,
            Err(LaunchError::BinaryNotExecutable { .. })
        ));
    }

    #[tokio::test]
    async fn pid_fallback_refuses_foreign_process() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), "xray", "exec sleep 30");
        let mut events = sup.bus().subscribe();

        let mut unrelated = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let mut handle = sup.adopt_pid(unrelated.id());

        assert!(!sup.terminate(&mut handle).await);
        assert!(identity::is_alive(unrelated.id()));
        let ev = events.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::TerminateRefused);
        assert_eq!(ev.reason.as_deref(), Some("pid belongs to a different executable"));

        unrelated.kill().unwrap();
        unrelated.wait().unwrap();
    }

    #[tokio::test]
    async fn pid_fallback_refuses_process_naming_the_binary() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), "xray", "exec sleep 30");
        let mut events = sup.bus().subscribe();

        let bin = dir.path().join("xray");
        let mut viewer = std::process::Command::new("tail")
            .arg(&bin)
            .arg("-f")
            .spawn()
            .unwrap();
        let mut handle = sup.adopt_pid(viewer.id());

        assert!(!sup.terminate(&mut handle).await);
        assert!(identity::is_alive(viewer.id()));
        let ev = events.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::TerminateRefused);
        assert_eq!(ev.reason.as_deref(), Some("pid belongs to a different executable"));

        viewer.kill().unwrap();
        viewer.wait().unwrap();
    }

    #[tokio::test]
    async fn adoption_does_not_replace_a_live_recorded_pid() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), "xray", "exec sleep 30");
        let mut events = sup.bus().subscribe();
        let mut live = sup.launch().await.expect("launch");

        // Same name as the binary, so only the recorded-pid check can refuse it.
        std::fs::create_dir(dir.path().join("other")).unwrap();
        let impostor = script(&dir.path().join("other"), "xray", "sleep 30\nexit 0");
        let mut other = std::process::Command::new(&impostor).spawn().unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let mut adopted = sup.adopt_pid(other.id());
        assert_eq!(sup.recorded_pid(), Some(live.pid));
        assert!(identity::identity_matches(other.id(), "xray"));
        assert!(!sup.terminate(&mut adopted).await);
        assert!(identity::is_alive(other.id()));
        let refused = loop {
            let ev = events.recv().await.unwrap();
            if ev.kind == EventKind::TerminateRefused {
                break ev;
            }
        };
        assert_eq!(refused.reason.as_deref(), Some("pid does not match the recorded pid"));

        assert!(sup.terminate(&mut live).await);
        other.kill().unwrap();
        other.wait().unwrap();
    }

    #[tokio::test]
    async fn pid_fallback_refuses_stale_handle() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), "fake-xray", "exec sleep 30");
        let mut live = sup.launch().await.expect("launch");

        let mut stale = ProcessHandle::detached(live.pid + 1, live.executable.clone());
        assert!(!sup.terminate(&mut stale).await);
        assert!(identity::is_alive(live.pid));

        assert!(sup.terminate(&mut live).await);
    }

    #[tokio::test]
    async fn pid_fallback_kills_verified_process() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), "fake-xray", "sleep 30");
        let mut live = sup.launch().await.expect("launch");
        let pid = live.pid;

        // Owner recreated: the child object is lost, only the pid survives.
        let child = live.child.take().unwrap();
        let mut rebuilt = sup.adopt_pid(pid);
        let reaper = tokio::spawn(async move {
            let mut child = child;
            child.wait().await
        });

        assert!(sup.terminate(&mut rebuilt).await);
        let _ = reaper.await;
    }
}
