//! Liveness, identity and signalling of OS processes by pid.
//!
//! Used only on the fallback termination path, where we no longer own a
//! child handle and must prove the pid still belongs to our executable
//! before touching it.

use std::path::Path;

/// Longest process name the kernel keeps in `/proc/<pid>/comm`.
const COMM_LEN: usize = 15;

/// Programs allowed to carry the expected name in `argv[1]` (a script they run).
const INTERPRETERS: &[&str] = &[
    "sh", "ash", "bash", "dash", "mksh", "zsh", "busybox", "toybox", "python", "python3", "perl",
];

/// True if `pid` exists and is not a zombie.
pub fn is_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    // SAFETY: signal 0 only performs the permission/existence check.
    let exists = unsafe { libc::kill(raw, 0) } == 0
        || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
    exists && !is_zombie(pid)
}

fn is_zombie(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            let (_, rest) = stat.rsplit_once(')')?;
            rest.trim_start().chars().next()
        })
        .is_some_and(|state| state == 'Z')
}

/// Sends `signal` to `pid`. Returns `false` if the kernel refused.
pub fn send_signal(pid: u32, signal: libc::c_int) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    // SAFETY: plain kill(2) on a positive pid; never a process group.
    unsafe { libc::kill(raw, signal) == 0 }
}

/// Checks that `pid` is running `expected` (a file name or path).
///
/// Accepts a match on the kernel's process name (truncated to 15 bytes) or
/// the basename of `/proc/<pid>/exe` or `argv[0]`. `argv[1]` only counts when
/// the process itself is a known interpreter, so `tail xray` is not `xray`.
pub fn identity_matches(pid: u32, expected: &str) -> bool {
    let Some(expected) = Path::new(expected).file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if expected.is_empty() {
        return false;
    }

    let comm = std::fs::read_to_string(format!("/proc/{pid}/comm"))
        .map(|c| c.trim_end().to_owned())
        .unwrap_or_default();
    if comm == expected || (comm.len() == COMM_LEN && expected.starts_with(comm.as_str())) {
        return true;
    }

    let exe = std::fs::read_link(format!("/proc/{pid}/exe"))
        .ok()
        .and_then(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_owned))
        .unwrap_or_default();
    if exe == expected || exe.strip_suffix(" (deleted)") == Some(expected) {
        return true;
    }

    let Ok(cmdline) = std::fs::read(format!("/proc/{pid}/cmdline")) else {
        return false;
    };
    let argv: Vec<String> = cmdline
        .split(|b| *b == 0)
        .filter(|arg| !arg.is_empty())
        .take(2)
        .map(|arg| basename(&String::from_utf8_lossy(arg)))
        .collect();
    match argv.as_slice() {
        [first, ..] if first == expected => true,
        [_, second] => {
            second == expected
                && (INTERPRETERS.contains(&comm.as_str()) || INTERPRETERS.contains(&exe.as_str()))
        }
        _ => false,
    }
}

fn basename(arg: &str) -> String {
    Path::new(arg)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive_and_identified() {
        let pid = std::process::id();
        assert!(is_alive(pid));

        let exe = std::env::current_exe().unwrap();
        let name = exe.file_name().unwrap().to_str().unwrap();
        assert!(identity_matches(pid, name));
        assert!(!identity_matches(pid, "definitely-not-this-binary"));
    }

    #[test]
    fn bogus_pids() {
        assert!(!is_alive(0));
        assert!(!is_alive(u32::MAX));
        assert!(!send_signal(0, 0));
    }

    #[test]
    fn reaped_child_is_not_alive() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        // pid may be reused eventually, but not this quickly in practice.
        assert!(!is_alive(pid) || !identity_matches(pid, "true"));
    }

    #[test]
    fn naming_the_binary_as_an_argument_is_not_identity() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("xray");
        std::fs::write(&target, "").unwrap();

        let mut tail = std::process::Command::new("tail")
            .arg("-f")
            .arg(&target)
            .spawn()
            .unwrap();
        let mut shell = std::process::Command::new("sh")
            .arg("-c")
            .arg("sleep 30")
            .arg(&target)
            .spawn()
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(100));

        assert!(!identity_matches(tail.id(), "xray"));
        assert!(!identity_matches(tail.id(), target.to_str().unwrap()));
        assert!(identity_matches(tail.id(), "tail"));
        // sh's argv[1] is "-c", so the path in argv[3] is ignored too.
        assert!(!identity_matches(shell.id(), "xray"));

        for child in [&mut tail, &mut shell] {
            child.kill().unwrap();
            child.wait().unwrap();
        }
    }

    #[test]
    fn interpreter_running_the_script_matches() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("xray");
        std::fs::write(&script, "sleep 30\nexit 0\n").unwrap();

        let mut child = std::process::Command::new("sh").arg(&script).spawn().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert!(identity_matches(child.id(), "xray"));

        child.kill().unwrap();
        child.wait().unwrap();
    }
}
