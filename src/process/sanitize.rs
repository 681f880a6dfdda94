//! Redaction of secrets from process output and bounded log tails.
//!
//! Backends echo their configuration on startup errors, so anything we copy
//! out of a log (into an event, an error or a `tracing` line) goes through
//! [`sanitize`] first.

use std::io::SeekFrom;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

const REDACTED: &str = "***";

static KEY_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)("?(?:password|passwd|private[_-]?key|public[_-]?key|publickey|short[_-]?id|shortid|uuid|auth|token|secret|obfs[_-]?password)"?\s*[:=]\s*)("[^"]*"|[^\s,;}]+)"#,
    )
    .expect("static pattern")
});

static UUID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b")
        .expect("static pattern")
});

static LONG_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9+/_\-]{32,}={0,2}").expect("static pattern")
});

/// Masks values of secret-looking keys, UUIDs and long key-like runs.
pub fn sanitize(text: &str) -> String {
    let text = KEY_VALUE.replace_all(text, |caps: &regex::Captures<'_>| {
        format!("{}{REDACTED}", &caps[1])
    });
    let text = UUID.replace_all(&text, REDACTED);
    LONG_TOKEN.replace_all(&text, REDACTED).into_owned()
}

/// Reads at most `max_bytes` from the end of `path`, keeps the last
/// `max_lines` complete lines and sanitizes them.
///
/// A missing or unreadable file yields an empty tail.
pub async fn read_tail(path: &Path, max_bytes: usize, max_lines: usize) -> String {
    match read_tail_raw(path, max_bytes).await {
        Ok(raw) => {
            let lines: Vec<&str> = raw.lines().filter(|l| !l.trim().is_empty()).collect();
            let start = lines.len().saturating_sub(max_lines);
            sanitize(&lines[start..].join("\n"))
        }
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "log tail unavailable");
            String::new()
        }
    }
}

async fn read_tail_raw(path: &Path, max_bytes: usize) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    let start = len.saturating_sub(max_bytes as u64);
    file.seek(SeekFrom::Start(start)).await?;

    let mut buf = Vec::with_capacity(max_bytes.min(len as usize));
    file.take(max_bytes as u64).read_to_end(&mut buf).await?;
    let text = String::from_utf8_lossy(&buf);

    // A mid-file start almost always lands inside a line.
    let text = if start > 0 {
        text.split_once('\n').map(|(_, rest)| rest).unwrap_or("")
    } else {
        &text
    };
    Ok(text.to_string())
}
