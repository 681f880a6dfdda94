//! Follows a process log file and forwards new lines to `tracing`.
//!
//! Polls with a fixed interval and a bounded read per poll, so a chatty
//! backend can never stall the loop. Truncation (log rotation by the
//! backend) rewinds to the start of the file.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;

use crate::process::sanitize::sanitize;

/// Upper bound on bytes consumed per poll.
const READ_LIMIT: u64 = 64 * 1024;

/// Log follower for one process.
pub struct LogTail {
    layer: String,
    path: PathBuf,
    interval: Duration,
    offset: u64,
    partial: String,
}

impl LogTail {
    /// Follows `path` from its current end.
    pub fn new(layer: impl Into<String>, path: impl Into<PathBuf>, interval: Duration) -> Self {
        let path = path.into();
        let offset = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        Self {
            layer: layer.into(),
            path,
            interval: interval.max(Duration::from_millis(10)),
            offset,
            partial: String::new(),
        }
    }

    /// Runs until cancelled.
    pub async fn run(mut self, token: CancellationToken) {
        loop {
            select! {
                _ = time::sleep(self.interval) => {}
                _ = token.cancelled() => break,
            }
            match self.poll().await {
                Ok(lines) => {
                    for line in lines {
                        tracing::debug!(target: "chainvisor::process", layer = %self.layer, "{line}");
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::debug!(layer = %self.layer, error = %e, "log poll failed");
                }
            }
        }
    }

    /// Reads what was appended since the last poll and returns complete,
    /// sanitized lines.
    pub(crate) async fn poll(&mut self) -> std::io::Result<Vec<String>> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        let len = file.metadata().await?.len();
        if len < self.offset {
            self.offset = 0;
            self.partial.clear();
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::new();
        let read = file.take(READ_LIMIT).read_to_end(&mut buf).await?;
        self.offset += read as u64;

        self.partial.push_str(&String::from_utf8_lossy(&buf));
        let mut lines = Vec::new();
        while let Some(pos) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=pos).collect();
            let line = line.trim_end();
            if !line.is_empty() {
                lines.push(sanitize(line));
            }
        }
        Ok(lines)
    }
}
