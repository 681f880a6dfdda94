//! Control channel over a Unix domain socket, one JSON object per line.
//!
//! ```text
//! data plane → core:  {"type":"connected"}
//!                     {"type":"disconnected"}
//!                     {"type":"error","message":"tun read failed"}
//!                     {"type":"traffic","up":1024,"down":8192}
//! core → data plane:  {"type":"register","id":3}
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::OwnedWriteHalf;
use tokio_util::sync::CancellationToken;

use crate::error::ChannelError;
use crate::routing::channel::{ChannelCallback, ChannelConnector, ControlChannel};

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Message {
    Connected,
    Disconnected,
    Error { message: String },
    Traffic { up: u64, down: u64 },
    Register { id: u64 },
}

type Callbacks = Arc<RwLock<Vec<Arc<dyn ChannelCallback>>>>;

/// Connects to a data plane listening on a Unix socket.
#[derive(Clone, Debug)]
pub struct UnixChannelConnector {
    path: PathBuf,
}

impl UnixChannelConnector {
    /// Connector for the socket at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ChannelConnector for UnixChannelConnector {
    async fn connect(&self) -> Result<Arc<dyn ControlChannel>, ChannelError> {
        let stream = UnixStream::connect(&self.path)
            .await
            .map_err(|e| ChannelError::ConnectFailed(format!("{}: {e}", self.path.display())))?;
        let (read, write) = stream.into_split();

        let callbacks: Callbacks = Arc::default();
        let dead = CancellationToken::new();
        tokio::spawn(read_loop(BufReader::new(read), Arc::clone(&callbacks), dead.clone()));

        Ok(Arc::new(UnixChannel {
            writer: tokio::sync::Mutex::new(write),
            callbacks,
            dead,
        }))
    }
}

async fn read_loop(
    mut reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    callbacks: Callbacks,
    dead: CancellationToken,
) {
    let mut line = String::new();
    loop {
        line.clear();
        let read = tokio::select! {
            r = reader.read_line(&mut line) => r,
            _ = dead.cancelled() => break,
        };
        match read {
            Ok(0) => break,
            Ok(_) => dispatch(line.trim(), &callbacks),
            Err(e) => {
                tracing::debug!(error = %e, "control channel read failed");
                break;
            }
        }
    }
    dead.cancel();
}

fn dispatch(line: &str, callbacks: &Callbacks) {
    if line.is_empty() {
        return;
    }
    let msg = match serde_json::from_str::<Message>(line) {
        Ok(msg) => msg,
        Err(e) => {
            let err = ChannelError::Protocol(e.to_string());
            for cb in callbacks.read().iter() {
                cb.on_error(&err);
            }
            return;
        }
    };
    for cb in callbacks.read().iter() {
        match &msg {
            Message::Connected => cb.on_connected(),
            Message::Disconnected => cb.on_disconnected(),
            Message::Error { message } => cb.on_error(&ChannelError::Protocol(message.clone())),
            Message::Traffic { up, down } => cb.on_traffic(*up, *down),
            Message::Register { .. } => {}
        }
    }
}

struct UnixChannel {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    callbacks: Callbacks,
    dead: CancellationToken,
}

#[async_trait]
impl ControlChannel for UnixChannel {
    async fn register(&self, callback: Arc<dyn ChannelCallback>) -> Result<(), ChannelError> {
        if self.dead.is_cancelled() {
            return Err(ChannelError::Disconnected);
        }
        let id = {
            let mut callbacks = self.callbacks.write();
            callbacks.push(callback);
            callbacks.len() as u64
        };
        let mut line = serde_json::to_string(&Message::Register { id })
            .map_err(|e| ChannelError::Protocol(e.to_string()))?;
        line.push('\n');
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            self.dead.cancel();
            tracing::debug!(error = %e, "control channel write failed");
            return Err(ChannelError::Disconnected);
        }
        Ok(())
    }

    async fn closed(&self) {
        self.dead.cancelled().await;
    }

    fn is_alive(&self) -> bool {
        !self.dead.is_cancelled()
    }
}

impl Drop for UnixChannel {
    fn drop(&mut self) {
        self.dead.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use tokio::net::UnixListener;

    #[derive(Default)]
    struct Counter {
        up: AtomicU64,
        down: AtomicU64,
        errors: AtomicU64,
    }

    impl ChannelCallback for Counter {
        fn on_traffic(&self, up: u64, down: u64) {
            self.up.fetch_add(up, Ordering::SeqCst);
            self.down.fetch_add(down, Ordering::SeqCst);
        }
        fn on_error(&self, _error: &ChannelError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn traffic_flows_and_close_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("dataplane.sock");
        let listener = UnixListener::bind(&sock).unwrap();

        let channel = UnixChannelConnector::new(&sock).connect().await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let (server_read, mut server_write) = server.into_split();

        let counter = Arc::new(Counter::default());
        channel.register(counter.clone()).await.unwrap();

        let mut lines = BufReader::new(server_read).lines();
        let hello = lines.next_line().await.unwrap().unwrap();
        assert_eq!(serde_json::from_str::<Message>(&hello).unwrap(), Message::Register { id: 1 });

        server_write
            .write_all(b"{\"type\":\"traffic\",\"up\":10,\"down\":20}\nnot json\n{\"type\":\"traffic\",\"up\":1,\"down\":2}\n")
            .await
            .unwrap();
        drop(server_write);
        drop(lines);

        tokio::time::timeout(Duration::from_secs(5), channel.closed())
            .await
            .expect("close detected");
        assert!(!channel.is_alive());
        assert_eq!(counter.up.load(Ordering::SeqCst), 11);
        assert_eq!(counter.down.load(Ordering::SeqCst), 22);
        assert_eq!(counter.errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_socket_fails_to_connect() {
        let dir = tempfile::tempdir().unwrap();
        let res = UnixChannelConnector::new(dir.path().join("nope.sock")).connect().await;
        assert!(matches!(res, Err(ChannelError::ConnectFailed(_))));
    }
}
