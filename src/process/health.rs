//! Liveness probes for running backends.
//!
//! A probe that fails `health_failure_threshold` times in a row asks the
//! process monitor to recycle the process; the restart itself goes through
//! the monitor's normal crash path and counts against the retry budget.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::{select, time};
use tokio_util::sync::CancellationToken;

use crate::config::ProcessConfig;
use crate::events::{Bus, Event, EventKind};

/// One health check against a running backend.
#[async_trait]
pub trait HealthProbe: Send + Sync + 'static {
    /// `Ok` when the backend answered.
    async fn probe(&self) -> Result<(), String>;
}

/// Connects to a local TCP listener.
#[derive(Clone, Debug)]
pub struct TcpProbe {
    addr: SocketAddr,
    timeout: Duration,
}

impl TcpProbe {
    /// Probe for `addr` with a per-attempt timeout.
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self { addr, timeout }
    }
}

#[async_trait]
impl HealthProbe for TcpProbe {
    async fn probe(&self) -> Result<(), String> {
        match time::timeout(self.timeout, tokio::net::TcpStream::connect(self.addr)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(format!("connect {}: {e}", self.addr)),
            Err(_) => Err(format!("connect {}: timed out", self.addr)),
        }
    }
}

pub(crate) struct HealthLoop {
    layer: String,
    probe: Box<dyn HealthProbe>,
    interval: Duration,
    threshold: u32,
    recycle: mpsc::Sender<()>,
    bus: Bus,
}

impl HealthLoop {
    pub(crate) fn new(
        layer: &str,
        probe: Box<dyn HealthProbe>,
        cfg: &ProcessConfig,
        recycle: mpsc::Sender<()>,
        bus: Bus,
    ) -> Option<Self> {
        Some(Self {
            layer: layer.to_string(),
            probe,
            interval: cfg.health_interval()?,
            threshold: cfg.health_threshold_clamped(),
            recycle,
            bus,
        })
    }

    pub(crate) async fn run(self, token: CancellationToken) {
        let mut failures: u32 = 0;
        loop {
            select! {
                _ = time::sleep(self.interval) => {}
                _ = token.cancelled() => break,
            }
            let outcome = select! {
                r = self.probe.probe() => r,
                _ = token.cancelled() => break,
            };
            match outcome {
                Ok(()) => failures = 0,
                Err(reason) => {
                    failures += 1;
                    tracing::warn!(layer = %self.layer, failures, %reason, "health probe failed");
                    self.bus.publish(
                        Event::new(EventKind::HealthCheckFailed)
                            .with_layer(self.layer.as_str())
                            .with_attempt(failures)
                            .with_reason(reason),
                    );
                    if failures >= self.threshold {
                        failures = 0;
                        if self.recycle.send(()).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky(Arc<AtomicU32>);

    #[async_trait]
    impl HealthProbe for Flaky {
        async fn probe(&self) -> Result<(), String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err("refused".into())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn recycles_after_threshold() {
        let calls = Arc::new(AtomicU32::new(0));
        let (tx, mut rx) = mpsc::channel(1);
        let cfg = ProcessConfig {
            health_interval: Duration::from_secs(1),
            health_failure_threshold: 3,
            ..ProcessConfig::default()
        };
        let hl = HealthLoop::new("xray", Box::new(Flaky(calls.clone())), &cfg, tx, Bus::new(16)).unwrap();
        let token = CancellationToken::new();
        let task = tokio::spawn(hl.run(token.clone()));

        rx.recv().await.expect("recycle request");
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        token.cancel();
        task.await.unwrap();
    }

    #[test]
    fn disabled_when_interval_is_zero() {
        let (tx, _rx) = mpsc::channel(1);
        let cfg = ProcessConfig {
            health_interval: Duration::ZERO,
            ..ProcessConfig::default()
        };
        assert!(HealthLoop::new("xray", Box::new(TcpProbe::new(([127, 0, 0, 1], 1).into(), Duration::from_millis(1))), &cfg, tx, Bus::new(1)).is_none());
    }

    #[tokio::test]
    async fn tcp_probe_reports_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let probe = TcpProbe::new(addr, Duration::from_secs(1));
        assert!(probe.probe().await.is_ok());
        drop(listener);
        assert!(probe.probe().await.is_err());
    }
}
