//! Traffic shaper ("pepper"), backed by a native handle instead of a process.
//!
//! ```text
//! start(cfg, upstream)
//!   ├─► upstream carries fds ─► backend.attach(fds, mode, params) ─► Running
//!   └─► no fds               ─► Standby (nothing to shape)
//! stop()
//!   └─► backend.detach(handle)
//! ```
//!
//! [`PacingShaper`] is the stock backend: one token bucket per handle,
//! refilled at `target_rate_bps`, capped at `max_burst_bytes`, with an
//! optional loss-aware pause after each send.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::config::{ChainConfig, ShaperConfig, ShaperMode};
use crate::error::LayerError;
use crate::layers::{
    Endpoint, Layer, LayerContext, LayerHealth, LayerKind, LayerMetrics, SocketPair,
};

/// Loss rate above which a loss-aware shaper pauses after a send.
const LOSS_THRESHOLD: f32 = 0.1;
/// RTT assumed for backoff before any estimate arrives.
const DEFAULT_RTT: Duration = Duration::from_millis(100);

/// Pacing knobs handed to a backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacingParams {
    /// Target rate in bits per second (`0` = unlimited).
    pub target_rate_bps: u64,
    /// Bucket size in bytes.
    pub max_burst_bytes: u64,
    /// Pause after sends while loss is high.
    pub loss_aware_backoff: bool,
    /// `false` turns the shaper into a pass-through counter.
    pub enable_pacing: bool,
    /// Minimum gap between two sends.
    pub min_interval: Duration,
}

impl From<&ShaperConfig> for PacingParams {
    fn from(cfg: &ShaperConfig) -> Self {
        Self {
            target_rate_bps: cfg.target_rate_bps,
            max_burst_bytes: cfg.max_burst_bytes,
            loss_aware_backoff: cfg.loss_aware_backoff,
            enable_pacing: cfg.enable_pacing,
            min_interval: Duration::from_micros(cfg.min_pacing_interval_us),
        }
    }
}

/// Opaque id of one attachment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ShaperHandle(u64);

/// Counters of one attachment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShaperStats {
    /// Bytes sent upstream.
    pub bytes_up: u64,
    /// Bytes received.
    pub bytes_down: u64,
    /// Sends the pacing gate held back.
    pub deferred: u64,
}

/// Native shaping engine.
pub trait ShaperBackend: Send + Sync + 'static {
    /// Starts shaping the descriptor pair.
    fn attach(&self, fds: SocketPair, mode: ShaperMode, params: PacingParams) -> Result<ShaperHandle, LayerError>;
    /// Stops shaping; unknown handles are ignored.
    fn detach(&self, handle: ShaperHandle) -> Result<(), LayerError>;
    /// Retunes a live attachment.
    fn update_params(&self, handle: ShaperHandle, params: PacingParams) -> Result<(), LayerError>;
    /// Counters of a live attachment.
    fn stats(&self, handle: ShaperHandle) -> Result<ShaperStats, LayerError>;
}

#[derive(Debug)]
struct PacingState {
    mode: ShaperMode,
    params: PacingParams,
    tokens: u64,
    last_refill: Instant,
    next_send: Instant,
    loss_rate: f32,
    rtt: Duration,
    backoff_until: Option<Instant>,
    stats: ShaperStats,
}

impl PacingState {
    fn new(mode: ShaperMode, params: PacingParams, now: Instant) -> Self {
        Self {
            mode,
            params,
            tokens: params.max_burst_bytes,
            last_refill: now,
            next_send: now,
            loss_rate: 0.0,
            rtt: Duration::ZERO,
            backoff_until: None,
            stats: ShaperStats::default(),
        }
    }

    fn can_send(&mut self, size: u64, now: Instant) -> bool {
        if !self.params.enable_pacing {
            return true;
        }
        match self.backoff_until {
            Some(until) if now < until => return false,
            _ => self.backoff_until = None,
        }
        if now < self.next_send {
            return false;
        }
        let rate = self.params.target_rate_bps;
        if rate > 0 {
            let elapsed = now.saturating_duration_since(self.last_refill);
            let refill = (elapsed.as_nanos() * u128::from(rate) / 8_000_000_000) as u64;
            self.tokens = self
                .tokens
                .saturating_add(refill)
                .min(self.params.max_burst_bytes);
            self.last_refill = now;
            if self.tokens < size {
                return false;
            }
        }
        true
    }

    fn on_sent(&mut self, size: u64, now: Instant) {
        self.stats.bytes_up = self.stats.bytes_up.saturating_add(size);
        if !self.params.enable_pacing {
            return;
        }
        let rate = self.params.target_rate_bps;
        let gap = if rate > 0 {
            self.tokens = self.tokens.saturating_sub(size);
            let nanos = u128::from(size) * 8_000_000_000 / u128::from(rate);
            Duration::from_nanos(nanos.min(u128::from(u64::MAX)) as u64).max(self.params.min_interval)
        } else {
            self.params.min_interval
        };
        self.next_send = now + gap;

        if self.params.loss_aware_backoff && self.loss_rate > LOSS_THRESHOLD {
            let rtt = if self.rtt.is_zero() { DEFAULT_RTT } else { self.rtt };
            self.backoff_until = Some(now + rtt.mul_f32(1.0 + self.loss_rate * 10.0));
        }
    }
}

/// Token-bucket pacer, one state per attachment.
#[derive(Default)]
pub struct PacingShaper {
    handles: DashMap<u64, Mutex<PacingState>>,
    next_id: AtomicU64,
}

impl PacingShaper {
    /// Backend with no attachments.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, handle: ShaperHandle, f: impl FnOnce(&mut PacingState) -> T) -> Result<T, LayerError> {
        let entry = self
            .handles
            .get(&handle.0)
            .ok_or_else(|| LayerError::Unavailable(format!("pepper: unknown handle {}", handle.0)))?;
        let mut state = entry.lock();
        Ok(f(&mut state))
    }

    /// Pacing gate for a `size`-byte send at `now`. Held-back sends are counted.
    pub fn can_send(&self, handle: ShaperHandle, size: u64, now: Instant) -> Result<bool, LayerError> {
        self.with_state(handle, |s| {
            let ok = s.can_send(size, now);
            if !ok {
                s.stats.deferred += 1;
            }
            ok
        })
    }

    /// Accounts a completed send.
    pub fn on_sent(&self, handle: ShaperHandle, size: u64, now: Instant) -> Result<(), LayerError> {
        self.with_state(handle, |s| s.on_sent(size, now))
    }

    /// Accounts received bytes.
    pub fn on_received(&self, handle: ShaperHandle, size: u64) -> Result<(), LayerError> {
        self.with_state(handle, |s| {
            s.stats.bytes_down = s.stats.bytes_down.saturating_add(size)
        })
    }

    /// Feeds a loss/RTT estimate into the backoff logic.
    pub fn report_path(&self, handle: ShaperHandle, loss_rate: f32, rtt: Duration) -> Result<(), LayerError> {
        self.with_state(handle, |s| {
            s.loss_rate = loss_rate.clamp(0.0, 1.0);
            s.rtt = rtt;
        })
    }

    /// Mode the handle was attached with.
    pub fn mode(&self, handle: ShaperHandle) -> Result<ShaperMode, LayerError> {
        self.with_state(handle, |s| s.mode)
    }

    /// Live attachments.
    pub fn attached(&self) -> usize {
        self.handles.len()
    }
}

impl ShaperBackend for PacingShaper {
    fn attach(&self, fds: SocketPair, mode: ShaperMode, params: PacingParams) -> Result<ShaperHandle, LayerError> {
        if fds.read_fd < 0 || fds.write_fd < 0 {
            return Err(LayerError::ConfigInvalid(format!(
                "pepper: invalid descriptors read={} write={}",
                fds.read_fd, fds.write_fd
            )));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.handles
            .insert(id, Mutex::new(PacingState::new(mode, params, Instant::now())));
        tracing::debug!(layer = "pepper", handle = id, read_fd = fds.read_fd, write_fd = fds.write_fd, ?mode, "shaper attached");
        Ok(ShaperHandle(id))
    }

    fn detach(&self, handle: ShaperHandle) -> Result<(), LayerError> {
        if self.handles.remove(&handle.0).is_some() {
            tracing::debug!(layer = "pepper", handle = handle.0, "shaper detached");
        }
        Ok(())
    }

    fn update_params(&self, handle: ShaperHandle, params: PacingParams) -> Result<(), LayerError> {
        self.with_state(handle, |s| {
            s.params = params;
            s.tokens = s.tokens.min(params.max_burst_bytes);
        })
    }

    fn stats(&self, handle: ShaperHandle) -> Result<ShaperStats, LayerError> {
        self.with_state(handle, |s| s.stats)
    }
}

/// Shaper adapter.
pub struct ShaperLayer {
    ctx: OnceLock<LayerContext>,
    backend: Arc<dyn ShaperBackend>,
    handle: Mutex<Option<ShaperHandle>>,
    health: Mutex<LayerHealth>,
}

impl ShaperLayer {
    /// Adapter over `backend`.
    pub fn new(backend: Arc<dyn ShaperBackend>) -> Self {
        Self {
            ctx: OnceLock::new(),
            backend,
            handle: Mutex::new(None),
            health: Mutex::new(LayerHealth::Stopped),
        }
    }

    /// Adapter over a fresh [`PacingShaper`].
    pub fn pacing() -> Self {
        Self::new(Arc::new(PacingShaper::new()))
    }

    /// Retunes the live attachment, if any.
    pub fn update_params(&self, cfg: &ShaperConfig) -> Result<(), LayerError> {
        match *self.handle.lock() {
            Some(handle) => self.backend.update_params(handle, cfg.into()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Layer for ShaperLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Shaper
    }

    async fn init(&self, ctx: &LayerContext) -> Result<(), LayerError> {
        let _ = self.ctx.set(ctx.clone());
        Ok(())
    }

    async fn start(&self, cfg: &ChainConfig, upstream: Option<Endpoint>) -> Result<(), LayerError> {
        if self.ctx.get().is_none() {
            return Err(LayerError::Unavailable("pepper: not initialized".into()));
        }
        let shaper = cfg.shaper.as_ref().ok_or(LayerError::NotConfigured)?;
        self.stop().await?;

        let Some(fds) = upstream.and_then(|e| e.fds) else {
            tracing::info!(layer = "pepper", "no upstream descriptors; shaper on standby");
            *self.health.lock() = LayerHealth::Standby("no upstream socket descriptors".into());
            return Ok(());
        };
        let handle = self.backend.attach(fds, shaper.mode, shaper.into())?;
        *self.handle.lock() = Some(handle);
        *self.health.lock() = LayerHealth::Running;
        Ok(())
    }

    async fn stop(&self) -> Result<(), LayerError> {
        let handle = self.handle.lock().take();
        *self.health.lock() = LayerHealth::Stopped;
        match handle {
            Some(handle) => self.backend.detach(handle),
            None => Ok(()),
        }
    }

    fn endpoint(&self) -> Option<Endpoint> {
        None
    }

    fn metrics(&self) -> Result<LayerMetrics, LayerError> {
        match *self.handle.lock() {
            Some(handle) => {
                let stats = self.backend.stats(handle)?;
                Ok(LayerMetrics {
                    bytes_up: stats.bytes_up,
                    bytes_down: stats.bytes_down,
                })
            }
            None => Ok(LayerMetrics::default()),
        }
    }

    fn health(&self) -> LayerHealth {
        self.health.lock().clone()
    }
}
