//! # Layer adapters.
//!
//! One adapter per chain stage, all behind the uniform [`Layer`] contract:
//!
//! | kind              | name        | backing                       | class    |
//! |-------------------|-------------|-------------------------------|----------|
//! | [`RelayLayer`]    | `reality`   | external process              | critical |
//! | [`AcceleratorLayer`] | `hysteria2` | swappable [`AcceleratorBackend`] | optional |
//! | [`ShaperLayer`]   | `pepper`    | native handle ([`ShaperBackend`]) | optional |
//! | [`RoutingEngineLayer`] | `xray` | external process + route store | critical |
//!
//! Adapters never panic and never throw: every failure is a [`LayerError`]
//! value. `stop()` on a stopped layer succeeds.

mod accelerator;
mod process_slot;
mod relay;
mod routing_engine;
mod shaper;

use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use tokio_util::sync::CancellationToken;

use crate::config::{ChainConfig, RuntimeConfig};
use crate::error::LayerError;
use crate::events::Bus;

pub use accelerator::{AcceleratorBackend, AcceleratorLayer, ProcessAccelerator};
pub use relay::RelayLayer;
pub use routing_engine::RoutingEngineLayer;
pub use shaper::{PacingParams, PacingShaper, ShaperBackend, ShaperHandle, ShaperLayer, ShaperStats};

/// Chain stage, in start order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LayerKind {
    /// TLS-mimicking relay.
    Relay,
    /// QUIC accelerator.
    Accelerator,
    /// Traffic shaper.
    Shaper,
    /// General-purpose routing engine.
    RoutingEngine,
}

impl LayerKind {
    /// Start order; stop order is the reverse.
    pub const ORDER: [LayerKind; 4] = [
        LayerKind::Relay,
        LayerKind::Accelerator,
        LayerKind::Shaper,
        LayerKind::RoutingEngine,
    ];

    /// Status-map key.
    pub fn name(&self) -> &'static str {
        match self {
            LayerKind::Relay => "reality",
            LayerKind::Accelerator => "hysteria2",
            LayerKind::Shaper => "pepper",
            LayerKind::RoutingEngine => "xray",
        }
    }

    /// Whether a failure of this stage aborts the chain.
    pub fn is_critical(&self) -> bool {
        matches!(self, LayerKind::Relay | LayerKind::RoutingEngine)
    }

    /// Whether `cfg` carries a block for this stage.
    pub fn is_configured(&self, cfg: &ChainConfig) -> bool {
        match self {
            LayerKind::Relay => cfg.relay.is_some(),
            LayerKind::Accelerator => cfg.accelerator.is_some(),
            LayerKind::Shaper => cfg.shaper.is_some(),
            LayerKind::RoutingEngine => cfg.routing_engine.is_some(),
        }
    }
}

/// Username/password pair guarding a local listener.
#[derive(Clone, PartialEq, Eq)]
pub struct LocalCredential {
    /// SOCKS username.
    pub username: String,
    /// SOCKS password.
    pub password: String,
}

impl std::fmt::Debug for LocalCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCredential")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Socket descriptors a native shaper can attach to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SocketPair {
    /// Descriptor the shaper reads from.
    pub read_fd: RawFd,
    /// Descriptor the shaper writes to.
    pub write_fd: RawFd,
}

/// Local listener a started layer exposes to the layers after it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    /// Listener address.
    pub addr: SocketAddr,
    /// Credential required by the listener, if any.
    pub credential: Option<LocalCredential>,
    /// Underlying descriptors, when the layer can hand them out.
    pub fds: Option<SocketPair>,
}

impl Endpoint {
    /// Loopback endpoint without auth or descriptors.
    pub fn local(port: u16) -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
            credential: None,
            fds: None,
        }
    }
}

/// Byte counters of one layer since it started.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LayerMetrics {
    /// Bytes sent towards the remote.
    pub bytes_up: u64,
    /// Bytes received from the remote.
    pub bytes_down: u64,
}

/// Health snapshot of one layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LayerHealth {
    /// Not started (or stopped).
    Stopped,
    /// Up and serving.
    Running,
    /// Started but idle, with the reason.
    Standby(String),
    /// Backing process crashed; relaunch `attempt` pending.
    Restarting {
        /// Retry number.
        attempt: u32,
    },
    /// Gave up; the message says why.
    Failed(String),
}

impl LayerHealth {
    /// Whether the layer counts as running in the chain status.
    pub fn is_up(&self) -> bool {
        matches!(
            self,
            LayerHealth::Running | LayerHealth::Standby(_) | LayerHealth::Restarting { .. }
        )
    }
}

/// Session-secret operations backed by the platform's crypto library.
///
/// Layers only ever hold opaque outputs; key material stays behind this trait.
pub trait CryptoProvider: Send + Sync + 'static {
    /// `len` random bytes.
    fn random_bytes(&self, len: usize) -> Result<Vec<u8>, LayerError>;
    /// Derives `len` bytes of key material (HKDF-style).
    fn derive_key(&self, secret: &[u8], salt: &[u8], info: &[u8], len: usize) -> Result<Vec<u8>, LayerError>;
    /// AEAD encrypt.
    fn seal(&self, key: &[u8], nonce: &[u8], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, LayerError>;
    /// AEAD decrypt.
    fn open(&self, key: &[u8], nonce: &[u8], aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, LayerError>;
}

/// Per-session credential for a loopback listener, minted from the crypto
/// provider. Without a provider the listener stays unauthenticated.
pub(crate) fn session_credential(ctx: &LayerContext) -> Result<Option<LocalCredential>, LayerError> {
    let Some(crypto) = ctx.crypto.as_deref() else {
        return Ok(None);
    };
    let secret = crypto.random_bytes(16)?;
    Ok(Some(LocalCredential {
        username: "chain".to_string(),
        password: URL_SAFE_NO_PAD.encode(secret),
    }))
}

/// Everything a layer needs from its chain, handed over by `init`.
#[derive(Clone)]
pub struct LayerContext {
    /// Chain work directory.
    pub work_dir: PathBuf,
    /// Runtime tunables.
    pub runtime: RuntimeConfig,
    /// Event bus of the chain.
    pub bus: Bus,
    /// Crypto backend, if the platform provides one.
    pub crypto: Option<Arc<dyn CryptoProvider>>,
    /// Cancelled when the chain shuts down; processes run under child tokens.
    pub token: CancellationToken,
}

impl LayerContext {
    /// Per-layer directory under the work dir.
    pub fn layer_dir(&self, kind: LayerKind) -> PathBuf {
        self.work_dir.join(kind.name())
    }
}

/// Uniform contract of a chain stage.
///
/// `metrics` and `health` are snapshot reads and never wait on the layer's
/// start/stop path.
#[async_trait]
pub trait Layer: Send + Sync + 'static {
    /// Stage this adapter implements.
    fn kind(&self) -> LayerKind;

    /// Whether a failure aborts the chain (defaults to the stage's class).
    fn is_critical(&self) -> bool {
        self.kind().is_critical()
    }

    /// One-time setup; later calls are no-ops.
    async fn init(&self, ctx: &LayerContext) -> Result<(), LayerError>;

    /// Starts the stage, chaining through `upstream` when given.
    async fn start(&self, cfg: &ChainConfig, upstream: Option<Endpoint>) -> Result<(), LayerError>;

    /// Stops the stage. Idempotent.
    async fn stop(&self) -> Result<(), LayerError>;

    /// Listener exposed to later stages, while running.
    fn endpoint(&self) -> Option<Endpoint>;

    /// Byte counters.
    fn metrics(&self) -> Result<LayerMetrics, LayerError>;

    /// Health snapshot.
    fn health(&self) -> LayerHealth;
}

/// The adapters a chain drives, one optional slot per stage.
#[derive(Clone, Default)]
pub struct LayerSet {
    /// Relay adapter.
    pub relay: Option<Arc<dyn Layer>>,
    /// Accelerator adapter.
    pub accelerator: Option<Arc<dyn Layer>>,
    /// Shaper adapter.
    pub shaper: Option<Arc<dyn Layer>>,
    /// Routing engine adapter.
    pub routing_engine: Option<Arc<dyn Layer>>,
}

impl LayerSet {
    /// Adapter for `kind`, if one is installed.
    pub fn get(&self, kind: LayerKind) -> Option<&Arc<dyn Layer>> {
        match kind {
            LayerKind::Relay => self.relay.as_ref(),
            LayerKind::Accelerator => self.accelerator.as_ref(),
            LayerKind::Shaper => self.shaper.as_ref(),
            LayerKind::RoutingEngine => self.routing_engine.as_ref(),
        }
    }

    /// Installs `layer` in the slot of its kind.
    pub fn with(mut self, layer: Arc<dyn Layer>) -> Self {
        let slot = match layer.kind() {
            LayerKind::Relay => &mut self.relay,
            LayerKind::Accelerator => &mut self.accelerator,
            LayerKind::Shaper => &mut self.shaper,
            LayerKind::RoutingEngine => &mut self.routing_engine,
        };
        *slot = Some(layer);
        self
    }

    /// Installed adapters in start order.
    pub fn in_order(&self) -> impl Iterator<Item = (LayerKind, &Arc<dyn Layer>)> {
        LayerKind::ORDER
            .into_iter()
            .filter_map(|k| self.get(k).map(|l| (k, l)))
    }
}
