//! # Per-connection chain configuration.
//!
//! A [`ChainConfig`] is created by the caller for one connection attempt and
//! never mutated afterwards; adapters receive it by reference at start time.
//! Every block is optional: an absent block means the layer is not part of
//! this chain.
//!
//! ## Example
//! ```rust
//! use chainvisor::{ChainConfig, RoutingEngineConfig};
//!
//! let cfg = ChainConfig {
//!     name: "home".into(),
//!     routing_engine: Some(RoutingEngineConfig {
//!         binary: "/data/bin/xray".into(),
//!         config_path: "/data/cfg/xray.json".into(),
//!     }),
//!     ..ChainConfig::default()
//! };
//! assert!(cfg.validate().is_ok());
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Fingerprints the relay backend knows how to mimic.
const KNOWN_FINGERPRINTS: &[&str] = &[
    "chrome", "firefox", "safari", "ios", "android", "edge", "360", "qq", "random", "randomized",
];

/// TLS stack used by process-backed layers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsImplementation {
    /// The backend's built-in TLS.
    #[default]
    Native,
    /// BoringSSL-backed TLS.
    BoringSsl,
}

impl TlsImplementation {
    /// Value exported to backends in `TLS_IMPLEMENTATION`.
    pub fn as_env_value(&self) -> &'static str {
        match self {
            TlsImplementation::Native => "native",
            TlsImplementation::BoringSsl => "boringssl",
        }
    }
}

/// TLS-mimicking relay ("reality") settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Relay client executable.
    pub binary: PathBuf,
    /// Remote server host.
    pub server: String,
    /// Remote server port.
    pub port: u16,
    /// Client id presented to the server.
    pub uuid: String,
    /// SNI to present; defaults to `server` when empty.
    #[serde(default)]
    pub server_name: String,
    /// Server's x25519 public key (base64url).
    pub public_key: String,
    /// Short id (hex, up to 16 chars).
    #[serde(default)]
    pub short_id: String,
    /// TLS client fingerprint to mimic.
    #[serde(default = "default_fingerprint")]
    pub fingerprint: String,
    /// Local SOCKS listener port exposed to later layers.
    pub local_port: u16,
}

fn default_fingerprint() -> String {
    "chrome".to_string()
}

/// QUIC accelerator ("hysteria2") settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceleratorConfig {
    /// Accelerator executable; `None` when a non-process backend is wired in.
    #[serde(default)]
    pub binary: Option<PathBuf>,
    /// Remote server host.
    pub server: String,
    /// Remote server port.
    pub port: u16,
    /// Authentication secret.
    #[serde(default)]
    pub auth: String,
    /// Optional obfuscation password.
    #[serde(default)]
    pub obfs_password: Option<String>,
    /// Upstream bandwidth hint in Mbps (`0` = let congestion control decide).
    #[serde(default)]
    pub up_mbps: u32,
    /// Downstream bandwidth hint in Mbps.
    #[serde(default)]
    pub down_mbps: u32,
    /// Local SOCKS listener port.
    pub local_port: u16,
}

/// Shaper attachment mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShaperMode {
    /// Favor throughput: large bursts.
    #[default]
    Bulk,
    /// Favor latency: small bursts, strict pacing.
    Interactive,
}

/// Traffic shaper ("pepper") settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShaperConfig {
    /// Attachment mode.
    #[serde(default)]
    pub mode: ShaperMode,
    /// Target pacing rate in bits per second (`0` = unlimited).
    pub target_rate_bps: u64,
    /// Largest burst allowed before pacing kicks in.
    pub max_burst_bytes: u64,
    /// Halve the rate when loss is reported.
    #[serde(default)]
    pub loss_aware_backoff: bool,
    /// Enable pacing at all (disabled = pass-through accounting only).
    #[serde(default = "default_true")]
    pub enable_pacing: bool,
    /// Minimum gap between two paced packets, in microseconds.
    #[serde(default)]
    pub min_pacing_interval_us: u64,
}

fn default_true() -> bool {
    true
}

/// General-purpose routing engine ("xray") settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingEngineConfig {
    /// Engine executable.
    pub binary: PathBuf,
    /// JSON configuration consumed by the engine.
    pub config_path: PathBuf,
}

/// Immutable input to a chain start.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Logical name (used in logs and file names).
    #[serde(default)]
    pub name: String,
    /// Relay block.
    #[serde(default)]
    pub relay: Option<RelayConfig>,
    /// Accelerator block.
    #[serde(default)]
    pub accelerator: Option<AcceleratorConfig>,
    /// Shaper block.
    #[serde(default)]
    pub shaper: Option<ShaperConfig>,
    /// Routing engine block.
    #[serde(default)]
    pub routing_engine: Option<RoutingEngineConfig>,
    /// TLS implementation selector.
    #[serde(default)]
    pub tls: TlsImplementation,
}

/// Outcome of [`ChainConfig::validate`]: hard errors block a start, warnings do not.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidationReport {
    /// Problems that make the chain unstartable.
    pub errors: Vec<String>,
    /// Suspicious but tolerable settings.
    pub warnings: Vec<String>,
}

impl ValidationReport {
    /// True when there are no hard errors.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, layer: &str, msg: impl AsRef<str>) {
        self.errors.push(format!("{layer}: {}", msg.as_ref()));
    }

    fn warn(&mut self, layer: &str, msg: impl AsRef<str>) {
        self.warnings.push(format!("{layer}: {}", msg.as_ref()));
    }
}

impl ChainConfig {
    /// Parses a chain config handed over as JSON by the upstream converter.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Name used in logs and file names; `"default"` when unset.
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            "default"
        } else {
            &self.name
        }
    }

    /// Structural checks per layer.
    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::default();

        if self.relay.is_none() && self.routing_engine.is_none() {
            report.error("chain", "neither relay nor routing engine configured");
        }
        if self.name.trim().is_empty() {
            report.warn("chain", "no name given, using \"default\"");
        }

        if let Some(relay) = &self.relay {
            validate_relay(relay, &mut report);
        }
        if let Some(acc) = &self.accelerator {
            validate_accelerator(acc, &mut report);
            if self.relay.is_none() {
                report.warn("hysteria2", "no relay configured; accelerator connects directly");
            }
        }
        if let Some(shaper) = &self.shaper {
            validate_shaper(shaper, &mut report);
        }
        if let Some(engine) = &self.routing_engine {
            validate_engine(engine, &mut report);
        }

        if let (Some(relay), Some(acc)) = (&self.relay, &self.accelerator) {
            if relay.local_port != 0 && relay.local_port == acc.local_port {
                report.error("chain", format!("relay and accelerator share local port {}", relay.local_port));
            }
        }
        report
    }
}

fn validate_relay(relay: &RelayConfig, report: &mut ValidationReport) {
    const L: &str = "reality";
    if relay.binary.as_os_str().is_empty() {
        report.error(L, "binary path missing");
    }
    if relay.server.trim().is_empty() {
        report.error(L, "server missing");
    }
    if relay.port == 0 {
        report.error(L, "server port is 0");
    }
    if relay.uuid.trim().is_empty() {
        report.error(L, "uuid missing");
    }
    if relay.public_key.trim().is_empty() {
        report.error(L, "public key missing");
    }
    if relay.local_port == 0 {
        report.error(L, "local port is 0");
    }
    if relay.short_id.len() > 16 || !relay.short_id.chars().all(|c| c.is_ascii_hexdigit()) {
        report.error(L, "short id must be up to 16 hex characters");
    }
    if relay.server_name.trim().is_empty() {
        report.warn(L, "no server name; SNI falls back to server host");
    }
    if !KNOWN_FINGERPRINTS.contains(&relay.fingerprint.as_str()) {
        report.warn(L, format!("unknown fingerprint {:?}", relay.fingerprint));
    }
}

fn validate_accelerator(acc: &AcceleratorConfig, report: &mut ValidationReport) {
    const L: &str = "hysteria2";
    if acc.server.trim().is_empty() {
        report.error(L, "server missing");
    }
    if acc.port == 0 {
        report.error(L, "server port is 0");
    }
    if acc.local_port == 0 {
        report.error(L, "local port is 0");
    }
    if acc.auth.is_empty() {
        report.warn(L, "empty auth");
    }
    if acc.up_mbps == 0 || acc.down_mbps == 0 {
        report.warn(L, "no bandwidth hints; congestion control decides");
    }
}

fn validate_shaper(shaper: &ShaperConfig, report: &mut ValidationReport) {
    const L: &str = "pepper";
    if shaper.enable_pacing && shaper.target_rate_bps == 0 && shaper.min_pacing_interval_us == 0 {
        report.warn(L, "pacing enabled without a rate or interval; nothing is paced");
    }
    if shaper.target_rate_bps > 0 && shaper.max_burst_bytes == 0 {
        report.error(L, "max burst is 0; the token bucket can never fill");
    }
}

fn validate_engine(engine: &RoutingEngineConfig, report: &mut ValidationReport) {
    const L: &str = "xray";
    if engine.binary.as_os_str().is_empty() {
        report.error(L, "binary path missing");
    }
    if engine.config_path.as_os_str().is_empty() {
        report.error(L, "config path missing");
    } else if engine.config_path.extension().and_then(|e| e.to_str()) != Some("json") {
        report.warn(L, "config path does not end in .json");
    }
}
