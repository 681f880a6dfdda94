//! QUIC accelerator ("hysteria2").
//!
//! The accelerator's wire protocol is owned by its backend, not by this
//! crate. [`AcceleratorLayer`] only sequences a swappable
//! [`AcceleratorBackend`]; [`ProcessAccelerator`] is the stock backend that
//! runs an external client binary and hands it the upstream endpoint through
//! its config file.

use std::ffi::OsString;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::config::{AcceleratorConfig, ChainConfig, TlsImplementation};
use crate::error::LayerError;
use crate::layers::process_slot::{self, ProcessSlot};
use crate::layers::{
    Endpoint, Layer, LayerContext, LayerHealth, LayerKind, LayerMetrics, LocalCredential,
    session_credential,
};
use crate::process::TcpProbe;

/// Engine behind the accelerator layer.
///
/// # Example
/// ```rust
/// use std::sync::Arc;
/// use async_trait::async_trait;
/// use chainvisor::{
///     AcceleratorBackend, AcceleratorConfig, AcceleratorLayer, Endpoint, LayerContext,
///     LayerError, LayerHealth, LayerMetrics, TlsImplementation,
/// };
///
/// struct Loopback;
///
/// #[async_trait]
/// impl AcceleratorBackend for Loopback {
///     async fn start(
///         &self,
///         _ctx: &LayerContext,
///         cfg: &AcceleratorConfig,
///         _tls: TlsImplementation,
///         _upstream: Option<Endpoint>,
///     ) -> Result<Endpoint, LayerError> {
///         Ok(Endpoint::local(cfg.local_port))
///     }
///     async fn stop(&self) -> Result<(), LayerError> { Ok(()) }
///     fn metrics(&self) -> Result<LayerMetrics, LayerError> { Ok(LayerMetrics::default()) }
///     fn health(&self) -> LayerHealth { LayerHealth::Running }
/// }
///
/// let layer = AcceleratorLayer::new(Arc::new(Loopback));
/// ```
#[async_trait]
pub trait AcceleratorBackend: Send + Sync + 'static {
    /// Brings the accelerator up and returns the listener it exposes.
    async fn start(
        &self,
        ctx: &LayerContext,
        cfg: &AcceleratorConfig,
        tls: TlsImplementation,
        upstream: Option<Endpoint>,
    ) -> Result<Endpoint, LayerError>;

    /// Tears it down. Must succeed when already stopped.
    async fn stop(&self) -> Result<(), LayerError>;

    /// Byte counters.
    fn metrics(&self) -> Result<LayerMetrics, LayerError>;

    /// Health snapshot.
    fn health(&self) -> LayerHealth;
}

/// Accelerator adapter over any [`AcceleratorBackend`].
pub struct AcceleratorLayer {
    ctx: OnceLock<LayerContext>,
    backend: Arc<dyn AcceleratorBackend>,
    endpoint: Mutex<Option<Endpoint>>,
}

impl AcceleratorLayer {
    /// Adapter over `backend`.
    pub fn new(backend: Arc<dyn AcceleratorBackend>) -> Self {
        Self {
            ctx: OnceLock::new(),
            backend,
            endpoint: Mutex::new(None),
        }
    }

    /// Adapter over the stock process backend.
    pub fn process() -> Self {
        Self::new(Arc::new(ProcessAccelerator::new()))
    }
}

#[async_trait]
impl Layer for AcceleratorLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Accelerator
    }

    async fn init(&self, ctx: &LayerContext) -> Result<(), LayerError> {
        let _ = self.ctx.set(ctx.clone());
        Ok(())
    }

    async fn start(&self, cfg: &ChainConfig, upstream: Option<Endpoint>) -> Result<(), LayerError> {
        let ctx = self
            .ctx
            .get()
            .ok_or_else(|| LayerError::Unavailable("hysteria2: not initialized".into()))?;
        let acc = cfg.accelerator.as_ref().ok_or(LayerError::NotConfigured)?;
        self.stop().await?;

        let endpoint = self.backend.start(ctx, acc, cfg.tls, upstream).await?;
        tracing::info!(layer = "hysteria2", addr = %endpoint.addr, "accelerator listening");
        *self.endpoint.lock() = Some(endpoint);
        Ok(())
    }

    async fn stop(&self) -> Result<(), LayerError> {
        *self.endpoint.lock() = None;
        self.backend.stop().await
    }

    fn endpoint(&self) -> Option<Endpoint> {
        self.endpoint.lock().clone()
    }

    fn metrics(&self) -> Result<LayerMetrics, LayerError> {
        self.backend.metrics()
    }

    fn health(&self) -> LayerHealth {
        self.backend.health()
    }
}

fn client_config(
    acc: &AcceleratorConfig,
    credential: Option<&LocalCredential>,
    upstream: Option<&Endpoint>,
) -> Value {
    let mut socks = json!({ "listen": format!("127.0.0.1:{}", acc.local_port) });
    if let Some(c) = credential {
        socks["username"] = json!(c.username);
        socks["password"] = json!(c.password);
    }

    let mut doc = json!({
        "server": format!("{}:{}", acc.server, acc.port),
        "auth": acc.auth,
        "socks5": socks,
    });
    if let Some(password) = acc.obfs_password.as_deref().filter(|p| !p.is_empty()) {
        doc["obfs"] = json!({ "type": "salamander", "salamander": { "password": password } });
    }
    if acc.up_mbps > 0 || acc.down_mbps > 0 {
        doc["bandwidth"] = json!({
            "up": format!("{} mbps", acc.up_mbps),
            "down": format!("{} mbps", acc.down_mbps),
        });
    }
    if let Some(up) = upstream {
        let mut hop = json!({ "type": "socks5", "addr": up.addr.to_string() });
        if let Some(c) = &up.credential {
            hop["username"] = json!(c.username);
            hop["password"] = json!(c.password);
        }
        doc["upstream"] = hop;
    }
    doc
}

/// Stock backend: runs the accelerator client binary from the config.
pub struct ProcessAccelerator {
    process: ProcessSlot,
}

impl ProcessAccelerator {
    /// Idle backend.
    pub fn new() -> Self {
        Self {
            process: ProcessSlot::new(),
        }
    }
}

impl Default for ProcessAccelerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AcceleratorBackend for ProcessAccelerator {
    async fn start(
        &self,
        ctx: &LayerContext,
        cfg: &AcceleratorConfig,
        tls: TlsImplementation,
        upstream: Option<Endpoint>,
    ) -> Result<Endpoint, LayerError> {
        let binary = cfg.binary.as_ref().ok_or_else(|| {
            LayerError::Unavailable("hysteria2: no binary configured for the process backend".into())
        })?;
        process_slot::check_bind(cfg.local_port)?;
        let credential = session_credential(ctx)?;

        let dir = process_slot::prepare_dir(ctx, LayerKind::Accelerator).await?;
        let config_path = dir.join("config.json");
        let doc = client_config(cfg, credential.as_ref(), upstream.as_ref());
        process_slot::write_json(&config_path, &doc).await?;

        let args: Vec<OsString> = vec!["client".into(), "--config".into(), config_path.into()];
        let supervisor = process_slot::supervisor(
            ctx,
            LayerKind::Accelerator,
            binary,
            &dir,
            args,
            &[("TLS_IMPLEMENTATION", tls.as_env_value())],
        );

        let endpoint = Endpoint {
            credential,
            ..Endpoint::local(cfg.local_port)
        };
        let probe = TcpProbe::new(endpoint.addr, ctx.runtime.process.health_timeout);
        self.process.spawn(ctx, supervisor, Some(Box::new(probe))).await?;
        Ok(endpoint)
    }

    async fn stop(&self) -> Result<(), LayerError> {
        if self.process.stop().await {
            Ok(())
        } else {
            Err(LayerError::Unavailable(
                "hysteria2: process could not be confirmed stopped".into(),
            ))
        }
    }

    fn metrics(&self) -> Result<LayerMetrics, LayerError> {
        Ok(LayerMetrics::default())
    }

    fn health(&self) -> LayerHealth {
        self.process.health()
    }
}
