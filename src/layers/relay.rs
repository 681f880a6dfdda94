//! TLS-mimicking relay ("reality"), backed by an external client process.
//!
//! The adapter materializes a client config into `<work_dir>/reality/`,
//! launches the binary under the process supervisor and exposes a loopback
//! SOCKS listener. When a crypto provider is present the listener is guarded
//! by a per-session credential that never leaves the chain.

use std::ffi::OsString;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::config::{ChainConfig, RelayConfig};
use crate::error::LayerError;
use crate::layers::process_slot::{self, ProcessSlot};
use crate::layers::{
    Endpoint, Layer, LayerContext, LayerHealth, LayerKind, LayerMetrics, LocalCredential,
    session_credential,
};
use crate::process::TcpProbe;

/// Outbound the routing engine uses to reach the relay server directly.
///
/// Shared by the relay's own client config and the routing engine's merged
/// config so both speak to the server the same way.
pub(crate) fn relay_outbound(relay: &RelayConfig) -> Value {
    let server_name = if relay.server_name.is_empty() {
        relay.server.as_str()
    } else {
        relay.server_name.as_str()
    };
    json!({
        "tag": "reality",
        "protocol": "vless",
        "settings": {
            "vnext": [{
                "address": relay.server,
                "port": relay.port,
                "users": [{
                    "id": relay.uuid,
                    "encryption": "none",
                    "flow": "xtls-rprx-vision",
                }],
            }],
        },
        "streamSettings": {
            "network": "tcp",
            "security": "reality",
            "realitySettings": {
                "serverName": server_name,
                "publicKey": relay.public_key,
                "shortId": relay.short_id,
                "fingerprint": relay.fingerprint,
            },
        },
    })
}

/// SOCKS inbound on loopback, with password auth when `credential` is set.
pub(crate) fn socks_inbound(tag: &str, port: u16, credential: Option<&LocalCredential>) -> Value {
    let settings = match credential {
        Some(c) => json!({
            "auth": "password",
            "accounts": [{ "user": c.username, "pass": c.password }],
            "udp": true,
        }),
        None => json!({ "auth": "noauth", "udp": true }),
    };
    json!({
        "tag": tag,
        "listen": "127.0.0.1",
        "port": port,
        "protocol": "socks",
        "settings": settings,
    })
}

fn client_config(relay: &RelayConfig, credential: Option<&LocalCredential>) -> Value {
    json!({
        "log": { "loglevel": "warning" },
        "inbounds": [socks_inbound("socks-in", relay.local_port, credential)],
        "outbounds": [relay_outbound(relay)],
    })
}

/// Relay adapter.
pub struct RelayLayer {
    ctx: OnceLock<LayerContext>,
    process: ProcessSlot,
    endpoint: Mutex<Option<Endpoint>>,
}

impl RelayLayer {
    /// Idle adapter; call [`Layer::init`] before starting it.
    pub fn new() -> Self {
        Self {
            ctx: OnceLock::new(),
            process: ProcessSlot::new(),
            endpoint: Mutex::new(None),
        }
    }

    fn context(&self) -> Result<&LayerContext, LayerError> {
        self.ctx
            .get()
            .ok_or_else(|| LayerError::Unavailable("reality: not initialized".into()))
    }
}

impl Default for RelayLayer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Layer for RelayLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Relay
    }

    async fn init(&self, ctx: &LayerContext) -> Result<(), LayerError> {
        let _ = self.ctx.set(ctx.clone());
        Ok(())
    }

    async fn start(&self, cfg: &ChainConfig, _upstream: Option<Endpoint>) -> Result<(), LayerError> {
        let ctx = self.context()?;
        let relay = cfg.relay.as_ref().ok_or(LayerError::NotConfigured)?;
        self.stop().await?;

        process_slot::check_bind(relay.local_port)?;
        let credential = session_credential(ctx)?;

        let dir = process_slot::prepare_dir(ctx, LayerKind::Relay).await?;
        let config_path = dir.join("config.json");
        process_slot::write_json(&config_path, &client_config(relay, credential.as_ref())).await?;

        let args: Vec<OsString> = vec!["run".into(), "-config".into(), config_path.into()];
        let supervisor = process_slot::supervisor(
            ctx,
            LayerKind::Relay,
            &relay.binary,
            &dir,
            args,
            &[("TLS_IMPLEMENTATION", cfg.tls.as_env_value())],
        );

        let endpoint = Endpoint {
            credential,
            ..Endpoint::local(relay.local_port)
        };
        let probe = TcpProbe::new(endpoint.addr, ctx.runtime.process.health_timeout);
        self.process
            .spawn(ctx, Arc::clone(&supervisor), Some(Box::new(probe)))
            .await?;

        tracing::info!(layer = "reality", port = relay.local_port, "relay listening");
        *self.endpoint.lock() = Some(endpoint);
        Ok(())
    }

    async fn stop(&self) -> Result<(), LayerError> {
        *self.endpoint.lock() = None;
        if self.process.stop().await {
            Ok(())
        } else {
            Err(LayerError::Unavailable(
                "reality: process could not be confirmed stopped".into(),
            ))
        }
    }

    fn endpoint(&self) -> Option<Endpoint> {
        self.endpoint.lock().clone()
    }

    fn metrics(&self) -> Result<LayerMetrics, LayerError> {
        // The relay client exposes no byte counters.
        Ok(LayerMetrics::default())
    }

    fn health(&self) -> LayerHealth {
        self.process.health()
    }
}
