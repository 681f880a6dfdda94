//! General-purpose routing engine ("xray").
//!
//! ```text
//! start(cfg, upstream)
//!   ├─► read user config (must stay inside allowed dirs)
//!   ├─► patch:  outbounds  += reality (from relay block), upstream socks hop
//!   │           routing    = chain-* rules from the RouteTable, then user rules
//!   │           inbounds   . sniffing = table.sniff_enabled
//!   ├─► write <work_dir>/xray/config.json     (user file is never touched)
//!   ├─► dry run `run -test -config …`  ── non-zero ──► DryRunFailed
//!   ├─► launch `run -config …` under the process supervisor
//!   └─► register traffic callback on the route store
//! ```

use std::ffi::OsString;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value, json};

use crate::config::{ChainConfig, RelayConfig};
use crate::error::LayerError;
use crate::layers::process_slot::{self, ProcessSlot};
use crate::layers::relay::relay_outbound;
use crate::layers::{Endpoint, Layer, LayerContext, LayerHealth, LayerKind, LayerMetrics};
use crate::process::{HealthProbe, LaunchSpec, ProcessSupervisor, TcpProbe, ensure_within};
use crate::routing::{CallbackId, ChannelCallback, RouteDecision, RouteQuery, RouteStore, RouteTable};

/// Prefix of rule tags owned by the chain; user rules never carry it.
const RULE_TAG_PREFIX: &str = "chain-";
/// Tag of the outbound that dials through the previous layer.
const UPSTREAM_TAG: &str = "upstream";

#[derive(Default)]
struct TrafficCounter {
    up: AtomicU64,
    down: AtomicU64,
}

impl TrafficCounter {
    fn reset(&self) {
        self.up.store(0, Ordering::Relaxed);
        self.down.store(0, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LayerMetrics {
        LayerMetrics {
            bytes_up: self.up.load(Ordering::Relaxed),
            bytes_down: self.down.load(Ordering::Relaxed),
        }
    }
}

impl ChannelCallback for TrafficCounter {
    fn on_traffic(&self, up: u64, down: u64) {
        let add = |cell: &AtomicU64, n: u64| {
            let _ = cell.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_add(n)));
        };
        add(&self.up, up);
        add(&self.down, down);
    }
}

fn invalid(msg: impl Into<String>) -> LayerError {
    LayerError::ConfigInvalid(format!("xray: {}", msg.into()))
}

fn upstream_outbound(upstream: &Endpoint) -> Value {
    let mut server = json!({
        "address": upstream.addr.ip().to_string(),
        "port": upstream.addr.port(),
    });
    if let Some(c) = &upstream.credential {
        server["users"] = json!([{ "user": c.username, "pass": c.password }]);
    }
    json!({
        "tag": UPSTREAM_TAG,
        "protocol": "socks",
        "settings": { "servers": [server] },
    })
}

fn array_field<'a>(root: &'a mut Map<String, Value>, key: &str) -> Result<&'a mut Vec<Value>, LayerError> {
    root.entry(key.to_string())
        .or_insert_with(|| Value::Array(Vec::new()))
        .as_array_mut()
        .ok_or_else(|| invalid(format!("`{key}` is not an array")))
}

/// Inserts `outbound` at the front, or replaces the outbound with the same tag in place.
fn upsert_outbound(outbounds: &mut Vec<Value>, outbound: Value) {
    let tag = outbound["tag"].clone();
    match outbounds.iter_mut().find(|o| o["tag"] == tag) {
        Some(slot) => *slot = outbound,
        None => outbounds.insert(0, outbound),
    }
}

fn is_relay_listener(upstream: &Endpoint, relay: &RelayConfig) -> bool {
    upstream.addr.ip().is_loopback() && upstream.addr.port() == relay.local_port
}

/// Merges chain state into the user's engine config.
fn patch_config(
    mut doc: Value,
    relay: Option<&RelayConfig>,
    upstream: Option<&Endpoint>,
    table: &RouteTable,
) -> Result<Value, LayerError> {
    let root = doc
        .as_object_mut()
        .ok_or_else(|| invalid("config root is not an object"))?;

    {
        let outbounds = array_field(root, "outbounds")?;
        if let Some(up) = upstream {
            upsert_outbound(outbounds, upstream_outbound(up));
        }
        if let Some(relay) = relay {
            let mut reality = relay_outbound(relay);
            // The relay's own listener already carries a reality session.
            if upstream.is_some_and(|up| !is_relay_listener(up, relay)) {
                reality["streamSettings"]["sockopt"] = json!({ "dialerProxy": UPSTREAM_TAG });
            }
            upsert_outbound(outbounds, reality);
        }
    }

    {
        let routing = root
            .entry("routing".to_string())
            .or_insert_with(|| json!({}))
            .as_object_mut()
            .ok_or_else(|| invalid("`routing` is not an object"))?;
        let rules = array_field(routing, "rules")?;
        rules.retain(|r| {
            !r["ruleTag"]
                .as_str()
                .is_some_and(|t| t.starts_with(RULE_TAG_PREFIX))
        });
        let mut ours: Vec<Value> = table
            .ordered_rules()
            .into_iter()
            .map(|rule| {
                let (field, cond) = rule.matcher.engine_condition();
                let mut v = json!({
                    "type": "field",
                    "ruleTag": format!("{RULE_TAG_PREFIX}{}", rule.id),
                    "outboundTag": table.tag_for(&rule.outbound),
                });
                v[field] = json!([cond]);
                v
            })
            .collect();
        ours.append(rules);
        *rules = ours;
    }

    let inbounds = array_field(root, "inbounds")?;
    for inbound in inbounds.iter_mut().filter(|i| i.is_object()) {
        inbound["sniffing"] = json!({
            "enabled": table.sniff_enabled,
            "destOverride": ["http", "tls", "quic"],
        });
    }
    Ok(doc)
}

/// First loopback-reachable inbound port, used for health probing.
fn probe_port(doc: &Value) -> Option<u16> {
    doc["inbounds"]
        .as_array()?
        .iter()
        .filter_map(|i| i["port"].as_u64())
        .find_map(|p| u16::try_from(p).ok())
}

/// Routing engine adapter; owns the chain's view of the [`RouteStore`].
pub struct RoutingEngineLayer {
    ctx: OnceLock<LayerContext>,
    store: Arc<RouteStore>,
    process: ProcessSlot,
    traffic: Arc<TrafficCounter>,
    callback: Mutex<Option<CallbackId>>,
    endpoint: Mutex<Option<Endpoint>>,
}

impl RoutingEngineLayer {
    /// Adapter bound to `store`.
    pub fn new(store: Arc<RouteStore>) -> Self {
        Self {
            ctx: OnceLock::new(),
            store,
            process: ProcessSlot::new(),
            traffic: Arc::new(TrafficCounter::default()),
            callback: Mutex::new(None),
            endpoint: Mutex::new(None),
        }
    }

    /// Store this engine routes with.
    pub fn store(&self) -> &Arc<RouteStore> {
        &self.store
    }

    /// Classifies `query` against the store's current table.
    pub fn route(&self, query: &RouteQuery) -> RouteDecision {
        self.store.resolve(query)
    }

    async fn dry_run(&self, ctx: &LayerContext, binary: &Path, dir: &Path, config: &Path) -> Result<(), LayerError> {
        let log = dir.join("xray-test.log");
        match tokio::fs::remove_file(&log).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let spec = LaunchSpec::new("xray", binary, dir, &log);
        let check = ProcessSupervisor::new(spec, ctx.runtime.process_config(), ctx.bus.clone());
        let args: Vec<OsString> = vec!["run".into(), "-test".into(), "-config".into(), config.into()];
        let (code, output) = check.check_run(&args, ctx.runtime.dry_run_timeout).await?;
        if code == Some(0) {
            Ok(())
        } else {
            tracing::warn!(layer = "xray", exit_code = ?code, "config dry run rejected");
            Err(LayerError::DryRunFailed { output })
        }
    }
}

#[async_trait]
impl Layer for RoutingEngineLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::RoutingEngine
    }

    async fn init(&self, ctx: &LayerContext) -> Result<(), LayerError> {
        let _ = self.ctx.set(ctx.clone());
        Ok(())
    }

    async fn start(&self, cfg: &ChainConfig, upstream: Option<Endpoint>) -> Result<(), LayerError> {
        let ctx = self
            .ctx
            .get()
            .ok_or_else(|| LayerError::Unavailable("xray: not initialized".into()))?;
        let engine = cfg.routing_engine.as_ref().ok_or(LayerError::NotConfigured)?;
        self.stop().await?;

        let roots = ctx.runtime.process_config().allowed_dirs;
        let user_config = ensure_within(&engine.config_path, &roots)?;
        let raw = tokio::fs::read(&user_config).await?;
        let doc: Value = serde_json::from_slice(&raw).map_err(|e| invalid(e.to_string()))?;
        let doc = patch_config(doc, cfg.relay.as_ref(), upstream.as_ref(), &self.store.current_table())?;

        let dir = process_slot::prepare_dir(ctx, LayerKind::RoutingEngine).await?;
        let config_path = dir.join("config.json");
        process_slot::write_json(&config_path, &doc).await?;

        self.dry_run(ctx, &engine.binary, &dir, &config_path).await?;

        let args: Vec<OsString> = vec!["run".into(), "-config".into(), config_path.clone().into()];
        let supervisor = process_slot::supervisor(
            ctx,
            LayerKind::RoutingEngine,
            &engine.binary,
            &dir,
            args,
            &[("TLS_IMPLEMENTATION", cfg.tls.as_env_value())],
        );
        let endpoint = probe_port(&doc).map(Endpoint::local);
        let probe = endpoint.as_ref().map(|e| {
            Box::new(TcpProbe::new(e.addr, ctx.runtime.process.health_timeout)) as Box<dyn HealthProbe>
        });
        self.process.spawn(ctx, supervisor, probe).await?;

        self.traffic.reset();
        let id = self
            .store
            .register_callback(Arc::clone(&self.traffic) as Arc<dyn ChannelCallback>);
        *self.callback.lock() = Some(id);
        *self.endpoint.lock() = endpoint;
        tracing::info!(layer = "xray", rules = self.store.current_table().rules.len(), "routing engine running");
        Ok(())
    }

    async fn stop(&self) -> Result<(), LayerError> {
        if let Some(id) = self.callback.lock().take() {
            self.store.unregister_callback(id);
        }
        *self.endpoint.lock() = None;
        if self.process.stop().await {
            Ok(())
        } else {
            Err(LayerError::Unavailable(
                "xray: process could not be confirmed stopped".into(),
            ))
        }
    }

    fn endpoint(&self) -> Option<Endpoint> {
        self.endpoint.lock().clone()
    }

    fn metrics(&self) -> Result<LayerMetrics, LayerError> {
        Ok(self.traffic.snapshot())
    }

    fn health(&self) -> LayerHealth {
        self.process.health()
    }
}
