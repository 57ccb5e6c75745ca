//! Kuview watch layer: one upstream subscription per configured kind,
//! translated into cache events.
//!
//! Creates and updates both surface as `create` (the cache upserts);
//! deletions surface as `delete`. Reconnects and re-lists are the kube
//! watcher's own business; a stream that ends for good is a terminal
//! failure for the process.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, Context, Result};
use futures::TryStreamExt;
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    runtime::{
        watcher::{self, Event as WatchEvent},
        WatchStreamExt,
    },
    Client,
};
use kuview_core::{stamp_gvk, Event, KindSpec};
use kuview_hub::Emitter;
use metrics::counter;
use once_cell::sync::Lazy;
use serde_json::Value;
use tracing::{debug, info, warn};

// Discovery cache: GVK key -> (ApiResource, namespaced)
static DISCOVERY_CACHE: Lazy<RwLock<HashMap<String, (ApiResource, bool)>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

async fn find_api_resource(client: Client, spec: &KindSpec) -> Result<(ApiResource, bool)> {
    let key = spec.gvk_key();
    if let Some(hit) = DISCOVERY_CACHE.read().unwrap().get(&key).cloned() {
        return Ok(hit);
    }
    let discovery = Discovery::new(client).run().await.context("running API discovery")?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == spec.group && ar.version == spec.version && ar.kind == spec.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                DISCOVERY_CACHE.write().unwrap().insert(key, (ar.clone(), namespaced));
                return Ok((ar, namespaced));
            }
        }
    }
    Err(anyhow!("kind not served by the cluster: {}", key))
}

fn strip_managed_fields(v: &mut Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

/// Serialise a watch object into the wire payload: `managedFields` dropped,
/// `apiVersion`/`kind` stamped even when the upstream left TypeMeta unset.
fn event_payload(spec: &KindSpec, obj: &DynamicObject) -> Result<Value> {
    let mut raw = serde_json::to_value(obj).context("serializing watch object")?;
    strip_managed_fields(&mut raw);
    stamp_gvk(&mut raw, spec);
    Ok(raw)
}

/// Suppresses Node sightings whose status differs from the previous one only
/// by per-condition heartbeat timestamps. Large clusters refresh heartbeats
/// every few seconds, which would otherwise flood subscribers with
/// effectively empty updates.
#[derive(Default)]
pub struct HeartbeatFilter {
    last_status: HashMap<String, Value>,
}

impl HeartbeatFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether this sighting should be forwarded. The first sighting of a
    /// node always passes; later ones pass only if the normalised status
    /// changed.
    pub fn admit(&mut self, payload: &Value) -> bool {
        let name = payload
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let status = normalized_status(payload);
        match self.last_status.get(&name) {
            Some(prev) if *prev == status => false,
            _ => {
                self.last_status.insert(name, status);
                true
            }
        }
    }

    /// Drop the remembered status when a node goes away, so a node recreated
    /// under the same name is admitted again.
    pub fn forget(&mut self, payload: &Value) {
        if let Some(name) = payload
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(Value::as_str)
        {
            self.last_status.remove(name);
        }
    }
}

/// Node status with every `conditions[*].lastHeartbeatTime` cleared, so the
/// comparison sees only meaningful changes.
fn normalized_status(payload: &Value) -> Value {
    let mut status = payload.get("status").cloned().unwrap_or(Value::Null);
    if let Some(conds) = status.get_mut("conditions").and_then(Value::as_array_mut) {
        for cond in conds {
            if let Some(obj) = cond.as_object_mut() {
                obj.insert("lastHeartbeatTime".to_string(), Value::Null);
            }
        }
    }
    status
}

fn is_node(spec: &KindSpec) -> bool {
    spec.group.is_empty() && spec.version == "v1" && spec.kind == "Node"
}

/// Watch one kind and emit an event per upstream notification. Returns only
/// on terminal failure; recoverable errors are logged and the stream keeps
/// retrying with backoff.
pub async fn start_watcher(client: Client, spec: KindSpec, emitter: Emitter) -> Result<()> {
    let (ar, _namespaced) = find_api_resource(client.clone(), &spec)
        .await
        .with_context(|| format!("resolving {}", spec.gvk_key()))?;
    let api: Api<DynamicObject> = Api::all_with(client, &ar);

    info!(gvk = %spec.gvk_key(), "watcher starting");

    let mut heartbeat = is_node(&spec).then(HeartbeatFilter::new);

    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);

    loop {
        match stream.try_next().await {
            Ok(Some(WatchEvent::Applied(obj))) => {
                forward_applied(&spec, &obj, heartbeat.as_mut(), &emitter).await?;
            }
            Ok(Some(WatchEvent::Deleted(obj))) => {
                let payload = event_payload(&spec, &obj)?;
                if let Some(hb) = heartbeat.as_mut() {
                    hb.forget(&payload);
                }
                counter!("kuview_watch_events_total", 1u64);
                emitter.emit(Event::delete(payload)).await;
            }
            Ok(Some(WatchEvent::Restarted(list))) => {
                debug!(gvk = %spec.gvk_key(), count = list.len(), "watch restarted");
                for obj in &list {
                    forward_applied(&spec, obj, heartbeat.as_mut(), &emitter).await?;
                }
            }
            Ok(None) => return Err(anyhow!("watch stream for {} ended", spec.gvk_key())),
            Err(e) => {
                warn!(gvk = %spec.gvk_key(), error = %e, "watch error; stream will retry");
                counter!("kuview_watch_errors_total", 1u64);
            }
        }
    }
}

async fn forward_applied(
    spec: &KindSpec,
    obj: &DynamicObject,
    heartbeat: Option<&mut HeartbeatFilter>,
    emitter: &Emitter,
) -> Result<()> {
    let payload = event_payload(spec, obj)?;
    if let Some(hb) = heartbeat {
        if !hb.admit(&payload) {
            counter!("kuview_heartbeat_suppressed_total", 1u64);
            return Ok(());
        }
    }
    counter!("kuview_watch_events_total", 1u64);
    emitter.emit(Event::create(payload)).await;
    Ok(())
}
