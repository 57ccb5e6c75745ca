//! Kuview metrics poller: periodic lists of `metrics.k8s.io/v1beta1`
//! resources synthesised into create/delete events, so metrics behave like
//! any other watched kind downstream.
//!
//! Each tick lists both endpoints, upserts every sample it kept, and emits
//! a delete for every sample that was present last tick but not this one.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use kube::{
    api::{Api, ListParams},
    core::{ApiResource, DynamicObject},
    Client,
};
use kuview_core::{stamp_gvk, Event, KindSpec};
use kuview_hub::Emitter;
use metrics::counter;
use serde_json::Value;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// Tick cadence. Part of the contract, not tunable.
pub const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Consecutive list failures tolerated across both endpoints before the
/// poller gives up for good.
pub const FAILURE_BUDGET: u32 = 10;

struct Endpoint {
    spec: KindSpec,
    resource: ApiResource,
    skip_zero_usage: bool,
    previous: HashMap<String, Value>,
}

impl Endpoint {
    fn new(kind: &str, plural: &str, skip_zero_usage: bool) -> Self {
        let spec = KindSpec::new("metrics.k8s.io", "v1beta1", kind);
        let resource = ApiResource {
            group: spec.group.clone(),
            version: spec.version.clone(),
            api_version: spec.api_version(),
            kind: spec.kind.clone(),
            plural: plural.to_string(),
        };
        Self { spec, resource, skip_zero_usage, previous: HashMap::new() }
    }

    async fn list(&self, client: &Client) -> Result<Vec<Value>> {
        let api: Api<DynamicObject> = Api::all_with(client.clone(), &self.resource);
        let list = api.list(&ListParams::default()).await?;
        list.items
            .iter()
            .map(|o| serde_json::to_value(o).context("serializing metrics item"))
            .collect()
    }
}

/// Poll both endpoints every [`POLL_INTERVAL`] until the failure budget is
/// exhausted. Exhaustion ends this task permanently; the rest of the
/// process keeps serving watch data.
pub async fn run(client: Client, emitter: Emitter) {
    let mut endpoints = [
        // Some metrics providers report zero total CPU for nodes, which is
        // nonsensical; those samples are skipped entirely.
        Endpoint::new("NodeMetrics", "nodes", true),
        Endpoint::new("PodMetrics", "pods", false),
    ];

    info!("metrics poller starting");

    let mut failcount: u32 = 0;
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        for ep in endpoints.iter_mut() {
            match ep.list(&client).await {
                Ok(items) => {
                    failcount = 0;
                    let events =
                        reconcile_tick(&ep.spec, ep.skip_zero_usage, items, &mut ep.previous);
                    for event in events {
                        emitter.emit(event).await;
                    }
                }
                Err(e) => {
                    warn!(kind = %ep.spec.kind, error = %e, "metrics list failed");
                    counter!("kuview_metrics_poll_failures_total", 1u64);
                    failcount += 1;
                }
            }
        }
        if failcount > FAILURE_BUDGET {
            error!(failures = failcount, "metrics unavailable for too long; poller giving up");
            return;
        }
    }
}

/// One endpoint's tick: keep the usable samples as upserts, then emit a
/// delete for every key that disappeared since the previous tick.
pub fn reconcile_tick(
    spec: &KindSpec,
    skip_zero_usage: bool,
    items: Vec<Value>,
    previous: &mut HashMap<String, Value>,
) -> Vec<Event> {
    let mut current: HashMap<String, Value> = HashMap::with_capacity(items.len());
    let mut out = Vec::with_capacity(items.len());

    for mut item in items {
        if skip_zero_usage && zero_usage(&item) {
            warn!(kind = %spec.kind, item = %item_key(&item), "zero usage reported; skipping sample");
            continue;
        }
        stamp_gvk(&mut item, spec);
        current.insert(item_key(&item), item.clone());
        out.push(Event::create(item));
    }

    let prior = std::mem::take(previous);
    for (key, prev) in prior {
        if !current.contains_key(&key) {
            info!(kind = %spec.kind, item = %key, "metrics disappeared; emitting delete");
            out.push(Event::delete(prev));
        }
    }
    *previous = current;
    out
}

fn item_key(item: &Value) -> String {
    let meta = item.get("metadata");
    let name = meta
        .and_then(|m| m.get("name"))
        .and_then(Value::as_str)
        .unwrap_or("");
    match meta.and_then(|m| m.get("namespace")).and_then(Value::as_str) {
        Some(ns) => format!("{}/{}", ns, name),
        None => name.to_string(),
    }
}

fn zero_usage(item: &Value) -> bool {
    let cpu = item.pointer("/usage/cpu").and_then(Value::as_str).unwrap_or("0");
    let memory = item.pointer("/usage/memory").and_then(Value::as_str).unwrap_or("0");
    quantity_is_zero(cpu) || quantity_is_zero(memory)
}

/// Whether a Kubernetes quantity string ("250m", "0n", "1Ki") is zero.
fn quantity_is_zero(quantity: &str) -> bool {
    let mantissa: String = quantity
        .chars()
        .take_while(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+'))
        .collect();
    matches!(mantissa.parse::<f64>(), Ok(v) if v == 0.0)
}
