//! Kuview core types: the wire event envelope and object identity helpers.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event taxonomy on the wire. Updates are emitted as `create` because the
/// cache treats create as an upsert.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Create,
    Delete,
}

/// Tagged envelope delivered to subscribers. The object is carried verbatim
/// as upstream JSON so unknown fields survive the trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub object: Value,
}

impl Event {
    pub fn create(object: Value) -> Self {
        Self { event_type: EventType::Create, object }
    }

    pub fn delete(object: Value) -> Self {
        Self { event_type: EventType::Delete, object }
    }

    pub fn cache_key(&self) -> String {
        cache_key(&self.object)
    }
}

/// A group/version/kind descriptor for a watched resource schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KindSpec {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl KindSpec {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string() }
    }

    /// `apiVersion` as it appears on object bodies: `v1` for the core group,
    /// `group/version` otherwise.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Identity of a cached resource: `group/version/kind/namespace/name`.
/// Empty segments are preserved so cluster-scoped and core-group objects
/// keep a stable five-part shape.
pub fn cache_key(object: &Value) -> String {
    let api_version = object.get("apiVersion").and_then(Value::as_str).unwrap_or("");
    let (group, version) = match api_version.split_once('/') {
        Some((g, v)) => (g, v),
        None => ("", api_version),
    };
    let kind = object.get("kind").and_then(Value::as_str).unwrap_or("");
    let meta = object.get("metadata");
    let namespace = meta
        .and_then(|m| m.get("namespace"))
        .and_then(Value::as_str)
        .unwrap_or("");
    let name = meta
        .and_then(|m| m.get("name"))
        .and_then(Value::as_str)
        .unwrap_or("");
    format!("{}/{}/{}/{}/{}", group, version, kind, namespace, name)
}

/// Force `apiVersion` and `kind` onto an object body. The upstream can hand
/// back objects with TypeMeta unset; consumers need the discriminator.
pub fn stamp_gvk(object: &mut Value, spec: &KindSpec) {
    if let Some(map) = object.as_object_mut() {
        map.insert("apiVersion".to_string(), Value::String(spec.api_version()));
        map.insert("kind".to_string(), Value::String(spec.kind.clone()));
    }
}

/// The default watched set. Metrics kinds are handled by the poller, not
/// the watch layer.
pub fn default_kinds() -> Vec<KindSpec> {
    vec![
        KindSpec::new("", "v1", "Node"),
        KindSpec::new("", "v1", "Pod"),
        KindSpec::new("", "v1", "Namespace"),
        KindSpec::new("", "v1", "Service"),
        KindSpec::new("", "v1", "ServiceAccount"),
        KindSpec::new("discovery.k8s.io", "v1", "EndpointSlice"),
        KindSpec::new("rbac.authorization.k8s.io", "v1", "ClusterRole"),
        KindSpec::new("rbac.authorization.k8s.io", "v1", "ClusterRoleBinding"),
        KindSpec::new("rbac.authorization.k8s.io", "v1", "Role"),
        KindSpec::new("rbac.authorization.k8s.io", "v1", "RoleBinding"),
    ]
}

pub mod prelude {
    pub use super::{cache_key, stamp_gvk, Event, EventType, KindSpec};
}
