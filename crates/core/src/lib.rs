//! Kubeweave core types: the workload sum type, normalized events, and the
//! mapped-record output model.

#![forbid(unsafe_code)]

use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The workload kinds the engine correlates. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadKind {
    Ingress,
    Service,
    Deployment,
    ReplicaSet,
    Pod,
}

impl WorkloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Ingress => "ingress",
            WorkloadKind::Service => "service",
            WorkloadKind::Deployment => "deployment",
            WorkloadKind::ReplicaSet => "replicaset",
            WorkloadKind::Pod => "pod",
        }
    }
}

impl std::fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed cluster object of one of the supported kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Workload {
    Ingress(Ingress),
    Service(Service),
    Deployment(Deployment),
    ReplicaSet(ReplicaSet),
    Pod(Pod),
}

impl Workload {
    pub fn kind(&self) -> WorkloadKind {
        match self {
            Workload::Ingress(_) => WorkloadKind::Ingress,
            Workload::Service(_) => WorkloadKind::Service,
            Workload::Deployment(_) => WorkloadKind::Deployment,
            Workload::ReplicaSet(_) => WorkloadKind::ReplicaSet,
            Workload::Pod(_) => WorkloadKind::Pod,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Workload::Ingress(o) => &o.metadata,
            Workload::Service(o) => &o.metadata,
            Workload::Deployment(o) => &o.metadata,
            Workload::ReplicaSet(o) => &o.metadata,
            Workload::Pod(o) => &o.metadata,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.meta().name.as_deref()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.meta().namespace.as_deref()
    }

    pub fn uid(&self) -> Option<&str> {
        self.meta().uid.as_deref()
    }

    pub fn labels(&self) -> Option<&BTreeMap<String, String>> {
        self.meta().labels.as_ref()
    }
}

impl From<Ingress> for Workload {
    fn from(o: Ingress) -> Self {
        Workload::Ingress(o)
    }
}

impl From<Service> for Workload {
    fn from(o: Service) -> Self {
        Workload::Service(o)
    }
}

impl From<Deployment> for Workload {
    fn from(o: Deployment) -> Self {
        Workload::Deployment(o)
    }
}

impl From<ReplicaSet> for Workload {
    fn from(o: ReplicaSet) -> Self {
        Workload::ReplicaSet(o)
    }
}

impl From<Pod> for Workload {
    fn from(o: Pod) -> Self {
        Workload::Pod(o)
    }
}

/// Arrival kinds. Only insertion is modeled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Added,
}

/// Normalized, queueable representation of one workload's arrival.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceEvent {
    /// Cluster-assigned unique id, when the object carries one.
    pub uid: Option<String>,
    /// Canonical `namespace/name` composite. Unique within a cluster.
    pub key: String,
    pub kind: WorkloadKind,
    pub event_type: EventType,
    pub namespace: String,
    pub name: String,
    pub workload: Workload,
}

impl ResourceEvent {
    /// Queue identity: the uid when present, the key otherwise.
    pub fn queue_id(&self) -> &str {
        self.uid.as_deref().filter(|u| !u.is_empty()).unwrap_or(&self.key)
    }
}

/// Compose the canonical store key for object metadata: `namespace/name`,
/// or the bare name for cluster-scoped metadata.
pub fn meta_namespace_key(meta: &ObjectMeta) -> Result<String, KeyError> {
    let name = match meta.name.as_deref() {
        Some(n) if !n.is_empty() => n,
        _ => return Err(KeyError::MissingName),
    };
    Ok(match meta.namespace.as_deref() {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, name),
        _ => name.to_string(),
    })
}

/// Identity metadata needed to derive a store key is absent. Fatal for the
/// single resource, never for the whole batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("object has no name; cannot derive a store key")]
    MissingName,
}

/// Correlation against the store failed for one event. Retryable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    #[error("key: {0}")]
    Key(#[from] KeyError),
    #[error("{kind} {key}: payload carries no name")]
    MissingName { kind: WorkloadKind, key: String },
    #[error("{kind} {key}: payload carries no namespace")]
    MissingNamespace { kind: WorkloadKind, key: String },
}

/// One correlated group of related workloads under a common identity.
///
/// Created when the first event referencing a new identity arrives, merged
/// into by every later event that correlates to it, and never deleted
/// within a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MappedResource {
    /// Record identity: the key of the event that opened the record.
    pub common_key: String,
    pub namespace: String,
    /// Kind of the event merged most recently.
    pub current_kind: Option<WorkloadKind>,
    pub ingresses: Vec<Ingress>,
    pub services: Vec<Service>,
    pub deployments: Vec<Deployment>,
    pub replica_sets: Vec<ReplicaSet>,
    pub pods: Vec<Pod>,
}

impl MappedResource {
    pub fn new(common_key: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            common_key: common_key.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Total workloads aggregated in this record.
    pub fn resource_count(&self) -> usize {
        self.ingresses.len()
            + self.services.len()
            + self.deployments.len()
            + self.replica_sets.len()
            + self.pods.len()
    }
}

/// Ordered mapping output, derived from the store's sorted key order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MappedResources {
    pub records: Vec<MappedResource>,
}

impl MappedResources {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MappedResource> {
        self.records.iter()
    }
}

/// Input batch grouped by kind, as handed over by a cluster client.
#[derive(Debug, Clone, Default)]
pub struct WorkloadBatch {
    pub ingresses: Vec<Ingress>,
    pub services: Vec<Service>,
    pub deployments: Vec<Deployment>,
    pub replica_sets: Vec<ReplicaSet>,
    pub pods: Vec<Pod>,
}

impl WorkloadBatch {
    pub fn len(&self) -> usize {
        self.ingresses.len()
            + self.services.len()
            + self.deployments.len()
            + self.replica_sets.len()
            + self.pods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub mod prelude {
    pub use super::{
        meta_namespace_key, EventType, KeyError, MapError, MappedResource, MappedResources,
        ResourceEvent, Workload, WorkloadBatch, WorkloadKind,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(ns: Option<&str>, name: Option<&str>) -> ObjectMeta {
        ObjectMeta {
            namespace: ns.map(String::from),
            name: name.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn namespaced_key() {
        let key = meta_namespace_key(&meta(Some("prod"), Some("web"))).unwrap();
        assert_eq!(key, "prod/web");
    }

    #[test]
    fn cluster_scoped_key_is_the_bare_name() {
        let key = meta_namespace_key(&meta(None, Some("web"))).unwrap();
        assert_eq!(key, "web");
    }

    #[test]
    fn missing_or_empty_name_fails_key_derivation() {
        assert_eq!(meta_namespace_key(&meta(Some("prod"), None)), Err(KeyError::MissingName));
        assert_eq!(meta_namespace_key(&meta(Some("prod"), Some(""))), Err(KeyError::MissingName));
    }

    #[test]
    fn queue_id_prefers_uid_over_key() {
        let pod = Pod { metadata: meta(Some("prod"), Some("web-0")), ..Default::default() };
        let mut ev = ResourceEvent {
            uid: Some("u-1".to_string()),
            key: "prod/web-0".to_string(),
            kind: WorkloadKind::Pod,
            event_type: EventType::Added,
            namespace: "prod".to_string(),
            name: "web-0".to_string(),
            workload: Workload::Pod(pod),
        };
        assert_eq!(ev.queue_id(), "u-1");
        ev.uid = None;
        assert_eq!(ev.queue_id(), "prod/web-0");
        ev.uid = Some(String::new());
        assert_eq!(ev.queue_id(), "prod/web-0");
    }

    #[test]
    fn event_type_wire_form() {
        assert_eq!(serde_json::to_value(EventType::Added).unwrap(), serde_json::json!("ADDED"));
    }

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(WorkloadKind::ReplicaSet.as_str(), "replicaset");
        assert_eq!(
            serde_json::to_value(WorkloadKind::ReplicaSet).unwrap(),
            serde_json::json!("replicaset")
        );
    }
}
