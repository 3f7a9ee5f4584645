//! Correlation policy: how an incoming event finds the mapped record it
//! belongs to.
//!
//! Matching is upward only. An event looks for an already-stored parent:
//! a pod for the service selecting it or the replica set owning it, a
//! replica set for the deployment owning it, a service for the ingress
//! referencing it. Parents never back-link children stored earlier, so a
//! child processed before its parent stays a standalone record.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::{Metadata, Resource};
use kubeweave_core::{MapError, MappedResource, ResourceEvent, Workload};
use kubeweave_store::MappedStore;
use smallvec::SmallVec;

/// Merge `event` into the first record it relates to, opening a new record
/// under the event's own key when nothing matches. Returns the updated
/// record.
pub(crate) fn correlate(
    event: &ResourceEvent,
    store: &mut MappedStore,
) -> Result<MappedResource, MapError> {
    if event.name.is_empty() {
        return Err(MapError::MissingName { kind: event.kind, key: event.key.clone() });
    }
    // All five kinds are namespaced; a payload without a namespace cannot
    // be matched against anything.
    if event.namespace.is_empty() {
        return Err(MapError::MissingNamespace { kind: event.kind, key: event.key.clone() });
    }

    let key = match_record(event, store).unwrap_or_else(|| event.key.clone());
    if let Some(record) = store.get_mut(&key) {
        merge(event, record);
        return Ok(record.clone());
    }
    let mut record = MappedResource::new(key, event.namespace.clone());
    merge(event, &mut record);
    store.upsert(record.clone());
    Ok(record)
}

/// First stored record, in stable key order, that the event's labels,
/// owner references, or name tie it to.
fn match_record(event: &ResourceEvent, store: &MappedStore) -> Option<String> {
    match &event.workload {
        Workload::Pod(pod) => store
            .iter()
            .find(|(_, record)| pod_relates(pod, &event.namespace, record))
            .map(|(key, _)| key.clone()),
        Workload::ReplicaSet(rs) => store
            .iter()
            .find(|(_, record)| {
                record
                    .deployments
                    .iter()
                    .any(|d| owned_by(&rs.metadata, Deployment::KIND, &event.namespace, d.metadata()))
            })
            .map(|(key, _)| key.clone()),
        Workload::Service(_) => store
            .iter()
            .find(|(_, record)| {
                record
                    .ingresses
                    .iter()
                    .any(|ing| ingress_references(ing, &event.namespace, &event.name))
            })
            .map(|(key, _)| key.clone()),
        // Top of their chains: deployments and ingresses root their own
        // records and are found by later children.
        Workload::Deployment(_) | Workload::Ingress(_) => None,
    }
}

fn pod_relates(pod: &Pod, namespace: &str, record: &MappedResource) -> bool {
    let selected = record
        .services
        .iter()
        .any(|s| service_selects(s, namespace, pod.metadata.labels.as_ref()));
    selected
        || record
            .replica_sets
            .iter()
            .any(|rs| owned_by(&pod.metadata, ReplicaSet::KIND, namespace, rs.metadata()))
}

/// Label-selector match: every selector pair must be present on the pod.
/// An absent or empty selector selects nothing.
fn service_selects(
    service: &Service,
    namespace: &str,
    labels: Option<&BTreeMap<String, String>>,
) -> bool {
    if service.metadata.namespace.as_deref() != Some(namespace) {
        return false;
    }
    let Some(selector) = service.spec.as_ref().and_then(|s| s.selector.as_ref()) else {
        return false;
    };
    if selector.is_empty() {
        return false;
    }
    let Some(labels) = labels else { return false };
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

/// Owner-reference match against a candidate parent, by uid when both
/// sides carry one, by name otherwise.
fn owned_by(meta: &ObjectMeta, owner_kind: &str, namespace: &str, owner: &ObjectMeta) -> bool {
    if owner.namespace.as_deref() != Some(namespace) {
        return false;
    }
    let Some(refs) = meta.owner_references.as_ref() else { return false };
    refs.iter().any(|r| {
        if r.kind != owner_kind {
            return false;
        }
        match owner.uid.as_deref() {
            Some(uid) if !uid.is_empty() && !r.uid.is_empty() => r.uid == uid,
            _ => Some(r.name.as_str()) == owner.name.as_deref(),
        }
    })
}

/// Does this ingress route to the named service? Checks every rule path
/// backend plus the default backend.
fn ingress_references(ingress: &Ingress, namespace: &str, service_name: &str) -> bool {
    if ingress.metadata.namespace.as_deref() != Some(namespace) {
        return false;
    }
    let Some(spec) = ingress.spec.as_ref() else { return false };
    let mut backends: SmallVec<[&str; 4]> = SmallVec::new();
    if let Some(default) = spec.default_backend.as_ref().and_then(|b| b.service.as_ref()) {
        backends.push(default.name.as_str());
    }
    if let Some(rules) = spec.rules.as_ref() {
        for rule in rules {
            if let Some(http) = rule.http.as_ref() {
                for path in &http.paths {
                    if let Some(svc) = path.backend.service.as_ref() {
                        backends.push(svc.name.as_str());
                    }
                }
            }
        }
    }
    backends.iter().any(|name| *name == service_name)
}

/// Fold the event's workload into the record. Re-processing the same
/// object replaces its previous copy instead of appending a duplicate.
fn merge(event: &ResourceEvent, record: &mut MappedResource) {
    record.current_kind = Some(event.kind);
    match &event.workload {
        Workload::Ingress(o) => upsert_object(&mut record.ingresses, o.clone()),
        Workload::Service(o) => upsert_object(&mut record.services, o.clone()),
        Workload::Deployment(o) => upsert_object(&mut record.deployments, o.clone()),
        Workload::ReplicaSet(o) => upsert_object(&mut record.replica_sets, o.clone()),
        Workload::Pod(o) => upsert_object(&mut record.pods, o.clone()),
    }
}

fn upsert_object<T>(list: &mut Vec<T>, object: T)
where
    T: Metadata<Ty = ObjectMeta>,
{
    match list.iter().position(|existing| same_object(existing.metadata(), object.metadata())) {
        Some(i) => list[i] = object,
        None => list.push(object),
    }
}

/// Identity comparison: uid when both sides carry one, namespace/name
/// otherwise.
fn same_object(a: &ObjectMeta, b: &ObjectMeta) -> bool {
    match (a.uid.as_deref(), b.uid.as_deref()) {
        (Some(x), Some(y)) if !x.is_empty() && !y.is_empty() => x == y,
        _ => a.name == b.name && a.namespace == b.namespace,
    }
}
