#![forbid(unsafe_code)]

use kubeweave_core::{MappedResource, WorkloadKind};
use kubeweave_store::MappedStore;

fn record(ns: &str, name: &str) -> MappedResource {
    let mut r = MappedResource::new(format!("{}/{}", ns, name), ns);
    r.current_kind = Some(WorkloadKind::Service);
    r
}

#[test]
fn snapshot_order_is_stable_regardless_of_insertion_order() {
    let mut a = MappedStore::new();
    for key in ["prod/web", "dev/api", "prod/api", "dev/web"] {
        let (ns, name) = key.split_once('/').unwrap();
        a.upsert(record(ns, name));
    }

    let mut b = MappedStore::new();
    for key in ["dev/web", "prod/api", "prod/web", "dev/api"] {
        let (ns, name) = key.split_once('/').unwrap();
        b.upsert(record(ns, name));
    }

    let keys_a: Vec<_> = a.snapshot().records.into_iter().map(|r| r.common_key).collect();
    let keys_b: Vec<_> = b.snapshot().records.into_iter().map(|r| r.common_key).collect();
    assert_eq!(keys_a, keys_b);
    assert_eq!(keys_a, vec!["dev/api", "dev/web", "prod/api", "prod/web"]);
}

#[test]
fn upsert_replaces_instead_of_appending() {
    let mut store = MappedStore::new();
    store.upsert(record("prod", "web"));
    let mut updated = record("prod", "web");
    updated.current_kind = Some(WorkloadKind::Pod);
    store.upsert(updated);

    assert_eq!(store.len(), 1);
    assert_eq!(store.get("prod/web").unwrap().current_kind, Some(WorkloadKind::Pod));
}
