//! Kubeweave mapper: normalizes cluster workloads into events, drains them
//! through the retry queue, and correlates them into mapped records.
//!
//! The drain is single-threaded and synchronous: one consumer processes
//! the queue to exhaustion within a `map` call, so the call always
//! returns. Per-item failures are contained. An event that keeps failing
//! past the retry ceiling is dropped and reported, never aborting the run.

#![forbid(unsafe_code)]

mod logging;
mod relations;

use std::panic::{catch_unwind, AssertUnwindSafe};

pub use kubeweave_core::{
    meta_namespace_key, EventType, KeyError, MapError, MappedResource, MappedResources,
    ResourceEvent, Workload, WorkloadBatch, WorkloadKind,
};
pub use kubeweave_store::MappedStore;
pub use logging::{LogLevel, LoggingOptions, MapOptions, ParseLogLevelError};

use kubeweave_store::WorkQueue;
use logging::Logger;

/// Requeue ceiling: a failing event is retried this many times before
/// being dropped.
const MAX_RETRIES: u32 = 5;

/// Correlates interlinked cluster workloads into mapped records.
///
/// The store lives as long as the mapper; hand a pre-populated store to
/// [`Mapper::with_store`] to correlate incrementally across calls, and
/// take it back with [`Mapper::into_store`]. One mapping pass at a time
/// per store: the mapper adds no locking of its own.
pub struct Mapper {
    store: MappedStore,
    log: Logger,
}

impl Default for Mapper {
    fn default() -> Self {
        Self::new()
    }
}

impl Mapper {
    /// Fresh store, logging disabled.
    pub fn new() -> Self {
        Self { store: MappedStore::new(), log: Logger::disabled() }
    }

    pub fn with_options(options: MapOptions) -> Self {
        Self { store: MappedStore::new(), log: Logger::new(options.logging) }
    }

    /// Correlate against a caller-provided store.
    pub fn with_store(store: MappedStore) -> Self {
        Self { store, log: Logger::disabled() }
    }

    pub fn with_store_and_options(store: MappedStore, options: MapOptions) -> Self {
        Self { store, log: Logger::new(options.logging) }
    }

    pub fn store(&self) -> &MappedStore {
        &self.store
    }

    /// Hand the store back, e.g. to share it with a later mapper.
    pub fn into_store(self) -> MappedStore {
        self.store
    }

    /// Map a batch of workloads into correlated records.
    ///
    /// Every resource is normalized and enqueued in fixed kind order
    /// (ingress, service, deployment, replicaset, pod; a best-effort
    /// parent-before-child hint), then the queue is drained to exhaustion.
    /// Resources that cannot yield a key are skipped and reported; events
    /// that fail correlation are retried with backoff up to the ceiling
    /// and then dropped. The call never fails as a whole: it returns
    /// whatever correlated, in stable key order.
    pub fn map(&mut self, batch: &WorkloadBatch) -> MappedResources {
        let mut queue = WorkQueue::new();
        self.enqueue_batch(batch, &mut queue);
        self.drain(&mut queue);
        queue.shut_down();
        let snapshot = self.store.snapshot();
        self.log.info(&format!(
            "mapped {} workloads into {} records",
            batch.len(),
            snapshot.len()
        ));
        snapshot
    }

    /// Normalize one workload and correlate it directly against the store,
    /// bypassing the queue. Returns the record it landed in; errors are
    /// returned silently.
    pub fn store_map(&mut self, workload: &Workload) -> Result<MappedResource, MapError> {
        let event = resource_event(workload.clone())?;
        relations::correlate(&event, &mut self.store)
    }

    /// Same as [`Mapper::store_map`], but reports failures through the
    /// configured logger before returning them.
    pub fn store_map_logged(&mut self, workload: &Workload) -> Result<MappedResource, MapError> {
        self.store_map(workload).map_err(|err| {
            self.log.error(&format!("cannot map resource: {}", err));
            err
        })
    }

    fn enqueue_batch(&self, batch: &WorkloadBatch, queue: &mut WorkQueue) {
        for o in &batch.ingresses {
            self.enqueue(queue, Workload::Ingress(o.clone()));
        }
        for o in &batch.services {
            self.enqueue(queue, Workload::Service(o.clone()));
        }
        for o in &batch.deployments {
            self.enqueue(queue, Workload::Deployment(o.clone()));
        }
        for o in &batch.replica_sets {
            self.enqueue(queue, Workload::ReplicaSet(o.clone()));
        }
        for o in &batch.pods {
            self.enqueue(queue, Workload::Pod(o.clone()));
        }
    }

    fn enqueue(&self, queue: &mut WorkQueue, workload: Workload) {
        let kind = workload.kind();
        match resource_event(workload) {
            Ok(event) => queue.add(event),
            Err(err) => {
                // One unkeyable resource must not spoil the batch.
                metrics::counter!("mapper_skipped_resources_total", 1u64);
                self.log.error(&format!("skipping {}: {}", kind, err));
            }
        }
    }

    fn drain(&mut self, queue: &mut WorkQueue) {
        let run = catch_unwind(AssertUnwindSafe(|| {
            while queue.len() > 0 {
                if !self.process_next(queue) {
                    break;
                }
            }
        }));
        if let Err(panic) = run {
            metrics::counter!("mapper_drain_panics_total", 1u64);
            self.log.error(&format!(
                "mapping run aborted by panic: {}; returning partial results",
                panic_message(&panic)
            ));
        }
    }

    fn process_next(&mut self, queue: &mut WorkQueue) -> bool {
        let (event, shutting_down) = queue.get();
        if shutting_down {
            return false;
        }
        let Some(event) = event else { return false };

        match relations::correlate(&event, &mut self.store) {
            Ok(record) => {
                queue.forget(&event);
                self.log.debug(&format!(
                    "mapped {} {} into record {}",
                    event.kind, event.key, record.common_key
                ));
            }
            Err(err) if queue.num_requeues(&event) < MAX_RETRIES => {
                self.log.warn(&format!(
                    "cannot map {} {}: {}; requeueing",
                    event.kind, event.key, err
                ));
                queue.add_rate_limited(event.clone());
            }
            Err(err) => {
                queue.forget(&event);
                metrics::counter!("mapper_dropped_events_total", 1u64);
                self.log.error(&format!(
                    "too many retries for {} {}; dropping: {}",
                    event.kind, event.key, err
                ));
            }
        }
        queue.done(&event);
        true
    }
}

/// Normalize one workload into its queueable event. The workload handed in
/// is already the mapper's own clone, so in-flight processing can never be
/// affected by caller mutation.
fn resource_event(workload: Workload) -> Result<ResourceEvent, KeyError> {
    let meta = workload.meta();
    let key = meta_namespace_key(meta)?;
    Ok(ResourceEvent {
        uid: meta.uid.clone(),
        key,
        kind: workload.kind(),
        event_type: EventType::Added,
        namespace: meta.namespace.clone().unwrap_or_default(),
        name: meta.name.clone().unwrap_or_default(),
        workload,
    })
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}
