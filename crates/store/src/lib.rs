//! Kubeweave in-RAM containers: the mapped-record store and the
//! rate-limited retry queue feeding the correlator.

#![forbid(unsafe_code)]

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, VecDeque};

use kubeweave_core::{MappedResource, MappedResources, ResourceEvent};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

/// Keyed, deduplicated collection of mapped records.
///
/// Backed by a `BTreeMap` so iteration and snapshots follow stable key
/// order regardless of insertion order. At most one record per key;
/// re-upserting a key replaces its record. No internal locking: when a
/// store is shared across mapping calls, one writer at a time is the
/// caller's contract.
#[derive(Debug, Clone, Default)]
pub struct MappedStore {
    records: BTreeMap<String, MappedResource>,
}

impl MappedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&MappedResource> {
        self.records.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut MappedResource> {
        self.records.get_mut(key)
    }

    /// Insert or replace the record stored under its `common_key`.
    pub fn upsert(&mut self, record: MappedResource) {
        self.records.insert(record.common_key.clone(), record);
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    /// Records in stable key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &MappedResource)> {
        self.records.iter()
    }

    /// Clone out the current contents, ordered by key.
    pub fn snapshot(&self) -> MappedResources {
        MappedResources { records: self.records.values().cloned().collect() }
    }
}

// Backoff delay is `1 << requeues` ticks, capped.
const BACKOFF_CAP_TICKS: u64 = 64;

/// Deduplicating FIFO of events with per-item retry bookkeeping and a
/// rate-limited requeue schedule.
///
/// Pending items are keyed by queue identity (uid when present, else key):
/// re-adding an identical pending item is a no-op. An item re-added while
/// being processed goes dirty and is re-queued when `done` is called.
/// Retried items wait on a delay heap keyed by next-eligible tick. The
/// clock is virtual: it advances one tick per `get` and jumps forward
/// when only delayed items remain, so draining to exhaustion never blocks.
pub struct WorkQueue {
    items: FxHashMap<String, ResourceEvent>,
    ready: VecDeque<String>,
    delayed: BinaryHeap<Reverse<(u64, u64, String)>>,
    processing: FxHashSet<String>,
    dirty: FxHashSet<String>,
    retries: FxHashMap<String, u32>,
    tick: u64,
    seq: u64,
    shutting_down: bool,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            items: FxHashMap::default(),
            ready: VecDeque::new(),
            delayed: BinaryHeap::new(),
            processing: FxHashSet::default(),
            dirty: FxHashSet::default(),
            retries: FxHashMap::default(),
            tick: 0,
            seq: 0,
            shutting_down: false,
        }
    }

    /// Items still owed to the consumer (ready + delayed + dirty).
    /// In-flight items are not counted.
    pub fn len(&self) -> usize {
        self.ready.len() + self.delayed.len() + self.dirty.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue an event. No-op while an identical item is already pending;
    /// an item currently being processed is marked dirty and re-queued on
    /// `done`. Dropped after shutdown.
    pub fn add(&mut self, event: ResourceEvent) {
        if self.shutting_down {
            return;
        }
        let id = event.queue_id().to_string();
        if self.processing.contains(&id) {
            self.items.insert(id.clone(), event);
            self.dirty.insert(id);
            return;
        }
        if self.items.contains_key(&id) {
            return;
        }
        self.items.insert(id.clone(), event);
        self.ready.push_back(id);
        metrics::gauge!("mapper_queue_depth", self.len() as f64);
    }

    /// Pop the next ready event. The flag reports shutdown; `(None, false)`
    /// means the queue is momentarily empty.
    pub fn get(&mut self) -> (Option<ResourceEvent>, bool) {
        if self.shutting_down {
            return (None, true);
        }
        self.tick += 1;
        self.promote_ready();
        if self.ready.is_empty() {
            // Only delayed items left: jump the clock to the earliest one.
            if let Some(at) = self.next_delayed_at() {
                self.tick = at.max(self.tick);
                self.promote_ready();
            }
        }
        while let Some(id) = self.ready.pop_front() {
            if let Some(event) = self.items.remove(&id) {
                self.processing.insert(id);
                return (Some(event), false);
            }
        }
        (None, false)
    }

    /// Mark an event finished. Re-queues it if it went dirty in flight.
    pub fn done(&mut self, event: &ResourceEvent) {
        let id = event.queue_id();
        self.processing.remove(id);
        if self.dirty.remove(id) && self.items.contains_key(id) {
            self.ready.push_back(id.to_string());
        }
    }

    /// Clear retry bookkeeping for an event.
    pub fn forget(&mut self, event: &ResourceEvent) {
        self.retries.remove(event.queue_id());
    }

    /// Re-enqueue with exponential backoff: the item becomes eligible
    /// `1 << n` ticks from now (capped), behind everything already ready.
    pub fn add_rate_limited(&mut self, event: ResourceEvent) {
        if self.shutting_down {
            return;
        }
        let id = event.queue_id().to_string();
        if self.items.contains_key(&id) {
            return;
        }
        let n = {
            let count = self.retries.entry(id.clone()).or_insert(0);
            *count += 1;
            *count
        };
        let delay = (1u64 << n.min(16)).min(BACKOFF_CAP_TICKS);
        self.seq += 1;
        self.items.insert(id.clone(), event);
        self.delayed.push(Reverse((self.tick + delay, self.seq, id)));
        metrics::counter!("mapper_requeues_total", 1u64);
    }

    /// Requeue count so far for this event's identity.
    pub fn num_requeues(&self, event: &ResourceEvent) -> u32 {
        self.retries.get(event.queue_id()).copied().unwrap_or(0)
    }

    /// Idempotent. Later `add`s are dropped and `get` reports shutdown.
    pub fn shut_down(&mut self) {
        if !self.shutting_down {
            self.shutting_down = true;
            debug!(pending = self.len(), "work queue shut down");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    fn next_delayed_at(&self) -> Option<u64> {
        self.delayed.peek().map(|Reverse((at, _, _))| *at)
    }

    fn promote_ready(&mut self) {
        while self.next_delayed_at().map_or(false, |at| at <= self.tick) {
            if let Some(Reverse((_, _, id))) = self.delayed.pop() {
                self.ready.push_back(id);
            }
        }
    }
}
