//! Lock-protected bookkeeping for the keyed pool.
//!
//! Everything here is plain data mutated under the pool mutex; nothing in
//! this module awaits.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::pool::config::PoolConfig;
use crate::slot::{Slot, SlotId};

/// Pool statistics, for the whole pool or a single key.
///
/// Counters are cumulative; gauges are point-in-time and advisory only
/// under concurrency.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections ever opened.
    pub created: u64,
    /// Connections ever terminated.
    pub destroyed: u64,
    /// Successful borrows.
    pub borrowed: u64,
    /// Connections handed back, recycled or not.
    pub returned: u64,
    /// Liveness probes that failed.
    pub validation_failures: u64,
    /// Connection attempts that failed.
    pub create_failures: u64,
    /// Borrows that gave up waiting.
    pub timeouts: u64,
    /// Slots currently checked out.
    pub active: usize,
    /// Slots currently idle.
    pub idle: usize,
    /// Slots being created, validated or destroyed.
    pub pending: usize,
    /// Borrowers currently waiting.
    pub waiters: usize,
}

impl PoolStats {
    fn absorb(&mut self, other: &Self) {
        self.created += other.created;
        self.destroyed += other.destroyed;
        self.borrowed += other.borrowed;
        self.returned += other.returned;
        self.validation_failures += other.validation_failures;
        self.create_failures += other.create_failures;
        self.timeouts += other.timeouts;
        self.active += other.active;
        self.idle += other.idle;
        self.pending += other.pending;
        self.waiters += other.waiters;
    }
}

/// A slot that is currently lent out.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Checkout {
    pub(crate) borrowed_at: Instant,
    pub(crate) abandoned: bool,
}

/// Per-key queues and counters.
#[derive(Debug)]
pub(crate) struct KeyState<T> {
    /// Idle slots ordered by `idle_since`, oldest first.
    pub(crate) idle: VecDeque<Slot<T>>,
    pub(crate) checked_out: HashMap<SlotId, Checkout>,
    /// Slots outside both the idle queue and the checkout table.
    pub(crate) pending: usize,
    pub(crate) waiters: usize,
    pub(crate) notify: Arc<Notify>,
    pub(crate) counters: PoolStats,
}

impl<T> KeyState<T> {
    fn new() -> Self {
        Self {
            idle: VecDeque::new(),
            checked_out: HashMap::new(),
            pending: 0,
            waiters: 0,
            notify: Arc::new(Notify::new()),
            counters: PoolStats::default(),
        }
    }

    /// Checked-out slots that still count against capacity.
    pub(crate) fn active(&self) -> usize {
        self.checked_out.values().filter(|c| !c.abandoned).count()
    }

    /// Slots counted against the per-key cap.
    pub(crate) fn total(&self) -> usize {
        self.idle.len() + self.active() + self.pending
    }

    /// Take the next idle slot according to the queue discipline.
    pub(crate) fn pop_idle(&mut self, lifo: bool) -> Option<Slot<T>> {
        if lifo {
            self.idle.pop_back()
        } else {
            self.idle.pop_front()
        }
    }

    /// Put a slot back keeping the queue ordered by `idle_since`.
    pub(crate) fn reinsert_idle(&mut self, slot: Slot<T>) {
        let at = slot.idle_since();
        let pos = self.idle.partition_point(|s| s.idle_since() <= at);
        self.idle.insert(pos, slot);
    }

    pub(crate) fn remove_idle(&mut self, id: SlotId) -> Option<Slot<T>> {
        let pos = self.idle.iter().position(|s| s.id() == id)?;
        self.idle.remove(pos)
    }

    pub(crate) fn snapshot(&self) -> PoolStats {
        PoolStats {
            active: self.active(),
            idle: self.idle.len(),
            pending: self.pending,
            waiters: self.waiters,
            ..self.counters.clone()
        }
    }
}

/// All mutable pool state, guarded by one mutex.
#[derive(Debug)]
pub(crate) struct PoolState<T> {
    pub(crate) keys: HashMap<Arc<str>, KeyState<T>>,
    pub(crate) closed: bool,
}

impl<T> PoolState<T> {
    pub(crate) fn new() -> Self {
        Self {
            keys: HashMap::new(),
            closed: false,
        }
    }

    pub(crate) fn key_mut(&mut self, key: &Arc<str>) -> &mut KeyState<T> {
        self.keys
            .entry(Arc::clone(key))
            .or_insert_with(KeyState::new)
    }

    pub(crate) fn key(&self, key: &str) -> Option<&KeyState<T>> {
        self.keys.get(key)
    }

    pub(crate) fn total(&self) -> usize {
        self.keys.values().map(KeyState::total).sum()
    }

    /// Whether a new slot for `key` fits under both caps.
    pub(crate) fn can_create(&self, key: &str, config: &PoolConfig) -> bool {
        let key_total = self.key(key).map_or(0, KeyState::total);
        key_total < config.max_total_per_key && config.global_headroom(self.total())
    }

    /// Oldest idle slot of any other key, to free global capacity for `key`.
    ///
    /// Only applies when the global cap is what blocks `key`.
    pub(crate) fn reclaim_candidate(&self, key: &str, config: &PoolConfig) -> Option<(Arc<str>, SlotId)> {
        config.max_total?;
        let key_total = self.key(key).map_or(0, KeyState::total);
        if key_total >= config.max_total_per_key {
            return None;
        }
        self.keys
            .iter()
            .filter(|(k, _)| k.as_ref() != key)
            .filter_map(|(k, ks)| ks.idle.front().map(|slot| (k, slot)))
            .min_by_key(|(_, slot)| slot.idle_since())
            .map(|(k, slot)| (Arc::clone(k), slot.id()))
    }

    /// Aggregate statistics over every key.
    pub(crate) fn snapshot(&self) -> PoolStats {
        let mut stats = PoolStats::default();
        for ks in self.keys.values() {
            stats.absorb(&ks.snapshot());
        }
        stats
    }
}
