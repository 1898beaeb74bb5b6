//! Engine counters and per-partition statistics.

use crate::types::{CollectionId, PartitionId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Global engine counters.
///
/// All counters are atomic and monotonically increasing.
#[derive(Debug, Default)]
pub struct EngineStats {
    transactions_started: AtomicU64,
    transactions_committed: AtomicU64,
    transactions_aborted: AtomicU64,
    documents_inserted: AtomicU64,
    documents_updated: AtomicU64,
    documents_removed: AtomicU64,
    txn_spills: AtomicU64,
    lock_conflicts: AtomicU64,
    cursors_opened: AtomicU64,
    cursors_timed_out: AtomicU64,
    checkpoints: AtomicU64,
}

impl EngineStats {
    /// Creates a zeroed counter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_transaction_start(&self) {
        self.transactions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_commit(&self) {
        self.transactions_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_abort(&self) {
        self.transactions_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_insert(&self) {
        self.documents_inserted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_update(&self) {
        self.documents_updated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_remove(&self) {
        self.documents_removed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_spill(&self) {
        self.txn_spills.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_lock_conflict(&self) {
        self.lock_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cursor_open(&self) {
        self.cursors_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cursor_timeout(&self) {
        self.cursors_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_checkpoint(&self) {
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads a consistent-enough snapshot of the counters.
    #[must_use]
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            transactions_started: self.transactions_started.load(Ordering::Relaxed),
            transactions_committed: self.transactions_committed.load(Ordering::Relaxed),
            transactions_aborted: self.transactions_aborted.load(Ordering::Relaxed),
            documents_inserted: self.documents_inserted.load(Ordering::Relaxed),
            documents_updated: self.documents_updated.load(Ordering::Relaxed),
            documents_removed: self.documents_removed.load(Ordering::Relaxed),
            txn_spills: self.txn_spills.load(Ordering::Relaxed),
            lock_conflicts: self.lock_conflicts.load(Ordering::Relaxed),
            cursors_opened: self.cursors_opened.load(Ordering::Relaxed),
            cursors_timed_out: self.cursors_timed_out.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct EngineStatsSnapshot {
    pub transactions_started: u64,
    pub transactions_committed: u64,
    pub transactions_aborted: u64,
    pub documents_inserted: u64,
    pub documents_updated: u64,
    pub documents_removed: u64,
    pub txn_spills: u64,
    pub lock_conflicts: u64,
    pub cursors_opened: u64,
    pub cursors_timed_out: u64,
    pub checkpoints: u64,
}

/// A staged change to one partition's row count and byte size.
///
/// Deltas accumulate inside a transaction and apply to the registry only
/// at publish, so rollback leaves counters untouched.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsDelta {
    /// Row count change.
    pub count: i64,
    /// Document byte change.
    pub bytes: i64,
}

impl StatsDelta {
    /// Adds another delta into this one.
    pub fn merge(&mut self, other: StatsDelta) {
        self.count += other.count;
        self.bytes += other.bytes;
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct PartitionCounter {
    count: i64,
    bytes: i64,
}

/// Committed row counts and byte sizes per (collection, partition).
#[derive(Debug, Default)]
pub struct CounterRegistry {
    counters: Mutex<HashMap<(CollectionId, PartitionId), PartitionCounter>>,
}

impl CounterRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a transaction's staged deltas at publish.
    pub fn apply(&self, deltas: &HashMap<(CollectionId, PartitionId), StatsDelta>) {
        let mut counters = self.counters.lock();
        for (key, delta) in deltas {
            let counter = counters.entry(*key).or_default();
            counter.count += delta.count;
            counter.bytes += delta.bytes;
        }
    }

    /// Seeds a counter during recovery.
    pub fn seed(&self, collection: CollectionId, partition: PartitionId, count: i64, bytes: i64) {
        let mut counters = self.counters.lock();
        let counter = counters.entry((collection, partition)).or_default();
        counter.count += count;
        counter.bytes += bytes;
    }

    /// Returns `(count, bytes)` for one partition.
    #[must_use]
    pub fn get(&self, collection: CollectionId, partition: PartitionId) -> (u64, u64) {
        let counters = self.counters.lock();
        let counter = counters
            .get(&(collection, partition))
            .copied()
            .unwrap_or_default();
        (counter.count.max(0) as u64, counter.bytes.max(0) as u64)
    }

    /// Sums `(count, bytes)` across a collection.
    #[must_use]
    pub fn collection_totals(&self, collection: CollectionId) -> (u64, u64) {
        let counters = self.counters.lock();
        let mut count = 0i64;
        let mut bytes = 0i64;
        for ((coll, _), counter) in counters.iter() {
            if *coll == collection {
                count += counter.count;
                bytes += counter.bytes;
            }
        }
        (count.max(0) as u64, bytes.max(0) as u64)
    }

    /// Forgets a dropped partition's counters.
    pub fn forget_partition(&self, collection: CollectionId, partition: PartitionId) {
        self.counters.lock().remove(&(collection, partition));
    }

    /// Forgets a dropped collection's counters.
    pub fn forget_collection(&self, collection: CollectionId) {
        self.counters.lock().retain(|(coll, _), _| *coll != collection);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deltas_apply_at_publish() {
        let registry = CounterRegistry::new();
        let coll = CollectionId::new(1);
        let part = PartitionId::new(0);

        let mut deltas = HashMap::new();
        deltas.insert((coll, part), StatsDelta { count: 3, bytes: 300 });
        registry.apply(&deltas);
        assert_eq!(registry.get(coll, part), (3, 300));

        let mut removal = HashMap::new();
        removal.insert((coll, part), StatsDelta { count: -1, bytes: -100 });
        registry.apply(&removal);
        assert_eq!(registry.get(coll, part), (2, 200));
    }

    #[test]
    fn collection_totals_span_partitions() {
        let registry = CounterRegistry::new();
        let coll = CollectionId::new(1);
        registry.seed(coll, PartitionId::new(0), 2, 20);
        registry.seed(coll, PartitionId::new(1), 3, 30);
        registry.seed(CollectionId::new(2), PartitionId::new(0), 9, 90);
        assert_eq!(registry.collection_totals(coll), (5, 50));
    }

    #[test]
    fn forget_partition_removes_counters() {
        let registry = CounterRegistry::new();
        let coll = CollectionId::new(1);
        registry.seed(coll, PartitionId::new(0), 2, 20);
        registry.forget_partition(coll, PartitionId::new(0));
        assert_eq!(registry.get(coll, PartitionId::new(0)), (0, 0));
    }

    #[test]
    fn engine_counters() {
        let stats = EngineStats::new();
        stats.record_insert();
        stats.record_insert();
        stats.record_transaction_start();
        let snap = stats.snapshot();
        assert_eq!(snap.documents_inserted, 2);
        assert_eq!(snap.transactions_started, 1);
    }

    #[test]
    fn delta_merge() {
        let mut a = StatsDelta { count: 1, bytes: 10 };
        a.merge(StatsDelta { count: -2, bytes: 5 });
        assert_eq!(a, StatsDelta { count: -1, bytes: 15 });
    }
}
