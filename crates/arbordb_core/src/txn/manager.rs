//! Transaction manager: begin, commit, rollback, publish.

use crate::catalog::{catalog_op_to_bytes, Catalog, CatalogOp};
use crate::config::Isolation;
use crate::error::{CoreError, CoreResult};
use crate::heap::{HeapRecord, HeapStore};
use crate::kv::VersionStore;
use crate::lock::{LockManager, LockMode};
use crate::stats::{CounterRegistry, EngineStats};
use crate::txn::spill::SpillTarget;
use crate::txn::state::{Transaction, TxnState};
use crate::types::{SequenceNumber, TransactionId};
use crate::wal::{WalManager, WalRecord};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Coordinates transactions over the WAL, heap, version store, catalog,
/// and lock manager.
///
/// Commits serialize on a single commit lock: sequence assignment, WAL
/// append + flush, version-store publish, and catalog publish happen
/// under it, which is what makes a commit atomic with respect to every
/// concurrent snapshot.
pub struct TransactionManager {
    wal: Arc<WalManager>,
    heap: Arc<HeapStore>,
    store: Arc<VersionStore>,
    locks: Arc<LockManager>,
    catalog: Arc<Catalog>,
    counters: Arc<CounterRegistry>,
    stats: Arc<EngineStats>,
    next_txid: AtomicU64,
    next_seq: AtomicU64,
    committed_seq: AtomicU64,
    commit_lock: Mutex<()>,
    active: RwLock<BTreeMap<TransactionId, Arc<Transaction>>>,
    pins: Mutex<BTreeMap<u64, usize>>,
    txn_mem_limit: usize,
    spill_target: SpillTarget,
    max_version_chain: usize,
    default_isolation: Isolation,
}

impl TransactionManager {
    /// Creates a manager with recovered counters.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        wal: Arc<WalManager>,
        heap: Arc<HeapStore>,
        store: Arc<VersionStore>,
        locks: Arc<LockManager>,
        catalog: Arc<Catalog>,
        counters: Arc<CounterRegistry>,
        stats: Arc<EngineStats>,
        next_txid: u64,
        committed_seq: u64,
        txn_mem_limit: usize,
        spill_target: SpillTarget,
        max_version_chain: usize,
        default_isolation: Isolation,
    ) -> Self {
        Self {
            wal,
            heap,
            store,
            locks,
            catalog,
            counters,
            stats,
            next_txid: AtomicU64::new(next_txid),
            next_seq: AtomicU64::new(committed_seq + 1),
            committed_seq: AtomicU64::new(committed_seq),
            commit_lock: Mutex::new(()),
            active: RwLock::new(BTreeMap::new()),
            pins: Mutex::new(BTreeMap::new()),
            txn_mem_limit,
            spill_target,
            max_version_chain,
            default_isolation,
        }
    }

    /// Begins a transaction at the current committed snapshot.
    pub fn begin(&self, isolation: Option<Isolation>) -> CoreResult<Arc<Transaction>> {
        let isolation = isolation.unwrap_or(self.default_isolation);
        let txid = TransactionId::new(self.next_txid.fetch_add(1, Ordering::SeqCst));
        let snapshot = self.committed_seq();

        self.wal.append(&WalRecord::Begin { txid })?;

        let txn = Arc::new(Transaction::new(
            txid,
            isolation,
            snapshot,
            self.txn_mem_limit,
            self.spill_target.clone(),
        ));
        self.active.write().insert(txid, Arc::clone(&txn));
        self.stats.record_transaction_start();
        Ok(txn)
    }

    /// Commits a transaction: validate, log, publish.
    pub fn commit(&self, txn: &Arc<Transaction>) -> CoreResult<SequenceNumber> {
        txn.ensure_active()?;
        txn.transition(TxnState::Committing);

        let writes = txn.resolved_writes()?;
        let ddl = txn.staged_ddl();

        let guard = self.commit_lock.lock();

        // First-committer-wins validation for fixed-snapshot isolation.
        if matches!(
            txn.isolation(),
            Isolation::Snapshot | Isolation::Serializable
        ) {
            for (key, _) in &writes {
                if let Some(latest) = self.store.latest_seq(key) {
                    if latest > txn.snapshot() {
                        drop(guard);
                        self.finish_abort(txn)?;
                        return Err(CoreError::Conflict { txn: txn.id() });
                    }
                }
            }
        }
        // Serializable additionally requires every recorded read range to
        // still be covered by a held lock.
        if txn.isolation() == Isolation::Serializable {
            for (space, range) in txn.read_ranges() {
                if !self.locks.holds(txn.id(), space, &range, LockMode::Read)
                    && !self.locks.holds(txn.id(), space, &range, LockMode::Write)
                {
                    drop(guard);
                    self.finish_abort(txn)?;
                    return Err(CoreError::Conflict { txn: txn.id() });
                }
            }
        }

        let seq = SequenceNumber::new(self.next_seq.fetch_add(1, Ordering::SeqCst));

        // WAL first: a commit is durable before it is visible.
        for (key, value) in &writes {
            let record = match value {
                Some(value) => WalRecord::Put {
                    txid: txn.id(),
                    key: key.clone(),
                    value: value.clone(),
                },
                None => WalRecord::Delete {
                    txid: txn.id(),
                    key: key.clone(),
                },
            };
            self.wal.append(&record)?;
        }
        for op in &ddl {
            self.wal.append(&WalRecord::Ddl {
                txid: txn.id(),
                op: catalog_op_to_bytes(op),
            })?;
        }
        self.wal.append(&WalRecord::Commit {
            txid: txn.id(),
            sequence: seq,
        })?;
        self.wal.flush()?;

        // Publish atomically under the commit lock.
        let min_active = self.min_active_snapshot_locked();
        self.store
            .apply_batch(&writes, txn.id(), seq, min_active, self.max_version_chain);
        let pre_ddl_state = self.catalog.head();
        self.catalog.publish(&ddl, seq)?;
        self.counters.apply(&txn.merged_deltas());
        for op in &ddl {
            match op {
                CatalogOp::DropCollection(name) => {
                    if let Some(def) = pre_ddl_state.collection(name) {
                        self.counters.forget_collection(def.id);
                    }
                }
                CatalogOp::DropPartition { collection, id } => {
                    if let Some(def) = pre_ddl_state.collection(collection) {
                        self.counters.forget_partition(def.id, *id);
                    }
                }
                _ => {}
            }
        }

        for (key, value) in &writes {
            let record = match value {
                Some(value) => HeapRecord::put(key.clone(), value.clone(), seq, txn.id()),
                None => HeapRecord::tombstone(key.clone(), seq, txn.id()),
            };
            self.heap.append(&record)?;
        }
        self.heap.flush()?;

        self.committed_seq.store(seq.as_u64(), Ordering::SeqCst);
        drop(guard);

        self.active.write().remove(&txn.id());
        self.locks.release_all(txn.id());
        txn.discard_buffers();
        txn.transition(TxnState::Committed);
        self.stats.record_transaction_commit();
        tracing::debug!(txn = %txn.id(), %seq, writes = writes.len(), "committed");
        Ok(seq)
    }

    /// Rolls back a transaction, discarding all staged state.
    pub fn rollback(&self, txn: &Arc<Transaction>) -> CoreResult<()> {
        txn.ensure_active()?;
        txn.transition(TxnState::Aborting);
        self.finish_abort(txn)
    }

    /// Aborts a transaction already transitioned out of `Active` (commit
    /// validation failures and lock-conflict victims).
    pub fn finish_abort(&self, txn: &Arc<Transaction>) -> CoreResult<()> {
        self.wal.append(&WalRecord::Abort { txid: txn.id() })?;
        self.active.write().remove(&txn.id());
        self.locks.release_all(txn.id());
        txn.discard_buffers();
        txn.transition(TxnState::Aborted);
        self.stats.record_transaction_abort();
        tracing::debug!(txn = %txn.id(), "aborted");
        Ok(())
    }

    /// The current committed sequence.
    #[must_use]
    pub fn committed_seq(&self) -> SequenceNumber {
        SequenceNumber::new(self.committed_seq.load(Ordering::SeqCst))
    }

    /// Number of active transactions.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.read().len()
    }

    /// Pins a snapshot so vacuum keeps versions it can see (cursors
    /// outside transactions hold pins).
    pub fn pin_snapshot(&self, seq: SequenceNumber) {
        *self.pins.lock().entry(seq.as_u64()).or_insert(0) += 1;
    }

    /// Releases a snapshot pin.
    pub fn unpin_snapshot(&self, seq: SequenceNumber) {
        let mut pins = self.pins.lock();
        if let Some(count) = pins.get_mut(&seq.as_u64()) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&seq.as_u64());
            }
        }
    }

    /// The oldest sequence any snapshot may still read.
    #[must_use]
    pub fn min_active_snapshot(&self) -> SequenceNumber {
        self.min_active_snapshot_locked()
    }

    fn min_active_snapshot_locked(&self) -> SequenceNumber {
        let mut min = self.committed_seq();
        for txn in self.active.read().values() {
            min = min.min(txn.snapshot());
        }
        if let Some((&seq, _)) = self.pins.lock().first_key_value() {
            min = min.min(SequenceNumber::new(seq));
        }
        min
    }

    /// The most recent uncommitted write to `key` staged by any other
    /// active transaction. Read-uncommitted reads overlay this over
    /// committed state.
    pub fn overlay_get(
        &self,
        key: &[u8],
        exclude: Option<TransactionId>,
    ) -> CoreResult<Option<Option<Vec<u8>>>> {
        let active = self.active.read();
        let mut found: Option<(TransactionId, Option<Vec<u8>>)> = None;
        for (txid, txn) in active.iter().rev() {
            if Some(*txid) == exclude {
                continue;
            }
            if let Some(write) = txn.read_own(key)? {
                found = Some((*txid, write.into_value()));
                break;
            }
        }
        Ok(found.map(|(_, v)| v))
    }

    /// Uncommitted writes in a key range across all other active
    /// transactions, newest transaction winning per key.
    pub fn overlay_range(
        &self,
        lower: &[u8],
        upper: Option<&[u8]>,
        exclude: Option<TransactionId>,
    ) -> CoreResult<BTreeMap<Vec<u8>, Option<Vec<u8>>>> {
        let active = self.active.read();
        let mut merged: BTreeMap<Vec<u8>, Option<Vec<u8>>> = BTreeMap::new();
        for (txid, txn) in active.iter() {
            if Some(*txid) == exclude {
                continue;
            }
            for (key, value) in txn.writes_in_range(lower, upper)? {
                merged.insert(key, value);
            }
        }
        Ok(merged)
    }

    /// True if any other active transaction has staged writes in the
    /// range. Guards partition-boundary changes.
    pub fn any_active_writes_in_range(
        &self,
        lower: &[u8],
        upper: Option<&[u8]>,
        exclude: Option<TransactionId>,
    ) -> CoreResult<bool> {
        let active = self.active.read();
        for (txid, txn) in active.iter() {
            if Some(*txid) == exclude {
                continue;
            }
            if txn.has_writes_in_range(lower, upper)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Shared lock manager.
    #[must_use]
    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Shared per-partition counters.
    #[must_use]
    pub fn counters(&self) -> &Arc<CounterRegistry> {
        &self.counters
    }

    /// Runs `f` while holding the commit lock, keeping checkpoints and
    /// vacuum consistent with in-flight commits.
    pub(crate) fn with_commit_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.commit_lock.lock();
        f()
    }

    /// Shared engine counters.
    #[must_use]
    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.stats
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("committed_seq", &self.committed_seq())
            .field("active_count", &self.active_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbordb_storage::MemoryBackend;
    use std::time::Duration;

    fn manager() -> TransactionManager {
        TransactionManager::new(
            Arc::new(WalManager::new(Box::new(MemoryBackend::new()), false)),
            Arc::new(HeapStore::new(Box::new(MemoryBackend::new()))),
            Arc::new(VersionStore::new()),
            Arc::new(LockManager::new(Duration::from_millis(50))),
            Arc::new(Catalog::new()),
            Arc::new(CounterRegistry::new()),
            Arc::new(EngineStats::new()),
            1,
            0,
            1 << 20,
            SpillTarget::Memory,
            16,
            Isolation::ReadCommitted,
        )
    }

    #[test]
    fn begin_creates_active_transaction() {
        let tm = manager();
        let txn = tm.begin(None).unwrap();
        assert!(txn.is_active());
        assert_eq!(tm.active_count(), 1);
    }

    #[test]
    fn commit_publishes_writes() {
        let tm = manager();
        let txn = tm.begin(None).unwrap();
        txn.stage_put(b"k".to_vec(), b"v".to_vec()).unwrap();
        let seq = tm.commit(&txn).unwrap();
        assert_eq!(seq.as_u64(), 1);
        assert_eq!(tm.active_count(), 0);
        assert_eq!(
            tm.store.get(b"k", tm.committed_seq()),
            Some(b"v".to_vec())
        );
    }

    #[test]
    fn rollback_discards_writes() {
        let tm = manager();
        let txn = tm.begin(None).unwrap();
        txn.stage_put(b"k".to_vec(), b"v".to_vec()).unwrap();
        tm.rollback(&txn).unwrap();
        assert_eq!(tm.store.get(b"k", tm.committed_seq()), None);
        assert_eq!(tm.active_count(), 0);
        assert!(!txn.is_active());
    }

    #[test]
    fn cannot_commit_twice() {
        let tm = manager();
        let txn = tm.begin(None).unwrap();
        tm.commit(&txn).unwrap();
        assert!(matches!(
            tm.commit(&txn),
            Err(CoreError::TransactionClosed)
        ));
    }

    #[test]
    fn sequence_numbers_increase() {
        let tm = manager();
        let t1 = tm.begin(None).unwrap();
        let s1 = tm.commit(&t1).unwrap();
        let t2 = tm.begin(None).unwrap();
        let s2 = tm.commit(&t2).unwrap();
        assert!(s2 > s1);
    }

    #[test]
    fn snapshot_reader_misses_later_commit() {
        let tm = manager();
        {
            let txn = tm.begin(None).unwrap();
            txn.stage_put(b"k".to_vec(), b"v1".to_vec()).unwrap();
            tm.commit(&txn).unwrap();
        }
        let reader = tm.begin(Some(Isolation::Snapshot)).unwrap();
        {
            let txn = tm.begin(None).unwrap();
            txn.stage_put(b"k".to_vec(), b"v2".to_vec()).unwrap();
            tm.commit(&txn).unwrap();
        }
        // The reader's fixed snapshot still resolves the old version.
        assert_eq!(
            tm.store.get(b"k", reader.read_seq(tm.committed_seq())),
            Some(b"v1".to_vec())
        );
        // A fresh read-committed view sees the new one.
        assert_eq!(
            tm.store.get(b"k", tm.committed_seq()),
            Some(b"v2".to_vec())
        );
    }

    #[test]
    fn first_committer_wins() {
        let tm = manager();
        {
            let txn = tm.begin(None).unwrap();
            txn.stage_put(b"k".to_vec(), b"v0".to_vec()).unwrap();
            tm.commit(&txn).unwrap();
        }
        let t1 = tm.begin(Some(Isolation::Snapshot)).unwrap();
        let t2 = tm.begin(Some(Isolation::Snapshot)).unwrap();
        t1.stage_put(b"k".to_vec(), b"v1".to_vec()).unwrap();
        t2.stage_put(b"k".to_vec(), b"v2".to_vec()).unwrap();

        tm.commit(&t1).unwrap();
        let result = tm.commit(&t2);
        assert!(matches!(result, Err(CoreError::Conflict { .. })));
        assert!(!t2.is_active());
        // The loser's write left no trace.
        assert_eq!(
            tm.store.get(b"k", tm.committed_seq()),
            Some(b"v1".to_vec())
        );
    }

    #[test]
    fn overlay_sees_other_active_writes() {
        let tm = manager();
        let writer = tm.begin(None).unwrap();
        writer.stage_put(b"k".to_vec(), b"dirty".to_vec()).unwrap();

        let overlay = tm.overlay_get(b"k", None).unwrap();
        assert_eq!(overlay, Some(Some(b"dirty".to_vec())));

        // Excluding the writer hides it.
        let excluded = tm.overlay_get(b"k", Some(writer.id())).unwrap();
        assert!(excluded.is_none());
        tm.rollback(&writer).unwrap();
    }

    #[test]
    fn active_writes_in_range_guard() {
        let tm = manager();
        let writer = tm.begin(None).unwrap();
        writer.stage_put(b"m".to_vec(), b"v".to_vec()).unwrap();

        assert!(tm
            .any_active_writes_in_range(b"l", Some(b"z"), None)
            .unwrap());
        assert!(!tm
            .any_active_writes_in_range(b"a", Some(b"l"), None)
            .unwrap());
        tm.rollback(&writer).unwrap();
    }

    #[test]
    fn min_active_snapshot_tracks_oldest() {
        let tm = manager();
        {
            let txn = tm.begin(None).unwrap();
            txn.stage_put(b"k".to_vec(), b"v".to_vec()).unwrap();
            tm.commit(&txn).unwrap();
        }
        assert_eq!(tm.min_active_snapshot().as_u64(), 1);

        let old = tm.begin(Some(Isolation::Snapshot)).unwrap();
        {
            let txn = tm.begin(None).unwrap();
            txn.stage_put(b"k".to_vec(), b"v2".to_vec()).unwrap();
            tm.commit(&txn).unwrap();
        }
        // The open snapshot holds the floor down.
        assert_eq!(tm.min_active_snapshot().as_u64(), 1);
        tm.rollback(&old).unwrap();
        assert_eq!(tm.min_active_snapshot().as_u64(), 2);
    }

    #[test]
    fn pins_hold_the_floor() {
        let tm = manager();
        {
            let txn = tm.begin(None).unwrap();
            txn.stage_put(b"k".to_vec(), b"v".to_vec()).unwrap();
            tm.commit(&txn).unwrap();
        }
        tm.pin_snapshot(SequenceNumber::new(1));
        {
            let txn = tm.begin(None).unwrap();
            txn.stage_put(b"k".to_vec(), b"v2".to_vec()).unwrap();
            tm.commit(&txn).unwrap();
        }
        assert_eq!(tm.min_active_snapshot().as_u64(), 1);
        tm.unpin_snapshot(SequenceNumber::new(1));
        assert_eq!(tm.min_active_snapshot().as_u64(), 2);
    }
}
