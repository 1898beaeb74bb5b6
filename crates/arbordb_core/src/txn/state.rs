//! Transaction state and the two-tier write set.

use crate::catalog::CatalogOp;
use crate::config::Isolation;
use crate::error::{CoreError, CoreResult};
use crate::lock::{KeyRange, LockSpace};
use crate::stats::StatsDelta;
use crate::txn::spill::{SpillLog, SpillTarget};
use crate::types::{CollectionId, PartitionId, SequenceNumber, TransactionId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// Accepting operations.
    Active,
    /// Commit in progress.
    Committing,
    /// Abort in progress.
    Aborting,
    /// Durably committed.
    Committed,
    /// Rolled back.
    Aborted,
}

/// A resolved buffered write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingWrite {
    /// Insert or replace the value.
    Put(Vec<u8>),
    /// Delete the key.
    Delete,
}

impl PendingWrite {
    /// Converts to the batch form used at publish.
    #[must_use]
    pub fn into_value(self) -> Option<Vec<u8>> {
        match self {
            PendingWrite::Put(value) => Some(value),
            PendingWrite::Delete => None,
        }
    }
}

#[derive(Debug, Clone)]
enum MemWrite {
    Put(Vec<u8>),
    Delete,
}

#[derive(Debug, Clone)]
struct MemEntry {
    epoch: u32,
    write: MemWrite,
}

#[derive(Debug, Clone, Copy)]
enum SpillKind {
    Put { offset: u64, len: u32 },
    Delete,
}

#[derive(Debug, Clone, Copy)]
struct SpillEntry {
    epoch: u32,
    kind: SpillKind,
}

/// A transaction's buffered writes: an in-memory tier plus a spill log.
///
/// Writes stack per key so savepoint rollback can restore earlier
/// stagings. Once buffered bytes exceed the memory ceiling the memory
/// tier moves to the spill log and only the per-key index remains
/// resident; reads merge the tiers by recency (memory entries are always
/// newer than spilled ones for the same key).
#[derive(Debug)]
pub struct WriteSet {
    limit: usize,
    target: SpillTarget,
    txn: TransactionId,
    mem: BTreeMap<Vec<u8>, Vec<MemEntry>>,
    mem_bytes: usize,
    spill: Option<SpillLog>,
    spilled: BTreeMap<Vec<u8>, Vec<SpillEntry>>,
    dead_epochs: BTreeSet<u32>,
    current_epoch: u32,
    spill_events: u64,
}

impl WriteSet {
    /// Creates an empty write set.
    #[must_use]
    pub fn new(txn: TransactionId, limit: usize, target: SpillTarget) -> Self {
        Self {
            limit,
            target,
            txn,
            mem: BTreeMap::new(),
            mem_bytes: 0,
            spill: None,
            spilled: BTreeMap::new(),
            dead_epochs: BTreeSet::new(),
            current_epoch: 0,
            spill_events: 0,
        }
    }

    /// Stages a put. Returns true if this write triggered a spill.
    pub fn stage_put(&mut self, key: Vec<u8>, value: Vec<u8>) -> CoreResult<bool> {
        self.mem_bytes += key.len() + value.len();
        let entry = MemEntry {
            epoch: self.current_epoch,
            write: MemWrite::Put(value),
        };
        self.mem.entry(key).or_default().push(entry);
        self.maybe_spill()
    }

    /// Stages a delete. Returns true if this write triggered a spill.
    pub fn stage_delete(&mut self, key: Vec<u8>) -> CoreResult<bool> {
        self.mem_bytes += key.len();
        let entry = MemEntry {
            epoch: self.current_epoch,
            write: MemWrite::Delete,
        };
        self.mem.entry(key).or_default().push(entry);
        self.maybe_spill()
    }

    fn maybe_spill(&mut self) -> CoreResult<bool> {
        if self.mem_bytes <= self.limit {
            return Ok(false);
        }
        if self.spill.is_none() {
            self.spill = Some(self.target.open(self.txn)?);
        }
        // Invariant: spill was just ensured above.
        let log = self.spill.as_mut().ok_or(CoreError::TransactionClosed)?;

        let mem = std::mem::take(&mut self.mem);
        for (key, entries) in mem {
            let stack = self.spilled.entry(key).or_default();
            for entry in entries {
                let kind = match entry.write {
                    MemWrite::Put(value) => {
                        let offset = log.append(&value)?;
                        SpillKind::Put {
                            offset,
                            len: value.len() as u32,
                        }
                    }
                    MemWrite::Delete => SpillKind::Delete,
                };
                stack.push(SpillEntry {
                    epoch: entry.epoch,
                    kind,
                });
            }
        }
        log.flush()?;
        self.mem_bytes = 0;
        self.spill_events += 1;
        tracing::debug!(txn = %self.txn, "write set spilled to side log");
        Ok(true)
    }

    fn live_mem<'a>(&self, entries: &'a [MemEntry]) -> Option<&'a MemEntry> {
        entries
            .iter()
            .rev()
            .find(|e| !self.dead_epochs.contains(&e.epoch))
    }

    fn live_spilled(&self, entries: &[SpillEntry]) -> Option<SpillEntry> {
        entries
            .iter()
            .rev()
            .find(|e| !self.dead_epochs.contains(&e.epoch))
            .copied()
    }

    fn resolve_spilled(&self, entry: SpillEntry) -> CoreResult<PendingWrite> {
        match entry.kind {
            SpillKind::Delete => Ok(PendingWrite::Delete),
            SpillKind::Put { offset, len } => {
                let log = self.spill.as_ref().ok_or_else(|| {
                    CoreError::wal_corruption("spill entry without spill log")
                })?;
                Ok(PendingWrite::Put(log.read(offset, len as usize)?))
            }
        }
    }

    /// Returns the transaction's own staged write for a key, if any.
    pub fn get(&self, key: &[u8]) -> CoreResult<Option<PendingWrite>> {
        if let Some(entries) = self.mem.get(key) {
            if let Some(entry) = self.live_mem(entries) {
                return Ok(Some(match &entry.write {
                    MemWrite::Put(value) => PendingWrite::Put(value.clone()),
                    MemWrite::Delete => PendingWrite::Delete,
                }));
            }
        }
        if let Some(entries) = self.spilled.get(key) {
            if let Some(entry) = self.live_spilled(entries) {
                return Ok(Some(self.resolve_spilled(entry)?));
            }
        }
        Ok(None)
    }

    /// Resolved writes within `[lower, upper)`, ascending by key.
    pub fn writes_in_range(
        &self,
        lower: &[u8],
        upper: Option<&[u8]>,
    ) -> CoreResult<Vec<(Vec<u8>, Option<Vec<u8>>)>> {
        let range: (Bound<Vec<u8>>, Bound<Vec<u8>>) = (
            Bound::Included(lower.to_vec()),
            match upper {
                Some(key) => Bound::Excluded(key.to_vec()),
                None => Bound::Unbounded,
            },
        );

        let mut out: BTreeMap<Vec<u8>, PendingWrite> = BTreeMap::new();
        for (key, entries) in self.spilled.range(range.clone()) {
            if let Some(entry) = self.live_spilled(entries) {
                out.insert(key.clone(), self.resolve_spilled(entry)?);
            }
        }
        // Memory entries are newer and shadow spilled ones.
        for (key, entries) in self.mem.range(range) {
            if let Some(entry) = self.live_mem(entries) {
                let write = match &entry.write {
                    MemWrite::Put(value) => PendingWrite::Put(value.clone()),
                    MemWrite::Delete => PendingWrite::Delete,
                };
                out.insert(key.clone(), write);
            }
        }
        Ok(out
            .into_iter()
            .map(|(k, w)| (k, w.into_value()))
            .collect())
    }

    /// True if any live staged write falls in `[lower, upper)`.
    pub fn has_writes_in_range(&self, lower: &[u8], upper: Option<&[u8]>) -> CoreResult<bool> {
        Ok(!self.writes_in_range(lower, upper)?.is_empty())
    }

    /// All resolved writes, ascending by key. The commit stream.
    pub fn resolved(&self) -> CoreResult<Vec<(Vec<u8>, Option<Vec<u8>>)>> {
        self.writes_in_range(&[], None)
    }

    /// True if no live writes are staged.
    pub fn is_empty(&self) -> CoreResult<bool> {
        // Cheap path: nothing ever staged.
        if self.mem.is_empty() && self.spilled.is_empty() {
            return Ok(true);
        }
        Ok(self.resolved()?.is_empty())
    }

    /// Opens a savepoint, returning its epoch mark.
    pub fn begin_savepoint(&mut self) -> u32 {
        let mark = self.current_epoch;
        self.current_epoch += 1;
        mark
    }

    /// Discards every write staged after the savepoint mark.
    pub fn rollback_to(&mut self, mark: u32) {
        for epoch in (mark + 1)..=self.current_epoch {
            self.dead_epochs.insert(epoch);
        }
        // Memory entries can be purged eagerly; spilled ones are filtered
        // on read.
        for entries in self.mem.values_mut() {
            entries.retain(|e| !self.dead_epochs.contains(&e.epoch));
        }
        self.mem.retain(|_, entries| !entries.is_empty());
        self.current_epoch += 1;
    }

    /// The current epoch; writes staged now carry it.
    #[must_use]
    pub fn current_epoch(&self) -> u32 {
        self.current_epoch
    }

    /// True if this epoch was rolled back.
    #[must_use]
    pub fn epoch_is_dead(&self, epoch: u32) -> bool {
        self.dead_epochs.contains(&epoch)
    }

    /// Number of spill flushes performed.
    #[must_use]
    pub fn spill_events(&self) -> u64 {
        self.spill_events
    }

    /// Drops the spill log (and its file).
    pub fn discard(&mut self) {
        if let Some(mut log) = self.spill.take() {
            log.cleanup();
        }
    }
}

/// An in-flight transaction.
///
/// Interior-mutable so the active-transaction registry can share it: the
/// read-uncommitted overlay and the partition-boundary check both peek at
/// other transactions' buffered writes.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    isolation: Isolation,
    snapshot: SequenceNumber,
    state: Mutex<TxnState>,
    body: Mutex<TxnBody>,
}

#[derive(Debug)]
struct TxnBody {
    writes: WriteSet,
    ddl: Vec<(u32, CatalogOp)>,
    deltas: Vec<(u32, CollectionId, PartitionId, StatsDelta)>,
    savepoints: Vec<u32>,
    read_ranges: Vec<(LockSpace, KeyRange)>,
}

impl Transaction {
    /// Creates a transaction. Called by the transaction manager.
    pub(crate) fn new(
        id: TransactionId,
        isolation: Isolation,
        snapshot: SequenceNumber,
        mem_limit: usize,
        spill_target: SpillTarget,
    ) -> Self {
        Self {
            id,
            isolation,
            snapshot,
            state: Mutex::new(TxnState::Active),
            body: Mutex::new(TxnBody {
                writes: WriteSet::new(id, mem_limit, spill_target),
                ddl: Vec::new(),
                deltas: Vec::new(),
                savepoints: Vec::new(),
                read_ranges: Vec::new(),
            }),
        }
    }

    /// Transaction id.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Isolation level.
    #[must_use]
    pub fn isolation(&self) -> Isolation {
        self.isolation
    }

    /// The snapshot taken at begin.
    #[must_use]
    pub fn snapshot(&self) -> SequenceNumber {
        self.snapshot
    }

    /// The sequence this transaction reads at, given the current
    /// committed sequence.
    ///
    /// Read-committed refreshes per operation; read-uncommitted reads
    /// past every cutoff (the uncommitted overlay is applied above);
    /// snapshot and serializable stay fixed at begin.
    #[must_use]
    pub fn read_seq(&self, committed: SequenceNumber) -> SequenceNumber {
        match self.isolation {
            Isolation::ReadCommitted => committed,
            Isolation::ReadUncommitted => SequenceNumber::new(u64::MAX),
            Isolation::Snapshot | Isolation::Serializable => self.snapshot,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TxnState {
        *self.state.lock()
    }

    /// True while operations are accepted.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == TxnState::Active
    }

    /// Fails with [`CoreError::TransactionClosed`] unless active.
    pub fn ensure_active(&self) -> CoreResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(CoreError::TransactionClosed)
        }
    }

    pub(crate) fn transition(&self, to: TxnState) {
        *self.state.lock() = to;
    }

    /// Stages a put; returns true if the write set spilled.
    pub fn stage_put(&self, key: Vec<u8>, value: Vec<u8>) -> CoreResult<bool> {
        self.ensure_active()?;
        self.body.lock().writes.stage_put(key, value)
    }

    /// Stages a delete; returns true if the write set spilled.
    pub fn stage_delete(&self, key: Vec<u8>) -> CoreResult<bool> {
        self.ensure_active()?;
        self.body.lock().writes.stage_delete(key)
    }

    /// Reads the transaction's own staged write for a key.
    pub fn read_own(&self, key: &[u8]) -> CoreResult<Option<PendingWrite>> {
        self.body.lock().writes.get(key)
    }

    /// Resolved staged writes within a key range.
    pub fn writes_in_range(
        &self,
        lower: &[u8],
        upper: Option<&[u8]>,
    ) -> CoreResult<Vec<(Vec<u8>, Option<Vec<u8>>)>> {
        self.body.lock().writes.writes_in_range(lower, upper)
    }

    /// True if any staged write falls in the range.
    pub fn has_writes_in_range(&self, lower: &[u8], upper: Option<&[u8]>) -> CoreResult<bool> {
        self.body.lock().writes.has_writes_in_range(lower, upper)
    }

    /// All resolved staged writes, for commit.
    pub fn resolved_writes(&self) -> CoreResult<Vec<(Vec<u8>, Option<Vec<u8>>)>> {
        self.body.lock().writes.resolved()
    }

    /// Number of spill flushes so far.
    #[must_use]
    pub fn spill_events(&self) -> u64 {
        self.body.lock().writes.spill_events()
    }

    /// Stages a catalog operation.
    pub fn stage_ddl(&self, op: CatalogOp) -> CoreResult<()> {
        self.ensure_active()?;
        let mut body = self.body.lock();
        let epoch = body.writes.current_epoch();
        body.ddl.push((epoch, op));
        Ok(())
    }

    /// The live staged catalog operations, in staging order.
    pub fn staged_ddl(&self) -> Vec<CatalogOp> {
        let body = self.body.lock();
        body.ddl
            .iter()
            .filter(|(epoch, _)| !body.writes.epoch_is_dead(*epoch))
            .map(|(_, op)| op.clone())
            .collect()
    }

    /// Accumulates a row-count/byte delta for a partition.
    pub fn add_stats_delta(
        &self,
        collection: CollectionId,
        partition: PartitionId,
        delta: StatsDelta,
    ) {
        let mut body = self.body.lock();
        let epoch = body.writes.current_epoch();
        body.deltas.push((epoch, collection, partition, delta));
    }

    /// The live merged stats deltas.
    #[must_use]
    pub fn merged_deltas(&self) -> HashMap<(CollectionId, PartitionId), StatsDelta> {
        let body = self.body.lock();
        let mut out: HashMap<(CollectionId, PartitionId), StatsDelta> = HashMap::new();
        for (epoch, collection, partition, delta) in &body.deltas {
            if !body.writes.epoch_is_dead(*epoch) {
                out.entry((*collection, *partition)).or_default().merge(*delta);
            }
        }
        out
    }

    /// The staged delta total for one partition (capped-collection
    /// bookkeeping reads its own staged state).
    #[must_use]
    pub fn delta_for(&self, collection: CollectionId, partition: PartitionId) -> StatsDelta {
        let body = self.body.lock();
        let mut out = StatsDelta::default();
        for (epoch, coll, part, delta) in &body.deltas {
            if *coll == collection && *part == partition && !body.writes.epoch_is_dead(*epoch) {
                out.merge(*delta);
            }
        }
        out
    }

    /// Records a scanned range for serializable commit validation.
    pub fn record_read_range(&self, space: LockSpace, range: KeyRange) {
        self.body.lock().read_ranges.push((space, range));
    }

    /// The recorded read ranges.
    #[must_use]
    pub fn read_ranges(&self) -> Vec<(LockSpace, KeyRange)> {
        self.body.lock().read_ranges.clone()
    }

    /// Opens a savepoint (a nested transaction level).
    pub fn begin_savepoint(&self) -> CoreResult<()> {
        self.ensure_active()?;
        let mut body = self.body.lock();
        let mark = body.writes.begin_savepoint();
        body.savepoints.push(mark);
        Ok(())
    }

    /// Number of open savepoints.
    #[must_use]
    pub fn savepoint_depth(&self) -> usize {
        self.body.lock().savepoints.len()
    }

    /// Commits the innermost savepoint: its writes merge into the parent.
    pub fn release_savepoint(&self) -> CoreResult<()> {
        self.ensure_active()?;
        let mut body = self.body.lock();
        body.savepoints
            .pop()
            .map(|_| ())
            .ok_or_else(|| CoreError::validation("no open savepoint"))
    }

    /// Rolls back the innermost savepoint, discarding only its writes.
    pub fn rollback_savepoint(&self) -> CoreResult<()> {
        self.ensure_active()?;
        let mut body = self.body.lock();
        let mark = body
            .savepoints
            .pop()
            .ok_or_else(|| CoreError::validation("no open savepoint"))?;
        body.writes.rollback_to(mark);
        Ok(())
    }

    /// Drops transient resources after commit or rollback.
    pub(crate) fn discard_buffers(&self) {
        self.body.lock().writes.discard();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_set(limit: usize) -> WriteSet {
        WriteSet::new(TransactionId::new(1), limit, SpillTarget::Memory)
    }

    #[test]
    fn stage_and_read_back() {
        let mut ws = write_set(1 << 20);
        ws.stage_put(b"k".to_vec(), b"v".to_vec()).unwrap();
        assert_eq!(
            ws.get(b"k").unwrap(),
            Some(PendingWrite::Put(b"v".to_vec()))
        );
        ws.stage_delete(b"k".to_vec()).unwrap();
        assert_eq!(ws.get(b"k").unwrap(), Some(PendingWrite::Delete));
    }

    #[test]
    fn spill_preserves_reads() {
        // A tiny limit forces a spill on every write.
        let mut ws = write_set(8);
        for i in 0..20u8 {
            ws.stage_put(vec![i], vec![i; 16]).unwrap();
        }
        assert!(ws.spill_events() > 0);
        for i in 0..20u8 {
            assert_eq!(
                ws.get(&[i]).unwrap(),
                Some(PendingWrite::Put(vec![i; 16])),
                "key {i} must survive the spill"
            );
        }
    }

    #[test]
    fn memory_tier_shadows_spilled() {
        let mut ws = write_set(8);
        ws.stage_put(b"k".to_vec(), vec![1; 32]).unwrap(); // spills
        ws.stage_put(b"k".to_vec(), b"new".to_vec()).unwrap();
        assert_eq!(
            ws.get(b"k").unwrap(),
            Some(PendingWrite::Put(b"new".to_vec()))
        );
    }

    #[test]
    fn resolved_merges_tiers_in_key_order() {
        let mut ws = write_set(8);
        ws.stage_put(b"b".to_vec(), vec![2; 32]).unwrap(); // spills
        ws.stage_put(b"a".to_vec(), b"1".to_vec()).unwrap();
        ws.stage_delete(b"c".to_vec()).unwrap();

        let resolved = ws.resolved().unwrap();
        let keys: Vec<&[u8]> = resolved.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, [b"a", b"b", b"c"]);
        assert!(resolved[2].1.is_none());
    }

    #[test]
    fn savepoint_rollback_restores_earlier_write() {
        let mut ws = write_set(1 << 20);
        ws.stage_put(b"k".to_vec(), b"outer".to_vec()).unwrap();
        let mark = ws.begin_savepoint();
        ws.stage_put(b"k".to_vec(), b"inner".to_vec()).unwrap();
        assert_eq!(
            ws.get(b"k").unwrap(),
            Some(PendingWrite::Put(b"inner".to_vec()))
        );
        ws.rollback_to(mark);
        assert_eq!(
            ws.get(b"k").unwrap(),
            Some(PendingWrite::Put(b"outer".to_vec()))
        );
    }

    #[test]
    fn savepoint_rollback_spans_spill() {
        let mut ws = write_set(8);
        ws.stage_put(b"k".to_vec(), vec![7; 32]).unwrap(); // spills
        let mark = ws.begin_savepoint();
        ws.stage_put(b"k".to_vec(), vec![8; 32]).unwrap(); // spills again
        ws.rollback_to(mark);
        assert_eq!(
            ws.get(b"k").unwrap(),
            Some(PendingWrite::Put(vec![7; 32]))
        );
    }

    #[test]
    fn writes_after_savepoint_rollback_are_live() {
        let mut ws = write_set(1 << 20);
        let mark = ws.begin_savepoint();
        ws.stage_put(b"k".to_vec(), b"dead".to_vec()).unwrap();
        ws.rollback_to(mark);
        ws.stage_put(b"k".to_vec(), b"live".to_vec()).unwrap();
        assert_eq!(
            ws.get(b"k").unwrap(),
            Some(PendingWrite::Put(b"live".to_vec()))
        );
    }

    #[test]
    fn transaction_savepoint_stack() {
        let txn = Transaction::new(
            TransactionId::new(1),
            Isolation::ReadCommitted,
            SequenceNumber::ZERO,
            1 << 20,
            SpillTarget::Memory,
        );
        txn.stage_put(b"a".to_vec(), b"1".to_vec()).unwrap();
        txn.begin_savepoint().unwrap();
        txn.stage_put(b"b".to_vec(), b"2".to_vec()).unwrap();
        assert_eq!(txn.savepoint_depth(), 1);

        txn.rollback_savepoint().unwrap();
        assert_eq!(txn.savepoint_depth(), 0);
        assert!(txn.read_own(b"b").unwrap().is_none());
        assert!(txn.read_own(b"a").unwrap().is_some());
    }

    #[test]
    fn closed_transaction_rejects_writes() {
        let txn = Transaction::new(
            TransactionId::new(1),
            Isolation::ReadCommitted,
            SequenceNumber::ZERO,
            1 << 20,
            SpillTarget::Memory,
        );
        txn.transition(TxnState::Aborted);
        let result = txn.stage_put(b"k".to_vec(), b"v".to_vec());
        assert!(matches!(result, Err(CoreError::TransactionClosed)));
    }

    #[test]
    fn read_seq_by_isolation() {
        let committed = SequenceNumber::new(9);
        let snap = SequenceNumber::new(5);
        let cases = [
            (Isolation::ReadCommitted, committed),
            (Isolation::Snapshot, snap),
            (Isolation::Serializable, snap),
            (Isolation::ReadUncommitted, SequenceNumber::new(u64::MAX)),
        ];
        for (isolation, expected) in cases {
            let txn = Transaction::new(
                TransactionId::new(1),
                isolation,
                snap,
                1 << 20,
                SpillTarget::Memory,
            );
            assert_eq!(txn.read_seq(committed), expected);
        }
    }

    #[test]
    fn savepoint_masks_ddl_and_deltas() {
        let txn = Transaction::new(
            TransactionId::new(1),
            Isolation::ReadCommitted,
            SequenceNumber::ZERO,
            1 << 20,
            SpillTarget::Memory,
        );
        let coll = CollectionId::new(1);
        let part = PartitionId::new(0);
        txn.add_stats_delta(coll, part, StatsDelta { count: 1, bytes: 10 });
        txn.begin_savepoint().unwrap();
        txn.add_stats_delta(coll, part, StatsDelta { count: 5, bytes: 50 });
        txn.stage_ddl(CatalogOp::DropCollection("x".into())).unwrap();
        txn.rollback_savepoint().unwrap();

        assert!(txn.staged_ddl().is_empty());
        let deltas = txn.merged_deltas();
        assert_eq!(deltas[&(coll, part)], StatsDelta { count: 1, bytes: 10 });
    }
}
