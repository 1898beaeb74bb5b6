//! Collection operation layer.
//!
//! Routes document operations through the catalog (definitions and
//! partition layout), the index layer (key extraction, uniqueness), the
//! lock manager, and the transaction's write buffer, down to the
//! versioned store. Everything here stages writes into the transaction;
//! nothing becomes visible until the transaction manager publishes it.

use crate::catalog::{Catalog, CatalogState, CollectionDef, IndexDef};
use crate::config::Isolation;
use crate::error::{CoreError, CoreResult};
use crate::filter::{Filter, Mutation};
use crate::index;
use crate::keyspace;
use crate::kv::{ScanDirection, VersionStore};
use crate::lock::{KeyRange, LockMode, LockSpace};
use crate::stats::StatsDelta;
use crate::txn::{PendingWrite, Transaction, TransactionManager};
use crate::types::{PartitionId, SequenceNumber};
use arbordb_codec::{decode_document, encode_document, keys, Document, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Page size used by internal full scans.
const SCAN_BATCH: usize = 256;

/// The result of an update operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateResult {
    /// Documents matched by the filter.
    pub matched: u64,
    /// Documents actually modified.
    pub modified: u64,
}

/// The result of a remove operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemoveResult {
    /// Documents removed.
    pub removed: u64,
}

/// A page of scanned documents with a resume token.
#[derive(Debug, Default)]
pub struct DocPage {
    /// Documents with their full store keys, in scan order.
    pub items: Vec<(Vec<u8>, Document)>,
    /// Token to continue from; `None` when exhausted.
    pub resume: Option<Vec<u8>>,
}

/// Executes document operations against one database's shared state.
pub(crate) struct Executor<'a> {
    pub manager: &'a TransactionManager,
    pub catalog: &'a Catalog,
    pub store: &'a VersionStore,
}

impl<'a> Executor<'a> {
    /// The catalog state a transaction currently sees, staged DDL
    /// included.
    pub fn state_for(&self, txn: &Arc<Transaction>) -> CoreResult<Arc<CatalogState>> {
        let seq = txn.read_seq(self.manager.committed_seq());
        self.catalog.effective(seq, &txn.staged_ddl())
    }

    fn read_seq(&self, txn: &Arc<Transaction>) -> SequenceNumber {
        txn.read_seq(self.manager.committed_seq())
    }

    // === Point reads ===

    /// Reads a key through the transaction: own writes first, then the
    /// uncommitted overlay (read-uncommitted only), then the store.
    fn read_key(
        &self,
        txn: &Arc<Transaction>,
        key: &[u8],
        at: SequenceNumber,
    ) -> CoreResult<Option<Vec<u8>>> {
        if let Some(write) = txn.read_own(key)? {
            return Ok(match write {
                PendingWrite::Put(value) => Some(value),
                PendingWrite::Delete => None,
            });
        }
        if txn.isolation() == Isolation::ReadUncommitted {
            if let Some(value) = self.manager.overlay_get(key, Some(txn.id()))? {
                return Ok(value);
            }
        }
        Ok(self.store.get(key, at))
    }

    /// Fetches a document by encoded primary key.
    pub fn read_by_pk(
        &self,
        txn: &Arc<Transaction>,
        def: &CollectionDef,
        pk: &[u8],
    ) -> CoreResult<Option<Document>> {
        let at = self.read_seq(txn);
        let partition = def.layout.route(pk).id;
        let key = keyspace::data_key(def.id, crate::types::IndexId::PRIMARY, partition, pk);
        match self.read_key(txn, &key, at)? {
            Some(bytes) => Ok(Some(decode_document(&bytes)?)),
            None => Ok(None),
        }
    }

    // === Merged scans ===

    /// Scans one (collection, index, partition) region at `at`, merging
    /// the transaction's staged writes (and the uncommitted overlay for
    /// read-uncommitted) over committed rows.
    fn scan_region_page(
        &self,
        txn: &Arc<Transaction>,
        region: &[u8],
        at: SequenceNumber,
        direction: ScanDirection,
        resume: Option<&[u8]>,
        limit: usize,
    ) -> CoreResult<(Vec<(Vec<u8>, Vec<u8>)>, Option<Vec<u8>>)> {
        let region_end = keyspace::prefix_end(region);
        let page = self.store.scan_page(
            region,
            region_end.as_deref(),
            at,
            direction,
            resume,
            limit,
        );

        // The merge window: everything between the resume point and the
        // last key the store examined (the whole region when exhausted).
        let (win_lower, win_upper) = match direction {
            ScanDirection::Forward => {
                let lower = resume.map_or_else(|| region.to_vec(), key_after);
                let upper = match &page.resume {
                    Some(last) => Some(key_after(last)),
                    None => region_end.clone(),
                };
                (lower, upper)
            }
            ScanDirection::Backward => {
                let lower = match &page.resume {
                    Some(last) => last.clone(),
                    None => region.to_vec(),
                };
                let upper = match resume {
                    Some(key) => Some(key.to_vec()),
                    None => region_end.clone(),
                };
                (lower, upper)
            }
        };

        let mut merged: BTreeMap<Vec<u8>, Option<Vec<u8>>> = page
            .items
            .into_iter()
            .map(|(k, v)| (k, Some(v)))
            .collect();
        if txn.isolation() == Isolation::ReadUncommitted {
            for (key, value) in
                self.manager
                    .overlay_range(&win_lower, win_upper.as_deref(), Some(txn.id()))?
            {
                merged.insert(key, value);
            }
        }
        for (key, value) in txn.writes_in_range(&win_lower, win_upper.as_deref())? {
            merged.insert(key, value);
        }

        let mut items: Vec<(Vec<u8>, Vec<u8>)> = merged
            .into_iter()
            .filter_map(|(k, v)| v.map(|value| (k, value)))
            .collect();
        if direction == ScanDirection::Backward {
            items.reverse();
        }
        let resume_out = match &page.resume {
            Some(last) => Some(last.clone()),
            None => None,
        };
        Ok((items, resume_out))
    }

    /// Scans a whole collection in primary-key order across partitions.
    pub fn scan_collection_page(
        &self,
        txn: &Arc<Transaction>,
        def: &CollectionDef,
        at: SequenceNumber,
        direction: ScanDirection,
        resume: Option<&[u8]>,
        limit: usize,
    ) -> CoreResult<DocPage> {
        let mut partitions: Vec<PartitionId> =
            def.layout.partitions().iter().map(|p| p.id).collect();
        if direction == ScanDirection::Backward {
            partitions.reverse();
        }

        // Resume tokens are full store keys; restart in their partition.
        let mut start_idx = 0;
        let mut in_region_resume: Option<Vec<u8>> = None;
        if let Some(token) = resume {
            if let Some((_, _, pid, _)) = keyspace::split(token) {
                if let Some(idx) = partitions.iter().position(|p| *p == pid) {
                    start_idx = idx;
                    in_region_resume = Some(token.to_vec());
                }
            }
        }

        let mut out = DocPage::default();
        for (idx, pid) in partitions.iter().enumerate().skip(start_idx) {
            let region =
                keyspace::region_prefix(def.id, crate::types::IndexId::PRIMARY, *pid);
            let mut region_resume = if idx == start_idx {
                in_region_resume.clone()
            } else {
                None
            };
            loop {
                if out.items.len() >= limit {
                    // Continuing after the last emitted key re-examines at
                    // most a few invisible keys; nothing visible is lost
                    // or repeated.
                    out.resume = out.items.last().map(|(k, _)| k.clone());
                    return Ok(out);
                }
                let want = limit - out.items.len();
                let (items, next) = self.scan_region_page(
                    txn,
                    &region,
                    at,
                    direction,
                    region_resume.as_deref(),
                    want,
                )?;
                for (key, bytes) in items {
                    out.items.push((key, decode_document(&bytes)?));
                }
                match next {
                    Some(next_key) => region_resume = Some(next_key),
                    None => break,
                }
            }
        }
        out.resume = None;
        Ok(out)
    }

    /// Collects every visible document matching a filter. Used by
    /// update/remove and materialized (sorted) finds.
    pub fn collect_matching(
        &self,
        txn: &Arc<Transaction>,
        def: &CollectionDef,
        filter: &Filter,
        limit: Option<u64>,
    ) -> CoreResult<Vec<(Vec<u8>, Document)>> {
        let at = self.read_seq(txn);

        // Point lookup when the filter pins the whole primary key.
        if def.capped.is_none() {
            if let Some(values) = filter.pk_point(&def.pk_pattern) {
                let pk = keys::encode_key(&values);
                self.lock_read_point(txn, def, &pk)?;
                if let Some(doc) = self.read_by_pk(txn, def, &pk)? {
                    if filter.matches(&doc) {
                        let partition = def.layout.route(&pk).id;
                        let key = keyspace::data_key(
                            def.id,
                            crate::types::IndexId::PRIMARY,
                            partition,
                            &pk,
                        );
                        return Ok(vec![(key, doc)]);
                    }
                }
                return Ok(Vec::new());
            }
        }

        // Secondary-index equality path.
        if let Some((index_def, index_value)) = self.pick_index(def, filter) {
            return self.lookup_by_index(txn, def, index_def, &index_value, filter, at, limit);
        }

        // Full scan.
        let mut out = Vec::new();
        let mut resume: Option<Vec<u8>> = None;
        loop {
            let page = self.scan_collection_page(
                txn,
                def,
                at,
                ScanDirection::Forward,
                resume.as_deref(),
                SCAN_BATCH,
            )?;
            for (key, doc) in page.items {
                if filter.matches(&doc) {
                    out.push((key, doc));
                    if limit.is_some_and(|l| out.len() as u64 >= l) {
                        self.lock_scan_range(txn, def, None)?;
                        return Ok(out);
                    }
                }
            }
            match page.resume {
                Some(next) => resume = Some(next),
                None => break,
            }
        }
        self.lock_scan_range(txn, def, None)?;
        Ok(out)
    }

    fn pick_index<'d>(
        &self,
        def: &'d CollectionDef,
        filter: &Filter,
    ) -> Option<(&'d IndexDef, Value)> {
        for index_def in &def.indexes {
            let field = index_def.key_pattern.first()?;
            if let Some(value) = filter.eq_on(field) {
                if index_def.key_pattern.len() == 1 {
                    return Some((index_def, value.clone()));
                }
            }
        }
        None
    }

    fn lookup_by_index(
        &self,
        txn: &Arc<Transaction>,
        def: &CollectionDef,
        index_def: &IndexDef,
        value: &Value,
        filter: &Filter,
        at: SequenceNumber,
        limit: Option<u64>,
    ) -> CoreResult<Vec<(Vec<u8>, Document)>> {
        let index_key = keys::encode_key(std::slice::from_ref(value));
        if txn.isolation() == Isolation::Serializable {
            let space = LockSpace::Data(def.id, index_def.id);
            let range = KeyRange::point(index_key.clone());
            self.lock_read(txn, space, range)?;
        }

        let mut out = Vec::new();
        for partition in def.layout.partitions() {
            let mut region =
                keyspace::region_prefix(def.id, index_def.id, partition.id);
            region.extend_from_slice(&index_key);
            let mut resume: Option<Vec<u8>> = None;
            loop {
                let (items, next) = self.scan_region_page(
                    txn,
                    &region,
                    at,
                    ScanDirection::Forward,
                    resume.as_deref(),
                    SCAN_BATCH,
                )?;
                for (_, payload) in items {
                    let doc = if index_def.clustering {
                        decode_document(&payload)?
                    } else {
                        match self.read_by_pk(txn, def, &payload)? {
                            Some(doc) => doc,
                            // Entry pointing at a row this snapshot
                            // cannot see; skip it.
                            None => continue,
                        }
                    };
                    if filter.matches(&doc) {
                        // Capped rows cluster on a hidden key carried in
                        // the entry payload; everything else derives the
                        // key from the document.
                        let pk = if def.capped.is_some() {
                            payload.clone()
                        } else {
                            index::primary_key_bytes(def, &doc)?
                        };
                        let row_partition = def.layout.route(&pk).id;
                        let key = keyspace::data_key(
                            def.id,
                            crate::types::IndexId::PRIMARY,
                            row_partition,
                            &pk,
                        );
                        out.push((key, doc));
                        if limit.is_some_and(|l| out.len() as u64 >= l) {
                            return Ok(out);
                        }
                    }
                }
                match next {
                    Some(next_key) => resume = Some(next_key),
                    None => break,
                }
            }
        }
        Ok(out)
    }

    // === Locking helpers ===

    fn lock_write_point(
        &self,
        txn: &Arc<Transaction>,
        space: LockSpace,
        key: Vec<u8>,
    ) -> CoreResult<()> {
        self.manager
            .locks()
            .lock(txn.id(), space, KeyRange::point(key), LockMode::Write)
            .inspect_err(|_| self.manager.stats().record_lock_conflict())
    }

    fn lock_read(
        &self,
        txn: &Arc<Transaction>,
        space: LockSpace,
        range: KeyRange,
    ) -> CoreResult<()> {
        self.manager
            .locks()
            .lock(txn.id(), space, range.clone(), LockMode::Read)
            .inspect_err(|_| self.manager.stats().record_lock_conflict())?;
        txn.record_read_range(space, range);
        Ok(())
    }

    fn lock_read_point(
        &self,
        txn: &Arc<Transaction>,
        def: &CollectionDef,
        pk: &[u8],
    ) -> CoreResult<()> {
        if txn.isolation() == Isolation::Serializable {
            let space = LockSpace::Data(def.id, crate::types::IndexId::PRIMARY);
            self.lock_read(txn, space, KeyRange::point(pk.to_vec()))?;
        }
        Ok(())
    }

    /// Locks the whole primary-key space for a serializable streaming
    /// scan (cursors cannot know their final range up front).
    pub fn lock_full_scan(&self, txn: &Arc<Transaction>, def: &CollectionDef) -> CoreResult<()> {
        self.lock_scan_range(txn, def, None)
    }

    /// Serializable scans lock the scanned primary-key range including
    /// the gap beyond the last matched row.
    fn lock_scan_range(
        &self,
        txn: &Arc<Transaction>,
        def: &CollectionDef,
        upper: Option<Vec<u8>>,
    ) -> CoreResult<()> {
        if txn.isolation() == Isolation::Serializable {
            let space = LockSpace::Data(def.id, crate::types::IndexId::PRIMARY);
            self.lock_read(txn, space, KeyRange::span(Vec::new(), upper))?;
        }
        Ok(())
    }

    /// Writers hold the collection's metadata lock shared for the
    /// transaction lifetime, so partition DDL cannot commit underneath
    /// their staged writes.
    fn lock_meta_shared(&self, txn: &Arc<Transaction>, def: &CollectionDef) -> CoreResult<()> {
        self.manager
            .locks()
            .lock(
                txn.id(),
                LockSpace::Meta(def.id),
                KeyRange::all(),
                LockMode::Read,
            )
            .inspect_err(|_| self.manager.stats().record_lock_conflict())
    }

    // === Insert ===

    /// Inserts a document, staging the primary row and every index entry.
    pub fn insert(
        &self,
        txn: &Arc<Transaction>,
        def: &CollectionDef,
        doc: &Document,
    ) -> CoreResult<()> {
        if def.capped.is_some() {
            return self.insert_capped(txn, def, doc);
        }
        self.lock_meta_shared(txn, def)?;

        let pk = index::primary_key_bytes(def, doc)?;
        let space = LockSpace::Data(def.id, crate::types::IndexId::PRIMARY);
        self.lock_write_point(txn, space, pk.clone())?;

        // Uniqueness against latest committed state plus our own staged
        // writes; the write lock holds concurrent writers off this key.
        let committed = self.manager.committed_seq();
        let partition = def.layout.route(&pk).id;
        let primary_key =
            keyspace::data_key(def.id, crate::types::IndexId::PRIMARY, partition, &pk);
        let existing = match txn.read_own(&primary_key)? {
            Some(PendingWrite::Put(_)) => true,
            Some(PendingWrite::Delete) => false,
            None => self.store.get(&primary_key, committed).is_some(),
        };
        if existing {
            return Err(CoreError::duplicate_key(primary_index_name(def)));
        }

        let doc_bytes = encode_document(doc);
        self.stage_index_entries(txn, def, partition, &pk, doc, &doc_bytes, committed)?;
        txn.stage_put(primary_key, doc_bytes.clone())?;
        txn.add_stats_delta(
            def.id,
            partition,
            StatsDelta {
                count: 1,
                bytes: doc_bytes.len() as i64,
            },
        );
        self.manager.stats().record_insert();
        Ok(())
    }

    /// Stages secondary-index entries for a new document version.
    fn stage_index_entries(
        &self,
        txn: &Arc<Transaction>,
        def: &CollectionDef,
        partition: PartitionId,
        pk: &[u8],
        doc: &Document,
        doc_bytes: &[u8],
        committed: SequenceNumber,
    ) -> CoreResult<()> {
        for index_def in &def.indexes {
            for index_key in index::index_keys(index_def, doc)? {
                let space = LockSpace::Data(def.id, index_def.id);
                self.lock_write_point(txn, space, index_key.clone())?;

                if index_def.unique {
                    self.check_unique(txn, def, index_def, &index_key, committed)?;
                }
                let entry_key = index::entry_key(index_def, &index_key, pk);
                let store_key =
                    keyspace::data_key(def.id, index_def.id, partition, &entry_key);
                let payload = index::entry_value(index_def, pk, doc_bytes);
                txn.stage_put(store_key, payload)?;
            }
        }
        Ok(())
    }

    /// A unique key may not be visible in any partition's copy of the
    /// index.
    fn check_unique(
        &self,
        txn: &Arc<Transaction>,
        def: &CollectionDef,
        index_def: &IndexDef,
        index_key: &[u8],
        committed: SequenceNumber,
    ) -> CoreResult<()> {
        for partition in def.layout.partitions() {
            let store_key =
                keyspace::data_key(def.id, index_def.id, partition.id, index_key);
            let exists = match txn.read_own(&store_key)? {
                Some(PendingWrite::Put(_)) => true,
                Some(PendingWrite::Delete) => false,
                None => self.store.get(&store_key, committed).is_some(),
            };
            if exists {
                return Err(CoreError::duplicate_key(index_def.name.clone()));
            }
        }
        Ok(())
    }

    // === Capped insert ===

    /// Capped collections cluster on a hidden insertion id; inserts
    /// serialize on the tail lock and evict oldest rows to stay within
    /// bounds, all staged in the same transaction.
    fn insert_capped(
        &self,
        txn: &Arc<Transaction>,
        def: &CollectionDef,
        doc: &Document,
    ) -> CoreResult<()> {
        let capped = def
            .capped
            .ok_or_else(|| CoreError::validation("collection is not capped"))?;
        self.lock_meta_shared(txn, def)?;
        self.manager
            .locks()
            .lock(
                txn.id(),
                LockSpace::CappedTail(def.id),
                KeyRange::all(),
                LockMode::Write,
            )
            .inspect_err(|_| self.manager.stats().record_lock_conflict())?;

        let partition = def.layout.last().id;
        let region = keyspace::region_prefix(def.id, crate::types::IndexId::PRIMARY, partition);

        // Next insertion id: one past the newest row, committed or staged
        // by us. The tail lock keeps other writers out entirely.
        let committed = self.manager.committed_seq();
        let last_committed = self
            .store
            .scan_page(&region, keyspace::prefix_end(&region).as_deref(), committed, ScanDirection::Backward, None, 1)
            .items
            .first()
            .and_then(|(k, _)| decode_insertion_key(k));
        let last_staged = txn
            .writes_in_range(&region, keyspace::prefix_end(&region).as_deref())?
            .into_iter()
            .filter(|(_, v)| v.is_some())
            .filter_map(|(k, _)| decode_insertion_key(&k))
            .max();
        let next_id = last_committed.unwrap_or(0).max(last_staged.unwrap_or(0)) + 1;

        let pk = insertion_key(next_id);
        let doc_bytes = encode_document(doc);
        self.stage_index_entries(txn, def, partition, &pk, doc, &doc_bytes, committed)?;
        let primary_key =
            keyspace::data_key(def.id, crate::types::IndexId::PRIMARY, partition, &pk);
        txn.stage_put(primary_key, doc_bytes.clone())?;
        txn.add_stats_delta(
            def.id,
            partition,
            StatsDelta {
                count: 1,
                bytes: doc_bytes.len() as i64,
            },
        );
        self.manager.stats().record_insert();

        self.evict_capped_overflow(txn, def, capped, partition, committed)?;
        Ok(())
    }

    /// Deletes oldest rows until the capped bounds hold again.
    fn evict_capped_overflow(
        &self,
        txn: &Arc<Transaction>,
        def: &CollectionDef,
        capped: crate::catalog::CappedOptions,
        partition: PartitionId,
        committed: SequenceNumber,
    ) -> CoreResult<()> {
        loop {
            let (base_count, base_bytes) =
                counters_with_delta(self.manager, txn, def, partition);
            let over_docs = capped
                .max_docs
                .is_some_and(|max| base_count > max as i64);
            let over_bytes = capped
                .max_size
                .is_some_and(|max| base_bytes > max as i64);
            if !over_docs && !over_bytes {
                return Ok(());
            }

            // Oldest visible row: smallest insertion id, staged included.
            let at = txn.read_seq(committed);
            let page = self.scan_collection_page(
                txn,
                def,
                at,
                ScanDirection::Forward,
                None,
                1,
            )?;
            let Some((key, doc)) = page.items.into_iter().next() else {
                return Ok(());
            };
            let Some((_, _, pid, pk)) = keyspace::split(&key) else {
                return Err(CoreError::heap_corruption("malformed store key"));
            };
            let pk = pk.to_vec();
            self.remove_row(txn, def, pid, &pk, &doc)?;
        }
    }

    // === Remove ===

    /// Stages removal of one row: the primary entry and every index
    /// entry derived from the document, all array elements included.
    fn remove_row(
        &self,
        txn: &Arc<Transaction>,
        def: &CollectionDef,
        partition: PartitionId,
        pk: &[u8],
        doc: &Document,
    ) -> CoreResult<()> {
        let space = LockSpace::Data(def.id, crate::types::IndexId::PRIMARY);
        self.lock_write_point(txn, space, pk.to_vec())?;

        for index_def in &def.indexes {
            for index_key in index::index_keys(index_def, doc)? {
                let space = LockSpace::Data(def.id, index_def.id);
                self.lock_write_point(txn, space, index_key.clone())?;
                let entry_key = index::entry_key(index_def, &index_key, pk);
                let store_key =
                    keyspace::data_key(def.id, index_def.id, partition, &entry_key);
                txn.stage_delete(store_key)?;
            }
        }

        let primary_key =
            keyspace::data_key(def.id, crate::types::IndexId::PRIMARY, partition, pk);
        let doc_bytes = encode_document(doc);
        txn.stage_delete(primary_key)?;
        txn.add_stats_delta(
            def.id,
            partition,
            StatsDelta {
                count: -1,
                bytes: -(doc_bytes.len() as i64),
            },
        );
        Ok(())
    }

    /// Removes matching documents.
    pub fn remove(
        &self,
        txn: &Arc<Transaction>,
        def: &CollectionDef,
        filter: &Filter,
        just_one: bool,
    ) -> CoreResult<RemoveResult> {
        self.lock_meta_shared(txn, def)?;
        let limit = if just_one { Some(1) } else { None };
        let matches = self.collect_matching(txn, def, filter, limit)?;
        let mut removed = 0u64;
        for (key, doc) in matches {
            let Some((_, _, pid, pk)) = keyspace::split(&key) else {
                return Err(CoreError::heap_corruption("malformed store key"));
            };
            let pk = pk.to_vec();
            self.remove_row(txn, def, pid, &pk, &doc)?;
            removed += 1;
            self.manager.stats().record_remove();
        }
        Ok(RemoveResult { removed })
    }

    // === Update ===

    /// Applies a mutation to matching documents.
    pub fn update(
        &self,
        txn: &Arc<Transaction>,
        def: &CollectionDef,
        filter: &Filter,
        mutation: &Mutation,
        multi: bool,
    ) -> CoreResult<UpdateResult> {
        self.lock_meta_shared(txn, def)?;
        let limit = if multi { None } else { Some(1) };
        let matches = self.collect_matching(txn, def, filter, limit)?;
        let committed = self.manager.committed_seq();

        let mut result = UpdateResult::default();
        for (key, old_doc) in matches {
            result.matched += 1;
            let new_doc = mutation.apply(&old_doc);
            let old_bytes = encode_document(&old_doc);
            let new_bytes = encode_document(&new_doc);
            if old_bytes == new_bytes {
                continue;
            }

            let Some((_, _, pid, pk)) = keyspace::split(&key) else {
                return Err(CoreError::heap_corruption("malformed store key"));
            };
            let pk = pk.to_vec();

            if def.capped.is_some() {
                // Capped rows may not grow; their layout is fixed.
                if new_bytes.len() > old_bytes.len() {
                    return Err(CoreError::validation(
                        "cannot grow a document in a capped collection",
                    ));
                }
                if new_doc.get("_id") != old_doc.get("_id") {
                    return Err(CoreError::validation("the _id field is immutable"));
                }
            } else {
                // The primary key is immutable under update.
                let new_pk = index::primary_key_bytes(def, &new_doc)?;
                if new_pk != pk {
                    return Err(CoreError::validation(
                        "update may not change primary-key fields",
                    ));
                }
            }

            let space = LockSpace::Data(def.id, crate::types::IndexId::PRIMARY);
            self.lock_write_point(txn, space, pk.clone())?;
            self.update_index_entries(
                txn, def, pid, &pk, &old_doc, &new_doc, &new_bytes, mutation, committed,
            )?;

            let primary_key =
                keyspace::data_key(def.id, crate::types::IndexId::PRIMARY, pid, &pk);
            txn.stage_put(primary_key, new_bytes.clone())?;
            txn.add_stats_delta(
                def.id,
                pid,
                StatsDelta {
                    count: 0,
                    bytes: new_bytes.len() as i64 - old_bytes.len() as i64,
                },
            );
            result.modified += 1;
            self.manager.stats().record_update();
        }
        Ok(result)
    }

    /// Recomputes only the index entries whose fields the mutation
    /// touched; untouched entries stay as they are.
    #[allow(clippy::too_many_arguments)]
    fn update_index_entries(
        &self,
        txn: &Arc<Transaction>,
        def: &CollectionDef,
        partition: PartitionId,
        pk: &[u8],
        old_doc: &Document,
        new_doc: &Document,
        new_bytes: &[u8],
        mutation: &Mutation,
        committed: SequenceNumber,
    ) -> CoreResult<()> {
        let touched = mutation.touched_paths();
        for index_def in &def.indexes {
            let affected = match &touched {
                None => true,
                Some(paths) => index_def.key_pattern.iter().any(|field| {
                    paths.iter().any(|path| paths_overlap(field, path))
                }),
            };
            if !affected && !index_def.clustering {
                continue;
            }

            let old_keys = index::index_keys(index_def, old_doc)?;
            let new_keys = index::index_keys(index_def, new_doc)?;

            for removed in old_keys.iter().filter(|k| !new_keys.contains(k)) {
                let space = LockSpace::Data(def.id, index_def.id);
                self.lock_write_point(txn, space, removed.clone())?;
                let entry_key = index::entry_key(index_def, removed, pk);
                let store_key =
                    keyspace::data_key(def.id, index_def.id, partition, &entry_key);
                txn.stage_delete(store_key)?;
            }
            for added in new_keys.iter().filter(|k| !old_keys.contains(k)) {
                let space = LockSpace::Data(def.id, index_def.id);
                self.lock_write_point(txn, space, added.clone())?;
                if index_def.unique {
                    self.check_unique(txn, def, index_def, added, committed)?;
                }
                let entry_key = index::entry_key(index_def, added, pk);
                let store_key =
                    keyspace::data_key(def.id, index_def.id, partition, &entry_key);
                txn.stage_put(store_key, index::entry_value(index_def, pk, new_bytes))?;
            }
            if index_def.clustering {
                // Clustering entries carry the document itself, so every
                // surviving key gets the fresh payload.
                for kept in new_keys.iter().filter(|k| old_keys.contains(k)) {
                    let entry_key = index::entry_key(index_def, kept, pk);
                    let store_key =
                        keyspace::data_key(def.id, index_def.id, partition, &entry_key);
                    txn.stage_put(store_key, new_bytes.to_vec())?;
                }
            }
        }
        Ok(())
    }

    /// Counts matching documents through the transaction's view.
    pub fn count(
        &self,
        txn: &Arc<Transaction>,
        def: &CollectionDef,
        filter: &Filter,
    ) -> CoreResult<u64> {
        Ok(self.collect_matching(txn, def, filter, None)?.len() as u64)
    }
}

/// True when a mutation path can change an indexed field: equal paths,
/// or one a dotted prefix of the other.
fn paths_overlap(field: &str, path: &str) -> bool {
    field == path
        || field
            .strip_prefix(path)
            .is_some_and(|rest| rest.starts_with('.'))
        || path
            .strip_prefix(field)
            .is_some_and(|rest| rest.starts_with('.'))
}

/// The user-visible name of a collection's primary index.
pub(crate) fn primary_index_name(def: &CollectionDef) -> String {
    if def.pk_pattern == ["_id".to_string()] {
        "_id_".to_string()
    } else {
        index::derive_index_name(&def.pk_pattern)
    }
}

/// Encoded hidden primary key of a capped collection row.
pub(crate) fn insertion_key(id: u64) -> Vec<u8> {
    id.to_be_bytes().to_vec()
}

/// Decodes a capped row's insertion id from its full store key.
pub(crate) fn decode_insertion_key(store_key: &[u8]) -> Option<u64> {
    let (_, _, _, pk) = keyspace::split(store_key)?;
    pk.try_into().ok().map(u64::from_be_bytes)
}

/// Committed counters plus the transaction's staged delta.
fn counters_with_delta(
    manager: &TransactionManager,
    txn: &Arc<Transaction>,
    def: &CollectionDef,
    partition: PartitionId,
) -> (i64, i64) {
    let (count, bytes) = manager_counters(manager, def, partition);
    let delta = txn.delta_for(def.id, partition);
    (count as i64 + delta.count, bytes as i64 + delta.bytes)
}

fn manager_counters(
    manager: &TransactionManager,
    def: &CollectionDef,
    partition: PartitionId,
) -> (u64, u64) {
    manager.counters().get(def.id, partition)
}

#[inline]
fn key_after(key: &[u8]) -> Vec<u8> {
    let mut next = key.to_vec();
    next.push(0);
    next
}
