//! Database facade and recovery.

use crate::catalog::{
    catalog_op_from_bytes, CappedOptions, Catalog, CatalogOp, CatalogState, CollectionDef,
    IndexDef,
};
use crate::collection::{primary_index_name, Executor, RemoveResult, UpdateResult};
use crate::config::{Config, Isolation};
use crate::cursor::{CursorManager, CursorPlan};
use crate::dir::DatabaseDir;
use crate::error::{CoreError, CoreResult};
use crate::filter::{Filter, Mutation, SortSpec};
use crate::heap::{HeapRecord, HeapStore};
use crate::index;
use crate::keyspace;
use crate::kv::{ScanDirection, VersionStore};
use crate::lock::{KeyRange, LockManager, LockMode, LockSpace};
use crate::manifest::Manifest;
use crate::partition::PartitionLayout;
use crate::session::{Session, WriteOutcome};
use crate::stats::{CounterRegistry, EngineStats, EngineStatsSnapshot};
use crate::txn::{SpillTarget, Transaction, TransactionManager};
use crate::types::{CollectionId, CursorId, IndexId, PartitionId, SequenceNumber, TransactionId};
use crate::wal::{WalManager, WalRecord};
use arbordb_codec::{encode_document, keys, Document, Value};
use arbordb_storage::{FileBackend, MemoryBackend, StorageBackend};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

/// Internal scan batch size for cursor continuations.
const CURSOR_BATCH: usize = 256;

/// Reserved lockspace that serializes collection create/drop by name.
const CATALOG_NAMES: CollectionId = CollectionId(0);

/// Options for creating a collection.
#[derive(Debug, Clone, Default)]
pub struct CollectionOptions {
    /// Explicit primary-key pattern; `_id` is appended when absent.
    /// Defaults to `{_id}`.
    pub primary_key: Option<Vec<String>>,
    /// Capped bounds. Capped collections cluster on insertion order and
    /// may not be partitioned or carry an explicit primary key.
    pub capped: Option<CappedOptions>,
    /// Whether the collection accepts partition DDL.
    pub partitioned: bool,
}

/// Options for creating a secondary index.
#[derive(Debug, Clone, Default)]
pub struct IndexOptions {
    /// Reject duplicate index keys.
    pub unique: bool,
    /// Store the document inline in the entry.
    pub clustering: bool,
    /// Explicit index name; derived from the key pattern when absent.
    pub name: Option<String>,
    /// Legacy drop-duplicates flag: accepted and ignored. A unique index
    /// build that finds duplicates always fails instead of dropping rows.
    pub drop_dups: bool,
}

/// Per-index statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexStatsEntry {
    /// Index name.
    pub name: String,
    /// Whether the index is unique.
    pub unique: bool,
    /// Whether the index is clustering.
    pub clustering: bool,
    /// Visible entry count.
    pub entries: u64,
}

/// Per-partition statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionStats {
    /// Partition id.
    pub id: PartitionId,
    /// Exclusive upper bound (encoded); `None` for the last partition.
    pub max: Option<Vec<u8>>,
    /// Committed row count.
    pub count: u64,
    /// Committed document bytes.
    pub bytes: u64,
}

/// Collection statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionStats {
    /// Committed row count.
    pub count: u64,
    /// Committed document bytes.
    pub data_size: u64,
    /// Secondary index details.
    pub indexes: Vec<IndexStatsEntry>,
    /// Partition details, for partitioned collections.
    pub partitions: Option<Vec<PartitionStats>>,
}

/// The main database handle.
///
/// Thread-safe: sessions are per-connection, everything else is shared.
pub struct Database {
    config: Config,
    dir: Option<DatabaseDir>,
    wal: Arc<WalManager>,
    heap: Arc<HeapStore>,
    store: Arc<VersionStore>,
    catalog: Arc<Catalog>,
    counters: Arc<CounterRegistry>,
    stats: Arc<EngineStats>,
    manager: Arc<TransactionManager>,
    cursors: CursorManager,
    is_open: RwLock<bool>,
}

impl Database {
    /// Opens a database directory with default configuration.
    pub fn open(path: &Path) -> CoreResult<Self> {
        Self::open_with_config(path, Config::default())
    }

    /// Opens a database directory.
    pub fn open_with_config(path: &Path, config: Config) -> CoreResult<Self> {
        let dir = DatabaseDir::open(path, config.create_if_missing)?;
        if config.error_if_exists && !dir.is_new_database() {
            return Err(CoreError::invalid_format(
                "database already exists and error_if_exists is true",
            ));
        }
        dir.clean_spill_dir()?;

        let manifest = match dir.load_manifest()? {
            Some(bytes) => {
                let manifest = Manifest::decode(&bytes)?;
                if manifest.format_version.0 != config.format_version.0 {
                    return Err(CoreError::invalid_format(format!(
                        "incompatible format version: database is v{}.{}, expected v{}.{}",
                        manifest.format_version.0,
                        manifest.format_version.1,
                        config.format_version.0,
                        config.format_version.1,
                    )));
                }
                Some(manifest)
            }
            None => None,
        };

        let wal_backend = FileBackend::open_with_create_dirs(&dir.wal_path())?;
        let heap_backend = FileBackend::open_with_create_dirs(&dir.heap_path())?;
        let spill_target = SpillTarget::Directory(dir.spill_dir());

        Self::bootstrap(
            config,
            Some(dir),
            Box::new(wal_backend),
            Box::new(heap_backend),
            spill_target,
            manifest,
        )
    }

    /// Opens an ephemeral in-memory database.
    pub fn open_in_memory() -> CoreResult<Self> {
        Self::open_in_memory_with_config(Config::default())
    }

    /// Opens an ephemeral in-memory database with configuration.
    pub fn open_in_memory_with_config(config: Config) -> CoreResult<Self> {
        Self::bootstrap(
            config,
            None,
            Box::new(MemoryBackend::new()),
            Box::new(MemoryBackend::new()),
            SpillTarget::Memory,
            None,
        )
    }

    /// Builds every component and runs recovery.
    fn bootstrap(
        config: Config,
        dir: Option<DatabaseDir>,
        wal_backend: Box<dyn StorageBackend>,
        heap_backend: Box<dyn StorageBackend>,
        spill_target: SpillTarget,
        manifest: Option<Manifest>,
    ) -> CoreResult<Self> {
        let wal = Arc::new(WalManager::new(wal_backend, config.sync_on_commit));
        let heap = Arc::new(HeapStore::new(heap_backend));
        let store = Arc::new(VersionStore::new());

        let recovered = recover(&wal, &heap, &store, manifest)?;
        let catalog = Arc::new(Catalog::from_state(
            recovered.state,
            SequenceNumber::ZERO,
            recovered.next_collection_id,
        ));

        let counters = Arc::new(CounterRegistry::new());
        seed_counters(&store, &catalog.head(), recovered.committed_seq, &counters);

        let stats = Arc::new(EngineStats::new());
        let locks = Arc::new(LockManager::new(config.lock_timeout));
        let manager = Arc::new(TransactionManager::new(
            Arc::clone(&wal),
            Arc::clone(&heap),
            Arc::clone(&store),
            locks,
            Arc::clone(&catalog),
            Arc::clone(&counters),
            Arc::clone(&stats),
            recovered.next_txid,
            recovered.committed_seq.as_u64(),
            config.txn_mem_limit,
            spill_target,
            config.max_version_chain,
            config.default_isolation,
        ));

        tracing::debug!(
            committed_seq = recovered.committed_seq.as_u64(),
            collections = catalog.head().collections().count(),
            "database opened"
        );

        Ok(Self {
            cursors: CursorManager::new(config.cursor_timeout),
            config,
            dir,
            wal,
            heap,
            store,
            catalog,
            counters,
            stats,
            manager,
            is_open: RwLock::new(true),
        })
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if *self.is_open.read() {
            Ok(())
        } else {
            Err(CoreError::DatabaseClosed)
        }
    }

    fn executor(&self) -> Executor<'_> {
        Executor {
            manager: &self.manager,
            catalog: &self.catalog,
            store: &self.store,
        }
    }

    /// A detached read-only view at a fixed snapshot, for cursors and
    /// reads outside any transaction. Never registered, never committed.
    fn read_view(&self, at: SequenceNumber) -> Arc<Transaction> {
        Arc::new(Transaction::new(
            TransactionId::new(0),
            Isolation::Snapshot,
            at,
            self.config.txn_mem_limit,
            SpillTarget::Memory,
        ))
    }

    fn reap_cursors(&self) {
        for state in self.cursors.sweep() {
            if state.pinned {
                self.manager.unpin_snapshot(state.at);
            }
            self.stats.record_cursor_timeout();
            tracing::debug!("idle cursor reaped");
        }
    }

    // === Transactions ===

    /// Begins a transaction on the session; nested begins open
    /// savepoints whose rollback undoes only their own writes.
    pub fn begin_transaction(
        &self,
        session: &mut Session,
        isolation: Option<Isolation>,
    ) -> CoreResult<()> {
        self.ensure_open()?;
        match &session.txn {
            Some(txn) => txn.begin_savepoint(),
            None => {
                session.txn = Some(self.manager.begin(isolation)?);
                Ok(())
            }
        }
    }

    /// Commits the session's innermost transaction level.
    pub fn commit_transaction(&self, session: &mut Session) -> CoreResult<()> {
        self.ensure_open()?;
        let txn = session
            .txn
            .clone()
            .ok_or_else(|| CoreError::validation("no transaction in progress"))?;
        if txn.savepoint_depth() > 0 {
            return txn.release_savepoint();
        }
        session.txn = None;
        self.manager.commit(&txn).map(|_| ())
    }

    /// Rolls back the session's innermost transaction level.
    pub fn rollback_transaction(&self, session: &mut Session) -> CoreResult<()> {
        self.ensure_open()?;
        let txn = session
            .txn
            .clone()
            .ok_or_else(|| CoreError::validation("no transaction in progress"))?;
        if txn.savepoint_depth() > 0 {
            return txn.rollback_savepoint();
        }
        session.txn = None;
        self.manager.rollback(&txn)
    }

    /// Runs an operation in the session's transaction, or in a
    /// single-operation transaction when none is open. Inside an
    /// explicit transaction the operation runs under a savepoint, so a
    /// failure leaves no partial staged state and the transaction stays
    /// usable.
    fn with_write_txn<T>(
        &self,
        session: &mut Session,
        f: impl FnOnce(&Arc<Transaction>) -> CoreResult<T>,
    ) -> CoreResult<T> {
        self.ensure_open()?;
        if let Some(txn) = session.txn.clone() {
            txn.begin_savepoint()?;
            match f(&txn) {
                Ok(value) => {
                    txn.release_savepoint()?;
                    Ok(value)
                }
                Err(e) => {
                    if matches!(e, CoreError::LockConflict { .. }) {
                        // Wait-die victims abort the whole transaction;
                        // the session itself stays usable.
                        if txn.is_active() {
                            let _ = self.manager.rollback(&txn);
                        }
                        session.txn = None;
                    } else if txn.is_active() {
                        txn.rollback_savepoint()?;
                    }
                    Err(e)
                }
            }
        } else {
            let txn = self.manager.begin(None)?;
            match f(&txn) {
                Ok(value) => {
                    self.manager.commit(&txn)?;
                    Ok(value)
                }
                Err(e) => {
                    if txn.is_active() {
                        let _ = self.manager.rollback(&txn);
                    }
                    Err(e)
                }
            }
        }
    }

    fn with_read_txn<T>(
        &self,
        session: &Session,
        f: impl FnOnce(&Arc<Transaction>) -> CoreResult<T>,
    ) -> CoreResult<T> {
        self.ensure_open()?;
        match session.txn.clone() {
            Some(txn) => f(&txn),
            None => f(&self.read_view(self.manager.committed_seq())),
        }
    }

    // === Writes ===

    /// Inserts a document.
    pub fn insert(&self, session: &mut Session, collection: &str, doc: Document) -> CoreResult<()> {
        let result = self.with_write_txn(session, |txn| {
            let exec = self.executor();
            let state = exec.state_for(txn)?;
            let def = Arc::clone(state.require(collection)?);
            exec.insert(txn, &def, &doc)
        });
        session.record(match &result {
            Ok(()) => WriteOutcome {
                inserted: 1,
                ..Default::default()
            },
            Err(e) => WriteOutcome {
                error: Some(e.to_string()),
                ..Default::default()
            },
        });
        result
    }

    /// Updates matching documents.
    pub fn update(
        &self,
        session: &mut Session,
        collection: &str,
        filter: &Filter,
        mutation: &Mutation,
        multi: bool,
    ) -> CoreResult<UpdateResult> {
        let result = self.with_write_txn(session, |txn| {
            let exec = self.executor();
            let state = exec.state_for(txn)?;
            let def = Arc::clone(state.require(collection)?);
            exec.update(txn, &def, filter, mutation, multi)
        });
        session.record(match &result {
            Ok(r) => WriteOutcome {
                matched: r.matched,
                modified: r.modified,
                ..Default::default()
            },
            Err(e) => WriteOutcome {
                error: Some(e.to_string()),
                ..Default::default()
            },
        });
        result
    }

    /// Removes matching documents.
    pub fn remove(
        &self,
        session: &mut Session,
        collection: &str,
        filter: &Filter,
        just_one: bool,
    ) -> CoreResult<RemoveResult> {
        let result = self.with_write_txn(session, |txn| {
            let exec = self.executor();
            let state = exec.state_for(txn)?;
            let def = Arc::clone(state.require(collection)?);
            exec.remove(txn, &def, filter, just_one)
        });
        session.record(match &result {
            Ok(r) => WriteOutcome {
                removed: r.removed,
                ..Default::default()
            },
            Err(e) => WriteOutcome {
                error: Some(e.to_string()),
                ..Default::default()
            },
        });
        result
    }

    // === Reads ===

    /// Counts matching documents through the session's view.
    pub fn count(
        &self,
        session: &mut Session,
        collection: &str,
        filter: &Filter,
    ) -> CoreResult<u64> {
        self.with_read_txn(session, |txn| {
            let exec = self.executor();
            let state = exec.state_for(txn)?;
            let def = Arc::clone(state.require(collection)?);
            exec.count(txn, &def, filter)
        })
    }

    /// Opens a server-side cursor over matching documents.
    ///
    /// Sorted finds that don't follow primary-key order materialize their
    /// results; everything else streams lazily with a resume key.
    pub fn find(
        &self,
        session: &mut Session,
        collection: &str,
        filter: Filter,
        sort: Option<SortSpec>,
    ) -> CoreResult<CursorId> {
        self.ensure_open()?;
        self.reap_cursors();

        let (txn, pinned, at) = match session.txn.clone() {
            Some(txn) => {
                let at = txn.read_seq(self.manager.committed_seq());
                (txn, false, at)
            }
            None => {
                let at = self.manager.committed_seq();
                self.manager.pin_snapshot(at);
                (self.read_view(at), true, at)
            }
        };

        let exec = self.executor();
        let state = self.catalog.effective(at, &txn.staged_ddl())?;
        let def = Arc::clone(state.require(collection)?);

        let plan = match &sort {
            Some(spec) if !spec.is_pk_order(&def.pk_pattern) => {
                let mut docs: Vec<Document> = exec
                    .collect_matching(&txn, &def, &filter, None)?
                    .into_iter()
                    .map(|(_, doc)| doc)
                    .collect();
                docs.sort_by(|a, b| spec.compare(a, b));
                CursorPlan::Materialized { docs: docs.into() }
            }
            _ => {
                if txn.isolation() == Isolation::Serializable {
                    exec.lock_full_scan(&txn, &def)?;
                }
                CursorPlan::Streaming {
                    collection: collection.to_string(),
                    filter,
                    resume: None,
                    done: false,
                }
            }
        };

        let id = self.cursors.open(plan, at, pinned, Some(txn));
        self.stats.record_cursor_open();
        Ok(id)
    }

    /// Fetches the next batch from a cursor, resetting its idle clock.
    ///
    /// An exhausted cursor is removed; later continuations fail with
    /// `CursorNotFound`, as do continuations of expired cursors.
    pub fn next_batch(&self, cursor: CursorId, n: usize) -> CoreResult<Vec<Document>> {
        self.ensure_open()?;
        self.reap_cursors();

        let mut state = self.cursors.take(cursor).ok_or(CoreError::CursorNotFound {
            id: cursor.as_u64(),
        })?;

        // A cursor whose owning transaction finished is dead.
        if let Some(txn) = &state.txn {
            if txn.id().as_u64() != 0 && !txn.is_active() {
                if state.pinned {
                    self.manager.unpin_snapshot(state.at);
                }
                return Err(CoreError::CursorNotFound {
                    id: cursor.as_u64(),
                });
            }
        }

        // A cursor is dropped only after it hands back an empty batch, so
        // "iterate until empty" never races against cursor removal.
        let mut out = Vec::new();
        let exhausted = match &mut state.plan {
            CursorPlan::Materialized { docs } => {
                while out.len() < n {
                    match docs.pop_front() {
                        Some(doc) => out.push(doc),
                        None => break,
                    }
                }
                docs.is_empty() && out.is_empty()
            }
            CursorPlan::Streaming {
                collection,
                filter,
                resume,
                done,
            } => {
                let exec = self.executor();
                let txn = state
                    .txn
                    .clone()
                    .ok_or_else(|| CoreError::validation("cursor has no read context"))?;
                let catalog_state = self.catalog.effective(state.at, &txn.staged_ddl())?;
                let def = Arc::clone(catalog_state.require(collection)?);

                while out.len() < n && !*done {
                    let want = (n - out.len()).min(CURSOR_BATCH);
                    let page = exec.scan_collection_page(
                        &txn,
                        &def,
                        state.at,
                        ScanDirection::Forward,
                        resume.as_deref(),
                        want,
                    )?;
                    for (_, doc) in page.items {
                        if filter.matches(&doc) {
                            out.push(doc);
                        }
                    }
                    match page.resume {
                        Some(next) => *resume = Some(next),
                        None => *done = true,
                    }
                }
                *done && out.is_empty()
            }
        };

        if exhausted {
            if state.pinned {
                self.manager.unpin_snapshot(state.at);
            }
        } else {
            self.cursors.put_back(cursor, state);
        }
        Ok(out)
    }

    /// Kills a cursor explicitly.
    pub fn kill_cursor(&self, cursor: CursorId) -> CoreResult<()> {
        self.ensure_open()?;
        if let Some(state) = self.cursors.remove(cursor) {
            if state.pinned {
                self.manager.unpin_snapshot(state.at);
            }
        }
        Ok(())
    }

    /// Convenience: runs a find and drains the cursor.
    pub fn find_all(
        &self,
        session: &mut Session,
        collection: &str,
        filter: Filter,
        sort: Option<SortSpec>,
    ) -> CoreResult<Vec<Document>> {
        let cursor = self.find(session, collection, filter, sort)?;
        let mut out = Vec::new();
        loop {
            let batch = self.next_batch(cursor, CURSOR_BATCH)?;
            let finished = batch.len() < CURSOR_BATCH;
            out.extend(batch);
            if finished {
                break;
            }
        }
        self.kill_cursor(cursor)?;
        Ok(out)
    }

    // === DDL ===

    /// Creates a collection.
    pub fn create_collection(
        &self,
        session: &mut Session,
        name: &str,
        options: CollectionOptions,
    ) -> CoreResult<()> {
        if name.is_empty() || name.contains('\0') {
            return Err(CoreError::validation("invalid collection name"));
        }
        if options.capped.is_some() && options.partitioned {
            return Err(CoreError::validation(
                "capped collections may not be partitioned",
            ));
        }
        if options.capped.is_some() && options.primary_key.is_some() {
            return Err(CoreError::validation(
                "capped collections cluster on insertion order and take no primary key",
            ));
        }

        self.with_write_txn(session, |txn| {
            // Serialize create/drop by name across transactions.
            self.manager.locks().lock(
                txn.id(),
                LockSpace::Meta(CATALOG_NAMES),
                KeyRange::point(name.as_bytes().to_vec()),
                LockMode::Write,
            )?;

            let exec = self.executor();
            let state = exec.state_for(txn)?;
            if state.collection(name).is_some() {
                return Err(CoreError::validation(format!(
                    "collection '{name}' already exists"
                )));
            }

            let def = build_collection_def(
                self.catalog.allocate_collection_id(),
                name,
                &options,
            )?;
            txn.stage_ddl(CatalogOp::CreateCollection(Arc::new(def)))
        })
    }

    /// Drops a collection. Its storage is reclaimed by vacuum.
    pub fn drop_collection(&self, session: &mut Session, name: &str) -> CoreResult<()> {
        self.with_write_txn(session, |txn| {
            self.manager.locks().lock(
                txn.id(),
                LockSpace::Meta(CATALOG_NAMES),
                KeyRange::point(name.as_bytes().to_vec()),
                LockMode::Write,
            )?;
            let exec = self.executor();
            let state = exec.state_for(txn)?;
            let def = Arc::clone(state.require(name)?);
            self.lock_meta_exclusive(txn, def.id)?;
            txn.stage_ddl(CatalogOp::DropCollection(name.to_string()))
        })
    }

    /// Creates a secondary index, backfilling entries for existing
    /// documents. Duplicate key patterns under distinct names coexist.
    pub fn create_index(
        &self,
        session: &mut Session,
        collection: &str,
        key_pattern: Vec<String>,
        options: IndexOptions,
    ) -> CoreResult<String> {
        index::validate_key_pattern(&key_pattern)?;
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| index::derive_index_name(&key_pattern));
        index::validate_index_name(&name, self.config.max_index_name_len)?;
        if options.drop_dups {
            // Accepted for compatibility; never drops rows.
            tracing::debug!(index = %name, "ignoring dropDups on index build");
        }

        self.with_write_txn(session, |txn| {
            let exec = self.executor();
            let state = exec.state_for(txn)?;
            let def = Arc::clone(state.require(collection)?);
            self.lock_meta_exclusive(txn, def.id)?;

            if def.index_by_name(&name).is_some() {
                return Err(CoreError::validation(format!(
                    "index '{name}' already exists"
                )));
            }
            if options.clustering && def.capped.is_some() {
                return Err(CoreError::validation(
                    "capped collections do not support clustering secondary indexes",
                ));
            }

            let index_def = IndexDef {
                id: IndexId::new(def.next_index_id),
                name: name.clone(),
                key_pattern: key_pattern.clone(),
                unique: options.unique,
                clustering: options.clustering,
            };
            txn.stage_ddl(CatalogOp::CreateIndex {
                collection: collection.to_string(),
                def: index_def.clone(),
            })?;
            self.backfill_index(txn, &def, &index_def)?;
            Ok(name.clone())
        })
    }

    /// Populates a new index from the documents visible to the creating
    /// transaction.
    fn backfill_index(
        &self,
        txn: &Arc<Transaction>,
        def: &CollectionDef,
        index_def: &IndexDef,
    ) -> CoreResult<()> {
        let exec = self.executor();
        let at = txn.read_seq(self.manager.committed_seq());
        let mut seen_unique: HashSet<Vec<u8>> = HashSet::new();
        let mut resume: Option<Vec<u8>> = None;
        loop {
            let page = exec.scan_collection_page(
                txn,
                def,
                at,
                ScanDirection::Forward,
                resume.as_deref(),
                CURSOR_BATCH,
            )?;
            for (store_key, doc) in &page.items {
                let Some((_, _, pid, pk)) = keyspace::split(store_key) else {
                    return Err(CoreError::heap_corruption("malformed store key"));
                };
                let doc_bytes = encode_document(doc);
                for index_key in index::index_keys(index_def, doc)? {
                    if index_def.unique && !seen_unique.insert(index_key.clone()) {
                        return Err(CoreError::duplicate_key(index_def.name.clone()));
                    }
                    let entry_key = index::entry_key(index_def, &index_key, pk);
                    let entry_store_key =
                        keyspace::data_key(def.id, index_def.id, pid, &entry_key);
                    txn.stage_put(
                        entry_store_key,
                        index::entry_value(index_def, pk, &doc_bytes),
                    )?;
                }
            }
            match page.resume {
                Some(next) => resume = Some(next),
                None => break,
            }
        }
        Ok(())
    }

    /// Drops a secondary index. The `_id`/primary index is never
    /// droppable.
    pub fn drop_index(&self, session: &mut Session, collection: &str, name: &str) -> CoreResult<()> {
        self.with_write_txn(session, |txn| {
            let exec = self.executor();
            let state = exec.state_for(txn)?;
            let def = Arc::clone(state.require(collection)?);
            self.lock_meta_exclusive(txn, def.id)?;

            if name == "_id_" || name == primary_index_name(&def) {
                return Err(CoreError::validation("cannot drop the _id index"));
            }
            if def.index_by_name(name).is_none() {
                return Err(CoreError::IndexNotFound {
                    name: name.to_string(),
                    collection: def.id,
                });
            }
            txn.stage_ddl(CatalogOp::DropIndex {
                collection: collection.to_string(),
                name: name.to_string(),
            })
        })
    }

    /// Caps the collection's last partition at `bound` and appends a
    /// fresh one. The bound document must carry every primary-key field.
    pub fn add_partition(
        &self,
        session: &mut Session,
        collection: &str,
        bound: &Document,
    ) -> CoreResult<()> {
        self.with_write_txn(session, |txn| {
            let exec = self.executor();
            let state = exec.state_for(txn)?;
            let def = Arc::clone(state.require(collection)?);
            if !def.partitioned {
                return Err(CoreError::partition_boundary(format!(
                    "collection '{collection}' is not partitioned"
                )));
            }
            let new_max = encode_partition_bound(&def, bound)?;
            let last = def.layout.last().id;
            let boundary_start = keyspace::data_key(def.id, IndexId::PRIMARY, last, &new_max);
            let region_end =
                keyspace::prefix_end(&keyspace::region_prefix(def.id, IndexId::PRIMARY, last));

            // Uncommitted writes that would straddle the new boundary
            // make the change ambiguous; fail before waiting on locks.
            if self.manager.any_active_writes_in_range(
                &boundary_start,
                region_end.as_deref(),
                Some(txn.id()),
            )? || txn.has_writes_in_range(&boundary_start, region_end.as_deref())?
            {
                return Err(CoreError::partition_boundary(
                    "cannot add partition: a concurrent transaction holds uncommitted \
                     writes beyond the new boundary",
                ));
            }

            self.lock_meta_exclusive(txn, def.id)?;

            // Committed rows beyond the bound would be mis-routed by the
            // capped layout.
            let committed = self.manager.committed_seq();
            let beyond = self.store.scan_page(
                &boundary_start,
                region_end.as_deref(),
                committed,
                ScanDirection::Forward,
                None,
                1,
            );
            if !beyond.items.is_empty() {
                return Err(CoreError::partition_boundary(
                    "cannot add partition: existing rows sort beyond the new boundary",
                ));
            }

            let new_id = PartitionId::new(def.next_partition_id);
            // Validates bound ordering against the current layout.
            def.layout.cap_and_append(new_max.clone(), new_id)?;
            txn.stage_ddl(CatalogOp::AddPartition {
                collection: collection.to_string(),
                new_max,
                new_id,
            })
        })
    }

    /// Drops a partition; its rows disappear for new snapshots and are
    /// physically reclaimed by vacuum.
    pub fn drop_partition(
        &self,
        session: &mut Session,
        collection: &str,
        partition: PartitionId,
    ) -> CoreResult<()> {
        self.with_write_txn(session, |txn| {
            let exec = self.executor();
            let state = exec.state_for(txn)?;
            let def = Arc::clone(state.require(collection)?);
            if !def.partitioned {
                return Err(CoreError::partition_boundary(format!(
                    "collection '{collection}' is not partitioned"
                )));
            }
            self.lock_meta_exclusive(txn, def.id)?;
            // Validates existence and layout shape.
            def.layout.drop_partition(partition)?;
            txn.stage_ddl(CatalogOp::DropPartition {
                collection: collection.to_string(),
                id: partition,
            })
        })
    }

    /// The partition layout a session currently sees.
    pub fn partition_info(
        &self,
        session: &mut Session,
        collection: &str,
    ) -> CoreResult<Vec<(PartitionId, Option<Vec<u8>>)>> {
        self.with_read_txn(session, |txn| {
            let exec = self.executor();
            let state = exec.state_for(txn)?;
            let def = state.require(collection)?;
            Ok(def
                .layout
                .partitions()
                .iter()
                .map(|p| (p.id, p.max.clone()))
                .collect())
        })
    }

    fn lock_meta_exclusive(&self, txn: &Arc<Transaction>, collection: CollectionId) -> CoreResult<()> {
        self.manager
            .locks()
            .lock(
                txn.id(),
                LockSpace::Meta(collection),
                KeyRange::all(),
                LockMode::Write,
            )
            .inspect_err(|_| self.stats.record_lock_conflict())
    }

    // === Stats, checkpoint, vacuum ===

    /// Committed statistics for a collection.
    pub fn stats(&self, collection: &str) -> CoreResult<CollectionStats> {
        self.ensure_open()?;
        let state = self.catalog.head();
        let def = state.require(collection)?;
        let committed = self.manager.committed_seq();
        let (count, data_size) = self.counters.collection_totals(def.id);

        let mut indexes = Vec::new();
        for index_def in &def.indexes {
            let mut entries = 0u64;
            for partition in def.layout.partitions() {
                let region = keyspace::region_prefix(def.id, index_def.id, partition.id);
                entries += self.count_region(&region, committed);
            }
            indexes.push(IndexStatsEntry {
                name: index_def.name.clone(),
                unique: index_def.unique,
                clustering: index_def.clustering,
                entries,
            });
        }

        let partitions = def.partitioned.then(|| {
            def.layout
                .partitions()
                .iter()
                .map(|p| {
                    let (count, bytes) = self.counters.get(def.id, p.id);
                    PartitionStats {
                        id: p.id,
                        max: p.max.clone(),
                        count,
                        bytes,
                    }
                })
                .collect()
        });

        Ok(CollectionStats {
            count,
            data_size,
            indexes,
            partitions,
        })
    }

    fn count_region(&self, region: &[u8], at: SequenceNumber) -> u64 {
        let end = keyspace::prefix_end(region);
        let mut total = 0u64;
        let mut resume: Option<Vec<u8>> = None;
        loop {
            let page = self.store.scan_page(
                region,
                end.as_deref(),
                at,
                ScanDirection::Forward,
                resume.as_deref(),
                1024,
            );
            total += page.items.len() as u64;
            match page.resume {
                Some(next) => resume = Some(next),
                None => return total,
            }
        }
    }

    /// Engine-wide counters.
    #[must_use]
    pub fn engine_stats(&self) -> EngineStatsSnapshot {
        self.stats.snapshot()
    }

    /// Collection names in the latest committed catalog.
    #[must_use]
    pub fn collection_names(&self) -> Vec<String> {
        self.catalog
            .head()
            .collections()
            .map(|def| def.name.clone())
            .collect()
    }

    /// Syncs the heap, persists the manifest, and truncates the WAL.
    pub fn checkpoint(&self) -> CoreResult<()> {
        self.ensure_open()?;
        self.manager.with_commit_lock(|| {
            self.heap.sync()?;
            let committed = self.manager.committed_seq();
            if let Some(dir) = &self.dir {
                let manifest = Manifest::capture(
                    &self.catalog.head(),
                    committed,
                    self.catalog.next_collection_id(),
                    self.config.format_version,
                );
                dir.store_manifest(&manifest.encode())?;
            }
            self.wal.append(&WalRecord::Checkpoint {
                sequence: committed,
            })?;
            self.wal.flush()?;
            self.wal.clear()?;
            self.stats.record_checkpoint();
            tracing::debug!(seq = committed.as_u64(), "checkpoint complete");
            Ok(())
        })
    }

    /// Reclaims versions and regions no snapshot can reach, then
    /// compacts the heap.
    pub fn vacuum(&self) -> CoreResult<usize> {
        self.ensure_open()?;
        self.reap_cursors();
        let min_active = self.manager.min_active_snapshot();
        let mut reclaimed = self.store.vacuum(min_active);
        self.catalog.prune(min_active);

        // A region is live when any retained catalog version still names
        // its collection, index, and partition.
        let mut live_regions: HashSet<(CollectionId, IndexId, PartitionId)> = HashSet::new();
        for state in self.catalog.retained_states() {
            for def in state.collections() {
                for partition in def.layout.partitions() {
                    live_regions.insert((def.id, IndexId::PRIMARY, partition.id));
                    for index_def in &def.indexes {
                        live_regions.insert((def.id, index_def.id, partition.id));
                    }
                }
            }
        }
        reclaimed += self.store.purge_where(|key| match keyspace::split(key) {
            Some((coll, idx, part, _)) => !live_regions.contains(&(coll, idx, part)),
            None => true,
        });

        self.manager.with_commit_lock(|| {
            let records: Vec<HeapRecord> = self
                .store
                .dump()
                .into_iter()
                .map(|(key, version)| HeapRecord {
                    key,
                    sequence: version.seq,
                    txn: version.txn,
                    value: version.value,
                })
                .collect();
            self.heap.rewrite(records)
        })?;
        tracing::debug!(reclaimed, "vacuum complete");
        Ok(reclaimed)
    }

    /// Checkpoints and closes the database, releasing the directory
    /// lock.
    pub fn close(&self) -> CoreResult<()> {
        self.ensure_open()?;
        self.checkpoint()?;
        *self.is_open.write() = false;
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("open", &*self.is_open.read())
            .field("committed_seq", &self.manager.committed_seq())
            .finish_non_exhaustive()
    }
}

/// Builds a collection definition from creation options.
fn build_collection_def(
    id: CollectionId,
    name: &str,
    options: &CollectionOptions,
) -> CoreResult<CollectionDef> {
    if let Some(capped) = &options.capped {
        if capped.max_size.is_none() && capped.max_docs.is_none() {
            return Err(CoreError::validation(
                "capped collections need a size or document bound",
            ));
        }
        // Capped collections cluster on a hidden insertion id; the user
        // `_id` gets an implicit unique index.
        return Ok(CollectionDef {
            id,
            name: name.to_string(),
            pk_pattern: Vec::new(),
            capped: Some(*capped),
            indexes: vec![IndexDef {
                id: IndexId::new(1),
                name: "_id_".to_string(),
                key_pattern: vec!["_id".to_string()],
                unique: true,
                clustering: false,
            }],
            next_index_id: 2,
            next_partition_id: 1,
            layout: PartitionLayout::single(PartitionId::new(0)),
            partitioned: false,
        });
    }

    let mut pk_pattern = options
        .primary_key
        .clone()
        .unwrap_or_else(|| vec!["_id".to_string()]);
    if !pk_pattern.iter().any(|f| f == "_id") {
        // Appending _id keeps every primary key unique even when the
        // explicit fields collide.
        pk_pattern.push("_id".to_string());
    }
    index::validate_key_pattern(&pk_pattern)?;

    Ok(CollectionDef {
        id,
        name: name.to_string(),
        pk_pattern,
        capped: None,
        indexes: Vec::new(),
        next_index_id: 1,
        next_partition_id: 1,
        layout: PartitionLayout::single(PartitionId::new(0)),
        partitioned: options.partitioned,
    })
}

/// Encodes an `addPartition` bound document against the primary key.
fn encode_partition_bound(def: &CollectionDef, bound: &Document) -> CoreResult<Vec<u8>> {
    let mut values = Vec::with_capacity(def.pk_pattern.len());
    for field in &def.pk_pattern {
        let value = bound.get_path(field).ok_or_else(|| {
            CoreError::partition_boundary(format!(
                "partition bound is missing primary-key field '{field}'"
            ))
        })?;
        if matches!(value, Value::Array(_)) {
            return Err(CoreError::partition_boundary(
                "partition bound fields may not be arrays",
            ));
        }
        values.push(value.clone());
    }
    Ok(keys::encode_key(&values))
}

struct Recovered {
    state: CatalogState,
    committed_seq: SequenceNumber,
    next_txid: u64,
    next_collection_id: u32,
}

/// Rebuilds the version store and catalog from the heap and the WAL
/// tail.
fn recover(
    wal: &WalManager,
    heap: &HeapStore,
    store: &VersionStore,
    manifest: Option<Manifest>,
) -> CoreResult<Recovered> {
    let (mut state, base_seq, manifest_next_coll) = match manifest {
        Some(manifest) => {
            let base_seq = manifest.checkpoint_seq;
            let next = manifest.next_collection_id;
            (manifest.into_state()?, base_seq, next)
        }
        None => (CatalogState::default(), SequenceNumber::ZERO, 1),
    };

    // Heap first: every record in it was committed.
    let heap_max = heap.replay(|record| {
        store.apply_batch(
            &[(record.key, record.value)],
            record.txn,
            record.sequence,
            SequenceNumber::ZERO,
            usize::MAX,
        );
        Ok(())
    })?;

    // WAL tail: gather each transaction's operations, then apply the
    // committed ones in commit order. Begin without Commit, and aborted
    // transactions, leave no trace.
    let mut ops: HashMap<TransactionId, Vec<WalRecord>> = HashMap::new();
    let mut commits: Vec<(SequenceNumber, TransactionId)> = Vec::new();
    let mut max_txid = 0u64;
    for entry in wal.iter()? {
        let (_, record) = entry?;
        if let Some(txid) = record.txid() {
            max_txid = max_txid.max(txid.as_u64());
        }
        match record {
            WalRecord::Begin { txid } => {
                ops.entry(txid).or_default();
            }
            WalRecord::Put { txid, .. }
            | WalRecord::Delete { txid, .. }
            | WalRecord::Ddl { txid, .. } => {
                ops.entry(txid).or_default().push(record);
            }
            WalRecord::Commit { txid, sequence } => commits.push((sequence, txid)),
            WalRecord::Abort { txid } => {
                ops.remove(&txid);
            }
            WalRecord::Checkpoint { .. } => {}
        }
    }
    commits.sort_by_key(|(seq, _)| *seq);

    let mut committed_seq = base_seq.max(heap_max);
    for (seq, txid) in commits {
        let Some(records) = ops.remove(&txid) else {
            continue;
        };
        let mut writes: Vec<(Vec<u8>, Option<Vec<u8>>)> = Vec::new();
        for record in records {
            match record {
                WalRecord::Put { key, value, .. } => writes.push((key, Some(value))),
                WalRecord::Delete { key, .. } => writes.push((key, None)),
                WalRecord::Ddl { op, .. } => {
                    let op = catalog_op_from_bytes(&op)?;
                    state = state.apply(&op)?;
                }
                _ => {}
            }
        }
        if seq > heap_max && !writes.is_empty() {
            store.apply_batch(&writes, txid, seq, SequenceNumber::ZERO, usize::MAX);
            for (key, value) in writes {
                let record = match value {
                    Some(value) => HeapRecord::put(key, value, seq, txid),
                    None => HeapRecord::tombstone(key, seq, txid),
                };
                heap.append(&record)?;
            }
        }
        committed_seq = committed_seq.max(seq);
    }
    heap.flush()?;

    let max_coll_id = state
        .collections()
        .map(|def| def.id.as_u32())
        .max()
        .unwrap_or(0);
    Ok(Recovered {
        state,
        committed_seq,
        next_txid: max_txid + 1,
        next_collection_id: manifest_next_coll.max(max_coll_id + 1),
    })
}

/// Rebuilds committed per-partition counters by scanning primary
/// regions.
fn seed_counters(
    store: &VersionStore,
    state: &CatalogState,
    at: SequenceNumber,
    counters: &CounterRegistry,
) {
    for def in state.collections() {
        for partition in def.layout.partitions() {
            let region = keyspace::region_prefix(def.id, IndexId::PRIMARY, partition.id);
            let end = keyspace::prefix_end(&region);
            let mut count = 0i64;
            let mut bytes = 0i64;
            let mut resume: Option<Vec<u8>> = None;
            loop {
                let page = store.scan_page(
                    &region,
                    end.as_deref(),
                    at,
                    ScanDirection::Forward,
                    resume.as_deref(),
                    1024,
                );
                count += page.items.len() as i64;
                bytes += page
                    .items
                    .iter()
                    .map(|(_, v)| v.len() as i64)
                    .sum::<i64>();
                match page.resume {
                    Some(next) => resume = Some(next),
                    None => break,
                }
            }
            if count > 0 {
                counters.seed(def.id, partition.id, count, bytes);
            }
        }
    }
}
