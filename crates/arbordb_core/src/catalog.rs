//! Collection catalog.
//!
//! Definitions of collections, their indexes, and their partition layouts.
//! The catalog is versioned by commit sequence: DDL staged in a
//! transaction publishes a new immutable [`CatalogState`] at the commit's
//! sequence, and every reader resolves the state as of its snapshot. A
//! transaction begun before a partition change therefore keeps operating
//! against the boundaries it began with.

use crate::error::{CoreError, CoreResult};
use crate::partition::{PartitionDef, PartitionLayout};
use crate::types::{CollectionId, IndexId, PartitionId, SequenceNumber};
use arbordb_codec::{decode_document, encode_document, Document, Value};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Size and count bounds of a capped collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CappedOptions {
    /// Maximum total document bytes, if bounded by size.
    pub max_size: Option<u64>,
    /// Maximum document count, if bounded by count.
    pub max_docs: Option<u64>,
}

/// A secondary index definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    /// Index id within the collection; never 0 (the primary).
    pub id: IndexId,
    /// User-visible name.
    pub name: String,
    /// Ordered field paths the key is built from.
    pub key_pattern: Vec<String>,
    /// Whether duplicate keys are rejected.
    pub unique: bool,
    /// Whether entries store the document inline instead of by
    /// primary-key reference.
    pub clustering: bool,
}

/// A collection definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionDef {
    /// Stable collection id.
    pub id: CollectionId,
    /// Collection name.
    pub name: String,
    /// Primary-key field paths. Always ends with `_id`; capped
    /// collections instead cluster on a hidden insertion id.
    pub pk_pattern: Vec<String>,
    /// Capped bounds, if any.
    pub capped: Option<CappedOptions>,
    /// Secondary indexes, in creation order.
    pub indexes: Vec<IndexDef>,
    /// Next index id to assign.
    pub next_index_id: u32,
    /// Next partition id to assign.
    pub next_partition_id: u64,
    /// Partition layout. Unpartitioned collections have a single
    /// unbounded partition.
    pub layout: PartitionLayout,
    /// Whether the collection accepts partition DDL.
    pub partitioned: bool,
}

impl CollectionDef {
    /// Finds a secondary index by name.
    #[must_use]
    pub fn index_by_name(&self, name: &str) -> Option<&IndexDef> {
        self.indexes.iter().find(|i| i.name == name)
    }

    /// Finds the first index whose leading key field is `field`,
    /// preferring unique indexes.
    #[must_use]
    pub fn index_on_field(&self, field: &str) -> Option<&IndexDef> {
        self.indexes
            .iter()
            .filter(|i| i.key_pattern.first().is_some_and(|f| f == field))
            .max_by_key(|i| i.unique)
    }
}

/// An immutable snapshot of every collection definition.
#[derive(Debug, Default, Clone)]
pub struct CatalogState {
    collections: BTreeMap<String, Arc<CollectionDef>>,
}

impl CatalogState {
    /// Looks up a collection by name.
    #[must_use]
    pub fn collection(&self, name: &str) -> Option<&Arc<CollectionDef>> {
        self.collections.get(name)
    }

    /// Looks up a collection, failing when absent.
    pub fn require(&self, name: &str) -> CoreResult<&Arc<CollectionDef>> {
        self.collection(name)
            .ok_or_else(|| CoreError::collection_not_found(name))
    }

    /// Iterates collections in name order.
    pub fn collections(&self) -> impl Iterator<Item = &Arc<CollectionDef>> {
        self.collections.values()
    }

    /// Applies one catalog operation, producing the next state.
    pub fn apply(&self, op: &CatalogOp) -> CoreResult<CatalogState> {
        let mut next = self.clone();
        match op {
            CatalogOp::CreateCollection(def) => {
                if next.collections.contains_key(&def.name) {
                    return Err(CoreError::validation(format!(
                        "collection '{}' already exists",
                        def.name
                    )));
                }
                next.collections.insert(def.name.clone(), Arc::clone(def));
            }
            CatalogOp::DropCollection(name) => {
                if next.collections.remove(name).is_none() {
                    return Err(CoreError::collection_not_found(name.clone()));
                }
            }
            CatalogOp::CreateIndex { collection, def } => {
                let existing = next.require(collection)?;
                let mut updated = (**existing).clone();
                if updated.index_by_name(&def.name).is_some() {
                    return Err(CoreError::validation(format!(
                        "index '{}' already exists",
                        def.name
                    )));
                }
                updated.next_index_id = updated.next_index_id.max(def.id.as_u32() + 1);
                updated.indexes.push(def.clone());
                next.collections
                    .insert(collection.clone(), Arc::new(updated));
            }
            CatalogOp::DropIndex { collection, name } => {
                let existing = next.require(collection)?;
                let mut updated = (**existing).clone();
                let before = updated.indexes.len();
                updated.indexes.retain(|i| i.name != *name);
                if updated.indexes.len() == before {
                    return Err(CoreError::IndexNotFound {
                        name: name.clone(),
                        collection: updated.id,
                    });
                }
                next.collections
                    .insert(collection.clone(), Arc::new(updated));
            }
            CatalogOp::AddPartition {
                collection,
                new_max,
                new_id,
            } => {
                let existing = next.require(collection)?;
                let mut updated = (**existing).clone();
                updated.layout = updated.layout.cap_and_append(new_max.clone(), *new_id)?;
                updated.next_partition_id = updated.next_partition_id.max(new_id.as_u64() + 1);
                next.collections
                    .insert(collection.clone(), Arc::new(updated));
            }
            CatalogOp::DropPartition { collection, id } => {
                let existing = next.require(collection)?;
                let mut updated = (**existing).clone();
                updated.layout = updated.layout.drop_partition(*id)?;
                next.collections
                    .insert(collection.clone(), Arc::new(updated));
            }
        }
        Ok(next)
    }
}

/// A catalog change staged inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogOp {
    /// Create a collection from a fully-formed definition.
    CreateCollection(Arc<CollectionDef>),
    /// Drop a collection by name.
    DropCollection(String),
    /// Add a secondary index.
    CreateIndex {
        /// Collection name.
        collection: String,
        /// The new index.
        def: IndexDef,
    },
    /// Drop a secondary index by name.
    DropIndex {
        /// Collection name.
        collection: String,
        /// Index name.
        name: String,
    },
    /// Cap the last partition and append a fresh unbounded one.
    AddPartition {
        /// Collection name.
        collection: String,
        /// Encoded primary-key bound the last partition is capped at.
        new_max: Vec<u8>,
        /// Id of the appended partition.
        new_id: PartitionId,
    },
    /// Drop a partition.
    DropPartition {
        /// Collection name.
        collection: String,
        /// Partition to drop.
        id: PartitionId,
    },
}

/// The versioned catalog.
#[derive(Debug)]
pub struct Catalog {
    versions: RwLock<Vec<(SequenceNumber, Arc<CatalogState>)>>,
    next_collection_id: AtomicU32,
}

impl Catalog {
    /// Creates an empty catalog at sequence zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            versions: RwLock::new(vec![(SequenceNumber::ZERO, Arc::new(CatalogState::default()))]),
            next_collection_id: AtomicU32::new(1),
        }
    }

    /// Restores a catalog from a recovered state.
    #[must_use]
    pub fn from_state(state: CatalogState, seq: SequenceNumber, next_collection_id: u32) -> Self {
        Self {
            versions: RwLock::new(vec![(seq, Arc::new(state))]),
            next_collection_id: AtomicU32::new(next_collection_id),
        }
    }

    /// Returns the state visible at `seq`.
    #[must_use]
    pub fn at(&self, seq: SequenceNumber) -> Arc<CatalogState> {
        let versions = self.versions.read();
        versions
            .iter()
            .rev()
            .find(|(v, _)| *v <= seq)
            .or_else(|| versions.first())
            .map(|(_, s)| Arc::clone(s))
            .unwrap_or_default()
    }

    /// Returns the latest published state.
    #[must_use]
    pub fn head(&self) -> Arc<CatalogState> {
        let versions = self.versions.read();
        versions
            .last()
            .map(|(_, s)| Arc::clone(s))
            .unwrap_or_default()
    }

    /// Returns the state at `seq` with a transaction's staged operations
    /// applied on top.
    pub fn effective(
        &self,
        seq: SequenceNumber,
        staged: &[CatalogOp],
    ) -> CoreResult<Arc<CatalogState>> {
        let base = self.at(seq);
        if staged.is_empty() {
            return Ok(base);
        }
        let mut state = (*base).clone();
        for op in staged {
            state = state.apply(op)?;
        }
        Ok(Arc::new(state))
    }

    /// Publishes staged operations at a commit sequence.
    ///
    /// Called under the commit lock; the operations were validated at
    /// staging time, so failure here means the catalog is corrupt.
    pub fn publish(&self, ops: &[CatalogOp], seq: SequenceNumber) -> CoreResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut versions = self.versions.write();
        let mut state = versions
            .last()
            .map(|(_, s)| (**s).clone())
            .unwrap_or_default();
        for op in ops {
            state = state.apply(op)?;
        }
        versions.push((seq, Arc::new(state)));
        Ok(())
    }

    /// Drops catalog versions no active snapshot can reference.
    pub fn prune(&self, min_active: SequenceNumber) {
        let mut versions = self.versions.write();
        while versions.len() > 1 && versions[1].0 <= min_active {
            versions.remove(0);
        }
    }

    /// Every retained catalog version, oldest first. Vacuum derives the
    /// set of live storage regions from these.
    #[must_use]
    pub fn retained_states(&self) -> Vec<Arc<CatalogState>> {
        self.versions
            .read()
            .iter()
            .map(|(_, s)| Arc::clone(s))
            .collect()
    }

    /// Allocates a collection id.
    pub fn allocate_collection_id(&self) -> CollectionId {
        CollectionId::new(self.next_collection_id.fetch_add(1, Ordering::SeqCst))
    }

    /// The next collection id, for the manifest.
    #[must_use]
    pub fn next_collection_id(&self) -> u32 {
        self.next_collection_id.load(Ordering::SeqCst)
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

// === Document encoding ===
//
// Catalog operations travel through the WAL and collection definitions
// through the manifest, both as encoded documents.

fn index_def_to_doc(def: &IndexDef) -> Document {
    let mut doc = Document::new();
    doc.set("id", Value::Int(i64::from(def.id.as_u32())));
    doc.set("name", Value::Text(def.name.clone()));
    doc.set(
        "key",
        Value::Array(
            def.key_pattern
                .iter()
                .map(|f| Value::Text(f.clone()))
                .collect(),
        ),
    );
    doc.set("unique", Value::Bool(def.unique));
    doc.set("clustering", Value::Bool(def.clustering));
    doc
}

fn index_def_from_doc(doc: &Document) -> CoreResult<IndexDef> {
    Ok(IndexDef {
        id: IndexId::new(u32::try_from(read_int(doc, "id")?).map_err(bad_def)?),
        name: read_text(doc, "name")?,
        key_pattern: read_text_array(doc, "key")?,
        unique: read_bool(doc, "unique")?,
        clustering: read_bool(doc, "clustering")?,
    })
}

/// Encodes a collection definition as a document.
pub fn collection_def_to_doc(def: &CollectionDef) -> Document {
    let mut doc = Document::new();
    doc.set("id", Value::Int(i64::from(def.id.as_u32())));
    doc.set("name", Value::Text(def.name.clone()));
    doc.set(
        "pk",
        Value::Array(
            def.pk_pattern
                .iter()
                .map(|f| Value::Text(f.clone()))
                .collect(),
        ),
    );
    if let Some(capped) = &def.capped {
        let mut capped_doc = Document::new();
        if let Some(size) = capped.max_size {
            capped_doc.set("size", Value::Int(size as i64));
        }
        if let Some(docs) = capped.max_docs {
            capped_doc.set("max", Value::Int(docs as i64));
        }
        doc.set("capped", Value::Document(capped_doc));
    }
    doc.set(
        "indexes",
        Value::Array(
            def.indexes
                .iter()
                .map(|i| Value::Document(index_def_to_doc(i)))
                .collect(),
        ),
    );
    doc.set("nextIndexId", Value::Int(i64::from(def.next_index_id)));
    doc.set("nextPartitionId", Value::Int(def.next_partition_id as i64));
    doc.set(
        "partitions",
        Value::Array(
            def.layout
                .partitions()
                .iter()
                .map(|p| {
                    let mut part = Document::new();
                    part.set("id", Value::Int(p.id.as_u64() as i64));
                    match &p.max {
                        Some(max) => part.set("max", Value::Bytes(max.clone())),
                        None => part.set("max", Value::Null),
                    }
                    Value::Document(part)
                })
                .collect(),
        ),
    );
    doc.set("partitioned", Value::Bool(def.partitioned));
    doc
}

/// Decodes a collection definition from a document.
pub fn collection_def_from_doc(doc: &Document) -> CoreResult<CollectionDef> {
    let capped = match doc.get("capped") {
        Some(Value::Document(capped_doc)) => Some(CappedOptions {
            max_size: match capped_doc.get("size") {
                Some(Value::Int(n)) => Some(*n as u64),
                _ => None,
            },
            max_docs: match capped_doc.get("max") {
                Some(Value::Int(n)) => Some(*n as u64),
                _ => None,
            },
        }),
        _ => None,
    };

    let mut partitions = Vec::new();
    match doc.get("partitions") {
        Some(Value::Array(items)) => {
            for item in items {
                let Value::Document(part) = item else {
                    return Err(bad_def_msg("partition entry is not a document"));
                };
                let id = PartitionId::new(read_int(part, "id")? as u64);
                let max = match part.get("max") {
                    Some(Value::Bytes(b)) => Some(b.clone()),
                    Some(Value::Null) | None => None,
                    _ => return Err(bad_def_msg("partition bound has wrong type")),
                };
                partitions.push(PartitionDef { id, max });
            }
        }
        _ => return Err(bad_def_msg("missing partitions")),
    }

    let mut indexes = Vec::new();
    match doc.get("indexes") {
        Some(Value::Array(items)) => {
            for item in items {
                let Value::Document(index_doc) = item else {
                    return Err(bad_def_msg("index entry is not a document"));
                };
                indexes.push(index_def_from_doc(index_doc)?);
            }
        }
        _ => return Err(bad_def_msg("missing indexes")),
    }

    Ok(CollectionDef {
        id: CollectionId::new(u32::try_from(read_int(doc, "id")?).map_err(bad_def)?),
        name: read_text(doc, "name")?,
        pk_pattern: read_text_array(doc, "pk")?,
        capped,
        indexes,
        next_index_id: u32::try_from(read_int(doc, "nextIndexId")?).map_err(bad_def)?,
        next_partition_id: read_int(doc, "nextPartitionId")? as u64,
        layout: PartitionLayout::from_parts(partitions)?,
        partitioned: read_bool(doc, "partitioned")?,
    })
}

/// Encodes a catalog operation for the WAL.
pub fn catalog_op_to_bytes(op: &CatalogOp) -> Vec<u8> {
    let mut doc = Document::new();
    match op {
        CatalogOp::CreateCollection(def) => {
            doc.set("op", Value::Text("createCollection".into()));
            doc.set("def", Value::Document(collection_def_to_doc(def)));
        }
        CatalogOp::DropCollection(name) => {
            doc.set("op", Value::Text("dropCollection".into()));
            doc.set("name", Value::Text(name.clone()));
        }
        CatalogOp::CreateIndex { collection, def } => {
            doc.set("op", Value::Text("createIndex".into()));
            doc.set("collection", Value::Text(collection.clone()));
            doc.set("def", Value::Document(index_def_to_doc(def)));
        }
        CatalogOp::DropIndex { collection, name } => {
            doc.set("op", Value::Text("dropIndex".into()));
            doc.set("collection", Value::Text(collection.clone()));
            doc.set("name", Value::Text(name.clone()));
        }
        CatalogOp::AddPartition {
            collection,
            new_max,
            new_id,
        } => {
            doc.set("op", Value::Text("addPartition".into()));
            doc.set("collection", Value::Text(collection.clone()));
            doc.set("newMax", Value::Bytes(new_max.clone()));
            doc.set("newId", Value::Int(new_id.as_u64() as i64));
        }
        CatalogOp::DropPartition { collection, id } => {
            doc.set("op", Value::Text("dropPartition".into()));
            doc.set("collection", Value::Text(collection.clone()));
            doc.set("id", Value::Int(id.as_u64() as i64));
        }
    }
    encode_document(&doc)
}

/// Decodes a catalog operation from WAL bytes.
pub fn catalog_op_from_bytes(bytes: &[u8]) -> CoreResult<CatalogOp> {
    let doc = decode_document(bytes)?;
    let op = read_text(&doc, "op")?;
    match op.as_str() {
        "createCollection" => {
            let Some(Value::Document(def_doc)) = doc.get("def") else {
                return Err(bad_def_msg("missing collection definition"));
            };
            Ok(CatalogOp::CreateCollection(Arc::new(
                collection_def_from_doc(def_doc)?,
            )))
        }
        "dropCollection" => Ok(CatalogOp::DropCollection(read_text(&doc, "name")?)),
        "createIndex" => {
            let Some(Value::Document(def_doc)) = doc.get("def") else {
                return Err(bad_def_msg("missing index definition"));
            };
            Ok(CatalogOp::CreateIndex {
                collection: read_text(&doc, "collection")?,
                def: index_def_from_doc(def_doc)?,
            })
        }
        "dropIndex" => Ok(CatalogOp::DropIndex {
            collection: read_text(&doc, "collection")?,
            name: read_text(&doc, "name")?,
        }),
        "addPartition" => {
            let new_max = match doc.get("newMax") {
                Some(Value::Bytes(b)) => b.clone(),
                _ => return Err(bad_def_msg("missing partition bound")),
            };
            Ok(CatalogOp::AddPartition {
                collection: read_text(&doc, "collection")?,
                new_max,
                new_id: PartitionId::new(read_int(&doc, "newId")? as u64),
            })
        }
        "dropPartition" => Ok(CatalogOp::DropPartition {
            collection: read_text(&doc, "collection")?,
            id: PartitionId::new(read_int(&doc, "id")? as u64),
        }),
        other => Err(bad_def_msg(format!("unknown catalog op '{other}'"))),
    }
}

fn read_int(doc: &Document, field: &str) -> CoreResult<i64> {
    match doc.get(field) {
        Some(Value::Int(n)) => Ok(*n),
        _ => Err(bad_def_msg(format!("missing integer field '{field}'"))),
    }
}

fn read_bool(doc: &Document, field: &str) -> CoreResult<bool> {
    match doc.get(field) {
        Some(Value::Bool(b)) => Ok(*b),
        _ => Err(bad_def_msg(format!("missing boolean field '{field}'"))),
    }
}

fn read_text(doc: &Document, field: &str) -> CoreResult<String> {
    match doc.get(field) {
        Some(Value::Text(s)) => Ok(s.clone()),
        _ => Err(bad_def_msg(format!("missing text field '{field}'"))),
    }
}

fn read_text_array(doc: &Document, field: &str) -> CoreResult<Vec<String>> {
    match doc.get(field) {
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| match v {
                Value::Text(s) => Ok(s.clone()),
                _ => Err(bad_def_msg(format!("non-text element in '{field}'"))),
            })
            .collect(),
        _ => Err(bad_def_msg(format!("missing array field '{field}'"))),
    }
}

fn bad_def<E>(_: E) -> CoreError {
    bad_def_msg("value out of range")
}

fn bad_def_msg(message: impl Into<String>) -> CoreError {
    CoreError::invalid_format(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_def() -> CollectionDef {
        CollectionDef {
            id: CollectionId::new(3),
            name: "users".into(),
            pk_pattern: vec!["a".into(), "_id".into()],
            capped: None,
            indexes: vec![IndexDef {
                id: IndexId::new(1),
                name: "a_1".into(),
                key_pattern: vec!["a".into()],
                unique: true,
                clustering: false,
            }],
            next_index_id: 2,
            next_partition_id: 1,
            layout: PartitionLayout::single(PartitionId::new(0)),
            partitioned: false,
        }
    }

    #[test]
    fn def_document_round_trip() {
        let def = sample_def();
        let doc = collection_def_to_doc(&def);
        let decoded = collection_def_from_doc(&doc).unwrap();
        assert_eq!(decoded, def);
    }

    #[test]
    fn op_bytes_round_trip() {
        let ops = [
            CatalogOp::CreateCollection(Arc::new(sample_def())),
            CatalogOp::DropCollection("users".into()),
            CatalogOp::CreateIndex {
                collection: "users".into(),
                def: IndexDef {
                    id: IndexId::new(2),
                    name: "b_1".into(),
                    key_pattern: vec!["b".into()],
                    unique: false,
                    clustering: true,
                },
            },
            CatalogOp::DropIndex {
                collection: "users".into(),
                name: "b_1".into(),
            },
            CatalogOp::AddPartition {
                collection: "users".into(),
                new_max: vec![1, 2, 3],
                new_id: PartitionId::new(4),
            },
            CatalogOp::DropPartition {
                collection: "users".into(),
                id: PartitionId::new(4),
            },
        ];
        for op in ops {
            let bytes = catalog_op_to_bytes(&op);
            let decoded = catalog_op_from_bytes(&bytes).unwrap();
            assert_eq!(decoded, op);
        }
    }

    #[test]
    fn versioned_states_resolve_by_snapshot() {
        let catalog = Catalog::new();
        catalog
            .publish(
                &[CatalogOp::CreateCollection(Arc::new(sample_def()))],
                SequenceNumber::new(5),
            )
            .unwrap();

        assert!(catalog.at(SequenceNumber::new(4)).collection("users").is_none());
        assert!(catalog.at(SequenceNumber::new(5)).collection("users").is_some());
        assert!(catalog.head().collection("users").is_some());
    }

    #[test]
    fn effective_overlays_staged_ops() {
        let catalog = Catalog::new();
        let staged = vec![CatalogOp::CreateCollection(Arc::new(sample_def()))];
        let state = catalog.effective(SequenceNumber::ZERO, &staged).unwrap();
        assert!(state.collection("users").is_some());
        // Nothing published.
        assert!(catalog.head().collection("users").is_none());
    }

    #[test]
    fn partition_change_is_versioned() {
        let catalog = Catalog::new();
        let mut def = sample_def();
        def.partitioned = true;
        catalog
            .publish(
                &[CatalogOp::CreateCollection(Arc::new(def))],
                SequenceNumber::new(1),
            )
            .unwrap();
        catalog
            .publish(
                &[CatalogOp::AddPartition {
                    collection: "users".into(),
                    new_max: vec![9],
                    new_id: PartitionId::new(1),
                }],
                SequenceNumber::new(2),
            )
            .unwrap();

        let old = catalog.at(SequenceNumber::new(1));
        let new = catalog.at(SequenceNumber::new(2));
        assert_eq!(
            old.collection("users").unwrap().layout.partitions().len(),
            1
        );
        assert_eq!(
            new.collection("users").unwrap().layout.partitions().len(),
            2
        );
    }

    #[test]
    fn prune_drops_old_versions() {
        let catalog = Catalog::new();
        catalog
            .publish(
                &[CatalogOp::CreateCollection(Arc::new(sample_def()))],
                SequenceNumber::new(1),
            )
            .unwrap();
        catalog
            .publish(
                &[CatalogOp::DropCollection("users".into())],
                SequenceNumber::new(2),
            )
            .unwrap();

        catalog.prune(SequenceNumber::new(10));
        // The newest state survives pruning.
        assert!(catalog.head().collection("users").is_none());
        assert!(catalog
            .at(SequenceNumber::new(1))
            .collection("users")
            .is_none());
    }

    #[test]
    fn duplicate_collection_rejected() {
        let state = CatalogState::default();
        let state = state
            .apply(&CatalogOp::CreateCollection(Arc::new(sample_def())))
            .unwrap();
        let result = state.apply(&CatalogOp::CreateCollection(Arc::new(sample_def())));
        assert!(matches!(result, Err(CoreError::Validation { .. })));
    }
}
