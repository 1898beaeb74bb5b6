//! Manifest: the durable catalog snapshot.
//!
//! Written at every checkpoint, after the heap sync and before the WAL
//! truncation. Recovery starts from the manifest's catalog state and
//! re-applies committed DDL found in the WAL tail.

use crate::catalog::{collection_def_from_doc, collection_def_to_doc, CatalogState, CollectionDef};
use crate::error::{CoreError, CoreResult};
use crate::types::SequenceNumber;
use arbordb_codec::{decode_document, encode_document, Document, Value};
use std::sync::Arc;

/// Magic bytes for the manifest file.
pub const MANIFEST_MAGIC: [u8; 4] = *b"AMFN";

/// Current manifest format version.
pub const MANIFEST_VERSION: u16 = 1;

/// Decoded manifest contents.
#[derive(Debug, Clone)]
pub struct Manifest {
    /// Database format version (major, minor).
    pub format_version: (u16, u16),
    /// Commit sequence the catalog state was captured at.
    pub checkpoint_seq: SequenceNumber,
    /// Next collection id to assign.
    pub next_collection_id: u32,
    /// Every collection definition.
    pub collections: Vec<CollectionDef>,
}

impl Manifest {
    /// Captures a manifest from the live catalog state.
    #[must_use]
    pub fn capture(
        state: &CatalogState,
        checkpoint_seq: SequenceNumber,
        next_collection_id: u32,
        format_version: (u16, u16),
    ) -> Self {
        Self {
            format_version,
            checkpoint_seq,
            next_collection_id,
            collections: state.collections().map(|def| (**def).clone()).collect(),
        }
    }

    /// Rebuilds a catalog state from the manifest.
    pub fn into_state(self) -> CoreResult<CatalogState> {
        let mut state = CatalogState::default();
        for def in self.collections {
            state = state.apply(&crate::catalog::CatalogOp::CreateCollection(Arc::new(def)))?;
        }
        Ok(state)
    }

    /// Encodes the manifest with magic, version, and checksum framing.
    pub fn encode(&self) -> Vec<u8> {
        let mut doc = Document::new();
        doc.set(
            "format",
            Value::Array(vec![
                Value::Int(i64::from(self.format_version.0)),
                Value::Int(i64::from(self.format_version.1)),
            ]),
        );
        doc.set("checkpoint", Value::Int(self.checkpoint_seq.as_u64() as i64));
        doc.set(
            "nextCollectionId",
            Value::Int(i64::from(self.next_collection_id)),
        );
        doc.set(
            "collections",
            Value::Array(
                self.collections
                    .iter()
                    .map(|def| Value::Document(collection_def_to_doc(def)))
                    .collect(),
            ),
        );
        let payload = encode_document(&doc);

        let mut buf = Vec::with_capacity(payload.len() + 14);
        buf.extend_from_slice(&MANIFEST_MAGIC);
        buf.extend_from_slice(&MANIFEST_VERSION.to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decodes and verifies a manifest.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() < 14 {
            return Err(CoreError::invalid_format("manifest too short"));
        }
        if data[0..4] != MANIFEST_MAGIC {
            return Err(CoreError::invalid_format("invalid manifest magic"));
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version > MANIFEST_VERSION {
            return Err(CoreError::invalid_format(format!(
                "unsupported manifest version: {version}"
            )));
        }
        let payload_len = u32::from_le_bytes([data[6], data[7], data[8], data[9]]) as usize;
        if data.len() != 10 + payload_len + 4 {
            return Err(CoreError::invalid_format("manifest length mismatch"));
        }
        let stored_crc = u32::from_le_bytes([
            data[data.len() - 4],
            data[data.len() - 3],
            data[data.len() - 2],
            data[data.len() - 1],
        ]);
        let computed_crc = crc32fast::hash(&data[..data.len() - 4]);
        if stored_crc != computed_crc {
            return Err(CoreError::ChecksumMismatch {
                expected: stored_crc,
                actual: computed_crc,
            });
        }

        let doc = decode_document(&data[10..10 + payload_len])?;
        let format_version = match doc.get("format") {
            Some(Value::Array(items)) if items.len() == 2 => {
                let major = match &items[0] {
                    Value::Int(n) => *n as u16,
                    _ => return Err(CoreError::invalid_format("bad format version")),
                };
                let minor = match &items[1] {
                    Value::Int(n) => *n as u16,
                    _ => return Err(CoreError::invalid_format("bad format version")),
                };
                (major, minor)
            }
            _ => return Err(CoreError::invalid_format("missing format version")),
        };
        let checkpoint_seq = match doc.get("checkpoint") {
            Some(Value::Int(n)) => SequenceNumber::new(*n as u64),
            _ => return Err(CoreError::invalid_format("missing checkpoint sequence")),
        };
        let next_collection_id = match doc.get("nextCollectionId") {
            Some(Value::Int(n)) => *n as u32,
            _ => return Err(CoreError::invalid_format("missing next collection id")),
        };
        let mut collections = Vec::new();
        match doc.get("collections") {
            Some(Value::Array(items)) => {
                for item in items {
                    let Value::Document(def_doc) = item else {
                        return Err(CoreError::invalid_format(
                            "collection entry is not a document",
                        ));
                    };
                    collections.push(collection_def_from_doc(def_doc)?);
                }
            }
            _ => return Err(CoreError::invalid_format("missing collections")),
        }

        Ok(Self {
            format_version,
            checkpoint_seq,
            next_collection_id,
            collections,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::PartitionLayout;
    use crate::types::{CollectionId, PartitionId};

    fn sample() -> Manifest {
        Manifest {
            format_version: (1, 0),
            checkpoint_seq: SequenceNumber::new(42),
            next_collection_id: 7,
            collections: vec![CollectionDef {
                id: CollectionId::new(3),
                name: "events".into(),
                pk_pattern: vec!["_id".into()],
                capped: None,
                indexes: Vec::new(),
                next_index_id: 1,
                next_partition_id: 2,
                layout: PartitionLayout::single(PartitionId::new(0))
                    .cap_and_append(vec![9, 9], PartitionId::new(1))
                    .unwrap(),
                partitioned: true,
            }],
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let manifest = sample();
        let decoded = Manifest::decode(&manifest.encode()).unwrap();
        assert_eq!(decoded.checkpoint_seq, manifest.checkpoint_seq);
        assert_eq!(decoded.next_collection_id, manifest.next_collection_id);
        assert_eq!(decoded.collections, manifest.collections);
    }

    #[test]
    fn corrupted_manifest_rejected() {
        let mut bytes = sample().encode();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        assert!(Manifest::decode(&bytes).is_err());
    }

    #[test]
    fn bad_magic_rejected() {
        let result = Manifest::decode(b"XXXX00000000000000");
        assert!(matches!(result, Err(CoreError::InvalidFormat { .. })));
    }

    #[test]
    fn into_state_restores_collections() {
        let state = sample().into_state().unwrap();
        let def = state.collection("events").unwrap();
        assert_eq!(def.layout.partitions().len(), 2);
        assert!(def.partitioned);
    }
}
