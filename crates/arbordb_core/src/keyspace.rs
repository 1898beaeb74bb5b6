//! Store-key composition.
//!
//! All durable state shares one ordered byte keyspace:
//!
//! ```text
//! [collection_id u32 BE][index_id u32 BE][partition_id u64 BE][key bytes]
//! ```
//!
//! Index 0 is the primary clustering index. Because partitions appear in
//! bound order and every per-partition region is internally sorted, a
//! collection scan that visits partitions in layout order yields rows in
//! primary-key order.

use crate::types::{CollectionId, IndexId, PartitionId};

/// Byte length of the (collection, index, partition) prefix.
pub const PREFIX_LEN: usize = 4 + 4 + 8;

/// Composes a full store key.
#[must_use]
pub fn data_key(
    collection: CollectionId,
    index: IndexId,
    partition: PartitionId,
    key: &[u8],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(PREFIX_LEN + key.len());
    buf.extend_from_slice(&collection.as_u32().to_be_bytes());
    buf.extend_from_slice(&index.as_u32().to_be_bytes());
    buf.extend_from_slice(&partition.as_u64().to_be_bytes());
    buf.extend_from_slice(key);
    buf
}

/// Returns the prefix covering one index's entries within one partition.
#[must_use]
pub fn region_prefix(collection: CollectionId, index: IndexId, partition: PartitionId) -> Vec<u8> {
    data_key(collection, index, partition, &[])
}

/// Returns the prefix covering everything a collection stores.
#[must_use]
pub fn collection_prefix(collection: CollectionId) -> Vec<u8> {
    collection.as_u32().to_be_bytes().to_vec()
}

/// Splits a store key into its parts.
///
/// Returns `None` if the key is shorter than the fixed prefix.
#[must_use]
pub fn split(key: &[u8]) -> Option<(CollectionId, IndexId, PartitionId, &[u8])> {
    if key.len() < PREFIX_LEN {
        return None;
    }
    let collection = u32::from_be_bytes(key[0..4].try_into().ok()?);
    let index = u32::from_be_bytes(key[4..8].try_into().ok()?);
    let partition = u64::from_be_bytes(key[8..16].try_into().ok()?);
    Some((
        CollectionId::new(collection),
        IndexId::new(index),
        PartitionId::new(partition),
        &key[PREFIX_LEN..],
    ))
}

/// Returns the smallest key strictly greater than every key with this
/// prefix, or `None` when the prefix is all `0xFF`.
#[must_use]
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < 0xFF {
            *last += 1;
            return Some(end);
        }
        end.pop();
    }
    None
}
