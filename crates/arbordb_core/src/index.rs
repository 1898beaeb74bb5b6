//! Index key extraction and entry layout.
//!
//! The primary index is clustering: the encoded document is the payload
//! at its primary-key position. Secondary entries map an extracted index
//! key to the primary key (or carry the document inline when the index is
//! declared clustering). Array fields are multikey: one entry per
//! element. Uniqueness is enforced by giving unique indexes bare keys,
//! so a duplicate lands on an existing entry, while non-unique entries
//! append the primary key to stay distinct.

use crate::catalog::{CollectionDef, IndexDef};
use crate::error::{CoreError, CoreResult};
use arbordb_codec::{keys, Document, Value};

/// Validates a user-supplied index name against the configured limit.
///
/// Over-long names fail creation cleanly instead of producing an
/// unusable on-disk identifier.
pub fn validate_index_name(name: &str, max_len: usize) -> CoreResult<()> {
    if name.is_empty() {
        return Err(CoreError::validation("index name must not be empty"));
    }
    if name.len() > max_len {
        return Err(CoreError::validation(format!(
            "index name length {} exceeds maximum {max_len}",
            name.len()
        )));
    }
    Ok(())
}

/// Validates an index or primary-key pattern.
pub fn validate_key_pattern(pattern: &[String]) -> CoreResult<()> {
    if pattern.is_empty() {
        return Err(CoreError::validation("key pattern must not be empty"));
    }
    for field in pattern {
        if field.is_empty() {
            return Err(CoreError::validation("key pattern field must not be empty"));
        }
    }
    Ok(())
}

/// Derives a name for an index from its key pattern, `field_1_field2_1`
/// style.
#[must_use]
pub fn derive_index_name(pattern: &[String]) -> String {
    pattern
        .iter()
        .map(|f| format!("{f}_1"))
        .collect::<Vec<_>>()
        .join("_")
}

/// Extracts the encoded primary key of a document.
///
/// Every pattern field must resolve to a non-array value; `_id` in
/// particular may not be an array.
pub fn primary_key_bytes(def: &CollectionDef, doc: &Document) -> CoreResult<Vec<u8>> {
    let mut values = Vec::with_capacity(def.pk_pattern.len());
    for field in &def.pk_pattern {
        let value = doc.get_path(field).ok_or_else(|| {
            CoreError::validation(format!("document is missing primary-key field '{field}'"))
        })?;
        if matches!(value, Value::Array(_)) {
            return Err(CoreError::validation(format!(
                "primary-key field '{field}' may not be an array"
            )));
        }
        values.push(value.clone());
    }
    Ok(keys::encode_key(&values))
}

/// Extracts every index key a document produces for one index.
///
/// At most one pattern field may hold an array (parallel arrays are not
/// indexable); that field contributes one key per element. Duplicate
/// keys from repeated elements collapse to one entry.
pub fn index_keys(def: &IndexDef, doc: &Document) -> CoreResult<Vec<Vec<u8>>> {
    let mut scalar_values: Vec<Option<Value>> = Vec::with_capacity(def.key_pattern.len());
    let mut array_slot: Option<(usize, Vec<Value>)> = None;

    for (pos, field) in def.key_pattern.iter().enumerate() {
        match doc.get_path(field) {
            Some(Value::Array(elements)) => {
                if array_slot.is_some() {
                    return Err(CoreError::validation(format!(
                        "cannot index parallel arrays in index '{}'",
                        def.name
                    )));
                }
                array_slot = Some((pos, elements.clone()));
                scalar_values.push(None);
            }
            Some(value) => scalar_values.push(Some(value.clone())),
            // Missing fields index as Null, so sparse documents are
            // still reachable through the index.
            None => scalar_values.push(Some(Value::Null)),
        }
    }

    let mut out = Vec::new();
    match array_slot {
        None => {
            let values: Vec<Value> = scalar_values.into_iter().flatten().collect();
            out.push(keys::encode_key(&values));
        }
        Some((pos, elements)) => {
            // An empty array indexes as a single Null entry.
            let elements = if elements.is_empty() {
                vec![Value::Null]
            } else {
                elements
            };
            for element in elements {
                let mut values = Vec::with_capacity(scalar_values.len());
                for (i, slot) in scalar_values.iter().enumerate() {
                    if i == pos {
                        values.push(element.clone());
                    } else if let Some(v) = slot {
                        values.push(v.clone());
                    }
                }
                out.push(keys::encode_key(&values));
            }
            out.sort();
            out.dedup();
        }
    }
    Ok(out)
}

/// Builds the stored entry key for an index key.
///
/// Unique indexes use the bare key; non-unique entries append the
/// primary key so equal index keys stay distinct.
#[must_use]
pub fn entry_key(def: &IndexDef, index_key: &[u8], pk: &[u8]) -> Vec<u8> {
    if def.unique {
        index_key.to_vec()
    } else {
        let mut key = Vec::with_capacity(index_key.len() + pk.len());
        key.extend_from_slice(index_key);
        key.extend_from_slice(pk);
        key
    }
}

/// Builds the stored entry payload: the primary key by reference, or the
/// whole document for a clustering index.
#[must_use]
pub fn entry_value(def: &IndexDef, pk: &[u8], doc_bytes: &[u8]) -> Vec<u8> {
    if def.clustering {
        doc_bytes.to_vec()
    } else {
        pk.to_vec()
    }
}
