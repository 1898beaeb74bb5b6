//! Binary document encoder.
//!
//! The storage encoding is a tag-prefixed binary format. It is not the
//! key encoding (see [`crate::keys`]); payload bytes only need to round
//! trip, not to sort.

use crate::document::Document;
use crate::value::Value;

/// Value tags used by the storage encoding.
pub(crate) mod tag {
    pub const NULL: u8 = 0x01;
    pub const BOOL: u8 = 0x02;
    pub const INT: u8 = 0x03;
    pub const DOUBLE: u8 = 0x04;
    pub const TEXT: u8 = 0x05;
    pub const BYTES: u8 = 0x06;
    pub const ARRAY: u8 = 0x07;
    pub const DOCUMENT: u8 = 0x08;
}

/// Encodes a document to its storage bytes.
#[must_use]
pub fn encode_document(doc: &Document) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    write_document(&mut buf, doc);
    buf
}

/// Encodes a single value to its storage bytes.
#[must_use]
pub fn encode_value(value: &Value) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    write_value(&mut buf, value);
    buf
}

fn write_document(buf: &mut Vec<u8>, doc: &Document) {
    buf.push(tag::DOCUMENT);
    write_len(buf, doc.len());
    for (name, value) in doc.iter() {
        write_len(buf, name.len());
        buf.extend_from_slice(name.as_bytes());
        write_value(buf, value);
    }
}

fn write_value(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => buf.push(tag::NULL),
        Value::Bool(b) => {
            buf.push(tag::BOOL);
            buf.push(u8::from(*b));
        }
        Value::Int(n) => {
            buf.push(tag::INT);
            buf.extend_from_slice(&n.to_le_bytes());
        }
        Value::Double(d) => {
            buf.push(tag::DOUBLE);
            buf.extend_from_slice(&d.to_bits().to_le_bytes());
        }
        Value::Text(s) => {
            buf.push(tag::TEXT);
            write_len(buf, s.len());
            buf.extend_from_slice(s.as_bytes());
        }
        Value::Bytes(b) => {
            buf.push(tag::BYTES);
            write_len(buf, b.len());
            buf.extend_from_slice(b);
        }
        Value::Array(items) => {
            buf.push(tag::ARRAY);
            write_len(buf, items.len());
            for item in items {
                write_value(buf, item);
            }
        }
        Value::Document(doc) => write_document(buf, doc),
    }
}

fn write_len(buf: &mut Vec<u8>, len: usize) {
    buf.extend_from_slice(&(len as u32).to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    #[test]
    fn null_is_one_byte() {
        assert_eq!(encode_value(&Value::Null), vec![tag::NULL]);
    }

    #[test]
    fn bool_encoding() {
        assert_eq!(encode_value(&Value::Bool(true)), vec![tag::BOOL, 1]);
        assert_eq!(encode_value(&Value::Bool(false)), vec![tag::BOOL, 0]);
    }

    #[test]
    fn int_is_little_endian() {
        let bytes = encode_value(&Value::Int(1));
        assert_eq!(bytes[0], tag::INT);
        assert_eq!(&bytes[1..], &1i64.to_le_bytes());
    }

    #[test]
    fn empty_document() {
        let bytes = encode_document(&Document::new());
        assert_eq!(bytes, vec![tag::DOCUMENT, 0, 0, 0, 0]);
    }

    #[test]
    fn document_field_order_is_stable() {
        let a = encode_document(&doc! { "x" => 1_i64, "y" => 2_i64 });
        let b = encode_document(&doc! { "y" => 2_i64, "x" => 1_i64 });
        assert_ne!(a, b);
    }
}
