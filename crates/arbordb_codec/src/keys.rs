//! Order-preserving key encoding.
//!
//! Primary keys, index keys, and partition bounds are compared as raw
//! bytes inside the ordered store, so their encoding must sort exactly
//! like [`Value::cmp_order`]. The scheme:
//!
//! - one rank byte per value, matching the cross-type order
//! - numbers (Int and Double) share a rank and encode as the IEEE-754
//!   bit pattern with the sign bit flipped (negatives fully inverted),
//!   which sorts bitwise in numeric order
//! - Text and Bytes escape `0x00` as `0x00 0xFF` and terminate with
//!   `0x00 0x00`, so a prefix never sorts after its extension
//! - Array and Document encode their elements recursively and terminate
//!   with `0x00`
//!
//! Composite keys concatenate element encodings; each element is
//! self-terminating, so the concatenation preserves tuple order.

use crate::value::Value;

/// Rank bytes for the key encoding. Gaps leave room for future types.
mod rank {
    pub const NULL: u8 = 0x05;
    pub const BOOL: u8 = 0x10;
    pub const NUMBER: u8 = 0x20;
    pub const TEXT: u8 = 0x30;
    pub const BYTES: u8 = 0x40;
    pub const ARRAY: u8 = 0x50;
    pub const DOCUMENT: u8 = 0x60;
}

/// Encodes a composite key from its element values.
#[must_use]
pub fn encode_key(values: &[Value]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(values.len() * 12);
    for value in values {
        write_key_value(&mut buf, value);
    }
    buf
}

/// Encodes a single value as a key component.
#[must_use]
pub fn encode_key_value(value: &Value) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12);
    write_key_value(&mut buf, value);
    buf
}

fn write_key_value(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => buf.push(rank::NULL),
        Value::Bool(b) => {
            buf.push(rank::BOOL);
            buf.push(u8::from(*b));
        }
        Value::Int(_) | Value::Double(_) => {
            buf.push(rank::NUMBER);
            // Int and Double collapse into one numeric key so mixed-type
            // values compare numerically, like Value::cmp_order.
            let d = value.as_f64().unwrap_or(f64::NAN);
            buf.extend_from_slice(&monotone_f64_bits(d));
        }
        Value::Text(s) => {
            buf.push(rank::TEXT);
            write_escaped(buf, s.as_bytes());
        }
        Value::Bytes(b) => {
            buf.push(rank::BYTES);
            write_escaped(buf, b);
        }
        Value::Array(items) => {
            buf.push(rank::ARRAY);
            for item in items {
                write_key_value(buf, item);
            }
            buf.push(0x00);
        }
        Value::Document(doc) => {
            buf.push(rank::DOCUMENT);
            for (name, field_value) in doc.iter() {
                // Field names get their own escaped run so a name is never
                // confused with a value encoding.
                buf.push(0x01);
                write_escaped(buf, name.as_bytes());
                write_key_value(buf, field_value);
            }
            buf.push(0x00);
        }
    }
}

/// Maps f64 bits so unsigned bytewise comparison equals numeric order.
fn monotone_f64_bits(d: f64) -> [u8; 8] {
    let bits = d.to_bits();
    let flipped = if bits & (1 << 63) != 0 {
        !bits
    } else {
        bits | (1 << 63)
    };
    flipped.to_be_bytes()
}

/// Writes bytes with 0x00 escaped as 0x00 0xFF, terminated by 0x00 0x00.
fn write_escaped(buf: &mut Vec<u8>, bytes: &[u8]) {
    for &b in bytes {
        if b == 0x00 {
            buf.push(0x00);
            buf.push(0xFF);
        } else {
            buf.push(b);
        }
    }
    buf.push(0x00);
    buf.push(0x00);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;
    use std::cmp::Ordering;

    fn assert_order(a: &Value, b: &Value) {
        let ka = encode_key_value(a);
        let kb = encode_key_value(b);
        assert_eq!(
            ka.cmp(&kb),
            a.cmp_order(b),
            "key order mismatch for {a:?} vs {b:?}"
        );
    }

    #[test]
    fn numbers_sort_numerically() {
        let values = [
            Value::Double(f64::NEG_INFINITY),
            Value::Int(i64::MIN),
            Value::Double(-1.5),
            Value::Int(-1),
            Value::Int(0),
            Value::Double(0.5),
            Value::Int(1),
            Value::Int(1000),
            Value::Double(f64::INFINITY),
        ];
        for pair in values.windows(2) {
            let ka = encode_key_value(&pair[0]);
            let kb = encode_key_value(&pair[1]);
            assert!(ka < kb, "{:?} should sort before {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn int_and_double_equal_keys() {
        assert_eq!(
            encode_key_value(&Value::Int(3)),
            encode_key_value(&Value::Double(3.0))
        );
    }

    #[test]
    fn text_prefix_sorts_first() {
        assert_order(&Value::Text("ab".into()), &Value::Text("abc".into()));
        assert_order(&Value::Text("ab".into()), &Value::Text("b".into()));
    }

    #[test]
    fn embedded_zero_bytes_do_not_break_order() {
        let a = Value::Bytes(vec![1, 0]);
        let b = Value::Bytes(vec![1, 0, 0]);
        let c = Value::Bytes(vec![1, 1]);
        assert_order(&a, &b);
        assert_order(&b, &c);
    }

    #[test]
    fn cross_type_ranks() {
        let values = [
            Value::Null,
            Value::Bool(false),
            Value::Int(9),
            Value::Text("".into()),
            Value::Bytes(vec![]),
            Value::Array(vec![]),
            Value::Document(doc! { "a" => 1_i64 }),
        ];
        for pair in values.windows(2) {
            assert_eq!(pair[0].cmp_order(&pair[1]), Ordering::Less);
            assert_order(&pair[0], &pair[1]);
        }
    }

    #[test]
    fn composite_key_tuple_order() {
        let a = encode_key(&[Value::Int(1), Value::Text("b".into())]);
        let b = encode_key(&[Value::Int(1), Value::Text("c".into())]);
        let c = encode_key(&[Value::Int(2), Value::Text("a".into())]);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn array_element_order() {
        let a = Value::Array(vec![Value::Int(1)]);
        let b = Value::Array(vec![Value::Int(1), Value::Int(0)]);
        let c = Value::Array(vec![Value::Int(2)]);
        assert_order(&a, &b);
        assert_order(&b, &c);
    }
}
