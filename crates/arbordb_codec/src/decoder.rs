//! Binary document decoder.

use crate::document::Document;
use crate::encoder::tag;
use crate::error::{CodecError, CodecResult};
use crate::value::Value;

/// Maximum nesting depth accepted by the decoder.
const MAX_DEPTH: usize = 64;

/// Decodes a document from its storage bytes.
pub fn decode_document(data: &[u8]) -> CodecResult<Document> {
    let mut cursor = Cursor::new(data);
    let value = cursor.read_value(0)?;
    match value {
        Value::Document(doc) => Ok(doc),
        _ => Err(CodecError::InvalidTag { tag: data[0] }),
    }
}

/// Decodes a single value from its storage bytes.
pub fn decode_value(data: &[u8]) -> CodecResult<Value> {
    Cursor::new(data).read_value(0)
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_value(&mut self, depth: usize) -> CodecResult<Value> {
        if depth > MAX_DEPTH {
            return Err(CodecError::DepthExceeded { max: MAX_DEPTH });
        }
        let tag_byte = self.read_u8("value tag")?;
        match tag_byte {
            tag::NULL => Ok(Value::Null),
            tag::BOOL => Ok(Value::Bool(self.read_u8("bool")? != 0)),
            tag::INT => {
                let bytes = self.read_bytes(8, "int")?;
                let mut arr = [0u8; 8];
                arr.copy_from_slice(bytes);
                Ok(Value::Int(i64::from_le_bytes(arr)))
            }
            tag::DOUBLE => {
                let bytes = self.read_bytes(8, "double")?;
                let mut arr = [0u8; 8];
                arr.copy_from_slice(bytes);
                Ok(Value::Double(f64::from_bits(u64::from_le_bytes(arr))))
            }
            tag::TEXT => {
                let len = self.read_len("text length")?;
                let bytes = self.read_bytes(len, "text")?;
                let text = std::str::from_utf8(bytes)
                    .map_err(|_| CodecError::InvalidUtf8 { context: "text" })?;
                Ok(Value::Text(text.to_string()))
            }
            tag::BYTES => {
                let len = self.read_len("bytes length")?;
                Ok(Value::Bytes(self.read_bytes(len, "bytes")?.to_vec()))
            }
            tag::ARRAY => {
                let count = self.read_len("array length")?;
                let mut items = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    items.push(self.read_value(depth + 1)?);
                }
                Ok(Value::Array(items))
            }
            tag::DOCUMENT => {
                let count = self.read_len("document length")?;
                let mut fields = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let name_len = self.read_len("field name length")?;
                    let name_bytes = self.read_bytes(name_len, "field name")?;
                    let name = std::str::from_utf8(name_bytes)
                        .map_err(|_| CodecError::InvalidUtf8 {
                            context: "field name",
                        })?
                        .to_string();
                    let value = self.read_value(depth + 1)?;
                    fields.push((name, value));
                }
                Ok(Value::Document(Document::from_fields(fields)))
            }
            other => Err(CodecError::InvalidTag { tag: other }),
        }
    }

    fn read_u8(&mut self, context: &'static str) -> CodecResult<u8> {
        if self.pos >= self.data.len() {
            return Err(CodecError::eof(context));
        }
        let b = self.data[self.pos];
        self.pos += 1;
        Ok(b)
    }

    fn read_len(&mut self, context: &'static str) -> CodecResult<usize> {
        let bytes = self.read_bytes(4, context)?;
        let mut arr = [0u8; 4];
        arr.copy_from_slice(bytes);
        let len = u32::from_le_bytes(arr) as usize;
        let remaining = self.data.len() - self.pos;
        // Every element or byte the length describes costs at least one
        // input byte, so a length beyond the remaining input is corrupt.
        if len > remaining {
            return Err(CodecError::LengthOverflow {
                declared: len,
                remaining,
            });
        }
        Ok(len)
    }

    fn read_bytes(&mut self, len: usize, context: &'static str) -> CodecResult<&'a [u8]> {
        if self.pos + len > self.data.len() {
            return Err(CodecError::eof(context));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{encode_document, encode_value};
    use crate::{doc, Document};

    #[test]
    fn document_round_trip() {
        let original = doc! {
            "_id" => 42_i64,
            "name" => "ada",
            "score" => 3.5_f64,
            "tags" => Value::Array(vec![Value::Int(1), Value::Int(2)]),
            "meta" => doc! { "active" => true },
        };
        let decoded = decode_document(&encode_document(&original)).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn value_round_trip_all_types() {
        let values = [
            Value::Null,
            Value::Bool(false),
            Value::Int(-7),
            Value::Double(0.25),
            Value::Text("hello".into()),
            Value::Bytes(vec![0, 1, 255]),
            Value::Array(vec![Value::Null, Value::Text("x".into())]),
            Value::Document(Document::new()),
        ];
        for v in values {
            let decoded = decode_value(&encode_value(&v)).unwrap();
            assert_eq!(decoded, v);
        }
    }

    #[test]
    fn truncated_input_is_error() {
        let bytes = encode_document(&doc! { "a" => 1_i64 });
        let result = decode_document(&bytes[..bytes.len() - 1]);
        assert!(matches!(result, Err(CodecError::UnexpectedEof { .. })));
    }

    #[test]
    fn unknown_tag_is_error() {
        let result = decode_value(&[0xEE]);
        assert!(matches!(result, Err(CodecError::InvalidTag { tag: 0xEE })));
    }

    #[test]
    fn empty_input_is_error() {
        assert!(decode_value(&[]).is_err());
    }

    #[test]
    fn field_order_survives_round_trip() {
        let original = doc! { "z" => 1_i64, "a" => 2_i64, "m" => 3_i64 };
        let decoded = decode_document(&encode_document(&original)).unwrap();
        let names: Vec<&str> = decoded.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["z", "a", "m"]);
    }
}
