//! WAL record types and payload serialization.

use crate::error::{CoreError, CoreResult};
use crate::types::{SequenceNumber, TransactionId};

/// Magic bytes identifying a WAL record.
pub const WAL_MAGIC: [u8; 4] = *b"AWAL";

/// Current WAL format version.
pub const WAL_VERSION: u16 = 1;

/// Type of WAL record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalRecordType {
    /// Begin a transaction.
    Begin = 1,
    /// Put a key-value pair.
    Put = 2,
    /// Delete a key.
    Delete = 3,
    /// Apply a catalog change.
    Ddl = 4,
    /// Commit a transaction.
    Commit = 5,
    /// Abort a transaction.
    Abort = 6,
    /// Checkpoint marker.
    Checkpoint = 7,
}

impl WalRecordType {
    /// Converts a byte to a record type.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Begin),
            2 => Some(Self::Put),
            3 => Some(Self::Delete),
            4 => Some(Self::Ddl),
            5 => Some(Self::Commit),
            6 => Some(Self::Abort),
            7 => Some(Self::Checkpoint),
            _ => None,
        }
    }

    /// Converts the record type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A WAL record.
///
/// `Put` and `Delete` carry full store keys (collection, index, partition,
/// encoded key); `Ddl` carries an encoded catalog operation. Data records
/// are only written at commit time, between the transaction's `Begin` and
/// its `Commit` marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    /// Begin a transaction.
    Begin {
        /// Transaction ID.
        txid: TransactionId,
    },
    /// Put a key-value pair.
    Put {
        /// Transaction ID.
        txid: TransactionId,
        /// Full store key.
        key: Vec<u8>,
        /// Value payload.
        value: Vec<u8>,
    },
    /// Delete a key.
    Delete {
        /// Transaction ID.
        txid: TransactionId,
        /// Full store key.
        key: Vec<u8>,
    },
    /// Apply a catalog change at commit.
    Ddl {
        /// Transaction ID.
        txid: TransactionId,
        /// Encoded catalog operation.
        op: Vec<u8>,
    },
    /// Commit a transaction.
    Commit {
        /// Transaction ID.
        txid: TransactionId,
        /// Assigned commit sequence.
        sequence: SequenceNumber,
    },
    /// Abort a transaction.
    Abort {
        /// Transaction ID.
        txid: TransactionId,
    },
    /// Checkpoint marker for WAL truncation.
    Checkpoint {
        /// Committed sequence at checkpoint.
        sequence: SequenceNumber,
    },
}

impl WalRecord {
    /// Returns the record type.
    #[must_use]
    pub fn record_type(&self) -> WalRecordType {
        match self {
            Self::Begin { .. } => WalRecordType::Begin,
            Self::Put { .. } => WalRecordType::Put,
            Self::Delete { .. } => WalRecordType::Delete,
            Self::Ddl { .. } => WalRecordType::Ddl,
            Self::Commit { .. } => WalRecordType::Commit,
            Self::Abort { .. } => WalRecordType::Abort,
            Self::Checkpoint { .. } => WalRecordType::Checkpoint,
        }
    }

    /// Returns the transaction ID if the record belongs to one.
    #[must_use]
    pub fn txid(&self) -> Option<TransactionId> {
        match self {
            Self::Begin { txid }
            | Self::Put { txid, .. }
            | Self::Delete { txid, .. }
            | Self::Ddl { txid, .. }
            | Self::Commit { txid, .. }
            | Self::Abort { txid } => Some(*txid),
            Self::Checkpoint { .. } => None,
        }
    }

    /// Serializes the record payload (without envelope).
    pub fn encode_payload(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            Self::Begin { txid } | Self::Abort { txid } => {
                buf.extend_from_slice(&txid.as_u64().to_le_bytes());
            }
            Self::Put { txid, key, value } => {
                buf.extend_from_slice(&txid.as_u64().to_le_bytes());
                write_blob(&mut buf, key)?;
                write_blob(&mut buf, value)?;
            }
            Self::Delete { txid, key } => {
                buf.extend_from_slice(&txid.as_u64().to_le_bytes());
                write_blob(&mut buf, key)?;
            }
            Self::Ddl { txid, op } => {
                buf.extend_from_slice(&txid.as_u64().to_le_bytes());
                write_blob(&mut buf, op)?;
            }
            Self::Commit { txid, sequence } => {
                buf.extend_from_slice(&txid.as_u64().to_le_bytes());
                buf.extend_from_slice(&sequence.as_u64().to_le_bytes());
            }
            Self::Checkpoint { sequence } => {
                buf.extend_from_slice(&sequence.as_u64().to_le_bytes());
            }
        }
        Ok(buf)
    }

    /// Deserializes a record from its type and payload.
    pub fn decode_payload(record_type: WalRecordType, payload: &[u8]) -> CoreResult<Self> {
        let mut cursor = Cursor::new(payload);
        let record = match record_type {
            WalRecordType::Begin => Self::Begin {
                txid: TransactionId::new(cursor.read_u64()?),
            },
            WalRecordType::Put => Self::Put {
                txid: TransactionId::new(cursor.read_u64()?),
                key: cursor.read_blob()?,
                value: cursor.read_blob()?,
            },
            WalRecordType::Delete => Self::Delete {
                txid: TransactionId::new(cursor.read_u64()?),
                key: cursor.read_blob()?,
            },
            WalRecordType::Ddl => Self::Ddl {
                txid: TransactionId::new(cursor.read_u64()?),
                op: cursor.read_blob()?,
            },
            WalRecordType::Commit => Self::Commit {
                txid: TransactionId::new(cursor.read_u64()?),
                sequence: SequenceNumber::new(cursor.read_u64()?),
            },
            WalRecordType::Abort => Self::Abort {
                txid: TransactionId::new(cursor.read_u64()?),
            },
            WalRecordType::Checkpoint => Self::Checkpoint {
                sequence: SequenceNumber::new(cursor.read_u64()?),
            },
        };
        cursor.expect_end()?;
        Ok(record)
    }
}

fn write_blob(buf: &mut Vec<u8>, data: &[u8]) -> CoreResult<()> {
    let len = u32::try_from(data.len())
        .map_err(|_| CoreError::validation("WAL blob exceeds 4 GiB"))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(data);
    Ok(())
}

struct Cursor<'a> {
    payload: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(payload: &'a [u8]) -> Self {
        Self { payload, pos: 0 }
    }

    fn read_u64(&mut self) -> CoreResult<u64> {
        if self.pos + 8 > self.payload.len() {
            return Err(CoreError::wal_corruption("unexpected end of payload"));
        }
        let bytes: [u8; 8] = self.payload[self.pos..self.pos + 8]
            .try_into()
            .map_err(|_| CoreError::wal_corruption("invalid u64"))?;
        self.pos += 8;
        Ok(u64::from_le_bytes(bytes))
    }

    fn read_blob(&mut self) -> CoreResult<Vec<u8>> {
        if self.pos + 4 > self.payload.len() {
            return Err(CoreError::wal_corruption("unexpected end of payload"));
        }
        let bytes: [u8; 4] = self.payload[self.pos..self.pos + 4]
            .try_into()
            .map_err(|_| CoreError::wal_corruption("invalid length"))?;
        self.pos += 4;
        let len = u32::from_le_bytes(bytes) as usize;
        if self.pos + len > self.payload.len() {
            return Err(CoreError::wal_corruption("unexpected end of blob"));
        }
        let blob = self.payload[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(blob)
    }

    fn expect_end(&self) -> CoreResult<()> {
        if self.pos != self.payload.len() {
            return Err(CoreError::wal_corruption(format!(
                "trailing bytes in record: expected {} bytes, got {}",
                self.pos,
                self.payload.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(record: WalRecord) {
        let payload = record.encode_payload().unwrap();
        let decoded = WalRecord::decode_payload(record.record_type(), &payload).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn begin_round_trip() {
        round_trip(WalRecord::Begin {
            txid: TransactionId::new(42),
        });
    }

    #[test]
    fn put_round_trip() {
        round_trip(WalRecord::Put {
            txid: TransactionId::new(1),
            key: vec![0, 1, 2, 255],
            value: vec![0xCA, 0xFE],
        });
    }

    #[test]
    fn delete_round_trip() {
        round_trip(WalRecord::Delete {
            txid: TransactionId::new(9),
            key: vec![7; 24],
        });
    }

    #[test]
    fn ddl_round_trip() {
        round_trip(WalRecord::Ddl {
            txid: TransactionId::new(3),
            op: vec![1, 2, 3, 4],
        });
    }

    #[test]
    fn commit_round_trip() {
        round_trip(WalRecord::Commit {
            txid: TransactionId::new(7),
            sequence: SequenceNumber::new(100),
        });
    }

    #[test]
    fn abort_and_checkpoint_round_trip() {
        round_trip(WalRecord::Abort {
            txid: TransactionId::new(8),
        });
        round_trip(WalRecord::Checkpoint {
            sequence: SequenceNumber::new(500),
        });
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut payload = WalRecord::Begin {
            txid: TransactionId::new(1),
        }
        .encode_payload()
        .unwrap();
        payload.push(0);
        let result = WalRecord::decode_payload(WalRecordType::Begin, &payload);
        assert!(matches!(result, Err(CoreError::WalCorruption { .. })));
    }

    #[test]
    fn truncated_blob_rejected() {
        let payload = WalRecord::Put {
            txid: TransactionId::new(1),
            key: vec![1, 2, 3],
            value: vec![4, 5],
        }
        .encode_payload()
        .unwrap();
        let result = WalRecord::decode_payload(WalRecordType::Put, &payload[..payload.len() - 1]);
        assert!(matches!(result, Err(CoreError::WalCorruption { .. })));
    }

    #[test]
    fn record_type_bytes() {
        for t in [
            WalRecordType::Begin,
            WalRecordType::Put,
            WalRecordType::Delete,
            WalRecordType::Ddl,
            WalRecordType::Commit,
            WalRecordType::Abort,
            WalRecordType::Checkpoint,
        ] {
            assert_eq!(WalRecordType::from_byte(t.as_byte()), Some(t));
        }
        assert!(WalRecordType::from_byte(0).is_none());
    }
}
