//! Heap file: the append-only store of committed records.
//!
//! Commits append their published writes here after the WAL flush; on
//! open, the version store is rebuilt by replaying the heap and then the
//! WAL tail. A checkpoint syncs the heap, persists the manifest, and
//! truncates the WAL. Vacuum rewrites the heap from live state.

use crate::error::{CoreError, CoreResult};
use crate::types::{SequenceNumber, TransactionId};
use arbordb_storage::StorageBackend;
use parking_lot::Mutex;

/// Header size: record_len (4) + sequence (8) + txn (8) + flags (1) + key_len (4).
const HEADER_SIZE: usize = 25;

/// CRC trailer size.
const CRC_SIZE: usize = 4;

/// Tombstone flag bit.
const FLAG_TOMBSTONE: u8 = 0x01;

/// A committed record in the heap file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapRecord {
    /// Full store key.
    pub key: Vec<u8>,
    /// Commit sequence of the writing transaction.
    pub sequence: SequenceNumber,
    /// The writing transaction.
    pub txn: TransactionId,
    /// Value payload; `None` is a tombstone.
    pub value: Option<Vec<u8>>,
}

impl HeapRecord {
    /// Creates a put record.
    #[must_use]
    pub fn put(key: Vec<u8>, value: Vec<u8>, sequence: SequenceNumber, txn: TransactionId) -> Self {
        Self {
            key,
            sequence,
            txn,
            value: Some(value),
        }
    }

    /// Creates a tombstone record.
    #[must_use]
    pub fn tombstone(key: Vec<u8>, sequence: SequenceNumber, txn: TransactionId) -> Self {
        Self {
            key,
            sequence,
            txn,
            value: None,
        }
    }

    /// Encodes the record with its envelope and CRC.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let value_len = self.value.as_ref().map_or(0, Vec::len);
        let record_len = HEADER_SIZE + self.key.len() + value_len + CRC_SIZE;
        let mut buf = Vec::with_capacity(record_len);

        let len = u32::try_from(record_len)
            .map_err(|_| CoreError::validation("heap record too large"))?;
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&self.sequence.as_u64().to_le_bytes());
        buf.extend_from_slice(&self.txn.as_u64().to_le_bytes());
        buf.push(if self.value.is_none() { FLAG_TOMBSTONE } else { 0 });
        let key_len = u32::try_from(self.key.len())
            .map_err(|_| CoreError::validation("heap key too large"))?;
        buf.extend_from_slice(&key_len.to_le_bytes());
        buf.extend_from_slice(&self.key);
        if let Some(value) = &self.value {
            buf.extend_from_slice(value);
        }
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Decodes a record from `data`, returning it and its encoded length.
    pub fn decode(data: &[u8]) -> CoreResult<(Self, usize)> {
        if data.len() < HEADER_SIZE + CRC_SIZE {
            return Err(CoreError::heap_corruption("record too short"));
        }
        let record_len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if record_len < HEADER_SIZE + CRC_SIZE || data.len() < record_len {
            return Err(CoreError::heap_corruption("incomplete record"));
        }

        let stored_crc = u32::from_le_bytes([
            data[record_len - 4],
            data[record_len - 3],
            data[record_len - 2],
            data[record_len - 1],
        ]);
        let computed_crc = crc32fast::hash(&data[..record_len - CRC_SIZE]);
        if stored_crc != computed_crc {
            return Err(CoreError::ChecksumMismatch {
                expected: stored_crc,
                actual: computed_crc,
            });
        }

        let sequence = SequenceNumber::new(u64::from_le_bytes(
            data[4..12]
                .try_into()
                .map_err(|_| CoreError::heap_corruption("invalid sequence"))?,
        ));
        let txn = TransactionId::new(u64::from_le_bytes(
            data[12..20]
                .try_into()
                .map_err(|_| CoreError::heap_corruption("invalid transaction id"))?,
        ));
        let flags = data[20];
        let key_len = u32::from_le_bytes([data[21], data[22], data[23], data[24]]) as usize;
        if HEADER_SIZE + key_len + CRC_SIZE > record_len {
            return Err(CoreError::heap_corruption("key overruns record"));
        }
        let key = data[HEADER_SIZE..HEADER_SIZE + key_len].to_vec();
        let value = if flags & FLAG_TOMBSTONE != 0 {
            None
        } else {
            Some(data[HEADER_SIZE + key_len..record_len - CRC_SIZE].to_vec())
        };

        Ok((
            Self {
                key,
                sequence,
                txn,
                value,
            },
            record_len,
        ))
    }
}

/// Append-only store of committed records.
pub struct HeapStore {
    backend: Mutex<Box<dyn StorageBackend>>,
}

impl HeapStore {
    /// Creates a heap store over a backend.
    pub fn new(backend: Box<dyn StorageBackend>) -> Self {
        Self {
            backend: Mutex::new(backend),
        }
    }

    /// Appends a committed record.
    pub fn append(&self, record: &HeapRecord) -> CoreResult<()> {
        let data = record.encode()?;
        let mut backend = self.backend.lock();
        backend.append(&data)?;
        Ok(())
    }

    /// Flushes pending appends to the OS.
    pub fn flush(&self) -> CoreResult<()> {
        self.backend.lock().flush()?;
        Ok(())
    }

    /// Forces all records to durable media.
    pub fn sync(&self) -> CoreResult<()> {
        self.backend.lock().sync()?;
        Ok(())
    }

    /// Replays every record in append order.
    ///
    /// Returns the highest sequence seen. A torn record at the tail ends
    /// the replay (crash between WAL flush and heap append; the WAL
    /// re-applies it).
    pub fn replay<F>(&self, mut apply: F) -> CoreResult<SequenceNumber>
    where
        F: FnMut(HeapRecord) -> CoreResult<()>,
    {
        let backend = self.backend.lock();
        let size = backend.size()? as usize;
        let mut offset = 0usize;
        let mut max_seq = SequenceNumber::ZERO;

        while offset + HEADER_SIZE + CRC_SIZE <= size {
            let header = backend.read_at(offset as u64, 4)?;
            let record_len =
                u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
            if record_len < HEADER_SIZE + CRC_SIZE {
                return Err(CoreError::heap_corruption("record length too small"));
            }
            if offset + record_len > size {
                // Torn tail from a crash mid-append.
                break;
            }
            let data = backend.read_at(offset as u64, record_len)?;
            let (record, consumed) = HeapRecord::decode(&data)?;
            max_seq = max_seq.max(record.sequence);
            apply(record)?;
            offset += consumed;
        }
        Ok(max_seq)
    }

    /// Replaces the heap contents with `records`, then syncs.
    ///
    /// Used by vacuum to drop reclaimed versions.
    pub fn rewrite<I>(&self, records: I) -> CoreResult<()>
    where
        I: IntoIterator<Item = HeapRecord>,
    {
        let mut backend = self.backend.lock();
        backend.truncate(0)?;
        for record in records {
            let data = record.encode()?;
            backend.append(&data)?;
        }
        backend.sync()?;
        Ok(())
    }
}

impl std::fmt::Debug for HeapStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapStore").finish_non_exhaustive()
    }
}
