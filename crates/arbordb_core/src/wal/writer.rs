//! WAL writer and streaming reader.

use crate::error::{CoreError, CoreResult};
use crate::wal::record::{WalRecord, WalRecordType, WAL_MAGIC, WAL_VERSION};
use arbordb_storage::StorageBackend;
use parking_lot::{Mutex, MutexGuard};

/// Envelope size: magic (4) + version (2) + type (1) + length (4).
const HEADER_SIZE: usize = 11;

/// CRC trailer size.
const CRC_SIZE: usize = 4;

/// Appends and reads WAL records over a storage backend.
pub struct WalManager {
    backend: Mutex<Box<dyn StorageBackend>>,
    sync_on_flush: bool,
}

impl WalManager {
    /// Creates a WAL manager.
    ///
    /// With `sync_on_flush`, [`WalManager::flush`] also forces data to
    /// durable media.
    pub fn new(backend: Box<dyn StorageBackend>, sync_on_flush: bool) -> Self {
        Self {
            backend: Mutex::new(backend),
            sync_on_flush,
        }
    }

    /// Appends a record, returning the offset it was written at.
    pub fn append(&self, record: &WalRecord) -> CoreResult<u64> {
        let payload = record.encode_payload()?;
        let len = u32::try_from(payload.len())
            .map_err(|_| CoreError::validation("WAL record payload too large"))?;

        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        data.extend_from_slice(&WAL_MAGIC);
        data.extend_from_slice(&WAL_VERSION.to_le_bytes());
        data.push(record.record_type().as_byte());
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(&payload);
        let crc = crc32fast::hash(&data);
        data.extend_from_slice(&crc.to_le_bytes());

        let mut backend = self.backend.lock();
        Ok(backend.append(&data)?)
    }

    /// Flushes pending appends; syncs if configured to.
    pub fn flush(&self) -> CoreResult<()> {
        let mut backend = self.backend.lock();
        if self.sync_on_flush {
            backend.sync()?;
        } else {
            backend.flush()?;
        }
        Ok(())
    }

    /// Returns the current log size in bytes.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.lock().size()?)
    }

    /// Returns a streaming iterator over all records.
    ///
    /// A truncated trailing record is treated as the end of the log (a
    /// crash mid-append); a bad checksum or malformed envelope anywhere
    /// else is corruption.
    pub fn iter(&self) -> CoreResult<WalRecordIterator<'_>> {
        let backend = self.backend.lock();
        WalRecordIterator::new(backend)
    }

    /// Reads all records into memory. Prefer [`WalManager::iter`] for
    /// recovery of large logs.
    pub fn read_all(&self) -> CoreResult<Vec<(u64, WalRecord)>> {
        self.iter()?.collect()
    }

    /// Truncates the log to zero length after a checkpoint.
    pub fn clear(&self) -> CoreResult<()> {
        let mut backend = self.backend.lock();
        backend.truncate(0)?;
        Ok(())
    }
}

impl std::fmt::Debug for WalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalManager")
            .field("sync_on_flush", &self.sync_on_flush)
            .finish_non_exhaustive()
    }
}

/// Streaming iterator over WAL records.
///
/// Reads one record at a time, so recovery memory stays bounded by the
/// largest single record.
pub struct WalRecordIterator<'a> {
    backend: MutexGuard<'a, Box<dyn StorageBackend>>,
    size: u64,
    offset: u64,
    finished: bool,
}

impl<'a> WalRecordIterator<'a> {
    fn new(backend: MutexGuard<'a, Box<dyn StorageBackend>>) -> CoreResult<Self> {
        let size = backend.size()?;
        Ok(Self {
            backend,
            size,
            offset: 0,
            finished: false,
        })
    }

    fn read_next(&mut self) -> CoreResult<Option<(u64, WalRecord)>> {
        if self.finished || self.offset >= self.size {
            return Ok(None);
        }
        let start = self.offset;

        if self.size - start < HEADER_SIZE as u64 {
            // Torn header at the tail: end of usable log.
            self.finished = true;
            return Ok(None);
        }
        let header = self.backend.read_at(start, HEADER_SIZE)?;

        if header[0..4] != WAL_MAGIC {
            self.finished = true;
            return Err(CoreError::wal_corruption(format!(
                "bad magic at offset {start}"
            )));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version > WAL_VERSION {
            self.finished = true;
            return Err(CoreError::wal_corruption(format!(
                "unsupported WAL version {version}"
            )));
        }
        let record_type = WalRecordType::from_byte(header[6]).ok_or_else(|| {
            CoreError::wal_corruption(format!("unknown record type {}", header[6]))
        })?;
        let payload_len =
            u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;

        let total = HEADER_SIZE as u64 + payload_len as u64 + CRC_SIZE as u64;
        if self.size - start < total {
            // Torn payload at the tail.
            self.finished = true;
            return Ok(None);
        }

        let body = self
            .backend
            .read_at(start + HEADER_SIZE as u64, payload_len + CRC_SIZE)?;
        let (payload, crc_bytes) = body.split_at(payload_len);

        let stored_crc =
            u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header);
        hasher.update(payload);
        let computed_crc = hasher.finalize();
        if stored_crc != computed_crc {
            self.finished = true;
            return Err(CoreError::ChecksumMismatch {
                expected: stored_crc,
                actual: computed_crc,
            });
        }

        let record = WalRecord::decode_payload(record_type, payload)?;
        self.offset = start + total;
        Ok(Some((start, record)))
    }
}

impl Iterator for WalRecordIterator<'_> {
    type Item = CoreResult<(u64, WalRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_next() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SequenceNumber, TransactionId};
    use arbordb_storage::MemoryBackend;

    fn manager() -> WalManager {
        WalManager::new(Box::new(MemoryBackend::new()), false)
    }

    #[test]
    fn append_then_iterate() {
        let wal = manager();
        let records = [
            WalRecord::Begin {
                txid: TransactionId::new(1),
            },
            WalRecord::Put {
                txid: TransactionId::new(1),
                key: vec![1, 2, 3],
                value: vec![4],
            },
            WalRecord::Commit {
                txid: TransactionId::new(1),
                sequence: SequenceNumber::new(1),
            },
        ];
        for r in &records {
            wal.append(r).unwrap();
        }
        let read: Vec<WalRecord> = wal
            .read_all()
            .unwrap()
            .into_iter()
            .map(|(_, r)| r)
            .collect();
        assert_eq!(read, records);
    }

    #[test]
    fn empty_log_yields_nothing() {
        let wal = manager();
        assert!(wal.read_all().unwrap().is_empty());
    }

    #[test]
    fn torn_tail_is_end_of_log() {
        let wal = manager();
        wal.append(&WalRecord::Begin {
            txid: TransactionId::new(1),
        })
        .unwrap();
        let full = wal.size().unwrap();
        wal.append(&WalRecord::Abort {
            txid: TransactionId::new(1),
        })
        .unwrap();
        // Simulate a crash mid-append by truncating into the second record.
        {
            let mut backend = wal.backend.lock();
            backend.truncate(full + 3).unwrap();
        }
        let read = wal.read_all().unwrap();
        assert_eq!(read.len(), 1);
    }

    #[test]
    fn corrupted_record_is_error() {
        let backend = MemoryBackend::new();
        let wal = WalManager::new(Box::new(backend), false);
        wal.append(&WalRecord::Begin {
            txid: TransactionId::new(1),
        })
        .unwrap();
        // Flip a payload byte.
        {
            let mut backend = wal.backend.lock();
            let size = backend.size().unwrap();
            let mut data = backend.read_at(0, size as usize).unwrap();
            data[HEADER_SIZE] ^= 0xFF;
            backend.truncate(0).unwrap();
            backend.append(&data).unwrap();
        }
        let result: CoreResult<Vec<_>> = wal.iter().unwrap().collect();
        assert!(matches!(result, Err(CoreError::ChecksumMismatch { .. })));
    }

    #[test]
    fn clear_empties_log() {
        let wal = manager();
        wal.append(&WalRecord::Checkpoint {
            sequence: SequenceNumber::new(1),
        })
        .unwrap();
        wal.clear().unwrap();
        assert_eq!(wal.size().unwrap(), 0);
        assert!(wal.read_all().unwrap().is_empty());
    }
}
