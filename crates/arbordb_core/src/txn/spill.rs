//! Transaction write-set spill log.
//!
//! When a transaction's buffered writes exceed the memory ceiling, the
//! in-memory tier is flushed to an append-only side log and only a small
//! per-key index stays resident. The log is private to the transaction:
//! it feeds reads and the commit stream, and is discarded on
//! commit/rollback. It is never replayed at recovery, since a crash
//! aborts the transaction by definition.

use crate::error::CoreResult;
use crate::types::TransactionId;
use arbordb_storage::{FileBackend, MemoryBackend, StorageBackend};
use std::path::PathBuf;

/// Where a transaction's overflow log lives.
#[derive(Debug, Clone)]
pub enum SpillTarget {
    /// In-memory backend (ephemeral databases and tests).
    Memory,
    /// A file per transaction under the database's spill directory.
    Directory(PathBuf),
}

impl SpillTarget {
    /// Opens the spill log for a transaction.
    pub fn open(&self, txn: TransactionId) -> CoreResult<SpillLog> {
        match self {
            SpillTarget::Memory => Ok(SpillLog {
                backend: Box::new(MemoryBackend::new()),
                path: None,
            }),
            SpillTarget::Directory(dir) => {
                let path = dir.join(format!("txn-{}.spill", txn.as_u64()));
                let backend = FileBackend::open_with_create_dirs(&path)?;
                Ok(SpillLog {
                    backend: Box::new(backend),
                    path: Some(path),
                })
            }
        }
    }
}

/// An append-only log of spilled values.
pub struct SpillLog {
    backend: Box<dyn StorageBackend>,
    path: Option<PathBuf>,
}

impl SpillLog {
    /// Appends a value, returning its offset.
    pub fn append(&mut self, value: &[u8]) -> CoreResult<u64> {
        let offset = self.backend.append(value)?;
        Ok(offset)
    }

    /// Flushes appended values to durable storage.
    pub fn flush(&mut self) -> CoreResult<()> {
        self.backend.flush()?;
        Ok(())
    }

    /// Reads a value back.
    pub fn read(&self, offset: u64, len: usize) -> CoreResult<Vec<u8>> {
        Ok(self.backend.read_at(offset, len)?)
    }

    /// Removes the backing file, if any. Called on commit and rollback.
    pub fn cleanup(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove spill file");
            }
        }
    }
}

impl Drop for SpillLog {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl std::fmt::Debug for SpillLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpillLog")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn memory_spill_round_trip() {
        let mut log = SpillTarget::Memory.open(TransactionId::new(1)).unwrap();
        let off_a = log.append(b"alpha").unwrap();
        let off_b = log.append(b"beta").unwrap();
        assert_eq!(log.read(off_a, 5).unwrap(), b"alpha");
        assert_eq!(log.read(off_b, 4).unwrap(), b"beta");
    }

    #[test]
    fn file_spill_is_cleaned_up() {
        let dir = tempdir().unwrap();
        let target = SpillTarget::Directory(dir.path().to_path_buf());
        let path;
        {
            let mut log = target.open(TransactionId::new(7)).unwrap();
            log.append(b"payload").unwrap();
            log.flush().unwrap();
            path = log.path.clone().unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }
}
