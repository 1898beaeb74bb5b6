//! Database directory layout and locking.

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// File names inside a database directory.
const LOCK_FILE: &str = "LOCK";
const MANIFEST_FILE: &str = "MANIFEST";
const WAL_FILE: &str = "wal.adb";
const HEAP_FILE: &str = "heap.adb";
const SPILL_DIR: &str = "spill";

/// An opened database directory holding the exclusive process lock.
///
/// The lock is advisory (`fs2`) and released when this value drops.
#[derive(Debug)]
pub struct DatabaseDir {
    root: PathBuf,
    _lock: File,
    created: bool,
}

impl DatabaseDir {
    /// Opens (and optionally creates) a database directory, acquiring
    /// the exclusive lock.
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        let created = !path.exists();
        if created {
            if !create_if_missing {
                return Err(CoreError::invalid_format(
                    "database does not exist and create_if_missing is false",
                ));
            }
            std::fs::create_dir_all(path)?;
        }

        let lock_path = path.join(LOCK_FILE);
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;
        lock.try_lock_exclusive()
            .map_err(|_| CoreError::DatabaseLocked)?;

        Ok(Self {
            root: path.to_path_buf(),
            _lock: lock,
            created,
        })
    }

    /// True when this open created the directory.
    #[must_use]
    pub fn is_new_database(&self) -> bool {
        self.created
    }

    /// Path of the write-ahead log.
    #[must_use]
    pub fn wal_path(&self) -> PathBuf {
        self.root.join(WAL_FILE)
    }

    /// Path of the heap file.
    #[must_use]
    pub fn heap_path(&self) -> PathBuf {
        self.root.join(HEAP_FILE)
    }

    /// Directory holding per-transaction spill logs.
    #[must_use]
    pub fn spill_dir(&self) -> PathBuf {
        self.root.join(SPILL_DIR)
    }

    /// Loads the manifest bytes, if a manifest exists.
    pub fn load_manifest(&self) -> CoreResult<Option<Vec<u8>>> {
        let path = self.root.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let mut file = File::open(&path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Ok(Some(buf))
    }

    /// Atomically replaces the manifest: write a temp file, sync it,
    /// rename over the old one.
    pub fn store_manifest(&self, bytes: &[u8]) -> CoreResult<()> {
        let tmp = self.root.join(format!("{MANIFEST_FILE}.tmp"));
        let path = self.root.join(MANIFEST_FILE);
        {
            let mut file = File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Removes leftover spill files from aborted processes.
    pub fn clean_spill_dir(&self) -> CoreResult<()> {
        let dir = self.spill_dir();
        if dir.exists() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                if let Err(e) = std::fs::remove_file(entry.path()) {
                    tracing::warn!(path = %entry.path().display(), error = %e, "stale spill file not removed");
                }
            }
        }
        Ok(())
    }
}
