//! # ArborDB Storage
//!
//! Append-only byte-store backends for ArborDB.
//!
//! Backends are deliberately dumb: read a range, append bytes, flush, sync,
//! truncate. The write-ahead log, heap file, and spill logs in
//! `arbordb_core` own all format interpretation.
//!
//! ## Backends
//!
//! - [`MemoryBackend`] for tests and ephemeral databases
//! - [`FileBackend`] for persistent storage over OS files

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::MemoryBackend;
