//! Write-ahead log.
//!
//! Every commit appends its operations followed by a commit marker, then
//! flushes, before any write becomes visible. Recovery replays committed
//! transactions whose sequence is newer than the heap file; everything
//! else in the log is discarded.

mod record;
mod writer;

pub use record::{WalRecord, WalRecordType, WAL_MAGIC, WAL_VERSION};
pub use writer::{WalManager, WalRecordIterator};
