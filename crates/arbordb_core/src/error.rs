//! Error types for the storage core.

use crate::types::{CollectionId, TransactionId};
use std::io;
use thiserror::Error;

/// Result type for engine operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors produced by the storage core.
///
/// Per-operation errors never terminate the caller's session: a failed
/// operation inside an active transaction leaves the transaction usable or
/// explicitly rollback-able. Only `Io` is fatal to the node.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] arbordb_storage::StorageError),

    /// Document codec error.
    #[error("codec error: {0}")]
    Codec(#[from] arbordb_codec::CodecError),

    /// I/O error. Fatal to the node.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Uniqueness violation on the primary or a secondary index.
    #[error("duplicate key on index '{index}'")]
    DuplicateKey {
        /// Name of the violated index.
        index: String,
    },

    /// Malformed document, key pattern, or index specification.
    #[error("validation failed: {message}")]
    Validation {
        /// What was wrong.
        message: String,
    },

    /// Lock acquisition failed: wait-die abort, timeout, or deadlock.
    ///
    /// Aborts the offending transaction only; the session survives.
    #[error("lock conflict: transaction {txn} could not lock {what}")]
    LockConflict {
        /// The transaction that lost.
        txn: TransactionId,
        /// A description of the contended resource.
        what: String,
    },

    /// Optimistic commit validation failed against a concurrent writer.
    #[error("write conflict: transaction {txn} lost to a concurrent commit")]
    Conflict {
        /// The transaction that failed validation.
        txn: TransactionId,
    },

    /// Operation issued against a committed or aborted transaction.
    #[error("transaction is closed")]
    TransactionClosed,

    /// Invalid or ambiguous partition boundary change.
    #[error("cannot change partition boundaries: {message}")]
    PartitionBoundary {
        /// Why the change was rejected.
        message: String,
    },

    /// Collection does not exist.
    #[error("collection not found: {name}")]
    CollectionNotFound {
        /// Name of the missing collection.
        name: String,
    },

    /// Index does not exist.
    #[error("index not found: {name} on {collection}")]
    IndexNotFound {
        /// Name of the missing index.
        name: String,
        /// Collection searched.
        collection: CollectionId,
    },

    /// Cursor does not exist or its idle timeout expired.
    #[error("cursor not found: {id}")]
    CursorNotFound {
        /// The cursor's ID.
        id: u64,
    },

    /// The write-ahead log is corrupted.
    #[error("WAL corruption: {message}")]
    WalCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// The heap file is corrupted.
    #[error("heap corruption: {message}")]
    HeapCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// A stored checksum did not match.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// Another process holds the database directory.
    #[error("database locked: another process has exclusive access")]
    DatabaseLocked,

    /// Database has been closed.
    #[error("database is closed")]
    DatabaseClosed,

    /// Invalid database format or version.
    #[error("invalid database format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },
}

impl CoreError {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a duplicate-key error.
    pub fn duplicate_key(index: impl Into<String>) -> Self {
        Self::DuplicateKey {
            index: index.into(),
        }
    }

    /// Creates a lock-conflict error.
    pub fn lock_conflict(txn: TransactionId, what: impl Into<String>) -> Self {
        Self::LockConflict {
            txn,
            what: what.into(),
        }
    }

    /// Creates a partition-boundary error.
    pub fn partition_boundary(message: impl Into<String>) -> Self {
        Self::PartitionBoundary {
            message: message.into(),
        }
    }

    /// Creates a collection-not-found error.
    pub fn collection_not_found(name: impl Into<String>) -> Self {
        Self::CollectionNotFound { name: name.into() }
    }

    /// Creates a WAL corruption error.
    pub fn wal_corruption(message: impl Into<String>) -> Self {
        Self::WalCorruption {
            message: message.into(),
        }
    }

    /// Creates a heap corruption error.
    pub fn heap_corruption(message: impl Into<String>) -> Self {
        Self::HeapCorruption {
            message: message.into(),
        }
    }

    /// Creates an invalid-format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Returns true if this error is fatal to the node rather than to the
    /// operation that raised it.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Storage(_))
    }
}
