//! Engine configuration.

use crate::error::{CoreError, CoreResult};
use std::time::Duration;

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Isolation {
    /// Each read observes the latest committed state at the time of the
    /// read. Write locks only. The default.
    #[default]
    ReadCommitted,
    /// Reads bypass snapshot visibility entirely and observe other
    /// writers' uncommitted data.
    ReadUncommitted,
    /// A fixed snapshot for the whole transaction; first committer wins
    /// on write-write conflicts.
    Snapshot,
    /// Snapshot plus range read locks (including scan gaps) and commit
    /// validation.
    Serializable,
}

impl Isolation {
    /// Parses an isolation level from its configuration name.
    ///
    /// Accepts `serializable`, `mvcc` (alias for snapshot), `snapshot`,
    /// `readCommitted`, and `readUncommitted`.
    pub fn parse(name: &str) -> CoreResult<Self> {
        match name {
            "serializable" => Ok(Self::Serializable),
            "mvcc" | "snapshot" => Ok(Self::Snapshot),
            "readCommitted" => Ok(Self::ReadCommitted),
            "readUncommitted" => Ok(Self::ReadUncommitted),
            other => Err(CoreError::validation(format!(
                "unknown isolation level: {other}"
            ))),
        }
    }
}

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether to create the database if it doesn't exist.
    pub create_if_missing: bool,

    /// Whether to error if the database already exists.
    pub error_if_exists: bool,

    /// Bytes a transaction may buffer in memory before its write set
    /// spills to a durable side log.
    pub txn_mem_limit: usize,

    /// Idle lifetime of a server-side cursor. Each continuation resets
    /// the clock.
    pub cursor_timeout: Duration,

    /// How long a lock request may block before aborting with a lock
    /// conflict.
    pub lock_timeout: Duration,

    /// Default isolation level for transactions that don't choose one.
    pub default_isolation: Isolation,

    /// Target bound on version-chain length; publishing prunes chains
    /// beyond this when no active snapshot needs the tail.
    pub max_version_chain: usize,

    /// Maximum accepted index name length.
    pub max_index_name_len: usize,

    /// Whether to sync the WAL on every commit (safer but slower).
    pub sync_on_commit: bool,

    /// Format version for new databases.
    pub format_version: (u16, u16),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            error_if_exists: false,
            txn_mem_limit: 64 * 1024 * 1024, // 64 MB
            cursor_timeout: Duration::from_secs(600),
            lock_timeout: Duration::from_secs(4),
            default_isolation: Isolation::ReadCommitted,
            max_version_chain: 16,
            max_index_name_len: 200,
            sync_on_commit: true,
            format_version: (1, 0),
        }
    }
}

impl Config {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the database if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether to error if the database exists.
    #[must_use]
    pub const fn error_if_exists(mut self, value: bool) -> Self {
        self.error_if_exists = value;
        self
    }

    /// Sets the transaction memory limit before spill.
    #[must_use]
    pub const fn txn_mem_limit(mut self, bytes: usize) -> Self {
        self.txn_mem_limit = bytes;
        self
    }

    /// Sets the cursor idle timeout.
    #[must_use]
    pub const fn cursor_timeout(mut self, timeout: Duration) -> Self {
        self.cursor_timeout = timeout;
        self
    }

    /// Sets the lock wait timeout.
    #[must_use]
    pub const fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets the default isolation level.
    #[must_use]
    pub const fn default_isolation(mut self, isolation: Isolation) -> Self {
        self.default_isolation = isolation;
        self
    }

    /// Sets whether to sync the WAL on every commit.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }
}
