//! Per-connection sessions.
//!
//! A session owns at most one open transaction (nested begins become
//! savepoints inside it) and remembers the outcome of its last write
//! operation. The outcome is explicit per-session state queryable after
//! the fact, never ambient process-global state, so asynchronous
//! acknowledgment layers can report a write's result independently of
//! its synchronous return value.

use crate::txn::Transaction;
use std::sync::Arc;

/// The recorded outcome of a session's most recent write operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Documents inserted.
    pub inserted: u64,
    /// Documents matched by an update filter.
    pub matched: u64,
    /// Documents modified by an update.
    pub modified: u64,
    /// Documents removed.
    pub removed: u64,
    /// The error message, when the operation failed.
    pub error: Option<String>,
}

impl WriteOutcome {
    /// True when the operation completed without error.
    #[must_use]
    pub fn ok(&self) -> bool {
        self.error.is_none()
    }
}

/// A caller's connection context.
#[derive(Debug, Default)]
pub struct Session {
    pub(crate) txn: Option<Arc<Transaction>>,
    last: Option<WriteOutcome>,
}

impl Session {
    /// Creates a session with no open transaction.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a multi-statement transaction is open.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    /// Nesting depth: 0 outside a transaction, 1 for a top-level
    /// transaction, plus one per open savepoint.
    #[must_use]
    pub fn transaction_depth(&self) -> usize {
        match &self.txn {
            Some(txn) => 1 + txn.savepoint_depth(),
            None => 0,
        }
    }

    /// The outcome of the last write operation on this session, error
    /// included. Queryable independently of the operation's own return.
    #[must_use]
    pub fn last_result(&self) -> Option<&WriteOutcome> {
        self.last.as_ref()
    }

    pub(crate) fn record(&mut self, outcome: WriteOutcome) {
        self.last = Some(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_session_has_no_state() {
        let session = Session::new();
        assert!(!session.in_transaction());
        assert_eq!(session.transaction_depth(), 0);
        assert!(session.last_result().is_none());
    }

    #[test]
    fn record_keeps_latest_outcome() {
        let mut session = Session::new();
        session.record(WriteOutcome {
            inserted: 1,
            ..Default::default()
        });
        session.record(WriteOutcome {
            removed: 2,
            error: Some("duplicate key".into()),
            ..Default::default()
        });
        let last = session.last_result().unwrap();
        assert_eq!(last.removed, 2);
        assert!(!last.ok());
    }
}
