//! Server-side cursors.
//!
//! A find returns a cursor that the dispatch layer iterates in batches
//! across protocol round trips. Each continuation resets the cursor's
//! idle deadline; a cursor idle past `cursor_timeout` is reaped and
//! later continuations fail with `CursorNotFound`. Cursors opened inside
//! one transaction hold independent positions over the same snapshot, so
//! interleaved iteration never interferes.

use crate::filter::Filter;
use crate::txn::Transaction;
use crate::types::{CursorId, SequenceNumber};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How a cursor produces its documents.
#[derive(Debug)]
pub(crate) enum CursorPlan {
    /// Pages through the store, keeping a resume key.
    Streaming {
        /// Collection name.
        collection: String,
        /// Row filter.
        filter: Filter,
        /// Resume token from the previous page.
        resume: Option<Vec<u8>>,
        /// Whether the scan has reached the end of the collection.
        done: bool,
    },
    /// Fully materialized results (sorted finds).
    Materialized {
        /// Remaining documents.
        docs: VecDeque<arbordb_codec::Document>,
    },
}

/// One open cursor.
#[derive(Debug)]
pub(crate) struct CursorState {
    pub plan: CursorPlan,
    /// Snapshot the cursor reads at.
    pub at: SequenceNumber,
    /// Whether this cursor pinned its snapshot (no owning transaction).
    pub pinned: bool,
    /// Owning transaction, if opened inside one.
    pub txn: Option<Arc<Transaction>>,
    deadline: Instant,
}

impl CursorState {
    /// True once the idle deadline passed.
    pub fn expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Resets the idle clock. Called on every continuation.
    pub fn touch(&mut self, timeout: Duration) {
        self.deadline = Instant::now() + timeout;
    }
}

/// Registry of open cursors.
#[derive(Debug)]
pub(crate) struct CursorManager {
    cursors: Mutex<HashMap<u64, CursorState>>,
    next_id: AtomicU64,
    timeout: Duration,
}

impl CursorManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            cursors: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            timeout,
        }
    }

    /// Registers a cursor and returns its id.
    pub fn open(
        &self,
        plan: CursorPlan,
        at: SequenceNumber,
        pinned: bool,
        txn: Option<Arc<Transaction>>,
    ) -> CursorId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let state = CursorState {
            plan,
            at,
            pinned,
            txn,
            deadline: Instant::now() + self.timeout,
        };
        self.cursors.lock().insert(id, state);
        CursorId::new(id)
    }

    /// Takes a cursor out for one continuation. Returns `None` when the
    /// cursor does not exist or has expired; expired cursors stay
    /// registered until [`CursorManager::sweep`] reaps them and releases
    /// their snapshot pins.
    pub fn take(&self, id: CursorId) -> Option<CursorState> {
        let mut cursors = self.cursors.lock();
        if cursors
            .get(&id.as_u64())
            .is_some_and(|c| c.expired(Instant::now()))
        {
            return None;
        }
        cursors.remove(&id.as_u64())
    }

    /// Puts a cursor back after a continuation, resetting its deadline.
    pub fn put_back(&self, id: CursorId, mut state: CursorState) {
        state.touch(self.timeout);
        self.cursors.lock().insert(id.as_u64(), state);
    }

    /// Removes a cursor explicitly (exhausted or killed), returning its
    /// state so the caller can release the snapshot pin.
    pub fn remove(&self, id: CursorId) -> Option<CursorState> {
        self.cursors.lock().remove(&id.as_u64())
    }

    /// Drops every expired cursor, returning the reaped states so pins
    /// can be released.
    pub fn sweep(&self) -> Vec<CursorState> {
        let now = Instant::now();
        let mut cursors = self.cursors.lock();
        let expired: Vec<u64> = cursors
            .iter()
            .filter(|(_, c)| c.expired(now))
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| cursors.remove(&id))
            .collect()
    }

    /// Number of open cursors.
    pub fn open_count(&self) -> usize {
        self.cursors.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn streaming_plan() -> CursorPlan {
        CursorPlan::Streaming {
            collection: "c".into(),
            filter: Filter::All,
            resume: None,
            done: false,
        }
    }

    #[test]
    fn open_take_put_back() {
        let cm = CursorManager::new(Duration::from_secs(10));
        let id = cm.open(streaming_plan(), SequenceNumber::new(1), false, None);
        let state = cm.take(id).unwrap();
        assert_eq!(state.at, SequenceNumber::new(1));
        cm.put_back(id, state);
        assert_eq!(cm.open_count(), 1);
    }

    #[test]
    fn missing_cursor_is_none() {
        let cm = CursorManager::new(Duration::from_secs(10));
        assert!(cm.take(CursorId::new(99)).is_none());
    }

    #[test]
    fn expired_cursor_is_unavailable() {
        let cm = CursorManager::new(Duration::from_millis(1));
        let id = cm.open(streaming_plan(), SequenceNumber::new(1), false, None);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cm.take(id).is_none());
    }

    #[test]
    fn continuation_resets_deadline() {
        let cm = CursorManager::new(Duration::from_millis(60));
        let id = cm.open(streaming_plan(), SequenceNumber::new(1), false, None);
        // Keep touching the cursor at intervals below the timeout; it
        // must stay alive well past the original deadline.
        for _ in 0..5 {
            std::thread::sleep(Duration::from_millis(25));
            let state = cm.take(id).expect("cursor expired despite activity");
            cm.put_back(id, state);
        }
    }

    #[test]
    fn sweep_collects_expired() {
        let cm = CursorManager::new(Duration::from_millis(1));
        cm.open(streaming_plan(), SequenceNumber::new(1), true, None);
        cm.open(streaming_plan(), SequenceNumber::new(2), false, None);
        std::thread::sleep(Duration::from_millis(5));
        let reaped = cm.sweep();
        assert_eq!(reaped.len(), 2);
        assert_eq!(cm.open_count(), 0);
    }
}
