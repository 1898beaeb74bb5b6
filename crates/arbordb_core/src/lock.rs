//! Range lock manager.
//!
//! Locks cover encoded-key ranges within a lockspace: one per (collection,
//! index) pair for data, plus a per-collection metadata space used by DDL.
//! Serializable transactions read-lock every scanned range including the
//! gap past the last matched row; all isolation levels write-lock the keys
//! they mutate.
//!
//! Conflicts resolve by wait-die: an older transaction (smaller id) blocks
//! on the condvar until the holder releases or the wait times out; a
//! younger requester aborts immediately with a lock conflict. Only older
//! transactions ever wait, so waits-for cycles cannot form.

use crate::error::{CoreError, CoreResult};
use crate::types::{CollectionId, IndexId, TransactionId};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A lockable keyspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockSpace {
    /// Data entries of one index of one collection.
    Data(CollectionId, IndexId),
    /// Collection metadata: partition boundaries and index definitions.
    Meta(CollectionId),
    /// The insertion tail of a capped collection.
    CappedTail(CollectionId),
}

/// Lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Shared; compatible with other reads.
    Read,
    /// Exclusive.
    Write,
}

/// An inclusive key range; `upper == None` means unbounded above.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    /// Inclusive lower bound.
    pub lower: Vec<u8>,
    /// Inclusive upper bound; `None` is +infinity.
    pub upper: Option<Vec<u8>>,
}

impl KeyRange {
    /// A single-key range.
    #[must_use]
    pub fn point(key: Vec<u8>) -> Self {
        Self {
            lower: key.clone(),
            upper: Some(key),
        }
    }

    /// A bounded or half-open range.
    #[must_use]
    pub fn span(lower: Vec<u8>, upper: Option<Vec<u8>>) -> Self {
        Self { lower, upper }
    }

    /// The full keyspace.
    #[must_use]
    pub fn all() -> Self {
        Self {
            lower: Vec::new(),
            upper: None,
        }
    }

    fn overlaps(&self, other: &KeyRange) -> bool {
        let self_below = match &self.upper {
            Some(upper) => *upper < other.lower,
            None => false,
        };
        let other_below = match &other.upper {
            Some(upper) => *upper < self.lower,
            None => false,
        };
        !self_below && !other_below
    }
}

#[derive(Debug)]
struct Grant {
    range: KeyRange,
    mode: LockMode,
    owner: TransactionId,
}

/// Grants and releases range locks.
pub struct LockManager {
    spaces: Mutex<HashMap<LockSpace, Vec<Grant>>>,
    released: Condvar,
    timeout: Duration,
}

impl LockManager {
    /// Creates a lock manager with the given wait timeout.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            spaces: Mutex::new(HashMap::new()),
            released: Condvar::new(),
            timeout,
        }
    }

    /// Acquires a lock, blocking per wait-die when contended.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::LockConflict`] when the requester is the
    /// younger party in a conflict or the wait times out. The caller is
    /// expected to abort the transaction.
    pub fn lock(
        &self,
        owner: TransactionId,
        space: LockSpace,
        range: KeyRange,
        mode: LockMode,
    ) -> CoreResult<()> {
        let deadline = Instant::now() + self.timeout;
        let mut spaces = self.spaces.lock();
        loop {
            let conflict = spaces.get(&space).and_then(|grants| {
                grants
                    .iter()
                    .filter(|g| {
                        g.owner != owner
                            && (g.mode == LockMode::Write || mode == LockMode::Write)
                            && g.range.overlaps(&range)
                    })
                    .map(|g| g.owner)
                    .min()
            });

            match conflict {
                None => {
                    spaces.entry(space).or_default().push(Grant {
                        range,
                        mode,
                        owner,
                    });
                    return Ok(());
                }
                Some(holder) if owner < holder => {
                    // Older requester waits for the younger holder.
                    if self
                        .released
                        .wait_until(&mut spaces, deadline)
                        .timed_out()
                    {
                        tracing::debug!(%owner, %holder, "lock wait timed out");
                        return Err(CoreError::lock_conflict(
                            owner,
                            format!("timed out waiting for {holder}"),
                        ));
                    }
                }
                Some(holder) => {
                    // Younger requester dies.
                    tracing::debug!(%owner, %holder, "wait-die abort");
                    return Err(CoreError::lock_conflict(
                        owner,
                        format!("conflicts with older transaction {holder}"),
                    ));
                }
            }
        }
    }

    /// Releases every lock held by a transaction and wakes waiters.
    pub fn release_all(&self, owner: TransactionId) {
        let mut spaces = self.spaces.lock();
        spaces.retain(|_, grants| {
            grants.retain(|g| g.owner != owner);
            !grants.is_empty()
        });
        self.released.notify_all();
    }

    /// Returns true if the transaction still holds a lock covering the
    /// range in the given mode. Used by serializable commit validation.
    #[must_use]
    pub fn holds(
        &self,
        owner: TransactionId,
        space: LockSpace,
        range: &KeyRange,
        mode: LockMode,
    ) -> bool {
        let spaces = self.spaces.lock();
        spaces.get(&space).is_some_and(|grants| {
            grants.iter().any(|g| {
                g.owner == owner
                    && g.mode == mode
                    && g.range.lower <= range.lower
                    && match (&g.range.upper, &range.upper) {
                        (None, _) => true,
                        (Some(_), None) => false,
                        (Some(have), Some(want)) => have >= want,
                    }
            })
        })
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
