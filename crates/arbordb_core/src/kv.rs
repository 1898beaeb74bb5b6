//! Multi-version ordered key-value store.
//!
//! The authoritative runtime structure: an ordered map from store keys to
//! version chains, rebuilt on open from the heap file and WAL tail.
//! Mutation is copy-on-write: `apply_batch` pushes new versions at chain
//! heads and never overwrites a version a snapshot can still see. Chains
//! are pruned inline against the oldest active snapshot, which is what
//! keeps visibility walks short.

use crate::types::{SequenceNumber, TransactionId};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;

/// One version of a key's value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    /// The transaction that wrote this version.
    pub txn: TransactionId,
    /// Commit sequence the version became visible at.
    pub seq: SequenceNumber,
    /// Value payload; `None` is a tombstone.
    pub value: Option<Vec<u8>>,
}

/// Scan direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDirection {
    /// Ascending key order.
    Forward,
    /// Descending key order.
    Backward,
}

/// One page of a restartable scan.
#[derive(Debug, Default)]
pub struct ScanPage {
    /// Visible rows in scan order.
    pub items: Vec<(Vec<u8>, Vec<u8>)>,
    /// Resume token: the last key examined. `None` when the range is
    /// exhausted.
    pub resume: Option<Vec<u8>>,
}

/// A batched write: `None` deletes the key.
pub type BatchWrite = (Vec<u8>, Option<Vec<u8>>);

/// Ordered multi-version store.
#[derive(Debug, Default)]
pub struct VersionStore {
    map: RwLock<BTreeMap<Vec<u8>, Vec<Version>>>,
}

impl VersionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value visible at `at`, if any.
    pub fn get(&self, key: &[u8], at: SequenceNumber) -> Option<Vec<u8>> {
        let map = self.map.read();
        let chain = map.get(key)?;
        visible(chain, at).and_then(|v| v.value.clone())
    }

    /// Returns the newest committed sequence for a key, tombstones
    /// included. Used by commit validation.
    pub fn latest_seq(&self, key: &[u8]) -> Option<SequenceNumber> {
        let map = self.map.read();
        map.get(key).and_then(|chain| chain.first()).map(|v| v.seq)
    }

    /// Scans visible rows in `[lower, upper)` at snapshot `at`.
    ///
    /// `resume_after` continues a previous page: iteration restarts just
    /// past that key (before it, for backward scans). At most `limit`
    /// rows are returned; `ScanPage::resume` is `None` once the range is
    /// exhausted.
    pub fn scan_page(
        &self,
        lower: &[u8],
        upper: Option<&[u8]>,
        at: SequenceNumber,
        direction: ScanDirection,
        resume_after: Option<&[u8]>,
        limit: usize,
    ) -> ScanPage {
        let map = self.map.read();
        let range: (Bound<Vec<u8>>, Bound<Vec<u8>>) = match direction {
            ScanDirection::Forward => {
                let low = match resume_after {
                    Some(key) => Bound::Excluded(key.to_vec()),
                    None => Bound::Included(lower.to_vec()),
                };
                let high = match upper {
                    Some(key) => Bound::Excluded(key.to_vec()),
                    None => Bound::Unbounded,
                };
                (low, high)
            }
            ScanDirection::Backward => {
                let high = match resume_after {
                    Some(key) => Bound::Excluded(key.to_vec()),
                    None => match upper {
                        Some(key) => Bound::Excluded(key.to_vec()),
                        None => Bound::Unbounded,
                    },
                };
                (Bound::Included(lower.to_vec()), high)
            }
        };

        let mut page = ScanPage::default();
        let mut emitted = 0usize;

        let mut visit = |key: &Vec<u8>, chain: &Vec<Version>| -> bool {
            page.resume = Some(key.clone());
            if let Some(version) = visible(chain, at) {
                if let Some(value) = &version.value {
                    page.items.push((key.clone(), value.clone()));
                    emitted += 1;
                }
            }
            emitted < limit
        };

        let mut exhausted = true;
        match direction {
            ScanDirection::Forward => {
                for (key, chain) in map.range(range) {
                    if !visit(key, chain) {
                        exhausted = false;
                        break;
                    }
                }
            }
            ScanDirection::Backward => {
                for (key, chain) in map.range(range).rev() {
                    if !visit(key, chain) {
                        exhausted = false;
                        break;
                    }
                }
            }
        }
        if exhausted {
            page.resume = None;
        }
        page
    }

    /// Publishes a committed batch at `seq`.
    ///
    /// Called only under the commit lock; this is the atomic publish
    /// point. Each touched chain is pruned against `min_active`, the
    /// oldest snapshot any live transaction holds, and softly bounded by
    /// `max_chain`.
    pub fn apply_batch(
        &self,
        writes: &[BatchWrite],
        txn: TransactionId,
        seq: SequenceNumber,
        min_active: SequenceNumber,
        max_chain: usize,
    ) {
        let mut map = self.map.write();
        for (key, value) in writes {
            let chain = map.entry(key.clone()).or_default();
            chain.insert(
                0,
                Version {
                    txn,
                    seq,
                    value: value.clone(),
                },
            );
            prune_chain(chain, min_active);
            if chain.len() > max_chain {
                tracing::debug!(
                    chain_len = chain.len(),
                    max_chain,
                    "version chain exceeds target; long-lived snapshots are pinning history"
                );
            }
            if chain.is_empty() {
                map.remove(key);
            }
        }
    }

    /// Prunes every chain against `min_active` and drops dead keys.
    ///
    /// Returns the number of versions reclaimed.
    pub fn vacuum(&self, min_active: SequenceNumber) -> usize {
        let mut map = self.map.write();
        let mut reclaimed = 0;
        map.retain(|_, chain| {
            let before = chain.len();
            prune_chain(chain, min_active);
            reclaimed += before - chain.len();
            !chain.is_empty()
        });
        reclaimed
    }

    /// Removes every key the predicate marks dead, with all its
    /// versions. Vacuum uses this to reclaim regions belonging to
    /// dropped collections, indexes, and partitions.
    pub fn purge_where<F>(&self, dead: F) -> usize
    where
        F: Fn(&[u8]) -> bool,
    {
        let mut map = self.map.write();
        let before = map.len();
        map.retain(|key, _| !dead(key));
        before - map.len()
    }

    /// Dumps all retained versions, oldest first per key, for a heap
    /// rewrite.
    pub fn dump(&self) -> Vec<(Vec<u8>, Version)> {
        let map = self.map.read();
        let mut out = Vec::new();
        for (key, chain) in map.iter() {
            for version in chain.iter().rev() {
                out.push((key.clone(), version.clone()));
            }
        }
        out
    }

    /// Number of keys with at least one retained version.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.map.read().len()
    }
}

/// Returns the newest version with `seq <= at`.
fn visible(chain: &[Version], at: SequenceNumber) -> Option<&Version> {
    chain.iter().find(|v| v.seq <= at)
}

/// Keeps the newest version at or below `min_active` plus everything
/// newer; the rest is unreachable by any snapshot. A chain whose only
/// survivor is a tombstone no snapshot needs is emptied entirely.
fn prune_chain(chain: &mut Vec<Version>, min_active: SequenceNumber) {
    if let Some(idx) = chain.iter().position(|v| v.seq <= min_active) {
        chain.truncate(idx + 1);
    }
    if chain.len() == 1 && chain[0].value.is_none() && chain[0].seq <= min_active {
        chain.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_CHAIN: usize = 16;

    fn put(store: &VersionStore, key: &[u8], value: &[u8], seq: u64) {
        store.apply_batch(
            &[(key.to_vec(), Some(value.to_vec()))],
            TransactionId::new(seq),
            SequenceNumber::new(seq),
            SequenceNumber::ZERO,
            MAX_CHAIN,
        );
    }

    fn del(store: &VersionStore, key: &[u8], seq: u64) {
        store.apply_batch(
            &[(key.to_vec(), None)],
            TransactionId::new(seq),
            SequenceNumber::new(seq),
            SequenceNumber::ZERO,
            MAX_CHAIN,
        );
    }

    #[test]
    fn get_respects_snapshot() {
        let store = VersionStore::new();
        put(&store, b"k", b"v1", 1);
        put(&store, b"k", b"v2", 2);

        assert_eq!(store.get(b"k", SequenceNumber::new(1)), Some(b"v1".to_vec()));
        assert_eq!(store.get(b"k", SequenceNumber::new(2)), Some(b"v2".to_vec()));
        assert_eq!(store.get(b"k", SequenceNumber::ZERO), None);
    }

    #[test]
    fn tombstone_hides_value() {
        let store = VersionStore::new();
        put(&store, b"k", b"v", 1);
        del(&store, b"k", 2);

        assert_eq!(store.get(b"k", SequenceNumber::new(1)), Some(b"v".to_vec()));
        assert_eq!(store.get(b"k", SequenceNumber::new(2)), None);
    }

    #[test]
    fn forward_scan_with_resume() {
        let store = VersionStore::new();
        for (i, key) in [b"a", b"b", b"c", b"d"].iter().enumerate() {
            put(&store, *key, &[i as u8], 1);
        }

        let at = SequenceNumber::new(1);
        let page = store.scan_page(b"a", None, at, ScanDirection::Forward, None, 2);
        let keys: Vec<&[u8]> = page.items.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, [b"a", b"b"]);
        let resume = page.resume.clone().unwrap();

        let page2 = store.scan_page(b"a", None, at, ScanDirection::Forward, Some(&resume), 10);
        let keys2: Vec<&[u8]> = page2.items.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys2, [b"c", b"d"]);
        assert!(page2.resume.is_none());
    }

    #[test]
    fn backward_scan() {
        let store = VersionStore::new();
        for key in [b"a", b"b", b"c"] {
            put(&store, key, b"v", 1);
        }
        let page = store.scan_page(
            b"a",
            None,
            SequenceNumber::new(1),
            ScanDirection::Backward,
            None,
            10,
        );
        let keys: Vec<&[u8]> = page.items.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, [b"c", b"b", b"a"]);
    }

    #[test]
    fn scan_skips_invisible_and_deleted() {
        let store = VersionStore::new();
        put(&store, b"a", b"v", 1);
        put(&store, b"b", b"v", 5);
        put(&store, b"c", b"v", 1);
        del(&store, b"c", 2);

        let page = store.scan_page(
            b"a",
            None,
            SequenceNumber::new(2),
            ScanDirection::Forward,
            None,
            10,
        );
        let keys: Vec<&[u8]> = page.items.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, [b"a"]);
    }

    #[test]
    fn upper_bound_is_exclusive() {
        let store = VersionStore::new();
        for key in [b"a", b"b", b"c"] {
            put(&store, key, b"v", 1);
        }
        let page = store.scan_page(
            b"a",
            Some(b"c"),
            SequenceNumber::new(1),
            ScanDirection::Forward,
            None,
            10,
        );
        let keys: Vec<&[u8]> = page.items.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, [b"a", b"b"]);
    }

    #[test]
    fn pruning_keeps_reachable_versions() {
        let store = VersionStore::new();
        put(&store, b"k", b"v1", 1);
        put(&store, b"k", b"v2", 2);
        // min_active = 5: only the newest version is reachable.
        store.apply_batch(
            &[(b"k".to_vec(), Some(b"v3".to_vec()))],
            TransactionId::new(3),
            SequenceNumber::new(3),
            SequenceNumber::new(5),
            MAX_CHAIN,
        );
        let map = store.map.read();
        assert_eq!(map.get(b"k".as_slice()).unwrap().len(), 1);
    }

    #[test]
    fn vacuum_drops_dead_tombstones() {
        let store = VersionStore::new();
        put(&store, b"k", b"v", 1);
        del(&store, b"k", 2);
        assert_eq!(store.key_count(), 1);

        let reclaimed = store.vacuum(SequenceNumber::new(10));
        assert!(reclaimed > 0);
        assert_eq!(store.key_count(), 0);
    }

    #[test]
    fn vacuum_preserves_versions_needed_by_snapshots() {
        let store = VersionStore::new();
        put(&store, b"k", b"v1", 1);
        put(&store, b"k", b"v2", 5);

        // A snapshot at seq 1 still needs v1.
        store.vacuum(SequenceNumber::new(1));
        assert_eq!(store.get(b"k", SequenceNumber::new(1)), Some(b"v1".to_vec()));
        assert_eq!(store.get(b"k", SequenceNumber::new(5)), Some(b"v2".to_vec()));
    }

    #[test]
    fn dump_is_oldest_first_per_key() {
        let store = VersionStore::new();
        put(&store, b"k", b"v1", 1);
        put(&store, b"k", b"v2", 2);
        let dump = store.dump();
        assert_eq!(dump.len(), 2);
        assert!(dump[0].1.seq < dump[1].1.seq);
    }
}
