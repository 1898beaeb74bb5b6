//! Partition layouts.
//!
//! A partitioned collection stores an ordered list of disjoint key-range
//! partitions. Each partition is identified by the exclusive upper bound
//! (`max`) of its primary-key range; lower bounds are implicit (the
//! previous partition's `max`), and the final partition is unbounded
//! above. Every primary key therefore routes to exactly one partition.

use crate::error::{CoreError, CoreResult};
use crate::types::PartitionId;

/// One partition of a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionDef {
    /// Physical store id; never reused within a collection.
    pub id: PartitionId,
    /// Exclusive upper bound as an encoded primary key; `None` for the
    /// last, unbounded partition.
    pub max: Option<Vec<u8>>,
}

/// An ordered set of disjoint partitions covering the whole key space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionLayout {
    partitions: Vec<PartitionDef>,
}

impl PartitionLayout {
    /// A layout with a single unbounded partition.
    #[must_use]
    pub fn single(id: PartitionId) -> Self {
        Self {
            partitions: vec![PartitionDef { id, max: None }],
        }
    }

    /// Rebuilds a layout from stored definitions.
    pub fn from_parts(partitions: Vec<PartitionDef>) -> CoreResult<Self> {
        if partitions.is_empty() {
            return Err(CoreError::partition_boundary("layout has no partitions"));
        }
        for pair in partitions.windows(2) {
            match (&pair[0].max, &pair[1].max) {
                (Some(a), Some(b)) if a < b => {}
                (Some(_), None) => {}
                _ => {
                    return Err(CoreError::partition_boundary(
                        "partition bounds are not strictly increasing",
                    ))
                }
            }
        }
        if partitions.last().is_some_and(|p| p.max.is_some()) {
            return Err(CoreError::partition_boundary(
                "last partition must be unbounded",
            ));
        }
        Ok(Self { partitions })
    }

    /// All partitions in bound order.
    #[must_use]
    pub fn partitions(&self) -> &[PartitionDef] {
        &self.partitions
    }

    /// The last (unbounded) partition.
    #[must_use]
    pub fn last(&self) -> &PartitionDef {
        // Invariant: layouts always hold at least one partition.
        &self.partitions[self.partitions.len() - 1]
    }

    /// The bound the last partition was capped at, if any: the largest
    /// finite `max` in the layout.
    #[must_use]
    pub fn last_cap(&self) -> Option<&[u8]> {
        self.partitions
            .iter()
            .rev()
            .find_map(|p| p.max.as_deref())
    }

    /// Routes an encoded primary key to its partition.
    #[must_use]
    pub fn route(&self, pk: &[u8]) -> &PartitionDef {
        self.partitions
            .iter()
            .find(|p| match &p.max {
                Some(max) => pk < max.as_slice(),
                None => true,
            })
            .unwrap_or_else(|| self.last())
    }

    /// Caps the last partition at `new_max` and appends a fresh unbounded
    /// partition with id `new_id`.
    pub fn cap_and_append(&self, new_max: Vec<u8>, new_id: PartitionId) -> CoreResult<Self> {
        if let Some(cap) = self.last_cap() {
            if new_max.as_slice() <= cap {
                return Err(CoreError::partition_boundary(
                    "new bound must be greater than the current last bound",
                ));
            }
        }
        let mut partitions = self.partitions.clone();
        // Invariant: the last partition is unbounded.
        let last = partitions.len() - 1;
        partitions[last].max = Some(new_max);
        partitions.push(PartitionDef {
            id: new_id,
            max: None,
        });
        Ok(Self { partitions })
    }

    /// Removes a partition; its range merges into the successor (or the
    /// predecessor becomes unbounded when the last partition is dropped).
    pub fn drop_partition(&self, id: PartitionId) -> CoreResult<Self> {
        if self.partitions.len() == 1 {
            return Err(CoreError::partition_boundary(
                "cannot drop the only partition",
            ));
        }
        let idx = self
            .partitions
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| {
                CoreError::partition_boundary(format!("no partition with id {}", id.as_u64()))
            })?;
        let mut partitions = self.partitions.clone();
        partitions.remove(idx);
        // Dropping the unbounded tail promotes the new last partition.
        let last = partitions.len() - 1;
        partitions[last].max = None;
        Ok(Self { partitions })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(n: u64) -> PartitionId {
        PartitionId::new(n)
    }

    #[test]
    fn single_layout_routes_everything() {
        let layout = PartitionLayout::single(pid(0));
        assert_eq!(layout.route(b"anything").id, pid(0));
        assert_eq!(layout.partitions().len(), 1);
    }

    #[test]
    fn routing_uses_exclusive_upper_bound() {
        let layout = PartitionLayout::single(pid(0))
            .cap_and_append(b"m".to_vec(), pid(1))
            .unwrap();

        assert_eq!(layout.route(b"a").id, pid(0));
        assert_eq!(layout.route(b"l").id, pid(0));
        // The bound itself belongs to the next partition.
        assert_eq!(layout.route(b"m").id, pid(1));
        assert_eq!(layout.route(b"z").id, pid(1));
    }

    #[test]
    fn cap_requires_increasing_bound() {
        let layout = PartitionLayout::single(pid(0))
            .cap_and_append(b"m".to_vec(), pid(1))
            .unwrap();
        let result = layout.cap_and_append(b"m".to_vec(), pid(2));
        assert!(matches!(result, Err(CoreError::PartitionBoundary { .. })));
        let result = layout.cap_and_append(b"a".to_vec(), pid(2));
        assert!(matches!(result, Err(CoreError::PartitionBoundary { .. })));
    }

    #[test]
    fn three_way_split() {
        let layout = PartitionLayout::single(pid(0))
            .cap_and_append(b"h".to_vec(), pid(1))
            .unwrap()
            .cap_and_append(b"p".to_vec(), pid(2))
            .unwrap();

        assert_eq!(layout.route(b"c").id, pid(0));
        assert_eq!(layout.route(b"k").id, pid(1));
        assert_eq!(layout.route(b"q").id, pid(2));
        assert_eq!(layout.last_cap(), Some(b"p".as_slice()));
    }

    #[test]
    fn drop_middle_merges_into_successor() {
        let layout = PartitionLayout::single(pid(0))
            .cap_and_append(b"h".to_vec(), pid(1))
            .unwrap()
            .cap_and_append(b"p".to_vec(), pid(2))
            .unwrap();

        let dropped = layout.drop_partition(pid(1)).unwrap();
        assert_eq!(dropped.partitions().len(), 2);
        // Rows formerly in [h, p) now route to the tail partition.
        assert_eq!(dropped.route(b"k").id, pid(2));
        assert_eq!(dropped.route(b"c").id, pid(0));
    }

    #[test]
    fn drop_tail_promotes_predecessor() {
        let layout = PartitionLayout::single(pid(0))
            .cap_and_append(b"h".to_vec(), pid(1))
            .unwrap();
        let dropped = layout.drop_partition(pid(1)).unwrap();
        assert_eq!(dropped.partitions().len(), 1);
        assert!(dropped.last().max.is_none());
        assert_eq!(dropped.route(b"z").id, pid(0));
    }

    #[test]
    fn cannot_drop_only_partition() {
        let layout = PartitionLayout::single(pid(0));
        assert!(layout.drop_partition(pid(0)).is_err());
    }

    #[test]
    fn from_parts_validates_order() {
        let bad = PartitionLayout::from_parts(vec![
            PartitionDef {
                id: pid(0),
                max: Some(b"z".to_vec()),
            },
            PartitionDef {
                id: pid(1),
                max: Some(b"a".to_vec()),
            },
        ]);
        assert!(bad.is_err());

        let no_tail = PartitionLayout::from_parts(vec![PartitionDef {
            id: pid(0),
            max: Some(b"z".to_vec()),
        }]);
        assert!(no_tail.is_err());
    }
}
