use std::sync::Arc;

use crate::shard::Shard;

/// An ordered collection of shard handles within one level of the hierarchy.
///
/// Cloning a level produces a new list sharing the same shard handles, which
/// is what makes structure versions cheap: shards are immutable apart from
/// the tagged-delete bit, so two versions can safely share them.
#[derive(Debug)]
pub struct Level<S> {
    shards: Vec<Arc<S>>,
}

impl<S> Clone for Level<S> {
    fn clone(&self) -> Self {
        Self {
            shards: self.shards.clone(),
        }
    }
}

impl<S: Shard> Level<S> {
    pub fn new() -> Self {
        Self { shards: Vec::new() }
    }

    pub fn shards(&self) -> &[Arc<S>] {
        &self.shards
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn push(&mut self, shard: Arc<S>) {
        self.shards.push(shard);
    }

    pub fn remove(&mut self, index: usize) -> Arc<S> {
        self.shards.remove(index)
    }

    pub fn truncate(&mut self) {
        self.shards.clear();
    }

    /// Merge every shard on this level into one new shard. The level itself
    /// is unchanged.
    pub fn combined_shard(&self) -> Option<S> {
        if self.shards.is_empty() {
            return None;
        }
        let refs: Vec<&S> = self.shards.iter().map(Arc::as_ref).collect();
        Some(S::from_shards(&refs))
    }

    /// Find and mark-deleted the first live match on this level. Scans
    /// newest shard first so the most recent version of a duplicate is the
    /// one tagged.
    pub fn tagged_delete(&self, record: &S::Record) -> bool {
        for shard in self.shards.iter().rev() {
            if let Some(hit) = shard.point_lookup(record, false) {
                if hit.mark_deleted() {
                    return true;
                }
            }
        }
        false
    }

    pub fn record_count(&self) -> usize {
        self.shards.iter().map(|s| s.record_count()).sum()
    }

    pub fn tombstone_count(&self) -> usize {
        self.shards.iter().map(|s| s.tombstone_count()).sum()
    }

    pub fn memory_usage(&self) -> usize {
        self.shards.iter().map(|s| s.memory_usage()).sum()
    }

    pub fn aux_memory_usage(&self) -> usize {
        self.shards.iter().map(|s| s.aux_memory_usage()).sum()
    }

    /// Fraction of this level's records that are tombstones.
    pub fn tombstone_proportion(&self) -> f64 {
        let records = self.record_count();
        if records == 0 {
            0.0
        } else {
            self.tombstone_count() as f64 / records as f64
        }
    }
}

impl<S: Shard> Default for Level<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MutableBuffer;
    use crate::record::KvPair;
    use crate::shard::SortedRun;

    type TestLevel = Level<SortedRun<KvPair<u64, u64>>>;

    fn rec(key: u64) -> KvPair<u64, u64> {
        KvPair::new(key, key)
    }

    fn shard(keys: &[u64]) -> Arc<SortedRun<KvPair<u64, u64>>> {
        let cap = keys.len().max(1);
        let buf = Arc::new(MutableBuffer::new(cap, cap, cap, false));
        for &key in keys {
            assert!(buf.append(rec(key), false));
        }
        Arc::new(SortedRun::from_buffer(&buf.view()))
    }

    #[test]
    fn test_clone_shares_shard_handles() {
        let mut level = TestLevel::new();
        level.push(shard(&[1, 2, 3]));
        let copy = level.clone();

        assert_eq!(copy.shard_count(), 1);
        assert!(Arc::ptr_eq(&level.shards()[0], &copy.shards()[0]));
    }

    #[test]
    fn test_counts_sum_over_shards() {
        let mut level = TestLevel::new();
        level.push(shard(&[1, 2, 3]));
        level.push(shard(&[4, 5]));

        assert_eq!(level.record_count(), 5);
        assert_eq!(level.tombstone_count(), 0);
        assert!(level.memory_usage() > 0);
    }

    #[test]
    fn test_combined_shard_merges_the_level() {
        let mut level = TestLevel::new();
        level.push(shard(&[1, 3]));
        level.push(shard(&[2, 4]));

        let combined = level.combined_shard().unwrap();
        let keys: Vec<u64> = combined.records().iter().map(|w| w.record().key).collect();
        assert_eq!(keys, vec![1, 2, 3, 4]);
        // The level is untouched.
        assert_eq!(level.shard_count(), 2);

        assert!(TestLevel::new().combined_shard().is_none());
    }

    #[test]
    fn test_tagged_delete_transitions_once() {
        let mut level = TestLevel::new();
        level.push(shard(&[1, 2]));

        assert!(level.tagged_delete(&rec(2)));
        assert!(!level.tagged_delete(&rec(2)));
        assert!(!level.tagged_delete(&rec(9)));
    }

    #[test]
    fn test_structural_edits() {
        let mut level = TestLevel::new();
        level.push(shard(&[1]));
        level.push(shard(&[2]));
        level.push(shard(&[3]));

        let removed = level.remove(1);
        assert_eq!(removed.records()[0].record().key, 2);
        assert_eq!(level.shard_count(), 2);

        level.truncate();
        assert!(level.is_empty());
        assert_eq!(level.record_count(), 0);
    }
}
