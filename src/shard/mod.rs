//! Shard capability contracts and the reference shard.
//!
//! A shard is an immutable, read-optimized container of wrapped records.
//! The framework constructs shards in exactly two ways: from a buffer view
//! during a flush, or by merging existing shards during a reconstruction.
//! Everything else about a shard's layout is its own business.

mod sorted_run;

pub use sorted_run::SortedRun;

use crate::buffer::BufferView;
use crate::record::{KeyedRecord, RecordData, Wrapped};

/// The capability contract shards must satisfy for the framework.
pub trait Shard: Send + Sync + Sized + 'static {
    type Record: RecordData;

    /// Build a shard from the records visible through a buffer view.
    fn from_buffer(view: &BufferView<Self::Record>) -> Self;

    /// Build a shard by merging existing shards. Matching record/tombstone
    /// pairs annihilate and tagged-deleted records are dropped.
    fn from_shards(shards: &[&Self]) -> Self;

    /// Total records stored, tombstones included.
    fn record_count(&self) -> usize;

    fn tombstone_count(&self) -> usize;

    /// Bytes used for record storage.
    fn memory_usage(&self) -> usize;

    /// Bytes used for auxiliary structures (filters, hash tables, ...).
    fn aux_memory_usage(&self) -> usize;

    /// Find the most recent match for `record`, optionally seeing
    /// tombstones. Required for delete support.
    fn point_lookup(
        &self,
        record: &Self::Record,
        include_tombstones: bool,
    ) -> Option<&Wrapped<Self::Record>>;
}

/// Shards storing keyed records in key order, positionally addressable.
/// Range queries are built on this.
pub trait OrderedShard: Shard
where
    Self::Record: KeyedRecord,
{
    /// Index of the first record whose key is not less than `key`.
    fn lower_bound(&self, key: &<Self::Record as KeyedRecord>::Key) -> usize;

    /// The record at `index`, which must be below `record_count`.
    fn record_at(&self, index: usize) -> &Wrapped<Self::Record>;
}
