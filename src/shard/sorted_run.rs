use itertools::Itertools;

use crate::buffer::BufferView;
use crate::record::{KeyedRecord, RecordData, Wrapped};

use super::{OrderedShard, Shard};

/// The reference shard: a single sorted run of wrapped records, ordered by
/// payload and then insertion sequence.
///
/// Construction from a buffer view sorts the staged records; construction
/// from shards is a k-way merge that drops tagged-deleted records and
/// annihilates matching record/tombstone pairs. An unmatched tombstone
/// survives the merge so it can cancel its record on a deeper level later.
#[derive(Debug)]
pub struct SortedRun<R: RecordData> {
    records: Vec<Wrapped<R>>,
    tombstones: usize,
}

impl<R: RecordData> SortedRun<R> {
    fn from_sorted(records: Vec<Wrapped<R>>) -> Self {
        debug_assert!(records.windows(2).all(|w| w[0].order(&w[1]).is_le()));
        let tombstones = records.iter().filter(|w| w.is_tombstone()).count();
        Self {
            records,
            tombstones,
        }
    }

    pub fn records(&self) -> &[Wrapped<R>] {
        &self.records
    }

    /// Cancel record/tombstone pairs within a sorted stream. For each group
    /// of equal payloads, tombstones cancel records one for one; the excess
    /// of whichever kind survives, newest entries preferred.
    fn cancel_pairs(sorted: Vec<Wrapped<R>>) -> Vec<Wrapped<R>> {
        let mut out: Vec<Wrapped<R>> = Vec::with_capacity(sorted.len());
        let mut group_start = 0;

        let flush_group = |out: &mut Vec<Wrapped<R>>, group: &[Wrapped<R>]| {
            let tombstones = group.iter().filter(|w| w.is_tombstone()).count();
            let records = group.len() - tombstones;
            let (keep_tombstones, surviving) = if tombstones >= records {
                (true, tombstones - records)
            } else {
                (false, records - tombstones)
            };
            // Entries are sequence-ordered; keep the newest survivors.
            let kept: Vec<&Wrapped<R>> = group
                .iter()
                .filter(|w| w.is_tombstone() == keep_tombstones)
                .collect();
            out.extend(kept[kept.len() - surviving..].iter().map(|w| (*w).clone()));
        };

        for idx in 1..=sorted.len() {
            let group_ended =
                idx == sorted.len() || sorted[idx].record() != sorted[group_start].record();
            if group_ended {
                flush_group(&mut out, &sorted[group_start..idx]);
                group_start = idx;
            }
        }
        out
    }
}

impl<R: RecordData> Shard for SortedRun<R> {
    type Record = R;

    fn from_buffer(view: &BufferView<R>) -> Self {
        let mut records: Vec<Wrapped<R>> = view
            .iter()
            .filter(|w| !w.is_deleted())
            .cloned()
            .collect();
        records.sort_by(|a, b| a.order(b));
        Self::from_sorted(Self::cancel_pairs(records))
    }

    fn from_shards(shards: &[&Self]) -> Self {
        let merged: Vec<Wrapped<R>> = shards
            .iter()
            .map(|shard| shard.records.iter())
            .kmerge_by(|a, b| a.order(b).is_lt())
            .filter(|w| !w.is_deleted())
            .cloned()
            .collect();
        Self::from_sorted(Self::cancel_pairs(merged))
    }

    fn record_count(&self) -> usize {
        self.records.len()
    }

    fn tombstone_count(&self) -> usize {
        self.tombstones
    }

    fn memory_usage(&self) -> usize {
        self.records.len() * std::mem::size_of::<Wrapped<R>>()
    }

    fn aux_memory_usage(&self) -> usize {
        0
    }

    fn point_lookup(&self, record: &R, include_tombstones: bool) -> Option<&Wrapped<R>> {
        let end = self.records.partition_point(|w| w.record() <= record);
        self.records[..end]
            .iter()
            .rev()
            .take_while(|w| w.record() == record)
            .find(|w| include_tombstones || !w.is_tombstone())
    }
}

impl<R: KeyedRecord> OrderedShard for SortedRun<R> {
    fn lower_bound(&self, key: &R::Key) -> usize {
        self.records.partition_point(|w| w.record().key() < key)
    }

    fn record_at(&self, index: usize) -> &Wrapped<R> {
        &self.records[index]
    }
}
