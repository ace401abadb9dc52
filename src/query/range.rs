use crate::buffer::BufferView;
use crate::record::{KeyedRecord, Wrapped};
use crate::shard::OrderedShard;

use super::Query;

/// Inclusive key range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeParams<K> {
    pub lower: K,
    pub upper: K,
}

impl<K> RangeParams<K> {
    pub fn new(lower: K, upper: K) -> Self {
        Self { lower, upper }
    }
}

/// Inclusive range query over key-ordered shards.
///
/// Each shard contributes its records in `[lower, upper]`, tombstones
/// included; `combine` merges the local results, cancels record/tombstone
/// pairs across sources, and emits the surviving payloads in key order.
pub struct RangeQuery;

pub struct RangeLocal<K> {
    start: usize,
    parms: RangeParams<K>,
}

impl<S> Query<S> for RangeQuery
where
    S: OrderedShard,
    S::Record: KeyedRecord,
{
    type Parameters = RangeParams<<S::Record as KeyedRecord>::Key>;
    type LocalQuery = RangeLocal<<S::Record as KeyedRecord>::Key>;
    type BufferQuery = RangeParams<<S::Record as KeyedRecord>::Key>;
    type LocalOutput = Vec<Wrapped<S::Record>>;
    type Output = Vec<S::Record>;

    const EARLY_ABORT: bool = false;
    const SKIP_DELETE_FILTER: bool = true;

    fn preprocess(shard: &S, parms: &Self::Parameters) -> Self::LocalQuery {
        RangeLocal {
            start: shard.lower_bound(&parms.lower),
            parms: parms.clone(),
        }
    }

    fn preprocess_buffer(
        _view: &BufferView<S::Record>,
        parms: &Self::Parameters,
    ) -> Self::BufferQuery {
        parms.clone()
    }

    fn execute(shard: &S, query: &Self::LocalQuery) -> Self::LocalOutput {
        let mut results = Vec::new();
        for idx in query.start..shard.record_count() {
            let wrapped = shard.record_at(idx);
            if *wrapped.record().key() > query.parms.upper {
                break;
            }
            if !wrapped.is_deleted() {
                results.push(wrapped.clone());
            }
        }
        results
    }

    fn execute_buffer(
        query: &Self::BufferQuery,
        view: &BufferView<S::Record>,
    ) -> Self::LocalOutput {
        view.iter()
            .filter(|w| {
                let key = w.record().key();
                !w.is_deleted() && *key >= query.lower && *key <= query.upper
            })
            .cloned()
            .collect()
    }

    fn combine(
        local_results: Vec<Self::LocalOutput>,
        _parms: &Self::Parameters,
        output: &mut Self::Output,
    ) {
        let mut merged: Vec<Wrapped<S::Record>> =
            local_results.into_iter().flatten().collect();
        merged.sort_by(|a, b| a.order(b));

        // Cancel record/tombstone pairs per payload group; survivors of the
        // dominant kind are emitted (tombstone survivors are suppressed from
        // the output but still count against records in their group).
        let mut group_start = 0;
        for idx in 1..=merged.len() {
            let group_ended =
                idx == merged.len() || merged[idx].record() != merged[group_start].record();
            if !group_ended {
                continue;
            }
            let group = &merged[group_start..idx];
            group_start = idx;

            let tombstones = group.iter().filter(|w| w.is_tombstone()).count();
            let records = group.len() - tombstones;
            for _ in 0..records.saturating_sub(tombstones) {
                output.push(group[0].record().clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MutableBuffer;
    use crate::record::KvPair;
    use crate::shard::{Shard, SortedRun};
    use std::sync::Arc;

    type R = KvPair<u64, u64>;
    type Run = SortedRun<R>;

    fn rec(key: u64) -> R {
        KvPair::new(key, key)
    }

    fn run_with(entries: &[(u64, bool)]) -> Run {
        let cap = entries.len().max(1);
        let buf = Arc::new(MutableBuffer::new(cap, cap, cap, false));
        for &(key, tombstone) in entries {
            assert!(buf.append(rec(key), tombstone));
        }
        Run::from_buffer(&buf.view())
    }

    fn query_run(run: &Run, lower: u64, upper: u64) -> Vec<u64> {
        let parms = RangeParams::new(lower, upper);
        let local = <RangeQuery as Query<Run>>::preprocess(run, &parms);
        let result = <RangeQuery as Query<Run>>::execute(run, &local);
        let mut output = Vec::new();
        <RangeQuery as Query<Run>>::combine(vec![result], &parms, &mut output);
        output.into_iter().map(|r| r.key).collect()
    }

    #[test]
    fn test_range_bounds_are_inclusive() {
        let run = run_with(&[(1, false), (2, false), (3, false), (4, false)]);
        assert_eq!(query_run(&run, 2, 3), vec![2, 3]);
        assert_eq!(query_run(&run, 0, 10), vec![1, 2, 3, 4]);
        assert_eq!(query_run(&run, 5, 9), Vec::<u64>::new());
    }

    #[test]
    fn test_combine_cancels_across_sources() {
        let data = run_with(&[(1, false), (2, false), (3, false)]);
        let deletes = run_with(&[(2, true)]);

        let parms = RangeParams::new(0u64, 10);
        let results = vec![
            <RangeQuery as Query<Run>>::execute(
                &data,
                &<RangeQuery as Query<Run>>::preprocess(&data, &parms),
            ),
            <RangeQuery as Query<Run>>::execute(
                &deletes,
                &<RangeQuery as Query<Run>>::preprocess(&deletes, &parms),
            ),
        ];
        let mut output = Vec::new();
        <RangeQuery as Query<Run>>::combine(results, &parms, &mut output);
        let keys: Vec<u64> = output.into_iter().map(|r| r.key).collect();
        assert_eq!(keys, vec![1, 3]);
    }

    #[test]
    fn test_execute_buffer_respects_range_and_deletes() {
        let buf = Arc::new(MutableBuffer::new(8, 8, 8, false));
        for key in [1u64, 2, 3, 4] {
            assert!(buf.append(rec(key), false));
        }
        let view = buf.view();
        assert!(view.delete_record(&rec(3)));

        let parms = RangeParams::new(2u64, 4);
        let result = <RangeQuery as Query<Run>>::execute_buffer(&parms, &view);
        let keys: Vec<u64> = result.iter().map(|w| w.record().key).collect();
        assert_eq!(keys, vec![2, 4]);
    }

    #[test]
    fn test_unmatched_tombstone_produces_nothing() {
        let deletes = run_with(&[(7, true)]);
        assert_eq!(query_run(&deletes, 0, 10), Vec::<u64>::new());
    }
}
