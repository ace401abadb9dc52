use crate::buffer::BufferView;
use crate::shard::Shard;

use super::Query;

/// A point-lookup hit: the matched payload and whether the newest version
/// was a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointHit<R> {
    pub record: R,
    pub tombstone: bool,
}

/// First-match point lookup.
///
/// Runs with early abort: sources are visited newest first (buffer, then
/// level 0 downward), so the first hit is the most recent version of the
/// record. A tombstone hit means the record is deleted and the final result
/// is empty.
pub struct PointLookup;

impl<S: Shard> Query<S> for PointLookup {
    type Parameters = S::Record;
    type LocalQuery = S::Record;
    type BufferQuery = S::Record;
    type LocalOutput = Option<PointHit<S::Record>>;
    type Output = Option<S::Record>;

    const EARLY_ABORT: bool = true;
    const SKIP_DELETE_FILTER: bool = true;

    fn preprocess(_shard: &S, parms: &Self::Parameters) -> Self::LocalQuery {
        parms.clone()
    }

    fn preprocess_buffer(
        _view: &BufferView<S::Record>,
        parms: &Self::Parameters,
    ) -> Self::BufferQuery {
        parms.clone()
    }

    fn execute(shard: &S, query: &Self::LocalQuery) -> Self::LocalOutput {
        shard
            .point_lookup(query, true)
            .filter(|w| !w.is_deleted())
            .map(|w| PointHit {
                record: w.record().clone(),
                tombstone: w.is_tombstone(),
            })
    }

    fn execute_buffer(
        query: &Self::BufferQuery,
        view: &BufferView<S::Record>,
    ) -> Self::LocalOutput {
        // Newest append wins, so scan from the back.
        view.iter()
            .rev()
            .find(|w| !w.is_deleted() && w.record() == query)
            .map(|w| PointHit {
                record: w.record().clone(),
                tombstone: w.is_tombstone(),
            })
    }

    fn combine(
        local_results: Vec<Self::LocalOutput>,
        _parms: &Self::Parameters,
        output: &mut Self::Output,
    ) {
        *output = local_results
            .into_iter()
            .flatten()
            .next()
            .and_then(|hit| (!hit.tombstone).then_some(hit.record));
    }
}
