//! Query capability contracts and the reference queries.
//!
//! A query type describes how to run one logical query across many sources:
//! it preprocesses each shard and the buffer into local queries, may
//! redistribute work across them, executes each local query, and combines
//! the local results. The framework owns epoch pinning and source
//! enumeration; the query type owns everything about its semantics.

mod point;
mod range;

pub use point::{PointHit, PointLookup};
pub use range::{RangeParams, RangeQuery};

use crate::buffer::BufferView;
use crate::record::{RecordData, Wrapped};
use crate::shard::Shard;

/// Operations the framework needs on a local result: emptiness (for early
/// abort) and dropping tagged-deleted entries when the query type does not
/// filter them itself.
pub trait ResultSet {
    fn is_empty(&self) -> bool;

    fn filter_deleted(&mut self) {}
}

impl<R: RecordData> ResultSet for Vec<Wrapped<R>> {
    fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }

    fn filter_deleted(&mut self) {
        self.retain(|w| !w.is_deleted());
    }
}

impl<T> ResultSet for Option<T> {
    fn is_empty(&self) -> bool {
        self.is_none()
    }
}

/// The query capability contract.
///
/// Execution order: the buffer query runs first, then shard queries from
/// level 0 downward with the newest shard on each level first, so an
/// `EARLY_ABORT` query terminates on the most recent match. `combine`
/// receives the buffer result followed by the shard results that actually
/// ran (early abort stops execution at the first non-empty local result).
pub trait Query<S: Shard>: Send + Sync + 'static {
    type Parameters: Clone + Send + Sync + 'static;
    type LocalQuery: Send;
    type BufferQuery: Send;
    type LocalOutput: ResultSet + Send;
    type Output: Default + Send + 'static;

    /// Stop executing local queries as soon as one returns a non-empty
    /// result.
    const EARLY_ABORT: bool;

    /// The query type filters tagged-deleted records itself; the framework
    /// skips its own pass over each local result.
    const SKIP_DELETE_FILTER: bool;

    fn preprocess(shard: &S, parms: &Self::Parameters) -> Self::LocalQuery;

    fn preprocess_buffer(
        view: &BufferView<S::Record>,
        parms: &Self::Parameters,
    ) -> Self::BufferQuery;

    /// Rebalance work across the local queries before execution. Most
    /// queries need nothing here.
    fn distribute(
        parms: &Self::Parameters,
        local_queries: &mut [Self::LocalQuery],
        buffer_query: &mut Self::BufferQuery,
    ) {
        let _ = (parms, local_queries, buffer_query);
    }

    fn execute(shard: &S, query: &Self::LocalQuery) -> Self::LocalOutput;

    fn execute_buffer(
        query: &Self::BufferQuery,
        view: &BufferView<S::Record>,
    ) -> Self::LocalOutput;

    fn combine(
        local_results: Vec<Self::LocalOutput>,
        parms: &Self::Parameters,
        output: &mut Self::Output,
    );

    /// Return `true` to run another round with updated local queries.
    fn repeat(
        parms: &Self::Parameters,
        output: &mut Self::Output,
        local_queries: &mut [Self::LocalQuery],
        buffer_query: &mut Self::BufferQuery,
    ) -> bool {
        let _ = (parms, output, local_queries, buffer_query);
        false
    }
}
