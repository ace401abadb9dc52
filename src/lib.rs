//! Tephra lifts a static, read-optimized data structure (a "shard") into a
//! dynamic index supporting concurrent inserts, deletes, and queries.
//!
//! Writes land in a lock-free staging buffer; background reconstructions
//! merge them into a hierarchy of immutable shards organized in size-tiered
//! levels, in the spirit of a log-structured merge tree but generalized:
//! the shard type, query type, layout policy, and delete policy are all
//! parameters of the construction.
//!
//! ```text
//!  inserts ──► MutableBuffer ──flush──► level 0 ─merge─► level 1 ─► ...
//!                   │                      (immutable shards)
//!                   └── views ─┐               │
//!                              ▼               ▼
//!                    queries pin an Epoch = (Structure version, buffer head)
//! ```
//!
//! Queries see a consistent snapshot through epoch pinning: a reconstruction
//! rebuilds a private clone of the shard hierarchy and publishes it
//! atomically, while the previous epoch stays alive until its last pin is
//! released.

pub mod buffer;
pub mod config;
pub mod epoch;
pub mod error;
pub mod filter;
pub mod index;
pub mod policy;
pub mod query;
pub mod record;
pub mod scheduler;
pub mod shard;
pub mod structure;

pub use buffer::{BufferView, MutableBuffer};
pub use config::{Config, DeletePolicy, LayoutPolicy, SchedulerMode};
pub use error::{Error, Result};
pub use index::DynamicIndex;
pub use query::{PointLookup, Query, RangeParams, RangeQuery};
pub use record::{KeyedRecord, KvPair, RecordData, Wrapped};
pub use scheduler::QueryFuture;
pub use shard::{OrderedShard, Shard, SortedRun};
