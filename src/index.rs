//! The dynamic index coordinator.
//!
//! `DynamicIndex` owns the write buffer, the epoch register, and the
//! scheduler, and routes every public operation:
//!
//! - inserts append to the buffer; crossing the low watermark schedules a
//!   background reconstruction (one in flight at most, gated by a CAS),
//! - the reconstruction job clones the current structure, applies the
//!   policy's merge plan and any compactions to the private clone, flushes
//!   the buffer into it, and publishes the clone as a new epoch,
//! - queries pin the current epoch, fan out across its shards and buffer
//!   snapshot, and release the pin on completion,
//! - deletes append a tombstone or tag the record in place, per policy.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::buffer::MutableBuffer;
use crate::config::{Config, DeletePolicy, LayoutPolicy, SchedulerMode};
use crate::epoch::{Epoch, EpochRegister};
use crate::error::Result;
use crate::policy::{LevelingPolicy, ReconstructionPolicy, TieringPolicy};
use crate::query::{Query, ResultSet};
use crate::scheduler::{
    promise, Job, JobKind, QueryFuture, Scheduler, SchedulerStatsSnapshot, SerialScheduler,
    WorkerPool,
};
use crate::shard::Shard;
use crate::structure::Structure;

struct IndexInner<S: Shard> {
    config: Config,
    buffer: Arc<MutableBuffer<S::Record>>,
    register: EpochRegister<S>,
    epoch_ids: AtomicU64,
}

/// A dynamic index over shard type `S` answering queries of type `Q`.
pub struct DynamicIndex<S: Shard, Q: Query<S>> {
    inner: Arc<IndexInner<S>>,
    scheduler: Arc<dyn Scheduler>,
    _query: PhantomData<fn() -> Q>,
}

impl<S: Shard, Q: Query<S>> DynamicIndex<S, Q> {
    /// Construct an index from a validated configuration.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let policy: Arc<dyn ReconstructionPolicy> = match config.layout {
            LayoutPolicy::Leveling => Arc::new(LevelingPolicy::new(
                config.scale_factor,
                config.buffer_high_watermark,
            )),
            LayoutPolicy::Tiering => Arc::new(TieringPolicy::new(config.buffer_high_watermark)),
        };

        let buffer = Arc::new(MutableBuffer::new(
            config.buffer_low_watermark,
            config.buffer_high_watermark,
            config.effective_tombstone_capacity(),
            config.tombstone_filter,
        ));

        let serial = config.scheduler == SchedulerMode::Serial;
        let register = EpochRegister::new(serial);
        let structure = Structure::new(policy, config.max_tombstone_proportion);
        register.install_initial(Arc::new(Epoch::new(0, structure, Arc::clone(&buffer), 0)));

        let scheduler: Arc<dyn Scheduler> = if serial {
            Arc::new(SerialScheduler::new())
        } else {
            Arc::new(WorkerPool::new(config.thread_count))
        };

        Ok(Self {
            inner: Arc::new(IndexInner {
                config,
                buffer,
                register,
                epoch_ids: AtomicU64::new(0),
            }),
            scheduler,
            _query: PhantomData,
        })
    }

    /// Insert a record. Returns `false` when the buffer is at its high
    /// watermark; the insert should be retried once the in-flight flush
    /// completes. A successful insert is immediately visible to queries
    /// that start afterwards.
    pub fn insert(&self, record: S::Record) -> bool {
        self.internal_append(record, false)
    }

    /// Erase a record. Under the tombstone policy this appends a tombstone
    /// (retriable on `false`, like `insert`). Under tagging it marks the
    /// record deleted in place; `false` means the record was not found and
    /// the call must not be retried.
    pub fn erase(&self, record: S::Record) -> bool {
        match self.inner.config.delete_policy {
            DeletePolicy::Tagging => {
                // The view is taken first for ordering with concurrent
                // appends; the buffer is scanned last, as the least likely
                // place for an old record to live.
                let view = self.inner.buffer.view();
                let epoch = self.inner.register.pin();
                let tagged = epoch.structure().tagged_delete(&record);
                self.inner.register.release(&epoch);
                tagged || view.delete_record(&record)
            }
            DeletePolicy::Tombstone => self.internal_append(record, true),
        }
    }

    /// Schedule a query, returning a future for its result.
    pub fn query(&self, parms: Q::Parameters) -> QueryFuture<Q::Output> {
        let (tx, rx) = promise();
        let inner = Arc::clone(&self.inner);
        self.scheduler.dispatch(Job::new(JobKind::Query, move || {
            tx.fulfill(query_job::<S, Q>(&inner, &parms));
        }));
        rx
    }

    /// Records in the index, tombstones and tagged records included.
    pub fn record_count(&self) -> usize {
        let epoch = self.inner.register.pin();
        let count = epoch.buffer_view().record_count() + epoch.structure().record_count();
        self.inner.register.release(&epoch);
        count
    }

    /// Tombstones in the index. Always zero under tagging.
    pub fn tombstone_count(&self) -> usize {
        let epoch = self.inner.register.pin();
        let count = self.inner.buffer.tombstone_count() + epoch.structure().tombstone_count();
        self.inner.register.release(&epoch);
        count
    }

    /// Levels in the hierarchy, empty levels included, buffer excluded.
    pub fn height(&self) -> usize {
        let epoch = self.inner.register.pin();
        let height = epoch.structure().height();
        self.inner.register.release(&epoch);
        height
    }

    /// Bytes used for record storage across the buffer and all shards.
    pub fn memory_usage(&self) -> usize {
        let epoch = self.inner.register.pin();
        let usage = self.inner.buffer.memory_usage() + epoch.structure().memory_usage();
        self.inner.register.release(&epoch);
        usage
    }

    /// Bytes used by auxiliary shard structures.
    pub fn aux_memory_usage(&self) -> usize {
        let epoch = self.inner.register.pin();
        let usage = epoch.structure().aux_memory_usage();
        self.inner.register.release(&epoch);
        usage
    }

    /// Merge everything in the index, buffer included, into one shard.
    /// With `await_reconstruction` set, any in-flight reconstruction
    /// completes first.
    pub fn create_static_structure(&self, await_reconstruction: bool) -> S {
        if await_reconstruction {
            self.await_next_epoch();
        }

        let epoch = self.inner.register.pin();
        let mut parts: Vec<S> = Vec::new();
        for level in epoch.structure().levels().iter().rev() {
            if level.record_count() > 0 {
                if let Some(combined) = level.combined_shard() {
                    parts.push(combined);
                }
            }
        }
        // Hold the buffer view only as long as the records are being read.
        {
            let view = epoch.buffer_view();
            if !view.is_empty() {
                parts.push(S::from_buffer(&view));
            }
        }
        let refs: Vec<&S> = parts.iter().collect();
        let flattened = S::from_shards(&refs);
        self.inner.register.release(&epoch);
        flattened
    }

    /// Block until no reconstruction is in flight.
    pub fn await_next_epoch(&self) {
        self.inner.register.await_next_epoch();
    }

    /// Whether every level is within the tombstone proportion bound.
    pub fn validate_tombstone_proportion(&self) -> bool {
        let epoch = self.inner.register.pin();
        let valid = epoch.structure().validate_tombstone_proportion();
        self.inner.register.release(&epoch);
        valid
    }

    pub fn scheduler_stats(&self) -> SchedulerStatsSnapshot {
        self.scheduler.stats()
    }

    fn internal_append(&self, record: S::Record, tombstone: bool) -> bool {
        if self.inner.buffer.at_low_watermark() && self.inner.register.try_begin_reconstruction() {
            self.schedule_reconstruction();
        }
        self.inner.buffer.append(record, tombstone)
    }

    fn schedule_reconstruction(&self) {
        let inner = Arc::clone(&self.inner);
        let accepted = self
            .scheduler
            .dispatch(Job::new(JobKind::Reconstruction, move || {
                reconstruction_job(&inner);
            }));
        if !accepted {
            // The job was dropped; give the claim back so a later insert
            // can retry and `await_next_epoch` cannot hang.
            self.inner.register.end_reconstruction();
        }
    }
}

impl<S: Shard, Q: Query<S>> Drop for DynamicIndex<S, Q> {
    fn drop(&mut self) {
        self.inner.register.await_next_epoch();
        self.scheduler.shutdown();
    }
}

/// Rebuild the shard hierarchy and publish it as a new epoch.
fn reconstruction_job<S: Shard>(inner: &IndexInner<S>) {
    let current = inner.register.pin();
    let epoch_id = inner.epoch_ids.fetch_add(1, Ordering::Relaxed) + 1;
    let base_head = current.head();
    let mut structure = current.structure().clone();
    inner.register.release(&current);
    drop(current);

    let plan = structure.reconstruction_tasks(inner.config.buffer_high_watermark);
    for task in &plan.tasks {
        structure.perform_reconstruction(task);
    }

    // Restore the tombstone bound on the private clone before it becomes
    // visible. Compactions do not advance the epoch or flush the buffer;
    // the pass count bounds the loop when unmatched tombstones keep a
    // level over the bound.
    let mut passes = 0;
    loop {
        let compactions = structure.compaction_tasks();
        if compactions.is_empty() || passes > structure.height() {
            break;
        }
        for task in &compactions {
            structure.perform_reconstruction(task);
        }
        passes += 1;
    }

    // The buffer is snapshotted after the merges so the flush carries as
    // many records as possible; the merges made room for a full buffer
    // regardless.
    let view = inner.buffer.view();
    let new_head = view.tail();
    let flushed = view.record_count();
    structure.flush_buffer(&view, plan.flush);
    drop(view);

    let next = Arc::new(Epoch::new(
        epoch_id,
        structure,
        Arc::clone(&inner.buffer),
        base_head,
    ));
    inner.register.advance(next, new_head);
    inner.register.end_reconstruction();

    tracing::info!(
        epoch = epoch_id,
        merge_tasks = plan.tasks.len(),
        flushed,
        "epoch advanced",
    );
}

/// Execute one query against a pinned epoch.
fn query_job<S: Shard, Q: Query<S>>(inner: &IndexInner<S>, parms: &Q::Parameters) -> Q::Output {
    let epoch = inner.register.pin();
    let view = epoch.buffer_view();

    let mut buffer_query = Q::preprocess_buffer(&view, parms);

    // Newest sources first: the buffer, then level 0 downward with the
    // most recently installed shard on each level first.
    let mut shards: Vec<&S> = Vec::new();
    for level in epoch.structure().levels() {
        for shard in level.shards().iter().rev() {
            shards.push(shard.as_ref());
        }
    }
    let mut local_queries: Vec<Q::LocalQuery> = shards
        .iter()
        .map(|shard| Q::preprocess(shard, parms))
        .collect();
    Q::distribute(parms, &mut local_queries, &mut buffer_query);

    let mut output = Q::Output::default();
    loop {
        let mut results: Vec<Q::LocalOutput> = Vec::with_capacity(shards.len() + 1);

        let mut buffer_result = Q::execute_buffer(&buffer_query, &view);
        if !Q::SKIP_DELETE_FILTER {
            buffer_result.filter_deleted();
        }
        let abort = Q::EARLY_ABORT && !buffer_result.is_empty();
        results.push(buffer_result);

        if !abort {
            for (shard, local) in shards.iter().zip(&local_queries) {
                let mut result = Q::execute(shard, local);
                if !Q::SKIP_DELETE_FILTER {
                    result.filter_deleted();
                }
                let hit = !result.is_empty();
                results.push(result);
                if Q::EARLY_ABORT && hit {
                    break;
                }
            }
        }

        Q::combine(results, parms, &mut output);
        if !Q::repeat(parms, &mut output, &mut local_queries, &mut buffer_query) {
            break;
        }
    }

    drop(view);
    inner.register.release(&epoch);
    output
}
