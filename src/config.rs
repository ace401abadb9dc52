use crate::error::Result;
use crate::errinput;

/// How shards are arranged across levels and which reconstruction policy
/// drives merges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutPolicy {
    /// One shard per level; incoming records cascade pairwise down the
    /// hierarchy. Level capacities grow by `scale_factor` per level.
    Leveling,
    /// Binary-decomposition tiering: a single merge folds every shard above
    /// the target into it. Requires `scale_factor == 2`.
    Tiering,
}

/// How `erase` removes records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletePolicy {
    /// Append a tombstone record that annihilates its match during merges.
    Tombstone,
    /// Set the deleted bit on the record in place. Only supported under the
    /// serial scheduler, since the mutation is visible across every version
    /// sharing the shard handle.
    Tagging,
}

/// Where background jobs run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerMode {
    /// A bounded worker pool draining a FIFO job queue.
    Pooled,
    /// Jobs run inline on the calling thread. Used for testing and required
    /// by tagged deletes.
    Serial,
}

/// Configuration for a dynamic index.
#[derive(Debug, Clone)]
pub struct Config {
    /// Record count at which a background flush-plus-reconstruction is
    /// scheduled (default: 8192).
    pub buffer_low_watermark: usize,

    /// Hard cap on buffered records; appends fail once it is reached until
    /// the flush completes (default: 16384).
    pub buffer_high_watermark: usize,

    /// Capacity growth ratio between levels; at least 2 (default: 6).
    pub scale_factor: usize,

    /// Maximum number of worker threads for queries and reconstructions
    /// (default: 16). Ignored under the serial scheduler.
    pub thread_count: usize,

    /// Level layout and reconstruction policy (default: Leveling).
    pub layout: LayoutPolicy,

    /// Delete mechanism (default: Tombstone).
    pub delete_policy: DeletePolicy,

    /// Background job execution (default: Pooled).
    pub scheduler: SchedulerMode,

    /// Per-level bound on the fraction of tombstones; compactions run before
    /// an epoch is published until every level is back under the bound
    /// (default: 1.0, i.e. unenforced).
    pub max_tombstone_proportion: f64,

    /// Cap on buffered tombstones. Defaults to the high watermark.
    pub tombstone_capacity: Option<usize>,

    /// Maintain an approximate-membership filter over buffered tombstones
    /// (default: true).
    pub tombstone_filter: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buffer_low_watermark: 8192,
            buffer_high_watermark: 16384,
            scale_factor: 6,
            thread_count: 16,
            layout: LayoutPolicy::Leveling,
            delete_policy: DeletePolicy::Tombstone,
            scheduler: SchedulerMode::Pooled,
            max_tombstone_proportion: 1.0,
            tombstone_capacity: None,
            tombstone_filter: true,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set both buffer watermarks.
    pub fn watermarks(mut self, low: usize, high: usize) -> Self {
        self.buffer_low_watermark = low;
        self.buffer_high_watermark = high;
        self
    }

    /// Set the level capacity growth ratio.
    pub fn scale_factor(mut self, factor: usize) -> Self {
        self.scale_factor = factor;
        self
    }

    /// Set the worker pool size.
    pub fn thread_count(mut self, count: usize) -> Self {
        self.thread_count = count;
        self
    }

    /// Select the level layout policy.
    pub fn layout(mut self, layout: LayoutPolicy) -> Self {
        self.layout = layout;
        self
    }

    /// Select the delete policy.
    pub fn delete_policy(mut self, policy: DeletePolicy) -> Self {
        self.delete_policy = policy;
        self
    }

    /// Select the scheduler mode.
    pub fn scheduler(mut self, mode: SchedulerMode) -> Self {
        self.scheduler = mode;
        self
    }

    /// Set the per-level tombstone proportion bound.
    pub fn max_tombstone_proportion(mut self, proportion: f64) -> Self {
        self.max_tombstone_proportion = proportion;
        self
    }

    /// Cap the number of buffered tombstones.
    pub fn tombstone_capacity(mut self, capacity: usize) -> Self {
        self.tombstone_capacity = Some(capacity);
        self
    }

    /// Enable or disable the buffered-tombstone membership filter.
    pub fn tombstone_filter(mut self, enabled: bool) -> Self {
        self.tombstone_filter = enabled;
        self
    }

    /// The effective buffered-tombstone cap.
    pub fn effective_tombstone_capacity(&self) -> usize {
        self.tombstone_capacity
            .unwrap_or(self.buffer_high_watermark)
    }

    /// Check construction-time contracts.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_low_watermark == 0 {
            return Err(errinput!("buffer low watermark must be nonzero"));
        }
        if self.buffer_high_watermark < self.buffer_low_watermark {
            return Err(errinput!(
                "buffer high watermark {} below low watermark {}",
                self.buffer_high_watermark,
                self.buffer_low_watermark
            ));
        }
        if self.scale_factor < 2 {
            return Err(errinput!("scale factor must be at least 2"));
        }
        if self.layout == LayoutPolicy::Tiering && self.scale_factor != 2 {
            return Err(errinput!(
                "tiering layout requires scale factor 2, got {}",
                self.scale_factor
            ));
        }
        if self.delete_policy == DeletePolicy::Tagging && self.scheduler != SchedulerMode::Serial {
            return Err(errinput!(
                "tagged deletes are only supported under the serial scheduler"
            ));
        }
        if self.scheduler == SchedulerMode::Pooled && self.thread_count == 0 {
            return Err(errinput!("pooled scheduler requires at least one thread"));
        }
        if !(self.max_tombstone_proportion > 0.0 && self.max_tombstone_proportion <= 1.0) {
            return Err(errinput!(
                "max tombstone proportion must be in (0, 1], got {}",
                self.max_tombstone_proportion
            ));
        }
        Ok(())
    }
}
