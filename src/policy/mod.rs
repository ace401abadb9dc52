//! Reconstruction policies.
//!
//! A policy inspects the per-level shape of a structure and decides which
//! shards to merge where when the buffer flushes, and which levels to compact
//! when the tombstone bound is violated. Policies see level summaries only;
//! the structure executes the returned tasks.

mod leveling;
mod tiering;

pub use leveling::LevelingPolicy;
pub use tiering::TieringPolicy;

/// Per-level shape handed to policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelSummary {
    pub record_count: usize,
    pub tombstone_count: usize,
    pub shard_count: usize,
}

/// Selects shards on a level: one by index, or every shard on the level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardPick {
    All,
    At(usize),
}

/// A merge source: shards picked from one level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSource {
    pub level: usize,
    pub pick: ShardPick,
}

impl ShardSource {
    pub fn all_of(level: usize) -> Self {
        Self {
            level,
            pick: ShardPick::All,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Merge shards from one or more levels into the target level.
    Merge,
    /// Within-level merge driven by the tombstone bound.
    Compact,
}

/// One reconstruction step: merge `sources` into a new shard installed at
/// `target`. A target equal to the current height grows the hierarchy by one
/// level.
#[derive(Debug, Clone)]
pub struct ReconstructionTask {
    pub sources: Vec<ShardSource>,
    pub target: usize,
    /// Estimated records involved, for logging and policy bookkeeping.
    pub record_count: usize,
    pub kind: TaskKind,
}

/// How the buffer enters level 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Install the buffer shard alongside level 0's shards.
    Append,
    /// Merge the buffer shard with level 0's shards into a single shard.
    Merge,
}

/// Ordered task list plus the flush mode, produced per reconstruction.
#[derive(Debug, Clone)]
pub struct ReconstructionPlan {
    pub tasks: Vec<ReconstructionTask>,
    pub flush: FlushMode,
}

/// Strategy deciding which shards merge into which levels.
pub trait ReconstructionPolicy: Send + Sync {
    /// Tasks to run before flushing `incoming` records, ordered for
    /// execution (deepest first for cascades).
    fn reconstruction_tasks(
        &self,
        levels: &[LevelSummary],
        incoming: usize,
    ) -> ReconstructionPlan;

    /// Within-level merges needed to restore the tombstone bound. A level
    /// already collapsed to a single shard cannot shrink further (its
    /// matching records live deeper), so only multi-shard levels are
    /// eligible; this keeps the enforcement loop terminating.
    fn compaction_tasks(
        &self,
        levels: &[LevelSummary],
        max_tombstone_proportion: f64,
    ) -> Vec<ReconstructionTask> {
        levels
            .iter()
            .enumerate()
            .filter(|(_, level)| {
                level.shard_count > 1
                    && level.record_count > 0
                    && tombstone_proportion(level) > max_tombstone_proportion
            })
            .map(|(idx, level)| ReconstructionTask {
                sources: vec![ShardSource::all_of(idx)],
                target: idx,
                record_count: level.record_count,
                kind: TaskKind::Compact,
            })
            .collect()
    }
}

fn tombstone_proportion(level: &LevelSummary) -> f64 {
    if level.record_count == 0 {
        0.0
    } else {
        level.tombstone_count as f64 / level.record_count as f64
    }
}

/// Capacity of a level under geometric growth, in records. Integer
/// exponentiation, saturating for deep hierarchies.
pub(crate) fn level_capacity(buffer_size: usize, scale_factor: usize, level: usize) -> usize {
    scale_factor
        .saturating_pow(level as u32 + 1)
        .saturating_mul(buffer_size)
}
