//! The versioned shard hierarchy.
//!
//! A `Structure` is one version of the level-organized shard collection.
//! Versions are shallow copies: cloning produces new level lists that share
//! the same shard handles, so a background reconstruction can reshape its
//! private clone while the published version keeps serving queries. Shards
//! are dropped when the last version referencing them is dropped.

mod level;

pub use level::Level;

use std::sync::Arc;

use crate::buffer::BufferView;
use crate::policy::{
    FlushMode, LevelSummary, ReconstructionPlan, ReconstructionPolicy, ReconstructionTask,
    ShardPick,
};
use crate::shard::Shard;

pub struct Structure<S: Shard> {
    levels: Vec<Level<S>>,
    policy: Arc<dyn ReconstructionPolicy>,
    max_tombstone_proportion: f64,
}

impl<S: Shard> Clone for Structure<S> {
    /// Shallow copy: new level lists, shared shard handles.
    fn clone(&self) -> Self {
        Self {
            levels: self.levels.clone(),
            policy: Arc::clone(&self.policy),
            max_tombstone_proportion: self.max_tombstone_proportion,
        }
    }
}

impl<S: Shard> Structure<S> {
    pub fn new(policy: Arc<dyn ReconstructionPolicy>, max_tombstone_proportion: f64) -> Self {
        Self {
            levels: Vec::new(),
            policy,
            max_tombstone_proportion,
        }
    }

    pub fn levels(&self) -> &[Level<S>] {
        &self.levels
    }

    pub fn height(&self) -> usize {
        self.levels.len()
    }

    pub fn record_count(&self) -> usize {
        self.levels.iter().map(Level::record_count).sum()
    }

    pub fn tombstone_count(&self) -> usize {
        self.levels.iter().map(Level::tombstone_count).sum()
    }

    pub fn memory_usage(&self) -> usize {
        self.levels.iter().map(Level::memory_usage).sum()
    }

    pub fn aux_memory_usage(&self) -> usize {
        self.levels.iter().map(Level::aux_memory_usage).sum()
    }

    fn summaries(&self) -> Vec<LevelSummary> {
        self.levels
            .iter()
            .map(|level| LevelSummary {
                record_count: level.record_count(),
                tombstone_count: level.tombstone_count(),
                shard_count: level.shard_count(),
            })
            .collect()
    }

    /// Ask the policy for the merge plan preceding a flush of `incoming`
    /// records.
    pub fn reconstruction_tasks(&self, incoming: usize) -> ReconstructionPlan {
        self.policy.reconstruction_tasks(&self.summaries(), incoming)
    }

    /// Ask the policy for the compactions needed to restore the tombstone
    /// bound.
    pub fn compaction_tasks(&self) -> Vec<ReconstructionTask> {
        self.policy
            .compaction_tasks(&self.summaries(), self.max_tombstone_proportion)
    }

    /// Materialize one task: gather the source shards, merge them into a
    /// new shard, detach the sources from their levels, and install the
    /// result at the target level (growing the hierarchy when the target is
    /// one past the current height).
    pub fn perform_reconstruction(&mut self, task: &ReconstructionTask) {
        let mut sources: Vec<Arc<S>> = Vec::new();
        for source in &task.sources {
            debug_assert!(source.level < self.levels.len());
            match source.pick {
                ShardPick::All => {
                    sources.extend(self.levels[source.level].shards().iter().cloned());
                }
                ShardPick::At(idx) => {
                    sources.push(Arc::clone(&self.levels[source.level].shards()[idx]));
                }
            }
        }
        if sources.is_empty() {
            return;
        }

        let refs: Vec<&S> = sources.iter().map(Arc::as_ref).collect();
        let merged = S::from_shards(&refs);

        // Detach the sources. Indexed picks on a shared level are removed
        // highest index first so earlier removals do not shift later ones.
        let mut indexed: Vec<(usize, usize)> = Vec::new();
        for source in &task.sources {
            match source.pick {
                ShardPick::All => self.levels[source.level].truncate(),
                ShardPick::At(idx) => indexed.push((source.level, idx)),
            }
        }
        indexed.sort_by(|a, b| b.cmp(a));
        for (level, idx) in indexed {
            self.levels[level].remove(idx);
        }

        tracing::debug!(
            target_level = task.target,
            sources = sources.len(),
            merged_records = merged.record_count(),
            merged_tombstones = merged.tombstone_count(),
            kind = ?task.kind,
            "performed reconstruction",
        );

        if task.target < self.levels.len() {
            self.levels[task.target].push(Arc::new(merged));
        } else {
            debug_assert_eq!(task.target, self.levels.len());
            let mut level = Level::new();
            level.push(Arc::new(merged));
            self.levels.push(level);
        }
    }

    /// Install the buffer's records at level 0: one new shard, either
    /// appended alongside L0's shards or merged with them into a single
    /// shard.
    pub fn flush_buffer(&mut self, view: &BufferView<S::Record>, mode: FlushMode) {
        let incoming = S::from_buffer(view);
        if self.levels.is_empty() {
            self.levels.push(Level::new());
        }
        let level0 = &mut self.levels[0];

        match mode {
            FlushMode::Append => level0.push(Arc::new(incoming)),
            FlushMode::Merge if level0.is_empty() => level0.push(Arc::new(incoming)),
            FlushMode::Merge => {
                let merged = {
                    let mut refs: Vec<&S> = level0.shards().iter().map(Arc::as_ref).collect();
                    refs.push(&incoming);
                    S::from_shards(&refs)
                };
                level0.truncate();
                level0.push(Arc::new(merged));
            }
        }
    }

    /// Find and mark-deleted the first live match, level by level.
    pub fn tagged_delete(&self, record: &S::Record) -> bool {
        self.levels
            .iter()
            .any(|level| level.tagged_delete(record))
    }

    /// Whether every level is within the tombstone proportion bound.
    pub fn validate_tombstone_proportion(&self) -> bool {
        self.levels
            .iter()
            .all(|level| level.tombstone_proportion() <= self.max_tombstone_proportion)
    }
}
