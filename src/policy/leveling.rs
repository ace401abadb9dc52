use super::{
    level_capacity, FlushMode, LevelSummary, ReconstructionPlan, ReconstructionPolicy,
    ReconstructionTask, ShardSource, TaskKind,
};

/// Leveling layout: one shard per level, with level `i` holding up to
/// `buffer_size * scale_factor^(i+1)` records. A reconstruction picks the
/// shallowest level with room for the cascade and rolls each level into the
/// one below it, deepest pair first; the flush then merges the buffer into
/// level 0.
#[derive(Debug, Clone)]
pub struct LevelingPolicy {
    scale_factor: usize,
    buffer_size: usize,
}

impl LevelingPolicy {
    pub fn new(scale_factor: usize, buffer_size: usize) -> Self {
        Self {
            scale_factor,
            buffer_size,
        }
    }

    fn capacity(&self, level: usize) -> usize {
        level_capacity(self.buffer_size, self.scale_factor, level)
    }

    /// The shallowest level that can absorb the records cascading into it,
    /// or `levels.len()` when the hierarchy must grow.
    fn find_target(&self, levels: &[LevelSummary]) -> usize {
        let mut incoming = self.buffer_size;
        for (idx, level) in levels.iter().enumerate() {
            if level.record_count + incoming < self.capacity(idx) {
                return idx;
            }
            incoming = level.record_count;
        }
        levels.len()
    }
}

impl ReconstructionPolicy for LevelingPolicy {
    fn reconstruction_tasks(
        &self,
        levels: &[LevelSummary],
        _incoming: usize,
    ) -> ReconstructionPlan {
        let target = self.find_target(levels);

        let mut tasks = Vec::new();
        for to in (1..=target).rev() {
            let from = to - 1;
            if levels[from].record_count == 0 {
                continue;
            }
            let resident = if to < levels.len() {
                levels[to].record_count
            } else {
                0
            };
            tasks.push(ReconstructionTask {
                sources: vec![ShardSource::all_of(from)],
                target: to,
                record_count: levels[from].record_count + resident,
                kind: TaskKind::Merge,
            });
        }

        ReconstructionPlan {
            tasks,
            flush: FlushMode::Merge,
        }
    }
}
