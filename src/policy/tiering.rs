use super::{
    level_capacity, FlushMode, LevelSummary, ReconstructionPlan, ReconstructionPolicy,
    ReconstructionTask, ShardSource, TaskKind,
};

const SCALE_FACTOR: usize = 2;

/// Binary-decomposition tiering. Level capacities double per level
/// (`buffer_size * 2^(i+1)`), and every level holds a single shard or none.
/// A reconstruction finds the shallowest level that can absorb everything
/// above it plus the incoming buffer, folds all of those shards into it in
/// one merge, and the flush then merges the buffer into the emptied level 0.
#[derive(Debug, Clone)]
pub struct TieringPolicy {
    buffer_size: usize,
}

impl TieringPolicy {
    pub fn new(buffer_size: usize) -> Self {
        Self { buffer_size }
    }

    fn capacity(&self, level: usize) -> usize {
        level_capacity(self.buffer_size, SCALE_FACTOR, level)
    }

    /// The shallowest level whose capacity covers the incoming records plus
    /// every record on the levels above it, or `levels.len()` to grow.
    fn find_target(&self, levels: &[LevelSummary], incoming: usize) -> usize {
        let mut carry = incoming;
        for (idx, level) in levels.iter().enumerate() {
            if carry + level.record_count <= self.capacity(idx) {
                return idx;
            }
            carry += level.record_count;
        }
        levels.len()
    }
}

impl ReconstructionPolicy for TieringPolicy {
    fn reconstruction_tasks(
        &self,
        levels: &[LevelSummary],
        incoming: usize,
    ) -> ReconstructionPlan {
        let target = self.find_target(levels, incoming);

        let mut tasks = Vec::new();
        if target > 0 {
            let sources: Vec<ShardSource> = (0..=target.min(levels.len().saturating_sub(1)))
                .filter(|&idx| levels[idx].record_count > 0)
                .map(ShardSource::all_of)
                .collect();
            if !sources.is_empty() {
                let record_count = sources
                    .iter()
                    .map(|src| levels[src.level].record_count)
                    .sum();
                tasks.push(ReconstructionTask {
                    sources,
                    target,
                    record_count,
                    kind: TaskKind::Merge,
                });
            }
        }

        ReconstructionPlan {
            tasks,
            flush: FlushMode::Merge,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(records: usize) -> LevelSummary {
        LevelSummary {
            record_count: records,
            tombstone_count: 0,
            shard_count: usize::from(records > 0),
        }
    }

    #[test]
    fn test_first_flush_needs_no_merge() {
        let policy = TieringPolicy::new(1000);
        let plan = policy.reconstruction_tasks(&[], 1000);
        assert!(plan.tasks.is_empty());
        assert_eq!(plan.flush, FlushMode::Merge);
    }

    #[test]
    fn test_level_zero_with_room_absorbs_the_flush() {
        let policy = TieringPolicy::new(1000);
        // cap(L0) = 2000; 1000 incoming + 1000 resident fits exactly.
        let plan = policy.reconstruction_tasks(&[level(1000)], 1000);
        assert!(plan.tasks.is_empty());
    }

    #[test]
    fn test_overflow_folds_everything_into_the_target() {
        let policy = TieringPolicy::new(1000);
        // 1000 incoming + 2000 at L0 overflows cap(L0)=2000, fits cap(L1)=4000.
        let plan = policy.reconstruction_tasks(&[level(2000)], 1000);
        assert_eq!(plan.tasks.len(), 1);
        let task = &plan.tasks[0];
        assert_eq!(task.target, 1);
        assert_eq!(task.sources, vec![ShardSource::all_of(0)]);
        assert_eq!(task.record_count, 2000);
    }

    #[test]
    fn test_cascade_includes_every_level_above_the_target() {
        let policy = TieringPolicy::new(1000);
        // 1000 + 2000 + 3500 = 6500 overflows cap(L1)=4000, fits cap(L2)=8000.
        let plan = policy.reconstruction_tasks(&[level(2000), level(3500)], 1000);
        assert_eq!(plan.tasks.len(), 1);
        let task = &plan.tasks[0];
        assert_eq!(task.target, 2);
        assert_eq!(
            task.sources,
            vec![ShardSource::all_of(0), ShardSource::all_of(1)]
        );
        // Growing: target equals the current height.
    }

    #[test]
    fn test_empty_levels_are_not_sources() {
        let policy = TieringPolicy::new(1000);
        // 3000 + 2000 overflows L0 and L1; adding L2's 7000 overflows
        // cap(L2)=8000 as well, so the hierarchy grows.
        let plan = policy.reconstruction_tasks(&[level(2000), level(0), level(7000)], 3000);
        assert_eq!(plan.tasks.len(), 1);
        let task = &plan.tasks[0];
        assert_eq!(task.target, 3);
        assert_eq!(
            task.sources,
            vec![ShardSource::all_of(0), ShardSource::all_of(2)]
        );
    }
}
