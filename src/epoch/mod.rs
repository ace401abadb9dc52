//! Epochs: the unit of query visibility.
//!
//! An epoch pairs one structure version with the buffer head that delimits
//! its snapshot. Queries pin an epoch, read exactly that version's shards
//! plus the buffer from that head, and release the pin when done. The
//! register in this module tracks where each epoch is in its lifecycle and
//! when a retired epoch may be destroyed.

mod register;

pub use register::EpochRegister;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::buffer::{BufferView, MutableBuffer};
use crate::shard::Shard;
use crate::structure::Structure;

pub struct Epoch<S: Shard> {
    id: u64,
    structure: Structure<S>,
    buffer: Arc<MutableBuffer<S::Record>>,
    /// Where this epoch's buffer snapshots begin. Everything below it has
    /// been flushed into the structure.
    head: AtomicU64,
}

impl<S: Shard> Epoch<S> {
    pub fn new(
        id: u64,
        structure: Structure<S>,
        buffer: Arc<MutableBuffer<S::Record>>,
        head: u64,
    ) -> Self {
        Self {
            id,
            structure,
            buffer,
            head: AtomicU64::new(head),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn structure(&self) -> &Structure<S> {
        &self.structure
    }

    pub fn head(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    /// Snapshot the buffer from this epoch's head up to the currently
    /// published tail. Taken per query, so records appended after the epoch
    /// was created are visible to queries that start after the append.
    pub fn buffer_view(&self) -> BufferView<S::Record> {
        self.buffer.view_at(self.head())
    }

    /// Move this epoch's snapshot boundary up to `new_head` once the buffer
    /// can retire the region below it. Fails while views on the previous
    /// head are still live; the transition spins on this.
    pub fn advance_buffer_head(&self, new_head: u64) -> bool {
        if self.buffer.advance_head(new_head) {
            self.head.store(new_head, Ordering::Release);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::LevelingPolicy;
    use crate::record::KvPair;
    use crate::shard::SortedRun;

    fn epoch() -> (Epoch<SortedRun<KvPair<u64, u64>>>, Arc<MutableBuffer<KvPair<u64, u64>>>) {
        let buffer = Arc::new(MutableBuffer::new(4, 8, 8, false));
        let structure = Structure::new(Arc::new(LevelingPolicy::new(2, 8)), 1.0);
        (Epoch::new(0, structure, Arc::clone(&buffer), 0), buffer)
    }

    #[test]
    fn test_views_start_at_the_epoch_head() {
        let (epoch, buffer) = epoch();
        assert!(buffer.append(KvPair::new(1, 1), false));
        let view = epoch.buffer_view();
        assert_eq!(view.head(), 0);
        assert_eq!(view.record_count(), 1);

        // A later append is visible to a later view of the same epoch.
        assert!(buffer.append(KvPair::new(2, 2), false));
        assert_eq!(epoch.buffer_view().record_count(), 2);
    }

    #[test]
    fn test_advance_moves_head_and_respects_live_views() {
        let (epoch, buffer) = epoch();
        for i in 0..4 {
            assert!(buffer.append(KvPair::new(i, i), false));
        }
        assert!(epoch.advance_buffer_head(2));
        assert_eq!(epoch.head(), 2);
        assert_eq!(epoch.buffer_view().record_count(), 2);

        // A view on the now-prior head blocks the next advance.
        let stale = buffer.view_at(0);
        assert!(!epoch.advance_buffer_head(4));
        drop(stale);
        assert!(epoch.advance_buffer_head(4));
        assert_eq!(epoch.head(), 4);
    }
}
