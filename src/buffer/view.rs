use std::sync::Arc;

use crate::record::{RecordData, Wrapped};

use super::MutableBuffer;

/// An immutable snapshot of the buffer's live region.
///
/// The view covers logical positions `[head, tail)` frozen at creation time
/// and holds a reference on its head for its whole lifetime, which keeps the
/// underlying slots from being reclaimed. Dropping the view releases the
/// reference exactly once.
pub struct BufferView<R: RecordData> {
    buffer: Arc<MutableBuffer<R>>,
    head: u64,
    tail: u64,
}

impl<R: RecordData> BufferView<R> {
    pub(crate) fn new(buffer: Arc<MutableBuffer<R>>, head: u64, tail: u64) -> Self {
        debug_assert!(tail >= head);
        Self { buffer, head, tail }
    }

    /// Number of records visible through this view.
    pub fn record_count(&self) -> usize {
        (self.tail - self.head) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// The head this view starts at.
    pub fn head(&self) -> u64 {
        self.head
    }

    /// The logical position one past the last visible record. A flush that
    /// consumes this view advances the buffer head here.
    pub fn tail(&self) -> u64 {
        self.tail
    }

    /// The `index`-th visible record.
    pub fn get(&self, index: usize) -> &Wrapped<R> {
        assert!(index < self.record_count());
        // Safety: the position is published (below the frozen tail) and this
        // view's head reference keeps it from being reclaimed.
        unsafe { self.buffer.slot_ref(self.head + index as u64) }
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Wrapped<R>> {
        (0..self.record_count()).map(|i| self.get(i))
    }

    /// Tagged-delete scan: set the deleted bit on the first live match.
    /// Returns whether a record made the transition.
    pub fn delete_record(&self, record: &R) -> bool {
        self.iter()
            .any(|w| !w.is_tombstone() && w.record() == record && w.mark_deleted())
    }

    /// Whether the view contains a tombstone for `record`.
    pub fn contains_tombstone(&self, record: &R) -> bool {
        self.iter()
            .any(|w| w.is_tombstone() && w.record() == record)
    }
}

impl<R: RecordData> Drop for BufferView<R> {
    fn drop(&mut self) {
        self.buffer.release_head(self.head);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::KvPair;

    fn buffer() -> Arc<MutableBuffer<KvPair<u64, u64>>> {
        Arc::new(MutableBuffer::new(4, 8, 8, false))
    }

    fn rec(key: u64) -> KvPair<u64, u64> {
        KvPair::new(key, key)
    }

    #[test]
    fn test_view_is_a_frozen_snapshot() {
        let buf = buffer();
        for i in 0..3 {
            assert!(buf.append(rec(i), false));
        }
        let view = buf.view();
        assert!(buf.append(rec(3), false));
        // Appends after creation are not visible.
        assert_eq!(view.record_count(), 3);
        assert_eq!(buf.view().record_count(), 4);
    }

    #[test]
    fn test_delete_record_marks_first_live_match() {
        let buf = buffer();
        assert!(buf.append(rec(1), false));
        assert!(buf.append(rec(2), false));
        let view = buf.view();

        assert!(view.delete_record(&rec(2)));
        assert!(view.get(1).is_deleted());
        // Second delete of the same record finds nothing live.
        assert!(!view.delete_record(&rec(2)));
        assert!(!view.delete_record(&rec(9)));
    }

    #[test]
    fn test_delete_record_skips_tombstones() {
        let buf = buffer();
        assert!(buf.append(rec(5), true));
        let view = buf.view();
        assert!(!view.delete_record(&rec(5)));
        assert!(view.contains_tombstone(&rec(5)));
    }

    #[test]
    fn test_dropping_views_releases_references() {
        let buf = buffer();
        for i in 0..4 {
            assert!(buf.append(rec(i), false));
        }
        let a = buf.view();
        let b = buf.view();
        assert!(buf.advance_head(2));
        // Views from the parked head block the next advance until dropped.
        assert!(buf.append(rec(4), false));
        assert!(!buf.advance_head(4));
        drop(a);
        assert!(!buf.advance_head(4));
        drop(b);
        assert!(buf.advance_head(4));
    }
}
