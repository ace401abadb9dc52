//! The mutable write buffer.
//!
//! New records are staged here before a background reconstruction flushes
//! them into the shard hierarchy. The buffer is a fixed ring of record slots
//! addressed by monotonically increasing logical positions:
//!
//! ```text
//!        prior head        head              visible   tail
//!   ─────────┴───────────────┴─────────────────┴─────────┴──────
//!   reclaimable │ awaiting release │ live, readable │ reserved
//! ```
//!
//! Appends are lock-free: a slot is reserved by a CAS on the tail, written,
//! and then published in position order, so the published boundary always
//! delimits fully initialized slots. Readers never observe a reserved but
//! unwritten slot.
//!
//! Flushes advance the head instead of clearing the region, so appends can
//! proceed while a reconstruction drains the old records. Each head value
//! carries a reference count of the views created from it; the head can only
//! advance while the previous head has no live views, which is what makes
//! slot reuse safe. The ring holds twice the high watermark for the same
//! reason: a slot is only rewritten once the head has moved far enough that
//! no live view can still cover its previous occupant.

mod view;

pub use view::BufferView;

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::filter::TombstoneFilter;
use crate::record::{RecordData, Wrapped};

struct Slot<R> {
    cell: UnsafeCell<MaybeUninit<Wrapped<R>>>,
}

impl<R> Slot<R> {
    fn empty() -> Self {
        Self {
            cell: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

/// A head position plus the number of live views created from it.
#[derive(Debug, Clone, Copy)]
struct HeadRef {
    at: u64,
    refs: usize,
}

#[derive(Debug)]
struct HeadState {
    active: HeadRef,
    prior: HeadRef,
}

/// Fixed-capacity staging area for incoming records.
pub struct MutableBuffer<R: RecordData> {
    slots: Box<[Slot<R>]>,
    capacity: usize,
    low_watermark: usize,
    high_watermark: usize,

    /// Next logical position to reserve.
    tail: AtomicU64,
    /// Logical positions below this are published and readable.
    visible: AtomicU64,
    /// Active and prior heads with their view counts.
    heads: Mutex<HeadState>,
    /// Copy of the active head index, read on the lock-free append path.
    head_cache: AtomicU64,

    /// Live tombstones in `[head, tail)`.
    tombstone_count: AtomicU64,
    tombstone_cap: usize,
    filter: Option<TombstoneFilter>,
}

// The raw slot cells are synchronized by the reserve/publish/head protocol
// described on `append` and `advance_head`.
unsafe impl<R: RecordData> Send for MutableBuffer<R> {}
unsafe impl<R: RecordData> Sync for MutableBuffer<R> {}

impl<R: RecordData> MutableBuffer<R> {
    pub fn new(
        low_watermark: usize,
        high_watermark: usize,
        tombstone_cap: usize,
        with_filter: bool,
    ) -> Self {
        assert!(low_watermark > 0 && high_watermark >= low_watermark);
        let capacity = high_watermark * 2;
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, Slot::empty);

        Self {
            slots: slots.into_boxed_slice(),
            capacity,
            low_watermark,
            high_watermark,
            tail: AtomicU64::new(0),
            visible: AtomicU64::new(0),
            heads: Mutex::new(HeadState {
                active: HeadRef { at: 0, refs: 0 },
                prior: HeadRef { at: 0, refs: 0 },
            }),
            head_cache: AtomicU64::new(0),
            tombstone_count: AtomicU64::new(0),
            tombstone_cap,
            filter: with_filter.then(|| TombstoneFilter::new(tombstone_cap)),
        }
    }

    /// Append a record, returning `false` if the buffer is at the high
    /// watermark (or the tombstone cap would be exceeded). Failure is
    /// transient; the caller retries once a flush has drained the buffer.
    pub fn append(&self, record: R, tombstone: bool) -> bool {
        if tombstone && self.tombstone_count.load(Ordering::Relaxed) >= self.tombstone_cap as u64 {
            return false;
        }

        // Reserve a position, or fail if the live region is full. The CAS
        // either hands out a position exactly once or observes the bound;
        // there is no reserve-then-undo window.
        let pos = loop {
            let tail = self.tail.load(Ordering::Acquire);
            let head = self.head_cache.load(Ordering::Acquire);
            if tail - head >= self.high_watermark as u64 {
                return false;
            }
            match self
                .tail
                .compare_exchange_weak(tail, tail + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break tail,
                Err(_) => std::hint::spin_loop(),
            }
        };

        if tombstone {
            if let Some(filter) = &self.filter {
                filter.insert(&record);
            }
        }

        // Safety: the CAS above handed `pos` to this thread alone. If the
        // slot wraps, its previous occupant (`pos - capacity`) is already
        // behind the head by more than the high watermark, so no live view
        // covers it and it has not been dropped by anything else.
        unsafe {
            let cell = &mut *self.slots[(pos % self.capacity as u64) as usize].cell.get();
            if pos >= self.capacity as u64 {
                cell.assume_init_drop();
            }
            cell.write(Wrapped::new(record, pos, tombstone));
        }

        // Publish in position order so `visible` always bounds fully
        // initialized slots. The wait is for slower predecessors only.
        while self
            .visible
            .compare_exchange(pos, pos + 1, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }

        if tombstone {
            self.tombstone_count.fetch_add(1, Ordering::Relaxed);
        }
        true
    }

    /// Number of live records (tombstones included) in `[head, visible)`.
    pub fn record_count(&self) -> usize {
        let visible = self.visible.load(Ordering::Acquire);
        let head = self.head_cache.load(Ordering::Acquire);
        (visible - head) as usize
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstone_count.load(Ordering::Relaxed) as usize
    }

    pub fn at_low_watermark(&self) -> bool {
        self.record_count() >= self.low_watermark
    }

    pub fn is_full(&self) -> bool {
        self.record_count() >= self.high_watermark
    }

    pub fn head(&self) -> u64 {
        self.head_cache.load(Ordering::Acquire)
    }

    pub fn memory_usage(&self) -> usize {
        self.capacity * std::mem::size_of::<Wrapped<R>>()
    }

    pub fn aux_memory_usage(&self) -> usize {
        self.filter.as_ref().map_or(0, TombstoneFilter::memory_usage)
    }

    /// Snapshot the live region `[head, visible)` as an immutable view,
    /// taking a reference on the active head.
    pub fn view(self: &Arc<Self>) -> BufferView<R> {
        let mut heads = self.heads.lock();
        heads.active.refs += 1;
        let base = heads.active.at;
        drop(heads);
        let tail = self.visible.load(Ordering::Acquire);
        BufferView::new(Arc::clone(self), base, tail)
    }

    /// Snapshot `[head, visible)` for a specific head value, which must be
    /// the active or prior head. Epochs use this so that a query on a
    /// not-yet-retired epoch still pins the head its snapshot starts at.
    pub fn view_at(self: &Arc<Self>, head: u64) -> BufferView<R> {
        let mut heads = self.heads.lock();
        if heads.active.at == head {
            heads.active.refs += 1;
        } else if heads.prior.at == head {
            heads.prior.refs += 1;
        } else {
            // An epoch's head outlives the prior slot only after the epoch
            // has been retired, at which point nothing can request it.
            panic!(
                "view requested for reclaimed head {head} (active {}, prior {})",
                heads.active.at, heads.prior.at
            );
        }
        drop(heads);
        let tail = self.visible.load(Ordering::Acquire);
        BufferView::new(Arc::clone(self), head, tail)
    }

    pub(crate) fn release_head(&self, at: u64) {
        let mut heads = self.heads.lock();
        if heads.active.at == at {
            debug_assert!(heads.active.refs > 0);
            heads.active.refs -= 1;
        } else if heads.prior.at == at {
            debug_assert!(heads.prior.refs > 0);
            heads.prior.refs -= 1;
        } else {
            panic!("released view for unknown head {at}");
        }
    }

    /// Advance the head to `new_head`, retiring the region below it. Fails
    /// while the prior head still has live views; the caller spins. On
    /// success the old active head (and its live views) becomes the prior
    /// head, and tombstones in the retired region leave the live count.
    pub fn advance_head(&self, new_head: u64) -> bool {
        let mut heads = self.heads.lock();
        if heads.prior.refs != 0 {
            return false;
        }
        let retired = heads.active;
        debug_assert!(new_head >= retired.at);
        debug_assert!(new_head <= self.visible.load(Ordering::Acquire));

        let mut flushed_tombstones = 0u64;
        for pos in retired.at..new_head {
            // Safety: `[retired.at, new_head)` is published, and rewriting
            // any of it would require the head to pass `pos + high`, which
            // it has not.
            if unsafe { self.slot_ref(pos) }.is_tombstone() {
                flushed_tombstones += 1;
            }
        }
        self.tombstone_count
            .fetch_sub(flushed_tombstones, Ordering::Relaxed);

        heads.prior = retired;
        heads.active = HeadRef {
            at: new_head,
            refs: 0,
        };
        self.head_cache.store(new_head, Ordering::Release);
        true
    }

    /// Tagged-delete scan over the live region: set the deleted bit on the
    /// first live match. Returns whether a record made the transition.
    pub fn delete_record(self: &Arc<Self>, record: &R) -> bool {
        self.view().delete_record(record)
    }

    /// Check whether a tombstone for `record` is buffered, consulting the
    /// membership filter first.
    pub fn check_tombstone(self: &Arc<Self>, record: &R) -> bool {
        if let Some(filter) = &self.filter {
            if !filter.may_contain(record) {
                return false;
            }
        }
        self.view().contains_tombstone(record)
    }

    /// Logically empty the buffer. Only legal when no views are outstanding
    /// and no appends are in flight; used for quiescent reuse, primarily by
    /// tests. Normal operation reclaims through `advance_head`.
    pub fn truncate(&self) {
        let mut heads = self.heads.lock();
        assert!(
            heads.active.refs == 0 && heads.prior.refs == 0,
            "truncate with outstanding buffer views"
        );
        let visible = self.visible.load(Ordering::Acquire);
        debug_assert_eq!(visible, self.tail.load(Ordering::Acquire));

        let initialized = visible.min(self.capacity as u64);
        for slot in 0..initialized {
            // Safety: every physical slot below `initialized` holds a
            // published record, and the precondition excludes readers and
            // writers.
            unsafe {
                (*self.slots[slot as usize].cell.get()).assume_init_drop();
            }
        }

        self.tail.store(0, Ordering::Release);
        self.visible.store(0, Ordering::Release);
        heads.active = HeadRef { at: 0, refs: 0 };
        heads.prior = HeadRef { at: 0, refs: 0 };
        self.head_cache.store(0, Ordering::Release);
        self.tombstone_count.store(0, Ordering::Relaxed);
        if let Some(filter) = &self.filter {
            filter.clear();
        }
    }

    /// Safety: `pos` must be published and protected from reuse, either by a
    /// live view covering it or by the head protocol as in `advance_head`.
    pub(crate) unsafe fn slot_ref(&self, pos: u64) -> &Wrapped<R> {
        (*self.slots[(pos % self.capacity as u64) as usize].cell.get()).assume_init_ref()
    }
}

impl<R: RecordData> Drop for MutableBuffer<R> {
    fn drop(&mut self) {
        let visible = *self.visible.get_mut();
        let initialized = visible.min(self.capacity as u64);
        for slot in 0..initialized {
            unsafe {
                (*self.slots[slot as usize].cell.get()).assume_init_drop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::KvPair;

    type Buf = MutableBuffer<KvPair<u64, u64>>;

    fn buffer(low: usize, high: usize) -> Arc<Buf> {
        Arc::new(Buf::new(low, high, high, true))
    }

    fn rec(key: u64) -> KvPair<u64, u64> {
        KvPair::new(key, key)
    }

    #[test]
    fn test_append_and_view() {
        let buf = buffer(4, 8);
        for i in 0..5 {
            assert!(buf.append(rec(i), false));
        }
        assert_eq!(buf.record_count(), 5);
        assert!(buf.at_low_watermark());
        assert!(!buf.is_full());

        let view = buf.view();
        assert_eq!(view.record_count(), 5);
        for i in 0..5 {
            assert_eq!(view.get(i).record().key, i as u64);
            assert_eq!(view.get(i).sequence(), i as u64);
        }
    }

    #[test]
    fn test_append_fails_at_high_watermark() {
        let buf = buffer(2, 4);
        for i in 0..4 {
            assert!(buf.append(rec(i), false));
        }
        assert!(buf.is_full());
        assert!(!buf.append(rec(99), false));
        assert_eq!(buf.record_count(), 4);
    }

    #[test]
    fn test_tombstone_counts_and_filter() {
        let buf = buffer(4, 8);
        assert!(buf.append(rec(1), false));
        assert!(buf.append(rec(1), true));
        assert_eq!(buf.tombstone_count(), 1);
        assert!(buf.check_tombstone(&rec(1)));
        assert!(!buf.check_tombstone(&rec(2)));
    }

    #[test]
    fn test_delete_record_scans_the_live_region() {
        let buf = buffer(4, 8);
        assert!(buf.append(rec(1), false));
        assert!(buf.append(rec(2), false));
        assert!(buf.delete_record(&rec(2)));
        assert!(!buf.delete_record(&rec(2)));
        assert!(!buf.delete_record(&rec(5)));
    }

    #[test]
    fn test_tombstone_cap_rejects_appends() {
        let buf = Arc::new(Buf::new(2, 8, 2, false));
        assert!(buf.append(rec(1), true));
        assert!(buf.append(rec(2), true));
        assert!(!buf.append(rec(3), true));
        // Plain records are unaffected.
        assert!(buf.append(rec(3), false));
    }

    #[test]
    fn test_advance_head_retires_flushed_region() {
        let buf = buffer(2, 4);
        for i in 0..4 {
            assert!(buf.append(rec(i), i == 1));
        }
        assert!(buf.is_full());
        assert_eq!(buf.tombstone_count(), 1);

        assert!(buf.advance_head(3));
        assert_eq!(buf.record_count(), 1);
        assert_eq!(buf.tombstone_count(), 0);
        assert_eq!(buf.head(), 3);

        // Room again; the view starts at the new head.
        assert!(buf.append(rec(10), false));
        let view = buf.view();
        assert_eq!(view.record_count(), 2);
        assert_eq!(view.get(0).record().key, 3);
        assert_eq!(view.get(1).record().key, 10);
    }

    #[test]
    fn test_advance_blocked_by_prior_views() {
        let buf = buffer(2, 4);
        for i in 0..3 {
            assert!(buf.append(rec(i), false));
        }
        let view = buf.view();
        // First advance parks the viewed head as prior.
        assert!(buf.advance_head(2));
        assert!(buf.append(rec(3), false));
        assert!(buf.append(rec(4), false));
        // Second advance must wait for the prior head's view.
        assert!(!buf.advance_head(4));
        drop(view);
        assert!(buf.advance_head(4));
    }

    #[test]
    fn test_slot_reuse_after_wraparound() {
        let buf = buffer(2, 4);
        // Physical capacity is 8; run three flush cycles to wrap twice.
        for cycle in 0..3u64 {
            for i in 0..4u64 {
                assert!(buf.append(rec(cycle * 4 + i), false));
            }
            assert!(buf.advance_head((cycle + 1) * 4));
        }
        for i in 12..16u64 {
            assert!(buf.append(rec(i), false));
        }
        let view = buf.view();
        let keys: Vec<u64> = view.iter().map(|w| w.record().key).collect();
        assert_eq!(keys, vec![12, 13, 14, 15]);
    }

    #[test]
    fn test_view_at_prior_head() {
        let buf = buffer(2, 4);
        for i in 0..3 {
            assert!(buf.append(rec(i), false));
        }
        let old_head = buf.head();
        assert!(buf.advance_head(3));
        // An epoch that captured the old head can still snapshot from it.
        let view = buf.view_at(old_head);
        assert_eq!(view.head(), old_head);
        assert_eq!(view.record_count(), 3);
    }

    #[test]
    fn test_truncate_resets_everything() {
        let buf = buffer(2, 4);
        for i in 0..3 {
            assert!(buf.append(rec(i), i == 0));
        }
        buf.truncate();
        assert_eq!(buf.record_count(), 0);
        assert_eq!(buf.tombstone_count(), 0);
        assert!(!buf.check_tombstone(&rec(0)));
        assert!(buf.append(rec(7), false));
        let view = buf.view();
        assert_eq!(view.record_count(), 1);
        assert_eq!(view.get(0).record().key, 7);
    }

    #[test]
    fn test_concurrent_appends_are_linearizable_on_the_tail() {
        let buf = buffer(1 << 20, 1 << 20);
        let threads = 4;
        let per_thread = 10_000u64;

        std::thread::scope(|s| {
            for t in 0..threads {
                let buf = &buf;
                s.spawn(move || {
                    for i in 0..per_thread {
                        assert!(buf.append(rec(t as u64 * per_thread + i), false));
                    }
                });
            }
        });

        let total = threads as usize * per_thread as usize;
        assert_eq!(buf.record_count(), total);

        // Every append landed in a distinct slot with a distinct sequence,
        // and the view exposes all of them fully initialized.
        let view = buf.view();
        assert_eq!(view.record_count(), total);
        let mut seqs: Vec<u64> = view.iter().map(Wrapped::sequence).collect();
        seqs.sort_unstable();
        seqs.dedup();
        assert_eq!(seqs.len(), total);

        let mut keys: Vec<u64> = view.iter().map(|w| w.record().key).collect();
        keys.sort_unstable();
        for (expect, key) in keys.into_iter().enumerate() {
            assert_eq!(expect as u64, key);
        }
    }
}
