use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::shard::Shard;

use super::Epoch;

/// One lifecycle slot: the epoch held there and the number of outstanding
/// pins taken from it. The pair is updated under a short critical section so
/// pin, release, and transition all observe it atomically.
struct Slot<S: Shard> {
    epoch: Option<Arc<Epoch<S>>>,
    refs: usize,
}

impl<S: Shard> Slot<S> {
    fn empty() -> Self {
        Self {
            epoch: None,
            refs: 0,
        }
    }
}

/// The epoch register: `current` serves new pins, `previous` drains pins
/// taken before the last transition. The epoch under construction ("next")
/// is owned exclusively by the reconstruction job until it is published, and
/// is represented here by the reconstruction-in-flight flag; it exists only
/// while a reconstruction is active and nothing can pin it.
///
/// Lifecycle: an epoch is installed as current, demoted to previous by the
/// next transition, and destroyed from previous once its pin count reaches
/// zero. At most one of current/previous is empty outside the brief
/// mid-transition window, during which pin and release simply retry.
pub struct EpochRegister<S: Shard> {
    current: Mutex<Slot<S>>,
    previous: Mutex<Slot<S>>,

    reconstruction: AtomicBool,
    epoch_available: Condvar,
    epoch_wait: Mutex<()>,

    serial: bool,
}

impl<S: Shard> EpochRegister<S> {
    pub fn new(serial: bool) -> Self {
        Self {
            current: Mutex::new(Slot::empty()),
            previous: Mutex::new(Slot::empty()),
            reconstruction: AtomicBool::new(false),
            epoch_available: Condvar::new(),
            epoch_wait: Mutex::new(()),
            serial,
        }
    }

    /// Install the first epoch. Called once at construction.
    pub fn install_initial(&self, epoch: Arc<Epoch<S>>) {
        let mut current = self.current.lock();
        debug_assert!(current.epoch.is_none());
        current.epoch = Some(epoch);
    }

    /// Pin the active epoch: increment the refcount of the slot it lives in
    /// and hand out the handle. During a transition the current slot is
    /// transiently parked; pins fall back to the previous slot, retrying
    /// until an increment lands somewhere.
    pub fn pin(&self) -> Arc<Epoch<S>> {
        loop {
            {
                let mut current = self.current.lock();
                if let Some(epoch) = current.epoch.clone() {
                    current.refs += 1;
                    return epoch;
                }
            }
            {
                let mut previous = self.previous.lock();
                if let Some(epoch) = previous.epoch.clone() {
                    previous.refs += 1;
                    return epoch;
                }
            }
            std::hint::spin_loop();
        }
    }

    /// Release a pin. The epoch may have moved from current to previous
    /// since it was pinned, so the release is matched against the slot the
    /// epoch occupies now; mid-transition it is transiently in neither, and
    /// the release retries.
    pub fn release(&self, epoch: &Arc<Epoch<S>>) {
        loop {
            {
                let mut previous = self.previous.lock();
                let held_here = previous
                    .epoch
                    .as_ref()
                    .is_some_and(|held| Arc::ptr_eq(held, epoch));
                if held_here {
                    debug_assert!(previous.refs > 0);
                    previous.refs -= 1;
                    return;
                }
            }
            {
                let mut current = self.current.lock();
                let held_here = current
                    .epoch
                    .as_ref()
                    .is_some_and(|held| Arc::ptr_eq(held, epoch));
                if held_here {
                    debug_assert!(current.refs > 0);
                    current.refs -= 1;
                    return;
                }
            }
            std::hint::spin_loop();
        }
    }

    /// Publish `next` as the new current epoch:
    ///
    /// 1. retire the resident previous epoch (waits for its pins to drain),
    /// 2. park the current epoch into the previous slot,
    /// 3. spin until the buffer accepts the new head (blocked by views on
    ///    the prior head; there is no query preemption),
    /// 4. install `next` as current.
    pub fn advance(&self, next: Arc<Epoch<S>>, new_head: u64) {
        self.retire_previous();

        let parked = {
            let mut current = self.current.lock();
            let parked = Slot {
                epoch: current.epoch.take(),
                refs: current.refs,
            };
            current.refs = 0;
            parked
        };
        {
            let mut previous = self.previous.lock();
            debug_assert!(previous.epoch.is_none() && previous.refs == 0);
            *previous = parked;
        }

        let mut spins = 0u64;
        while !next.advance_buffer_head(new_head) {
            spins += 1;
            if spins % 1024 == 0 {
                tracing::warn!(
                    epoch = next.id(),
                    new_head,
                    spins,
                    "buffer head advance blocked by live views on the prior head",
                );
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }

        {
            let mut current = self.current.lock();
            debug_assert!(current.epoch.is_none());
            current.epoch = Some(next);
            current.refs = 0;
        }
    }

    /// Wait for the previous slot's pins to drain, then destroy the epoch.
    /// Under the serial scheduler a live pin here is a bug: nothing else
    /// can ever release it.
    fn retire_previous(&self) {
        loop {
            let retired = {
                let mut previous = self.previous.lock();
                if previous.epoch.is_none() {
                    return;
                }
                if self.serial {
                    assert!(
                        previous.refs == 0,
                        "retiring an epoch with {} live pins under the serial scheduler",
                        previous.refs,
                    );
                }
                if previous.refs == 0 {
                    previous.epoch.take()
                } else {
                    None
                }
            };
            match retired {
                Some(epoch) => {
                    tracing::debug!(epoch = epoch.id(), "retired epoch");
                    drop(epoch);
                    return;
                }
                None => std::thread::yield_now(),
            }
        }
    }

    /// Claim the right to schedule a reconstruction. Exactly one claimant
    /// wins until the running reconstruction ends.
    pub fn try_begin_reconstruction(&self) -> bool {
        self.reconstruction
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Mark the reconstruction finished and wake anyone waiting on the new
    /// epoch.
    pub fn end_reconstruction(&self) {
        self.reconstruction.store(false, Ordering::Release);
        let _guard = self.epoch_wait.lock();
        self.epoch_available.notify_all();
    }

    pub fn reconstruction_in_flight(&self) -> bool {
        self.reconstruction.load(Ordering::Acquire)
    }

    /// Block until no reconstruction is in flight. Returns immediately when
    /// none is.
    pub fn await_next_epoch(&self) {
        let mut guard = self.epoch_wait.lock();
        while self.reconstruction.load(Ordering::Acquire) {
            self.epoch_available.wait(&mut guard);
        }
    }

    /// Pins held across both slots. Zero at quiescence.
    pub fn outstanding_pins(&self) -> usize {
        self.current.lock().refs + self.previous.lock().refs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MutableBuffer;
    use crate::policy::LevelingPolicy;
    use crate::record::KvPair;
    use crate::shard::SortedRun;
    use crate::structure::Structure;

    type TestEpoch = Epoch<SortedRun<KvPair<u64, u64>>>;
    type TestRegister = EpochRegister<SortedRun<KvPair<u64, u64>>>;

    fn setup() -> (TestRegister, Arc<MutableBuffer<KvPair<u64, u64>>>) {
        let register = EpochRegister::new(false);
        let buffer = Arc::new(MutableBuffer::new(4, 8, 8, false));
        register.install_initial(Arc::new(epoch_on(0, &buffer, 0)));
        (register, buffer)
    }

    fn epoch_on(
        id: u64,
        buffer: &Arc<MutableBuffer<KvPair<u64, u64>>>,
        head: u64,
    ) -> TestEpoch {
        let structure = Structure::new(Arc::new(LevelingPolicy::new(2, 8)), 1.0);
        Epoch::new(id, structure, Arc::clone(buffer), head)
    }

    #[test]
    fn test_pin_release_balance() {
        let (register, _buffer) = setup();
        let a = register.pin();
        let b = register.pin();
        assert_eq!(register.outstanding_pins(), 2);
        register.release(&a);
        register.release(&b);
        assert_eq!(register.outstanding_pins(), 0);
    }

    #[test]
    fn test_advance_demotes_and_installs() {
        let (register, buffer) = setup();
        let first = register.pin();
        assert_eq!(first.id(), 0);
        register.release(&first);

        register.advance(Arc::new(epoch_on(1, &buffer, 0)), 0);
        let pinned = register.pin();
        assert_eq!(pinned.id(), 1);
        register.release(&pinned);
    }

    #[test]
    fn test_release_finds_a_demoted_epoch() {
        let (register, buffer) = setup();
        let old = register.pin();
        register.advance(Arc::new(epoch_on(1, &buffer, 0)), 0);

        // The pinned epoch now lives in the previous slot.
        assert_eq!(register.outstanding_pins(), 1);
        register.release(&old);
        assert_eq!(register.outstanding_pins(), 0);
    }

    #[test]
    fn test_retire_waits_for_pins_to_drain() {
        let (register, buffer) = setup();
        let old = register.pin();
        register.advance(Arc::new(epoch_on(1, &buffer, 0)), 0);

        // Epoch 0 sits pinned in previous; the next advance must wait for
        // the release before retiring it.
        let register = Arc::new(register);
        let releaser = {
            let register = Arc::clone(&register);
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                register.release(&old);
            })
        };

        register.advance(Arc::new(epoch_on(2, &buffer, 0)), 0);
        releaser.join().unwrap();

        let pinned = register.pin();
        assert_eq!(pinned.id(), 2);
        register.release(&pinned);
        assert_eq!(register.outstanding_pins(), 0);
    }

    #[test]
    fn test_concurrent_pins_stay_balanced() {
        let (register, _buffer) = setup();
        let register = Arc::new(register);

        std::thread::scope(|s| {
            for _ in 0..8 {
                let register = Arc::clone(&register);
                s.spawn(move || {
                    for _ in 0..1000 {
                        let epoch = register.pin();
                        register.release(&epoch);
                    }
                });
            }
        });

        assert_eq!(register.outstanding_pins(), 0);
    }

    #[test]
    fn test_reconstruction_flag_is_exclusive() {
        let (register, _buffer) = setup();
        assert!(register.try_begin_reconstruction());
        assert!(!register.try_begin_reconstruction());
        assert!(register.reconstruction_in_flight());

        register.end_reconstruction();
        assert!(!register.reconstruction_in_flight());
        assert!(register.try_begin_reconstruction());
        register.end_reconstruction();
    }

    #[test]
    fn test_await_next_epoch_blocks_until_end() {
        let (register, _buffer) = setup();
        let register = Arc::new(register);
        assert!(register.try_begin_reconstruction());

        let finisher = {
            let register = Arc::clone(&register);
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                register.end_reconstruction();
            })
        };

        register.await_next_epoch();
        assert!(!register.reconstruction_in_flight());
        finisher.join().unwrap();
    }
}
