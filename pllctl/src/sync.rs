//! Controller lock
//!
//! [`ClockController`](crate::ClockController) serializes its operations
//! with any [`lock_api::RawMutex`]. Platforms that already have a suitable
//! lock plug it in as the last type parameter; [`RawSpinlock`] is the
//! default. [`CriticalSectionRawMutex`] holds a critical section instead,
//! which masks interrupts for the whole operation.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

use critical_section::RestoreState;
use lock_api::{GuardNoSend, GuardSend, RawMutex};

/// A spinning lock that leaves interrupts enabled.
///
/// A holder that is preempted by a contender on the same core never gets
/// the lock back, so the controller must not be used from an interrupt
/// handler that can preempt another user of it.
pub struct RawSpinlock(AtomicBool);

unsafe impl RawMutex for RawSpinlock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: RawSpinlock = RawSpinlock(AtomicBool::new(false));

    type GuardMarker = GuardSend;

    fn lock(&self) {
        while !self.try_lock() {
            while self.0.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    fn try_lock(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A lock that holds a critical section while it is taken.
pub struct CriticalSectionRawMutex {
    taken: AtomicBool,
    restore: UnsafeCell<RestoreState>,
}

// SAFETY: `restore` is only accessed by the holder of the critical section.
unsafe impl Sync for CriticalSectionRawMutex {}

unsafe impl RawMutex for CriticalSectionRawMutex {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: CriticalSectionRawMutex = CriticalSectionRawMutex {
        taken: AtomicBool::new(false),
        restore: UnsafeCell::new(RestoreState::invalid()),
    };

    // The critical section must be released where it was acquired.
    type GuardMarker = GuardNoSend;

    fn lock(&self) {
        while !self.try_lock() {
            core::hint::spin_loop();
        }
    }

    fn try_lock(&self) -> bool {
        // SAFETY: released below, or in `unlock`.
        let state = unsafe { critical_section::acquire() };
        if self.taken.swap(true, Ordering::Acquire) {
            // SAFETY: `state` comes from the matching `acquire`.
            unsafe { critical_section::release(state) };
            return false;
        }
        // SAFETY: we hold the critical section.
        unsafe { *self.restore.get() = state };
        true
    }

    unsafe fn unlock(&self) {
        let state = *self.restore.get();
        self.taken.store(false, Ordering::Release);
        critical_section::release(state);
    }
}
