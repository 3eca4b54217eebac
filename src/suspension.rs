//! Process-wide suspension coordinator: one flag, one mutex, one condition
//! variable. A collector installs the flag to ask every runnable mutator to
//! park; parked mutators sleep on the condition until the flag clears.

use std::sync::atomic::AtomicBool;

use atomic::{Atomic, Ordering};
use parking_lot::{Condvar, Mutex};

use crate::mutator::ThreadState;

pub struct ThreadSuspension {
    requested: AtomicBool,
    mutex: Mutex<()>,
    cond: Condvar,
}

impl ThreadSuspension {
    pub(crate) fn new() -> Self {
        Self {
            requested: AtomicBool::new(false),
            mutex: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    #[inline(always)]
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Park the calling mutator if a suspension is in flight. Returns true
    /// if the thread actually parked.
    ///
    /// The flag is read once outside the mutex (fast path) and re-read under
    /// it: a waiter that saw the flag under the mutex cannot miss the clear,
    /// because the collector also clears under the mutex. While parked the
    /// thread reads as `Suspended`; the previous state is restored on wake.
    pub(crate) fn park_if_requested(&self, state: &Atomic<ThreadState>) -> bool {
        if !self.is_requested() {
            return false;
        }
        let mut guard = self.mutex.lock();
        if !self.is_requested() {
            return false;
        }
        let previous = state.swap(ThreadState::Suspended, Ordering::SeqCst);
        while self.is_requested() {
            self.cond.wait(&mut guard);
        }
        state.store(previous, Ordering::SeqCst);
        true
    }

    /// Install the suspension flag. Returns false if another thread already
    /// holds it; that caller lost the collector race and must park at its
    /// own safepoint.
    pub(crate) fn try_request(&self) -> bool {
        let _guard = self.mutex.lock();
        if self.requested.load(Ordering::SeqCst) {
            return false;
        }
        self.requested.store(true, Ordering::SeqCst);
        true
    }

    /// Clear the flag and wake every parked mutator. Modifying the atomic
    /// under the mutex publishes the clear to threads that are just about to
    /// wait.
    pub(crate) fn clear_and_notify(&self) {
        {
            let _guard = self.mutex.lock();
            self.requested.store(false, Ordering::SeqCst);
        }
        self.cond.notify_all();
    }
}
