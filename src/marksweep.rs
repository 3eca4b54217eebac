//! The heap: registry of mutator threads, the object space, root tables and
//! the stop-the-world mark & sweep driver.
//!
//! Exactly one thread may hold the collector role at a time; the role is won
//! by installing the suspension flag. The winner stops the world, marks from
//! every root source, sweeps, resumes the world and only then runs
//! finalizers on its own thread.

use std::{cell::UnsafeCell, mem, sync::Arc, time::Instant};

use atomic::Ordering;
use crossbeam_utils::Backoff;
use parking_lot::{lock_api::RawMutex, RawMutex as Lock};

use crate::{
    api::{Collectable, Gc, HeapObjectHeader, Trace},
    mark::Marking,
    mutator::{attach_thread, Mutator, MutatorRef, ThreadState},
    roots::{
        GlobalRoot, GlobalRoots, ProcessRoots, RootProvider, StableRef, StableRefRegistry,
        ThreadRoots,
    },
    space::ObjectSpace,
    stats::GcStats,
    suspension::ThreadSuspension,
    sweep::sweep,
    utils::formatted_size,
};

/// Collector configuration, immutable once the heap exists. A zero threshold
/// disables that trigger; polling of the suspension flag is never disabled.
#[derive(Debug, Clone)]
pub struct MarkSweepOptions {
    /// Bytes a mutator may allocate before it triggers a collection.
    pub allocation_threshold_bytes: usize,
    /// Safepoint weight a mutator may accumulate before it triggers a
    /// collection.
    pub safepoint_threshold: usize,
}

impl Default for MarkSweepOptions {
    fn default() -> Self {
        Self {
            allocation_threshold_bytes: 8 * 1024 * 1024,
            safepoint_threshold: 100_000,
        }
    }
}

/// Create a heap and attach the calling thread to it as the first mutator.
pub fn instantiate_marksweep(options: MarkSweepOptions) -> MutatorRef {
    let heap = Arc::new(UnsafeCell::new(MarkSweep::new(options)));
    attach_thread(&heap, ThreadState::Runnable)
}

pub struct MarkSweep {
    /// Guards the mutator registry, the object space and the root tables.
    /// Held by the collector for the whole mark + sweep window, so a thread
    /// attaching mid-collection blocks until the registry is stable again.
    pub(crate) global_lock: Lock,
    pub(crate) mutators: Vec<*mut Mutator>,
    suspension: ThreadSuspension,
    pub(crate) space: ObjectSpace,
    globals: GlobalRoots,
    stable_refs: StableRefRegistry,
    options: MarkSweepOptions,
    stats: GcStats,
    mark_stack: Vec<*mut HeapObjectHeader>,
}

impl MarkSweep {
    fn new(options: MarkSweepOptions) -> Self {
        Self {
            global_lock: Lock::INIT,
            mutators: Vec::new(),
            suspension: ThreadSuspension::new(),
            space: ObjectSpace::new(),
            globals: GlobalRoots::new(),
            stable_refs: StableRefRegistry::new(),
            options,
            stats: GcStats::new(),
            mark_stack: Vec::with_capacity(128),
        }
    }

    pub fn options(&self) -> &MarkSweepOptions {
        &self.options
    }

    pub(crate) fn suspension(&self) -> &ThreadSuspension {
        &self.suspension
    }

    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    pub fn live_objects(&self) -> usize {
        self.space.live_objects()
    }

    pub fn live_bytes(&self) -> usize {
        self.space.live_bytes()
    }

    #[inline]
    pub fn is_suspension_requested(&self) -> bool {
        self.suspension.is_requested()
    }

    pub(crate) fn attach_mutator(&mut self, mutator: *mut Mutator) {
        self.global_lock.lock();
        self.mutators.push(mutator);
        unsafe { self.global_lock.unlock() };
    }

    pub(crate) fn detach_mutator(&mut self, mutator: *mut Mutator) {
        self.global_lock.lock();
        unsafe {
            (*mutator).publish(&mut self.space);
        }
        let mut detached = false;
        self.mutators.retain(|&m| {
            if m == mutator {
                detached = true;
                false
            } else {
                true
            }
        });
        unsafe { self.global_lock.unlock() };
        assert!(detached, "mutator must be attached to this heap");
    }

    fn all_mutators(&self, predicate: impl Fn(ThreadState) -> bool) -> bool {
        self.global_lock.lock();
        let all = self
            .mutators
            .iter()
            .all(|&m| predicate(unsafe { (*m).state() }));
        unsafe { self.global_lock.unlock() };
        all
    }

    /// Stop every other mutator. Returns false if another thread already
    /// holds the collector role; the caller must then park at its own
    /// safepoint rather than proceed.
    ///
    /// The requester flips its own state to `Suspended` for the duration of
    /// the stop, standing in for "already at a safepoint" so the rendezvous
    /// predicate is uniform across the registry.
    pub fn suspend_threads(&self, mutator: &Mutator) -> bool {
        if !self.suspension.try_request() {
            return false;
        }
        mutator.assert_state(ThreadState::Runnable);
        mutator.state.store(ThreadState::Suspended, Ordering::SeqCst);
        self.wait_for_world_stopped();
        true
    }

    /// Wake every parked mutator and wait until none still reads as
    /// `Suspended`. Without the trailing wait, a freshly woken thread could
    /// be observed suspended by the next collector's registry snapshot and
    /// be skipped by its rendezvous.
    pub fn resume_threads(&self, mutator: &Mutator) {
        mutator.state.store(ThreadState::Runnable, Ordering::SeqCst);
        self.suspension.clear_and_notify();
        self.wait_for_world_running();
    }

    fn wait_for_world_stopped(&self) {
        let backoff = Backoff::new();
        while !self.all_mutators(|state| matches!(state, ThreadState::Suspended | ThreadState::Native))
        {
            backoff.snooze();
        }
    }

    fn wait_for_world_running(&self) {
        let backoff = Backoff::new();
        while !self.all_mutators(|state| matches!(state, ThreadState::Runnable | ThreadState::Native))
        {
            backoff.snooze();
        }
    }

    /// Run a full collection on the calling thread. Returns false if another
    /// thread was already collecting (the caller should park); true once a
    /// complete cycle ran.
    pub fn perform_full_gc(&mut self, mutator: &Mutator, keep: &mut [&mut dyn Trace]) -> bool {
        if !self.suspend_threads(mutator) {
            return false;
        }
        let start = Instant::now();

        self.global_lock.lock();
        let mut marking = Marking::with_stack(mem::take(&mut self.mark_stack));
        // Publish every stopped mutator's local buffer before touching the
        // object graph, then seed the worklist from all three root sources.
        for index in 0..self.mutators.len() {
            let thread = self.mutators[index];
            unsafe {
                (*thread).publish(&mut self.space);
                ThreadRoots::new(&*thread).provide(&mut marking);
            }
        }
        self.stable_refs.process_deletions();
        ProcessRoots::new(&self.globals, &self.stable_refs).provide(&mut marking);
        for root in keep.iter_mut() {
            root.trace(&mut marking);
        }
        tracing::debug!(
            target: "bolide::gc",
            threads = self.mutators.len(),
            live_objects = self.space.live_objects(),
            "world stopped, roots enumerated"
        );
        marking.run();
        self.mark_stack = marking.into_stack();
        let queue = sweep(&mut self.space);
        unsafe { self.global_lock.unlock() };

        self.resume_threads(mutator);
        let pause_ns = start.elapsed().as_nanos() as u64;

        // Finalizers run after the world resumes: they may allocate, and an
        // allocating finalizer may itself trigger the next collection.
        let reclaimed = queue.bytes();
        let finalized = queue.finalize();
        self.stats.on_collection(finalized, reclaimed, pause_ns);
        tracing::info!(
            target: "bolide::gc",
            finalized,
            reclaimed = %formatted_size(reclaimed),
            live = %formatted_size(self.space.live_bytes()),
            pause_us = pause_ns / 1_000,
            "collection complete"
        );
        true
    }

    pub fn register_global_root(&mut self, object: Gc<dyn Collectable>) -> GlobalRoot {
        self.global_lock.lock();
        let root = self.globals.insert(object);
        unsafe { self.global_lock.unlock() };
        root
    }

    pub fn unregister_global_root(&mut self, root: GlobalRoot) {
        self.global_lock.lock();
        self.globals.remove(root);
        unsafe { self.global_lock.unlock() };
    }

    pub fn create_stable_ref(&mut self, object: Gc<dyn Collectable>) -> StableRef {
        self.global_lock.lock();
        let reference = self.stable_refs.insert(object);
        unsafe { self.global_lock.unlock() };
        reference
    }

    /// Queue a stable reference for deletion. The slot stays a root until
    /// the next collection processes the queue.
    pub fn dispose_stable_ref(&mut self, reference: StableRef) {
        self.global_lock.lock();
        self.stable_refs.queue_dispose(reference);
        unsafe { self.global_lock.unlock() };
    }
}

/// RAII stop-the-world window for embedders: construction wins the collector
/// race and stops every other mutator, drop resumes them.
pub struct SafepointScope {
    heap: Arc<UnsafeCell<MarkSweep>>,
    mutator: MutatorRef,
}

impl SafepointScope {
    /// Returns None if another thread already holds the collector role; the
    /// calling thread has then already discharged its rendezvous obligation
    /// by parking.
    pub fn new(mutator: MutatorRef) -> Option<Self> {
        let heap = mutator.heap.clone();
        let href = unsafe { &*heap.get() };
        if !href.suspend_threads(&mutator) {
            mutator.park_if_requested();
            return None;
        }
        Some(Self { heap, mutator })
    }
}

impl Drop for SafepointScope {
    fn drop(&mut self) {
        let href = unsafe { &*self.heap.get() };
        href.resume_threads(&self.mutator);
    }
}
