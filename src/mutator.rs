//! Mutator threads. Each thread touching the managed heap owns a `Mutator`
//! descriptor: its state word, its safepoint counters and its unpublished
//! allocations. Descriptors are boxed behind [`MutatorRef`] handles and never
//! move for as long as the thread is attached, so the collector can iterate
//! them by raw pointer.

use std::{
    cell::{Cell, UnsafeCell},
    marker::PhantomData,
    mem::size_of,
    ops::{Deref, DerefMut},
    ptr::NonNull,
    sync::Arc,
};

use atomic::{Atomic, Ordering};
use parking_lot::{Condvar, Mutex};

use crate::{
    api::{vtable_of, Collectable, Gc, HeapObjectHeader, Trace, CELL_ALIGN},
    marksweep::MarkSweep,
    roots::{GlobalRoot, StableRef},
    shadow_stack::ShadowStack,
    space::{allocate_cell, LocalBuffer, ObjectSpace},
    stats::StatsSnapshot,
    suspension::ThreadSuspension,
    utils::align_usize,
};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ThreadState {
    /// Executing managed code: polls safepoints, honors suspension.
    Runnable = 0,
    /// Executing foreign code. The thread promises not to touch any managed
    /// object until it switches back, so the collector never waits for it.
    Native = 1,
    /// Parked on the suspension condition, or standing in for the collector
    /// itself while it runs a cycle.
    Suspended = 2,
}

/// Same-state switches are contract violations unless the caller explicitly
/// asks for a reentrant switch; every cross-state switch is legal.
#[inline(always)]
fn is_switch_allowed(old_state: ThreadState, new_state: ThreadState, reentrant: bool) -> bool {
    old_state != new_state || reentrant
}

pub struct Mutator {
    pub(crate) state: Atomic<ThreadState>,

    allocated_bytes: Cell<usize>,
    safepoint_counter: Cell<usize>,
    allocation_threshold: usize,
    safepoint_threshold: usize,

    pub(crate) local: LocalBuffer,
    shadow_stack: ShadowStack,

    suspension: *const ThreadSuspension,
    pub(crate) heap: Arc<UnsafeCell<MarkSweep>>,
    join_data: Arc<JoinDataInternal>,
    rc: u32,
}

unsafe impl Send for Mutator {}

impl Mutator {
    pub(crate) fn new(
        heap: Arc<UnsafeCell<MarkSweep>>,
        href: &MarkSweep,
        initial_state: ThreadState,
        join_data: Arc<JoinDataInternal>,
    ) -> Mutator {
        Mutator {
            state: Atomic::new(initial_state),
            allocated_bytes: Cell::new(0),
            safepoint_counter: Cell::new(0),
            allocation_threshold: href.options().allocation_threshold_bytes,
            safepoint_threshold: href.options().safepoint_threshold,
            local: LocalBuffer::new(),
            shadow_stack: ShadowStack::new(),
            suspension: href.suspension(),
            heap,
            join_data,
            rc: 1,
        }
    }

    pub(crate) fn heap_ref(&self) -> &mut MarkSweep {
        unsafe { &mut *self.heap.get() }
    }

    pub fn shadow_stack(&self) -> &'static ShadowStack {
        unsafe { std::mem::transmute(&self.shadow_stack) }
    }

    #[inline(always)]
    pub fn state(&self) -> ThreadState {
        self.state.load(Ordering::SeqCst)
    }

    /// Switch this thread to `new_state`, returning the previous state.
    ///
    /// A `Native -> Runnable` switch parks first if a suspension is in
    /// flight: re-entering managed code is the point where a native thread's
    /// rendezvous obligation comes due. No other switch can block.
    pub fn switch_state(&self, new_state: ThreadState, reentrant: bool) -> ThreadState {
        let old_state = self.state.load(Ordering::SeqCst);
        if !is_switch_allowed(old_state, new_state, reentrant) {
            contract_violation(format_args!(
                "illegal thread state switch: {:?} -> {:?}",
                old_state, new_state
            ));
        }
        if old_state == ThreadState::Native && new_state == ThreadState::Runnable {
            self.park_if_requested();
        }
        self.state.store(new_state, Ordering::SeqCst);
        old_state
    }

    /// Debug-build check that the thread is in the state the caller assumes.
    pub fn assert_state(&self, expected: ThreadState) {
        if cfg!(debug_assertions) {
            let actual = self.state.load(Ordering::SeqCst);
            if actual != expected {
                contract_violation(format_args!(
                    "unexpected thread state: expected {:?}, found {:?}",
                    expected, actual
                ));
            }
        }
    }

    #[inline(always)]
    pub fn is_suspension_requested(&self) -> bool {
        unsafe { (*self.suspension).is_requested() }
    }

    /// Park at the current safepoint if a collector asked for the world to
    /// stop. Returns true if the thread actually parked. Free when no
    /// suspension is in flight.
    #[inline(always)]
    pub fn park_if_requested(&self) -> bool {
        unsafe { (*self.suspension).park_if_requested(&self.state) }
    }

    /// Safepoint poll with an explicit weight. Called from function
    /// epilogues, loop back-edges and unwind paths with weight 1; a runtime
    /// embedding coarser polls can pass the number of skipped sites.
    #[inline]
    pub fn safepoint(&self, weight: usize) {
        self.poll(
            &self.safepoint_counter,
            self.safepoint_threshold,
            weight,
            &mut [],
        );
    }

    pub fn safepoint_function_epilogue(&self) {
        self.safepoint(1);
    }

    pub fn safepoint_loop_back_edge(&self) {
        self.safepoint(1);
    }

    pub fn safepoint_exception_unwind(&self) {
        self.safepoint(1);
    }

    /// Allocation-side poll: an external allocator reports `size` bytes
    /// about to be handed to this thread. [`Mutator::allocate`] runs the
    /// same poll internally.
    #[inline]
    pub fn on_allocation(&self, size: usize) {
        self.poll(
            &self.allocated_bytes,
            self.allocation_threshold,
            size,
            &mut [],
        );
    }

    /// Shared poll logic for both counters. Parking resets the counter and
    /// skips the trigger check for this poll; crossing the threshold resets
    /// the counter and runs a collection; either way the weight lands on
    /// the (possibly reset) counter afterwards. A zero threshold disables
    /// the trigger but never the suspension poll.
    fn poll(
        &self,
        counter: &Cell<usize>,
        threshold: usize,
        weight: usize,
        keep: &mut [&mut dyn Trace],
    ) {
        let overhead = if threshold == 0 {
            counter.get()
        } else {
            counter.get() % threshold
        };
        if self.park_if_requested() {
            counter.set(0);
            return;
        }
        if threshold != 0 && overhead + weight >= threshold {
            counter.set(0);
            self.perform_gc(keep);
        }
        counter.set(counter.get() + weight);
    }

    /// Trigger a collection on this thread. If another thread is already
    /// collecting, join its rendezvous as a victim instead.
    pub fn perform_gc(&self, keep: &mut [&mut dyn Trace]) {
        if self.heap_ref().perform_full_gc(self, keep) {
            return;
        }
        // Lost the race: the winning collector set the flag and is now
        // waiting for this thread to park.
        let parked = self.park_if_requested();
        debug_assert!(
            parked,
            "a competing collector resumed the world without waiting for this thread"
        );
    }

    /// Allocation failure hook: force a collection and let the caller retry.
    pub fn on_oom(&self, size: usize, keep: &mut [&mut dyn Trace]) {
        tracing::warn!(target: "bolide::gc", size, "allocation failure, forcing collection");
        self.perform_gc(keep);
    }

    /// Allocate `value` on the managed heap. The allocation itself is a
    /// safepoint: the byte counter may trip a collection here, with `value`
    /// traced as a root while it happens.
    pub fn allocate<T: Collectable + Sized + 'static>(&mut self, mut value: T) -> Gc<T> {
        let size = align_usize(
            value.allocation_size() + size_of::<HeapObjectHeader>(),
            CELL_ALIGN,
        );
        self.poll(
            &self.allocated_bytes,
            self.allocation_threshold,
            size,
            &mut [&mut value],
        );

        let mut cell = allocate_cell(size);
        if cell.is_null() {
            self.on_oom(size, &mut [&mut value]);
            cell = allocate_cell(size);
            if cell.is_null() {
                oom_abort();
            }
        }

        unsafe {
            cell.write(HeapObjectHeader::new(vtable_of::<T>(), size));
            ((*cell).data() as *mut T).write(value);
            self.local.push(cell);
            self.heap_ref().stats().on_allocation(size);
            Gc {
                base: NonNull::new_unchecked(cell),
                marker: PhantomData,
            }
        }
    }

    pub(crate) fn publish(&mut self, space: &mut ObjectSpace) {
        space.publish(&mut self.local);
    }

    /// Spawn an OS thread attached to this mutator's heap. The new thread
    /// attaches in `Native` (it starts in foreign code from the collector's
    /// point of view) and enters `Runnable` before the closure runs.
    pub fn spawn_mutator<F>(&self, closure: F) -> JoinData
    where
        F: FnOnce(MutatorRef) + Send + 'static,
    {
        let join_data = JoinData::new();
        let mutator =
            attach_thread_with_join(&self.heap, ThreadState::Native, join_data.internal.clone());
        std::thread::spawn(move || {
            mutator.switch_state(ThreadState::Runnable, false);
            closure(mutator.clone());
            mutator.switch_state(ThreadState::Native, false);
            drop(mutator);
        });
        join_data
    }

    pub(crate) fn stop(&self) {
        let mut running = self.join_data.running.lock();
        *running = false;
        self.join_data.cv_stopped.notify_all();
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        // Detaching is itself a safepoint; a runnable thread discharges any
        // pending rendezvous before it disappears from the registry.
        if self.state.load(Ordering::SeqCst) == ThreadState::Runnable {
            self.park_if_requested();
        }
        let href = unsafe { &mut *self.heap.get() };
        href.detach_mutator(self as *mut Mutator);
        self.stop();
    }
}

/// Refcounted handle to a boxed [`Mutator`]. The box gives the descriptor a
/// stable address for the thread's whole registered lifetime.
pub struct MutatorRef {
    mutator: NonNull<Mutator>,
}

unsafe impl Send for MutatorRef {}

impl MutatorRef {
    pub(crate) fn new(mutator: Mutator) -> Self {
        Self {
            mutator: unsafe { NonNull::new_unchecked(Box::into_raw(Box::new(mutator))) },
        }
    }

    /// Trigger a full collection, or join one already in flight.
    pub fn collect(&self, keep: &mut [&mut dyn Trace]) {
        self.perform_gc(keep);
    }

    pub fn register_global_root(&self, object: Gc<dyn Collectable>) -> GlobalRoot {
        self.heap_ref().register_global_root(object)
    }

    pub fn unregister_global_root(&self, root: GlobalRoot) {
        self.heap_ref().unregister_global_root(root);
    }

    pub fn create_stable_ref(&self, object: Gc<dyn Collectable>) -> StableRef {
        self.heap_ref().create_stable_ref(object)
    }

    pub fn dispose_stable_ref(&self, reference: StableRef) {
        self.heap_ref().dispose_stable_ref(reference);
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.heap_ref().stats().snapshot()
    }
}

impl Deref for MutatorRef {
    type Target = Mutator;
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.mutator.as_ptr() }
    }
}

impl DerefMut for MutatorRef {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.mutator.as_ptr() }
    }
}

impl Clone for MutatorRef {
    fn clone(&self) -> Self {
        unsafe {
            (*self.mutator.as_ptr()).rc += 1;
            Self {
                mutator: self.mutator,
            }
        }
    }
}

impl Drop for MutatorRef {
    fn drop(&mut self) {
        unsafe {
            (*self.mutator.as_ptr()).rc -= 1;
            if (*self.mutator.as_ptr()).rc == 0 {
                drop(Box::from_raw(self.mutator.as_ptr()));
            }
        }
    }
}

/// Attach the calling context to the heap with the given initial state:
/// `Runnable` for runtime-created threads, `Native` for threads arriving
/// from foreign code. Registration synchronizes with the collector, so a
/// runnable attach parks immediately if a rendezvous is in flight.
pub fn attach_thread(heap: &Arc<UnsafeCell<MarkSweep>>, initial_state: ThreadState) -> MutatorRef {
    attach_thread_with_join(heap, initial_state, Arc::new(JoinDataInternal::new()))
}

fn attach_thread_with_join(
    heap: &Arc<UnsafeCell<MarkSweep>>,
    initial_state: ThreadState,
    join_data: Arc<JoinDataInternal>,
) -> MutatorRef {
    if initial_state == ThreadState::Suspended {
        contract_violation(format_args!("threads may not attach in the Suspended state"));
    }
    let href = unsafe { &mut *heap.get() };
    let mut mutator = MutatorRef::new(Mutator::new(
        heap.clone(),
        href,
        initial_state,
        join_data,
    ));
    href.attach_mutator(&mut *mutator);
    if initial_state == ThreadState::Runnable {
        mutator.park_if_requested();
    }
    mutator
}

pub(crate) struct JoinDataInternal {
    running: Mutex<bool>,
    cv_stopped: Condvar,
}

impl JoinDataInternal {
    pub(crate) fn new() -> JoinDataInternal {
        JoinDataInternal {
            running: Mutex::new(true),
            cv_stopped: Condvar::new(),
        }
    }
}

/// Join handle for a spawned mutator. The blocking wait happens in `Native`
/// state so a joining thread never holds up a collection.
pub struct JoinData {
    pub(crate) internal: Arc<JoinDataInternal>,
}

impl JoinData {
    pub(crate) fn new() -> Self {
        Self {
            internal: Arc::new(JoinDataInternal::new()),
        }
    }

    pub fn join(self, mutator: &Mutator) {
        let old_state = mutator.switch_state(ThreadState::Native, true);
        {
            let mut running = self.internal.running.lock();
            while *running {
                self.internal.cv_stopped.wait(&mut running);
            }
        }
        mutator.switch_state(old_state, true);
    }
}

#[cold]
pub fn oom_abort() -> ! {
    eprintln!("OutOfMemory");
    std::process::abort();
}

#[cold]
pub(crate) fn contract_violation(args: std::fmt::Arguments) -> ! {
    eprintln!("contract violation: {}", args);
    std::process::abort();
}
