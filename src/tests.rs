//! End-to-end scenarios: the stop-the-world rendezvous under load, native
//! exemption, racing collectors, reachability and the trigger policies.

use std::mem::size_of;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Barrier,
};

use crate::api::{Collectable, Color, Finalize, Gc, HeapObjectHeader, Trace, Visitor, CELL_ALIGN};
use crate::marksweep::{instantiate_marksweep, MarkSweepOptions, SafepointScope};
use crate::mutator::{MutatorRef, ThreadState};
use crate::utils::align_usize;
use parking_lot::lock_api::RawMutex;

/// Options with both automatic triggers off: collections happen only when a
/// test asks for them.
fn manual_options() -> MarkSweepOptions {
    MarkSweepOptions {
        allocation_threshold_bytes: 0,
        safepoint_threshold: 0,
    }
}

fn thread_states(mutator: &MutatorRef) -> Vec<ThreadState> {
    let heap = mutator.heap_ref();
    heap.global_lock.lock();
    let states = heap
        .mutators
        .iter()
        .map(|&m| unsafe { (*m).state() })
        .collect();
    unsafe { heap.global_lock.unlock() };
    states
}

#[test]
fn simple_start_stop() {
    const THREADS: usize = 8;
    const ITERATIONS: usize = 10_000;

    let mutator = instantiate_marksweep(manual_options());
    let stop = Arc::new(AtomicBool::new(false));
    let ready = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();

    for _ in 0..THREADS {
        let stop = stop.clone();
        let ready = ready.clone();
        handles.push(mutator.spawn_mutator(move |worker| {
            ready.fetch_add(1, Ordering::SeqCst);
            while !stop.load(Ordering::SeqCst) {
                worker.park_if_requested();
            }
        }));
    }
    while ready.load(Ordering::SeqCst) < THREADS {
        std::thread::yield_now();
    }

    for _ in 0..ITERATIONS {
        assert!(mutator.heap_ref().suspend_threads(&mutator));
        assert!(mutator.is_suspension_requested());
        // Every thread, the requester included, reads as parked.
        for state in thread_states(&mutator) {
            assert_eq!(state, ThreadState::Suspended);
        }
        mutator.heap_ref().resume_threads(&mutator);
        assert!(!mutator.is_suspension_requested());
        for state in thread_states(&mutator) {
            assert_eq!(state, ThreadState::Runnable);
        }
    }

    stop.store(true, Ordering::SeqCst);
    for handle in handles {
        handle.join(&mutator);
    }
}

#[test]
fn native_threads_are_exempt_from_rendezvous() {
    const THREADS: usize = 4;

    let mutator = instantiate_marksweep(manual_options());
    let stop = Arc::new(AtomicBool::new(false));
    let entered = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();

    for _ in 0..THREADS {
        let stop = stop.clone();
        let entered = entered.clone();
        handles.push(mutator.spawn_mutator(move |worker| {
            worker.switch_state(ThreadState::Native, false);
            entered.fetch_add(1, Ordering::SeqCst);
            while !stop.load(Ordering::SeqCst) {
                std::hint::spin_loop();
            }
            // Re-entering managed code parks if a suspension is in flight.
            worker.switch_state(ThreadState::Runnable, false);
        }));
    }
    while entered.load(Ordering::SeqCst) < THREADS {
        std::thread::yield_now();
    }

    for _ in 0..100 {
        assert!(mutator.heap_ref().suspend_threads(&mutator));
        let states = thread_states(&mutator);
        // The workers never leave Native and are never seen Suspended.
        assert_eq!(
            states
                .iter()
                .filter(|s| **s == ThreadState::Native)
                .count(),
            THREADS
        );
        assert!(!states.contains(&ThreadState::Runnable));
        mutator.heap_ref().resume_threads(&mutator);
    }

    stop.store(true, Ordering::SeqCst);
    for handle in handles {
        handle.join(&mutator);
    }
}

#[test]
fn state_churn_under_repeated_suspension() {
    const ITERATIONS: usize = 10_000;

    let mutator = instantiate_marksweep(manual_options());
    let stop = Arc::new(AtomicBool::new(false));
    let transitions_ok = Arc::new(AtomicBool::new(true));

    let handle = {
        let stop = stop.clone();
        let transitions_ok = transitions_ok.clone();
        mutator.spawn_mutator(move |worker| {
            while !stop.load(Ordering::Relaxed) {
                let previous = worker.switch_state(ThreadState::Native, false);
                if previous != ThreadState::Runnable {
                    transitions_ok.store(false, Ordering::SeqCst);
                    break;
                }
                let previous = worker.switch_state(ThreadState::Runnable, false);
                if previous != ThreadState::Native {
                    transitions_ok.store(false, Ordering::SeqCst);
                    break;
                }
            }
        })
    };

    for _ in 0..ITERATIONS {
        assert!(mutator.heap_ref().suspend_threads(&mutator));
        assert!(mutator.is_suspension_requested());
        mutator.heap_ref().resume_threads(&mutator);
        assert!(!mutator.is_suspension_requested());
    }

    stop.store(true, Ordering::Relaxed);
    handle.join(&mutator);
    assert!(transitions_ok.load(Ordering::SeqCst));
}

#[test]
fn racing_collectors_elect_exactly_one_winner() {
    const ROUNDS: usize = 100;

    let mutator = instantiate_marksweep(manual_options());
    let barrier = Arc::new(Barrier::new(2));
    let worker_ran = Arc::new(AtomicUsize::new(0));
    let loser_parked = Arc::new(AtomicBool::new(true));

    let handle = {
        let barrier = barrier.clone();
        let worker_ran = worker_ran.clone();
        let loser_parked = loser_parked.clone();
        mutator.spawn_mutator(move |worker| {
            for _ in 0..ROUNDS {
                barrier.wait();
                if worker.heap_ref().perform_full_gc(&worker, &mut []) {
                    worker_ran.fetch_add(1, Ordering::SeqCst);
                } else if !worker.park_if_requested() {
                    loser_parked.store(false, Ordering::SeqCst);
                }
            }
        })
    };

    let mut main_ran = 0u64;
    for _ in 0..ROUNDS {
        barrier.wait();
        if mutator.heap_ref().perform_full_gc(&mutator, &mut []) {
            main_ran += 1;
        } else {
            // Lost the race: the winner is mid-cycle and waits for us.
            assert!(mutator.park_if_requested());
        }
    }
    handle.join(&mutator);

    let total = main_ran + worker_ran.load(Ordering::SeqCst) as u64;
    assert!(total >= ROUNDS as u64);
    assert!(total <= 2 * ROUNDS as u64);
    assert!(loser_parked.load(Ordering::SeqCst));
    assert_eq!(mutator.stats().collections, total);
}

struct Node {
    next: Option<Gc<Node>>,
    value: i32,
}

unsafe impl Trace for Node {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        self.next.trace(vis);
    }
}
unsafe impl Finalize for Node {}
impl Collectable for Node {}

#[test]
fn reachable_chain_survives_detached_object_is_finalized_once() {
    static FINALIZED: AtomicUsize = AtomicUsize::new(0);

    struct Tracked;
    unsafe impl Trace for Tracked {}
    unsafe impl Finalize for Tracked {
        unsafe fn finalize(&mut self) {
            FINALIZED.fetch_add(1, Ordering::SeqCst);
        }
    }
    impl Collectable for Tracked {}

    let mut mutator = instantiate_marksweep(manual_options());
    let stack = mutator.shadow_stack();

    let c = mutator.allocate(Node {
        next: None,
        value: 3,
    });
    let b = mutator.allocate(Node {
        next: Some(c),
        value: 2,
    });
    letroot!(
        a = stack,
        mutator.allocate(Node {
            next: Some(b),
            value: 1,
        })
    );
    mutator.allocate(Tracked);

    mutator.collect(&mut []);

    assert_eq!(FINALIZED.load(Ordering::SeqCst), 1);
    assert_eq!(mutator.heap_ref().live_objects(), 3);

    // The chain survived intact, and every survivor is white again.
    assert_eq!(a.value, 1);
    let b = a.next.unwrap();
    assert_eq!(b.value, 2);
    let c = b.next.unwrap();
    assert_eq!(c.value, 3);
    assert!(c.next.is_none());
    unsafe {
        for gc in [*a, b, c] {
            assert_eq!((*gc.base.as_ptr()).color(), Color::White);
        }
    }

    // A second cycle must not finalize the dead object again.
    mutator.collect(&mut []);
    assert_eq!(FINALIZED.load(Ordering::SeqCst), 1);
}

#[test]
fn allocation_threshold_triggers_exactly_one_collection() {
    const MIB: usize = 1024 * 1024;

    struct Payload {
        _data: [u8; 224],
    }
    unsafe impl Trace for Payload {}
    unsafe impl Finalize for Payload {}
    impl Collectable for Payload {}

    let mut mutator = instantiate_marksweep(MarkSweepOptions {
        allocation_threshold_bytes: MIB,
        safepoint_threshold: 0,
    });

    let cell = align_usize(size_of::<Payload>() + size_of::<HeapObjectHeader>(), CELL_ALIGN);
    assert_eq!(cell, 256);
    let count = MIB / cell;

    for index in 0..count {
        if index + 1 < count {
            assert_eq!(mutator.stats().collections, 0);
        }
        mutator.allocate(Payload { _data: [0; 224] });
    }
    assert_eq!(mutator.stats().collections, 1);
}

#[test]
fn safepoint_weights_summing_to_threshold_trigger_once() {
    let mutator = instantiate_marksweep(MarkSweepOptions {
        allocation_threshold_bytes: 0,
        safepoint_threshold: 1_000,
    });

    for _ in 0..999 {
        mutator.safepoint(1);
    }
    assert_eq!(mutator.stats().collections, 0);
    mutator.safepoint(1);
    assert_eq!(mutator.stats().collections, 1);

    // The triggering weight carries into the next period: one collection
    // per 1000 weight, with no drift.
    for _ in 0..998 {
        mutator.safepoint(1);
    }
    assert_eq!(mutator.stats().collections, 1);
    mutator.safepoint(1);
    assert_eq!(mutator.stats().collections, 2);
}

#[test]
fn heavy_safepoint_weights_accumulate() {
    let mutator = instantiate_marksweep(MarkSweepOptions {
        allocation_threshold_bytes: 0,
        safepoint_threshold: 1_000,
    });

    mutator.safepoint(500);
    assert_eq!(mutator.stats().collections, 0);
    mutator.safepoint(500);
    assert_eq!(mutator.stats().collections, 1);
}

#[test]
fn zero_thresholds_still_poll_the_suspension_flag() {
    let mutator = instantiate_marksweep(manual_options());
    let stop = Arc::new(AtomicBool::new(false));
    let handle = {
        let stop = stop.clone();
        mutator.spawn_mutator(move |worker| {
            while !stop.load(Ordering::Relaxed) {
                // Disabled thresholds never trigger a collection from here,
                // but the poll must still honor a pending suspension.
                worker.safepoint(1);
            }
        })
    };

    for _ in 0..100 {
        let scope = SafepointScope::new(mutator.clone()).unwrap();
        drop(scope);
    }
    assert_eq!(mutator.stats().collections, 0);

    stop.store(true, Ordering::Relaxed);
    handle.join(&mutator);
}

#[test]
fn stable_refs_pin_objects_until_deletions_are_processed() {
    static FINALIZED: AtomicUsize = AtomicUsize::new(0);

    struct Pinned;
    unsafe impl Trace for Pinned {}
    unsafe impl Finalize for Pinned {
        unsafe fn finalize(&mut self) {
            FINALIZED.fetch_add(1, Ordering::SeqCst);
        }
    }
    impl Collectable for Pinned {}

    let mut mutator = instantiate_marksweep(manual_options());
    let object = mutator.allocate(Pinned);
    let reference = mutator.create_stable_ref(object.to_dyn());

    mutator.collect(&mut []);
    assert_eq!(FINALIZED.load(Ordering::SeqCst), 0);

    mutator.dispose_stable_ref(reference);
    // The queued deletion is applied at the start of this cycle, so the
    // object is no longer a root and dies now.
    mutator.collect(&mut []);
    assert_eq!(FINALIZED.load(Ordering::SeqCst), 1);
}

#[test]
fn global_roots_pin_objects_until_unregistered() {
    let mut mutator = instantiate_marksweep(manual_options());
    let object = mutator.allocate(7i32);
    let root = mutator.register_global_root(object.to_dyn());

    mutator.collect(&mut []);
    assert_eq!(mutator.heap_ref().live_objects(), 1);
    assert_eq!(*object, 7);

    mutator.unregister_global_root(root);
    mutator.collect(&mut []);
    assert_eq!(mutator.heap_ref().live_objects(), 0);
}

#[test]
fn extra_roots_passed_to_collect_survive() {
    let mut mutator = instantiate_marksweep(manual_options());
    let mut object = mutator.allocate(Node {
        next: None,
        value: 11,
    });

    mutator.collect(&mut [&mut object]);
    assert_eq!(mutator.heap_ref().live_objects(), 1);
    assert_eq!(object.value, 11);

    mutator.collect(&mut []);
    assert_eq!(mutator.heap_ref().live_objects(), 0);
}
