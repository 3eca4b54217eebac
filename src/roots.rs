//! Root sources. Marking is polymorphic over [`RootProvider`]: anything that
//! can feed object references to a visitor. Two providers exist: the roots
//! of a single mutator (its shadow stack) and the process-wide roots (global
//! handles plus live stable references).

use std::ptr::NonNull;

use crate::api::{Collectable, Gc, HeapObjectHeader, Visitor};
use crate::mutator::Mutator;

/// Slot value standing in for a stable reference whose deletion has been
/// processed. Enumeration filters it alongside null, so a tombstoned slot
/// can never re-enter the root set before it is reused.
pub(crate) const TOMBSTONE: *mut HeapObjectHeader = usize::MAX as *mut HeapObjectHeader;

#[inline(always)]
pub(crate) fn is_null_or_marker(reference: *mut HeapObjectHeader) -> bool {
    reference.is_null() || reference == TOMBSTONE
}

/// A source of roots for one collection cycle.
pub trait RootProvider {
    fn provide(&mut self, vis: &mut dyn Visitor);
}

/// Roots owned by a single mutator thread: everything pinned on its shadow
/// stack. Only constructed under stop-the-world.
pub(crate) struct ThreadRoots<'a> {
    mutator: &'a Mutator,
}

impl<'a> ThreadRoots<'a> {
    pub(crate) fn new(mutator: &'a Mutator) -> Self {
        Self { mutator }
    }
}

impl RootProvider for ThreadRoots<'_> {
    fn provide(&mut self, vis: &mut dyn Visitor) {
        unsafe {
            self.mutator.shadow_stack().walk(|value| {
                value.trace(vis);
            });
        }
    }
}

/// Process-wide roots: registered global handles and the stable-reference
/// table. Dead and empty slots are filtered here, at push time.
pub(crate) struct ProcessRoots<'a> {
    globals: &'a GlobalRoots,
    stable: &'a StableRefRegistry,
}

impl<'a> ProcessRoots<'a> {
    pub(crate) fn new(globals: &'a GlobalRoots, stable: &'a StableRefRegistry) -> Self {
        Self { globals, stable }
    }
}

impl RootProvider for ProcessRoots<'_> {
    fn provide(&mut self, vis: &mut dyn Visitor) {
        for reference in self.globals.iter().chain(self.stable.iter()) {
            if is_null_or_marker(reference) {
                continue;
            }
            let mut object = unsafe { NonNull::new_unchecked(reference) };
            vis.mark_object(&mut object);
        }
    }
}

/// Handle to a registered global root.
#[derive(Debug)]
pub struct GlobalRoot(pub(crate) usize);

/// Slot table of process-wide roots: statics, interned values and the like.
/// Guarded by the heap's global lock; empty slots hold null.
pub struct GlobalRoots {
    slots: Vec<*mut HeapObjectHeader>,
    free: Vec<usize>,
}

impl GlobalRoots {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub(crate) fn insert(&mut self, object: Gc<dyn Collectable>) -> GlobalRoot {
        let reference = object.base.as_ptr();
        match self.free.pop() {
            Some(index) => {
                self.slots[index] = reference;
                GlobalRoot(index)
            }
            None => {
                self.slots.push(reference);
                GlobalRoot(self.slots.len() - 1)
            }
        }
    }

    pub(crate) fn remove(&mut self, root: GlobalRoot) {
        self.slots[root.0] = std::ptr::null_mut();
        self.free.push(root.0);
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = *mut HeapObjectHeader> + '_ {
        self.slots.iter().copied()
    }
}

/// Handle to a stable reference, typically held by foreign code.
#[derive(Debug)]
pub struct StableRef(pub(crate) usize);

/// Stable references pin objects for code outside the managed world.
/// Disposal is deferred: `dispose` only queues the slot, and the queue is
/// drained by `process_deletions` at the start of the next collection, so a
/// disposed reference stops acting as a root exactly once per cycle
/// semantics require it to.
pub struct StableRefRegistry {
    slots: Vec<*mut HeapObjectHeader>,
    free: Vec<usize>,
    pending: Vec<usize>,
}

impl StableRefRegistry {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            pending: Vec::new(),
        }
    }

    pub(crate) fn insert(&mut self, object: Gc<dyn Collectable>) -> StableRef {
        let reference = object.base.as_ptr();
        match self.free.pop() {
            Some(index) => {
                self.slots[index] = reference;
                StableRef(index)
            }
            None => {
                self.slots.push(reference);
                StableRef(self.slots.len() - 1)
            }
        }
    }

    pub(crate) fn queue_dispose(&mut self, reference: StableRef) {
        self.pending.push(reference.0);
    }

    /// Apply queued disposals. Runs under stop-the-world, before root
    /// enumeration.
    pub(crate) fn process_deletions(&mut self) {
        for index in self.pending.drain(..) {
            self.slots[index] = TOMBSTONE;
            self.free.push(index);
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = *mut HeapObjectHeader> + '_ {
        self.slots.iter().copied()
    }
}
