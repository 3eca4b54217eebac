//! Mark phase. The gray set is an explicit stack of objects that have been
//! colored black but not yet scanned; each object enters it at most once, so
//! the stack is bounded by the number of reachable objects.

use std::ptr::NonNull;

use crate::api::{HeapObjectHeader, Visitor};

pub(crate) struct Marking {
    gray: Vec<*mut HeapObjectHeader>,
}

impl Marking {
    /// The driver hands the worklist storage back and forth between cycles
    /// so its capacity is reused.
    pub(crate) fn with_stack(mut gray: Vec<*mut HeapObjectHeader>) -> Self {
        gray.clear();
        Self { gray }
    }

    pub(crate) fn into_stack(self) -> Vec<*mut HeapObjectHeader> {
        self.gray
    }

    /// Drain the worklist: pop, scan the object's reference fields, repeat.
    /// Children are pushed by `mark_object` as tracing discovers them.
    pub(crate) fn run(&mut self) {
        unsafe {
            while let Some(object) = self.gray.pop() {
                (*object).get_dyn().trace(self);
            }
        }
    }
}

impl Visitor for Marking {
    fn mark_object(&mut self, root: &mut NonNull<HeapObjectHeader>) {
        let object = root.as_ptr();
        unsafe {
            if (*object).try_mark() {
                self.gray.push(object);
            }
        }
    }
}
