//! The finalizer queue: cells detached by sweep, awaiting cleanup. The
//! queue preserves sweep's encounter order and is drained exactly once per
//! cycle, on the thread that triggered the collection, after every mutator
//! has been resumed. A finalizer is therefore free to allocate or even
//! trigger the next collection.

use std::ptr::null_mut;

use crate::api::HeapObjectHeader;
use crate::space::free_cell;

pub struct FinalizerQueue {
    head: *mut HeapObjectHeader,
    tail: *mut HeapObjectHeader,
    count: usize,
    bytes: usize,
}

impl FinalizerQueue {
    pub(crate) fn new() -> Self {
        Self {
            head: null_mut(),
            tail: null_mut(),
            count: 0,
            bytes: 0,
        }
    }

    pub(crate) fn push(&mut self, cell: *mut HeapObjectHeader) {
        unsafe {
            (*cell).next = null_mut();
            if self.head.is_null() {
                self.head = cell;
            } else {
                (*self.tail).next = cell;
            }
            self.tail = cell;
            self.count += 1;
            self.bytes += (*cell).cell_size;
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub(crate) fn bytes(&self) -> usize {
        self.bytes
    }

    /// Run each pending finalizer and free its cell. Returns how many
    /// objects were finalized.
    pub fn finalize(mut self) -> usize {
        let finalized = self.count;
        unsafe {
            let mut cell = self.head;
            while !cell.is_null() {
                let next = (*cell).next;
                (*cell).get_dyn().finalize();
                free_cell(cell);
                cell = next;
            }
        }
        self.head = null_mut();
        self.tail = null_mut();
        self.count = 0;
        finalized
    }
}

impl Drop for FinalizerQueue {
    /// A queue is normally consumed by `finalize`; if one is dropped with
    /// entries left, run them rather than leak the cells.
    fn drop(&mut self) {
        if self.head.is_null() {
            return;
        }
        let queue = std::mem::replace(self, FinalizerQueue::new());
        queue.finalize();
    }
}
