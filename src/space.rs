//! The object space: every live cell, chained into one intrusive list.
//!
//! Mutators allocate into a private buffer without taking any lock; the
//! buffer is spliced into the global list by `publish`, which runs either
//! under stop-the-world (the collector publishes on behalf of every stopped
//! mutator before marking) or on the owning thread as it detaches.

use std::alloc::Layout;
use std::ptr::null_mut;

use crate::api::{HeapObjectHeader, CELL_ALIGN};

/// Carve a fresh cell out of the global allocator. Returns null on
/// exhaustion; the caller decides whether that forces a collection.
pub(crate) fn allocate_cell(cell_size: usize) -> *mut HeapObjectHeader {
    let layout = Layout::from_size_align(cell_size, CELL_ALIGN).expect("invalid cell layout");
    unsafe { std::alloc::alloc(layout) as *mut HeapObjectHeader }
}

/// Return a cell to the global allocator. The header must still be intact:
/// its recorded size is what the allocation was carved with.
pub(crate) unsafe fn free_cell(cell: *mut HeapObjectHeader) {
    let layout = Layout::from_size_align((*cell).cell_size, CELL_ALIGN).expect("invalid cell layout");
    std::alloc::dealloc(cell as *mut u8, layout);
}

/// A mutator's unpublished allocations. Append-only and touched by the
/// owning thread alone, except under stop-the-world.
pub(crate) struct LocalBuffer {
    head: *mut HeapObjectHeader,
    tail: *mut HeapObjectHeader,
    bytes: usize,
    count: usize,
}

impl LocalBuffer {
    pub(crate) fn new() -> Self {
        Self {
            head: null_mut(),
            tail: null_mut(),
            bytes: 0,
            count: 0,
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
            self.bytes += (*cell).cell_size;
            self.count += 1;
        }
    }
}

/// The global live list plus its accounting.
pub struct ObjectSpace {
    pub(crate) head: *mut HeapObjectHeader,
    pub(crate) bytes: usize,
    pub(crate) count: usize,
}

impl ObjectSpace {
    pub(crate) fn new() -> Self {
        Self {
            head: null_mut(),
            bytes: 0,
            count: 0,
        }
    }

    /// Splice a mutator's local buffer onto the live list.
    pub(crate) fn publish(&mut self, local: &mut LocalBuffer) {
        if local.head.is_null() {
            return;
        }
        unsafe {
            (*local.tail).next = self.head;
        }
        self.head = local.head;
        self.bytes += local.bytes;
        self.count += local.count;
        *local = LocalBuffer::new();
    }

    pub fn live_bytes(&self) -> usize {
        self.bytes
    }

    pub fn live_objects(&self) -> usize {
        self.count
    }
}

impl Drop for ObjectSpace {
    /// Heap teardown: finalize and free whatever is still live, without a
    /// marking pass. Every mutator has detached (and therefore published)
    /// by the time the space drops.
    fn drop(&mut self) {
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
        self.bytes = 0;
        self.count = 0;
    }
}
