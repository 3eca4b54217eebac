//! Sweep phase: one pass over the live list. White cells are unlinked into
//! the finalizer queue in encounter order; black survivors are recolored
//! white for the next cycle. Survivors keep their relative order.

use crate::api::Color;
use crate::finalizer::FinalizerQueue;
use crate::space::ObjectSpace;

pub(crate) fn sweep(space: &mut ObjectSpace) -> FinalizerQueue {
    let mut queue = FinalizerQueue::new();
    let mut link = &mut space.head as *mut *mut crate::api::HeapObjectHeader;

    unsafe {
        while !(*link).is_null() {
            let cell = *link;
            match (*cell).color() {
                Color::White => {
                    *link = (*cell).next;
                    space.bytes -= (*cell).cell_size;
                    space.count -= 1;
                    queue.push(cell);
                }
                Color::Black => {
                    (*cell).set_color(Color::White);
                    link = &mut (*cell).next as *mut *mut _;
                }
            }
        }
    }

    queue
}
