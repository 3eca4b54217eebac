//! # bolide
//!
//! A stop-the-world mark & sweep garbage collector with a cooperative
//! thread-suspension protocol.
//!
//! Any number of mutator threads share one heap. A mutator that crosses an
//! allocation or safepoint threshold takes the collector role, brings every
//! other mutator to a rendezvous (threads executing foreign code are exempt
//! while they stay [`ThreadState::Native`]), marks from the thread, global
//! and stable-reference root sets, sweeps, resumes the world and finally
//! runs finalizers for everything that died.
//!
//! ```
//! use bolide::{instantiate_marksweep, letroot, MarkSweepOptions};
//!
//! let mut mutator = instantiate_marksweep(MarkSweepOptions::default());
//! let stack = mutator.shadow_stack();
//! letroot!(value = stack, mutator.allocate(42u64));
//! mutator.collect(&mut []);
//! assert_eq!(**value, 42);
//! ```

#[macro_use]
pub mod shadow_stack;
pub mod api;
pub mod finalizer;
pub mod marksweep;
pub mod mutator;
pub mod roots;
pub mod space;
pub mod stats;
pub mod suspension;
pub mod utils;

mod mark;
mod sweep;

#[cfg(test)]
mod tests;

pub use mopa;

pub use api::{Collectable, Color, Finalize, Gc, Trace, Visitor};
pub use marksweep::{instantiate_marksweep, MarkSweep, MarkSweepOptions, SafepointScope};
pub use mutator::{attach_thread, JoinData, Mutator, MutatorRef, ThreadState};
pub use roots::{GlobalRoot, RootProvider, StableRef};
pub use stats::StatsSnapshot;
