//! Cooperative user-space fibers.
//!
//! A fiber is a unit of execution with its own stack, resumed and suspended
//! explicitly; nothing ever preempts it. This crate implements the fiber
//! control block and the machinery around it: stack allocation with the
//! control block carved from the high end of the fiber's own stack, an
//! index-linked registry of contexts, atomic handle counting, and a
//! single-threaded FIFO scheduler driving it all.
//!
//! ```rust
//! let sched = strand::Scheduler::new().unwrap();
//! let a = sched.spawn(|| println!("in fiber a")).unwrap();
//! let a2 = a.clone();
//! let _b = sched.spawn(move || {
//!     a2.join();
//!     assert!(a2.is_terminated());
//! });
//! sched.run();
//! assert!(a.is_terminated());
//! ```

#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]

#[macro_use]
extern crate log;

mod context;
mod error;
mod handle;
mod id;
mod list;
mod registry;
mod scheduler;
mod stack;
mod switch;

pub use crate::context::Role;
pub use crate::error::SpawnError;
pub use crate::handle::Fiber;
pub use crate::id::FiberId;
pub use crate::scheduler::{yield_now, Scheduler};
pub use crate::stack::{FixedSizeStack, StackAllocator, StackRegion, DEFAULT_STACK_SIZE};
