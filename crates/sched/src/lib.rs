#![cfg_attr(not(test), no_std)]

//! # Kestrel scheduler
//!
//! Processes own an address space; threads belong to a process and are what gets scheduled.
//! Scheduling is round-robin over a single FIFO queue. Priority does not change a thread's place
//! in the queue, only how many timer ticks it keeps the CPU once it is picked.
//!
//! The scheduler decides; it never switches. Callers get a [`Switch`] describing what to load and
//! perform the register and address-space switch themselves.

extern crate alloc;

mod process;
mod scheduler;
mod thread;

pub use process::{Process, ProcessId};
pub use scheduler::{Scheduler, SchedulerError, Switch};
pub use thread::{ExecutionMode, Priority, Thread, ThreadId, ThreadState};
