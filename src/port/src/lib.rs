//! kport: a thin RTOS portability layer.
//!
//! Application code written against [`Os`] runs unchanged on any kernel that
//! implements [`kport_hal::Kernel`]. The layer provides tasks, events,
//! counting semaphores, mutexes, scheduler suspension, a millisecond clock
//! and a heap front end, and emulates whatever the kernel lacks.
//!
//! # Architecture
//!
//! - `config`: Limits and tick conversion helpers
//! - `id_alloc`: Semaphore slot table for kernels that address semaphores by id
//! - `os`: The layer instance, time and scheduler suspension
//! - `sync`: Event, semaphore and mutex
//! - `task`: Task creation, deletion, delay and yield
//! - `mem`: Heap allocation bracketed against task switches
//!
//! # Safety
//!
//! This is a `#![no_std]` crate. The only unsafe code is the heap front end,
//! whose safety requirements are documented on [`Os::free_mem`].

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod config;
pub mod id_alloc;
pub mod mem;
mod os;
mod sched;
pub mod sync;
pub mod task;

pub use kport_common::time::time_compare;
pub use kport_common::{KernelCaps, OsError, Result, SysTime, Timeout, Wait};
pub use kport_hal::{Kernel, Scheduler, TaskMemory, Timer};
pub use os::Os;
pub use sync::{Event, Mutex, MutexGuard, Semaphore, SemaphorePermit};
pub use task::{RawTaskParameters, TaskParameters, TaskRef};
