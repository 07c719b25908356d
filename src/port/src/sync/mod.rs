//! Synchronization primitives for kernel tasks.
//!
//! Every primitive sits on the kernel's counting semaphore (or its native
//! mutex), so the same code behaves alike on preemptive and cooperative
//! kernels. Blocking calls take a [`Timeout`](kport_common::Timeout) in
//! milliseconds and hand the kernel a tick count rounded up.
//!
//! # Primitives
//!
//! - [`Event`]: Auto-reset binary signal, settable from interrupts
//! - [`Semaphore`]: Counting semaphore for limiting concurrent access
//! - [`Mutex`]: Exclusive lock, native or emulated
//!
//! # Example
//!
//! ```ignore
//! use kport::sync::{Event, Mutex, Semaphore};
//!
//! let ready = Event::create(os)?;
//! ready.set();
//! assert!(ready.wait(Timeout::Millis(10)));
//!
//! // Mutex protecting shared state
//! let lock = Mutex::create(os)?;
//! {
//!     let _guard = lock.lock();
//!     // ... touch shared state ...
//! }
//!
//! // Semaphore limiting concurrency
//! let sem = Semaphore::create(os, 3)?;
//! if sem.wait(Timeout::Infinite) {
//!     // ... do work ...
//!     sem.release();
//! }
//! ```

mod event;
mod mutex;
mod raw;
mod semaphore;

pub use event::Event;
pub use mutex::{Mutex, MutexGuard};
pub use semaphore::{Semaphore, SemaphorePermit};
