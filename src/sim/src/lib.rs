//! Simulated kernels for running kport on a host.
//!
//! Tasks are `std` threads. Two kernels with deliberately different
//! capability sets exercise both sides of every emulation in the layer:
//!
//! - [`ThreadKernel`]: preemptive, native mutex, native semaphore reset, ISR
//!   wake feedback, nesting scheduler lock, 1 kHz tick.
//! - [`PoolKernel`]: cooperative (one CPU token), fixed semaphore table
//!   addressed by `u8` id, two-step task creation, bounded task table,
//!   kernel heap, 100 Hz tick.
//!
//! # Limitations
//!
//! Host threads cannot be killed from outside. Deleting another task takes
//! effect the next time that task enters the kernel. A task leaves through
//! the exit call by unwinding to its trampoline.

mod cpu;
mod pool;
mod thread;

use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use lazy_static::lazy_static;

pub use pool::{PoolControlBlock, PoolKernel};
pub use thread::{SimMutex, SimSemaphore, ThreadControlBlock, ThreadKernel, ThreadTaskId};

lazy_static! {
    /// Process-wide tick source; every simulated kernel counts from here.
    static ref BOOT: Instant = Instant::now();
}

/// Smallest host stack a task thread gets, whatever the task asked for.
const MIN_HOST_STACK: usize = 256 * 1024;

/// Unwind payload of a task leaving through the kernel's exit call.
struct TaskExit;

/// Task trampoline: run `entry(arg)` and absorb an exit-call unwind.
fn run_task<A>(entry: fn(A), arg: A) {
    match panic::catch_unwind(AssertUnwindSafe(|| entry(arg))) {
        Ok(()) => {}
        Err(payload) if payload.is::<TaskExit>() => {}
        Err(payload) => panic::resume_unwind(payload),
    }
}

/// Leave the calling task. Does not run the panic hook.
fn exit_current() -> ! {
    panic::resume_unwind(Box::new(TaskExit))
}

fn ticks_since_boot(tick_rate_hz: u32) -> u64 {
    let micros = BOOT.elapsed().as_micros();
    (micros * u128::from(tick_rate_hz) / 1_000_000) as u64
}

fn ticks_to_duration(ticks: u32, tick_rate_hz: u32) -> Duration {
    Duration::from_micros(u64::from(ticks) * 1_000_000 / u64::from(tick_rate_hz))
}

fn host_stack_size(requested: usize) -> usize {
    requested.max(MIN_HOST_STACK)
}
