//! Kernel capability flags.

use bitflags::bitflags;

bitflags! {
    /// Optional primitives a kernel provides natively.
    ///
    /// Anything missing here is emulated by the portability layer on top of
    /// the kernel's counting semaphore.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct KernelCaps: u32 {
        /// Tasks are preempted; without it a task only loses the CPU at
        /// suspension points and explicit yields.
        const PREEMPTIVE        = 1 << 0;
        /// A mutex object distinct from the semaphore.
        const NATIVE_MUTEX      = 1 << 1;
        /// A call that clears a semaphore count in one step.
        const SEMAPHORE_RESET   = 1 << 2;
        /// ISR-side give reports whether a higher-priority task woke.
        const ISR_FEEDBACK      = 1 << 3;
        /// The scheduler lock counts nested lock/unlock pairs itself.
        const NESTED_SCHED_LOCK = 1 << 4;
        /// Tasks can run on caller-supplied control block and stack.
        const STATIC_TASKS      = 1 << 5;
        /// Tasks can have their control block and stack allocated by the kernel.
        const DYNAMIC_TASKS     = 1 << 6;
        /// The kernel ships its own heap.
        const HEAP              = 1 << 7;
        /// Heap calls may run concurrently without locking the scheduler.
        const REENTRANT_HEAP    = 1 << 8; // Skips the suspend/resume bracket
    }
}

impl KernelCaps {
    /// Flags every task-capable kernel is expected to advertise at least one of.
    pub const TASK_STORAGE: Self = Self::STATIC_TASKS.union(Self::DYNAMIC_TASKS);
}
