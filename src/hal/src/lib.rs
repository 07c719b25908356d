//! kport kernel capability traits.
//!
//! This crate defines the downward contract of the portability layer: the
//! set of calls the layer makes into whatever real-time kernel sits below
//! it. Each backend implements [`Kernel`] once and is selected at build time
//! by type parameter.
//!
//! Optional primitives (native mutex, semaphore reset, ISR wake feedback,
//! heap) have default bodies and are advertised through [`Kernel::CAPS`];
//! the layer emulates whatever a kernel does not provide.

#![no_std]

use core::fmt;
use core::ptr::NonNull;

pub use kport_common::{KernelCaps, Wait};

/// Trait for the kernel's tick counter.
pub trait Timer {
    /// Ticks per second.
    const TICK_RATE_HZ: u32;

    /// Returns the number of ticks since the kernel started counting.
    ///
    /// Must be monotonic and must not block.
    fn current_ticks(&self) -> u64;
}

/// Trait for the scheduler controls shared by every kernel.
pub trait Scheduler {
    /// Starts scheduling. Tasks created earlier become eligible to run.
    fn start(&self);
    /// Returns `true` once [`Scheduler::start`] has run.
    fn is_running(&self) -> bool;
    /// Stops task switching. Nesting is only honored with
    /// [`KernelCaps::NESTED_SCHED_LOCK`].
    fn lock_scheduler(&self);
    /// Resumes task switching.
    fn unlock_scheduler(&self);
    /// Gives up the CPU to another ready task.
    fn yield_now(&self);
    /// Blocks the calling task for `ticks` ticks.
    fn sleep(&self, ticks: u32);

    /// Interrupt service routine prologue.
    fn enter_isr(&self) {}
    /// Interrupt service routine epilogue; requests a context switch when
    /// `switch_required` is set.
    fn exit_isr(&self, _switch_required: bool) {}
}

/// Task storage handed to [`Kernel::task_create`].
pub enum TaskMemory<K: Kernel> {
    /// Caller-owned control block and stack; the kernel must not allocate.
    Static {
        /// Control block storage.
        control_block: &'static mut K::ControlBlock,
        /// Stack storage, in native stack words.
        stack: &'static mut [K::StackWord],
    },
    /// Kernel-allocated control block and stack.
    Dynamic {
        /// Stack size in native units (bytes or words, kernel-defined).
        stack_size: usize,
    },
}

impl<K: Kernel> TaskMemory<K> {
    /// Stack size in native units.
    pub fn stack_size(&self) -> usize {
        match self {
            TaskMemory::Static { stack, .. } => stack.len(),
            TaskMemory::Dynamic { stack_size } => *stack_size,
        }
    }

    /// Returns `true` for caller-supplied storage.
    pub fn is_static(&self) -> bool {
        matches!(self, TaskMemory::Static { .. })
    }
}

impl<K: Kernel> fmt::Debug for TaskMemory<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskMemory::Static { stack, .. } => f
                .debug_struct("Static")
                .field("stack_size", &stack.len())
                .finish_non_exhaustive(),
            TaskMemory::Dynamic { stack_size } => f
                .debug_struct("Dynamic")
                .field("stack_size", stack_size)
                .finish(),
        }
    }
}

/// Trait for a real-time kernel driven by the portability layer.
///
/// Every method is callable from task context. Only
/// [`Kernel::semaphore_give_from_isr`] is callable from interrupt context.
pub trait Kernel: Timer + Scheduler + Sized + Sync + 'static {
    /// Primitives this kernel provides natively.
    const CAPS: KernelCaps;
    /// Number of kernel-tracked semaphores addressed by slot id, or `0` when
    /// the kernel allocates semaphore objects itself.
    const SEMAPHORE_SLOTS: usize = 0;
    /// Upper bound on concurrently existing tasks.
    const MAX_TASKS: usize = usize::MAX;
    /// Stack size used when a caller does not pick one, in native units.
    const DEFAULT_STACK_SIZE: usize;
    /// Priority for ordinary worker tasks.
    const PRIORITY_NORMAL: Self::Priority;
    /// Priority for latency-sensitive tasks.
    const PRIORITY_HIGH: Self::Priority;

    /// Native priority value, passed through untouched.
    type Priority: Copy + fmt::Debug + Send + Sync + 'static;
    /// Native task identifier.
    type TaskId: Copy + Eq + fmt::Debug + Send + Sync + 'static;
    /// Task control block for static allocation.
    type ControlBlock: Send + 'static;
    /// Unit of a statically allocated stack.
    type StackWord: Send + 'static;
    /// Native counting semaphore handle.
    type Semaphore: Send + Sync;
    /// Native mutex handle; `()` for kernels without one.
    type Mutex: Send + Sync;

    /// Creates a task running `entry(arg)`.
    ///
    /// Two-step kernels leave the task created but not started; see
    /// [`Kernel::task_start`].
    fn task_create<A: Send + 'static>(
        &self,
        name: &str,
        entry: fn(A),
        arg: A,
        memory: TaskMemory<Self>,
        priority: Self::Priority,
    ) -> Option<Self::TaskId>;

    /// Makes a created task eligible to run. Single-step kernels return `true`.
    fn task_start(&self, _task: Self::TaskId) -> bool {
        true
    }

    /// Deletes another task by identifier.
    fn task_delete(&self, task: Self::TaskId);

    /// Terminates the calling task.
    fn task_exit(&self) -> !;

    /// Creates a counting semaphore holding `initial` units, bounded by `max`
    /// where the kernel enforces bounds. `slot` carries the identifier picked
    /// by the layer on kernels with [`Kernel::SEMAPHORE_SLOTS`] > 0.
    fn semaphore_create(&self, slot: Option<u8>, initial: u32, max: u32)
        -> Option<Self::Semaphore>;

    /// Takes one unit, waiting as told. Returns `false` on timeout.
    fn semaphore_take(&self, sem: &Self::Semaphore, wait: Wait) -> bool;

    /// Gives one unit back. Returns `false` if the kernel rejected the call.
    fn semaphore_give(&self, sem: &Self::Semaphore) -> bool;

    /// ISR-safe give. Returns `true` when a task with a higher priority than
    /// the interrupted one became ready.
    fn semaphore_give_from_isr(&self, sem: &Self::Semaphore) -> bool;

    /// Clears the count in one call. Only meaningful with
    /// [`KernelCaps::SEMAPHORE_RESET`].
    fn semaphore_reset(&self, _sem: &Self::Semaphore) -> bool {
        false
    }

    /// Releases kernel resources held by a semaphore.
    fn semaphore_destroy(&self, sem: &Self::Semaphore);

    /// Creates an unlocked mutex. Only meaningful with
    /// [`KernelCaps::NATIVE_MUTEX`].
    fn mutex_create(&self) -> Option<Self::Mutex> {
        None
    }

    /// Blocks until the mutex is owned by the caller.
    fn mutex_lock(&self, _mutex: &Self::Mutex) {}

    /// Releases a mutex owned by the caller.
    fn mutex_unlock(&self, _mutex: &Self::Mutex) {}

    /// Releases kernel resources held by a mutex.
    fn mutex_destroy(&self, _mutex: &Self::Mutex) {}

    /// Allocates from the kernel heap. Only meaningful with [`KernelCaps::HEAP`].
    fn heap_alloc(&self, _size: usize) -> Option<NonNull<u8>> {
        None
    }

    /// Returns a block to the kernel heap.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`Kernel::heap_alloc`] on the same kernel and must
    /// not be used afterwards.
    unsafe fn heap_free(&self, _ptr: NonNull<u8>) {}
}
