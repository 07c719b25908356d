//! Task lifecycle management.
//!
//! Tasks are native kernel threads. The layer only decides where their
//! storage comes from, hides two-step create/start kernels, and routes
//! self-deletion to the kernel's exit call.

use core::fmt;

use kport_common::{OsError, Result, SysTime};
use kport_hal::{Kernel, KernelCaps};
use log::{debug, warn};

pub use kport_hal::TaskMemory;

use crate::config;
use crate::os::Os;

/// Where a task's storage comes from, and at which priority it runs.
pub struct TaskParameters<K: Kernel> {
    /// Control block and stack.
    pub memory: TaskMemory<K>,
    /// Native priority, passed through untouched.
    pub priority: K::Priority,
}

impl<K: Kernel> TaskParameters<K> {
    /// Kernel-allocated storage with `stack_size` native units of stack.
    ///
    /// A `stack_size` of `0` picks [`Kernel::DEFAULT_STACK_SIZE`].
    pub fn dynamic(stack_size: usize, priority: K::Priority) -> Self {
        Self {
            memory: TaskMemory::Dynamic { stack_size },
            priority,
        }
    }

    /// Caller-owned storage; the kernel uses it as is and allocates nothing.
    pub fn with_static(
        control_block: &'static mut K::ControlBlock,
        stack: &'static mut [K::StackWord],
        priority: K::Priority,
    ) -> Self {
        Self {
            memory: TaskMemory::Static {
                control_block,
                stack,
            },
            priority,
        }
    }

    /// Dynamic storage at the kernel's default stack size and normal priority.
    pub fn default_for() -> Self {
        Self::dynamic(K::DEFAULT_STACK_SIZE, K::PRIORITY_NORMAL)
    }
}

impl<K: Kernel> Default for TaskParameters<K> {
    fn default() -> Self {
        Self::default_for()
    }
}

impl<K: Kernel> fmt::Debug for TaskParameters<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskParameters")
            .field("memory", &self.memory)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Task parameters in their loose form, as a C caller would fill them in.
///
/// Converts into [`TaskParameters`] with [`TryFrom`]: both storage fields set
/// means static allocation, neither means dynamic, anything else is
/// [`OsError::PartialStaticAllocation`].
pub struct RawTaskParameters<K: Kernel> {
    /// Control block storage, if statically allocated.
    pub control_block: Option<&'static mut K::ControlBlock>,
    /// Stack storage, if statically allocated.
    pub stack: Option<&'static mut [K::StackWord]>,
    /// Stack size in native units. For static storage, `0` means the whole
    /// buffer.
    pub stack_size: usize,
    /// Native priority.
    pub priority: K::Priority,
}

impl<K: Kernel> TryFrom<RawTaskParameters<K>> for TaskParameters<K> {
    type Error = OsError;

    fn try_from(raw: RawTaskParameters<K>) -> Result<Self> {
        match (raw.control_block, raw.stack) {
            (Some(control_block), Some(stack)) => {
                let stack = match raw.stack_size {
                    0 => stack,
                    size if size > stack.len() => return Err(OsError::InvalidParameter),
                    size => stack.split_at_mut(size).0,
                };
                Ok(Self::with_static(control_block, stack, raw.priority))
            }
            (None, None) => Ok(Self::dynamic(raw.stack_size, raw.priority)),
            _ => Err(OsError::PartialStaticAllocation),
        }
    }
}

/// Target of [`Os::delete_task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskRef<Id> {
    /// The calling task.
    Current,
    /// Another task.
    Handle(Id),
}

impl<K: Kernel> Os<K> {
    /// Create a task running `entry(arg)`.
    ///
    /// The returned handle refers to a task that is eligible to run (or will
    /// be once [`Os::start`] runs). On failure no task exists.
    pub fn create_task<A: Send + 'static>(
        &self,
        name: &str,
        entry: fn(A),
        arg: A,
        params: TaskParameters<K>,
    ) -> Result<K::TaskId> {
        let TaskParameters { memory, priority } = params;

        let required = if memory.is_static() {
            KernelCaps::STATIC_TASKS
        } else {
            KernelCaps::DYNAMIC_TASKS
        };
        if !K::CAPS.contains(required) {
            warn!("kport: task '{}' needs {:?}, not supported by kernel", name, required);
            return Err(OsError::InvalidParameter);
        }

        let memory = match memory {
            TaskMemory::Dynamic { stack_size: 0 } => TaskMemory::Dynamic {
                stack_size: K::DEFAULT_STACK_SIZE,
            },
            memory => memory,
        };
        let is_static = memory.is_static();

        let Some(task) = self.kernel().task_create(name, entry, arg, memory, priority) else {
            warn!("kport: kernel refused task '{}'", name);
            return Err(OsError::OutOfResources);
        };

        if !self.kernel().task_start(task) {
            warn!("kport: task '{}' created but could not be started", name);
            self.kernel().task_delete(task);
            return Err(OsError::KernelFailure);
        }

        debug!(
            "kport: task '{}' created ({:?}, {}, priority {:?})",
            name,
            task,
            if is_static { "static" } else { "dynamic" },
            priority
        );
        Ok(task)
    }

    /// Delete a task. [`TaskRef::Current`] does not return.
    pub fn delete_task(&self, target: TaskRef<K::TaskId>) {
        match target {
            TaskRef::Current => self.exit_task(),
            TaskRef::Handle(task) => {
                debug!("kport: deleting task {:?}", task);
                self.kernel().task_delete(task);
            }
        }
    }

    /// Terminate the calling task.
    pub fn exit_task(&self) -> ! {
        debug!("kport: task exiting");
        self.kernel().task_exit()
    }

    /// Block the calling task for at least `ms` milliseconds.
    pub fn delay_task(&self, ms: SysTime) {
        self.kernel().sleep(config::ms_to_ticks::<K>(ms));
    }

    /// Give up the CPU to another ready task.
    pub fn switch_task(&self) {
        self.kernel().yield_now();
    }
}
