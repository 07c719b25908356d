//! The portability layer instance.

use kport_common::time::SysTime;
use kport_common::{OsError, Result};
use kport_hal::{Kernel, KernelCaps};
use log::debug;

use crate::config::{self, MAX_SLOTS};
use crate::id_alloc::{IdAllocator, SlotId};
use crate::sched::SchedulerLock;

/// One kernel behind the uniform task / synchronization / memory API.
///
/// Created once at boot. Synchronization objects borrow it, so it usually
/// lives in a `static` or is leaked; tasks receive `&'static Os<K>` through
/// their argument.
///
/// # Example
///
/// ```ignore
/// let os: &'static Os<MyKernel> = Box::leak(Box::new(Os::new(MyKernel::new())));
/// let event = Event::create(os)?;
/// os.start();
/// assert!(!event.wait(Timeout::Poll));
/// ```
pub struct Os<K: Kernel> {
    kernel: K,
    slots: IdAllocator<MAX_SLOTS>,
    scheduler: SchedulerLock,
}

impl<K: Kernel> Os<K> {
    /// Initialize the layer on top of `kernel`.
    pub fn new(kernel: K) -> Self {
        debug_assert!(
            K::CAPS.intersects(KernelCaps::TASK_STORAGE),
            "kernel supports neither static nor dynamic tasks"
        );
        let os = Self {
            kernel,
            slots: IdAllocator::with_limit(config::slot_count::<K>()),
            scheduler: SchedulerLock::new(),
        };
        os.slots.clear();
        debug!(
            "kport: kernel initialized (caps {:?}, {} semaphore slots)",
            K::CAPS,
            os.slots.capacity()
        );
        os
    }

    /// Start the scheduler.
    pub fn start(&self) {
        debug!(
            "kport: starting {} scheduler",
            if K::CAPS.contains(KernelCaps::PREEMPTIVE) {
                "preemptive"
            } else {
                "cooperative"
            }
        );
        self.kernel.start();
    }

    /// The kernel this layer drives.
    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// Milliseconds since the kernel started counting, wrapping at 2^32.
    pub fn now(&self) -> SysTime {
        self.now64() as SysTime
    }

    /// Milliseconds since the kernel started counting.
    pub fn now64(&self) -> u64 {
        config::ticks_to_ms::<K>(self.kernel.current_ticks())
    }

    /// Stop task switching until the matching [`Os::resume_all_tasks`].
    ///
    /// No-op before [`Os::start`]. Nests even where the kernel lock does not.
    pub fn suspend_all_tasks(&self) {
        self.scheduler.suspend(&self.kernel);
    }

    /// Undo one [`Os::suspend_all_tasks`].
    pub fn resume_all_tasks(&self) {
        self.scheduler.resume(&self.kernel);
    }

    /// Current scheduler suspension depth.
    pub fn suspend_depth(&self) -> usize {
        self.scheduler.depth()
    }

    /// Interrupt service routine prologue.
    pub fn enter_isr(&self) {
        self.kernel.enter_isr();
    }

    /// Interrupt service routine epilogue. Pass the OR of every
    /// `set_from_isr` result so the kernel can switch to the woken task.
    pub fn exit_isr(&self, higher_priority_woken: bool) {
        self.kernel.exit_isr(higher_priority_woken);
    }

    /// Claim a semaphore slot on kernels with a fixed table.
    pub(crate) fn claim_slot(&self) -> Result<Option<SlotId>> {
        if K::SEMAPHORE_SLOTS == 0 {
            return Ok(None);
        }
        self.slots.allocate().map(Some).ok_or(OsError::NoFreeSlot)
    }

    pub(crate) fn release_slot(&self, slot: Option<SlotId>) {
        if let Some(id) = slot {
            self.slots.free(id);
        }
    }

    /// Number of semaphore slots in use; always `0` on kernels without a table.
    pub fn slots_in_use(&self) -> usize {
        self.slots.in_use()
    }
}
