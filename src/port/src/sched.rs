//! Scheduler suspend/resume pairing.
//!
//! `suspend_all_tasks` / `resume_all_tasks` form a coarse critical section
//! around work that must not be preempted (heap calls, mostly). Kernels
//! differ on two points this module hides: the native lock may not nest, and
//! it may not be callable before the scheduler runs.

use core::sync::atomic::{AtomicUsize, Ordering};

use kport_hal::{Kernel, KernelCaps};
use log::warn;

/// Nesting depth of scheduler suspension for one kernel instance.
///
/// On kernels without [`KernelCaps::NESTED_SCHED_LOCK`] only the outermost
/// resume reaches the kernel.
pub(crate) struct SchedulerLock {
    depth: AtomicUsize,
}

impl SchedulerLock {
    pub(crate) const fn new() -> Self {
        Self {
            depth: AtomicUsize::new(0),
        }
    }

    pub(crate) fn suspend<K: Kernel>(&self, kernel: &K) {
        if !kernel.is_running() {
            return;
        }
        // The kernel lock is taken before the depth moves, so a nonzero
        // depth always means the scheduler is locked. A flat lock taken
        // again by its owner is a no-op.
        kernel.lock_scheduler();
        self.depth.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn resume<K: Kernel>(&self, kernel: &K) {
        if !kernel.is_running() {
            return;
        }
        let previous = self
            .depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |depth| depth.checked_sub(1));
        match previous {
            Ok(_) if K::CAPS.contains(KernelCaps::NESTED_SCHED_LOCK) => kernel.unlock_scheduler(),
            Ok(1) => kernel.unlock_scheduler(),
            Ok(_) => {}
            // Suspended before start, or unbalanced.
            Err(_) => warn!("resume_all_tasks without matching suspend_all_tasks"),
        }
    }

    /// Current nesting depth.
    pub(crate) fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kport_common::Wait;
    use kport_hal::{Scheduler, TaskMemory, Timer};
    use kport_sim::{PoolKernel, ThreadKernel};
    use std::sync::{Condvar, Mutex, PoisonError};
    use std::thread::{self, ThreadId};
    use std::time::Duration;

    /// Preemptive kernel whose scheduler lock does not nest and is slow to
    /// take. Other threads block while one holds it, like tasks that are
    /// not scheduled; a second lock by the holder is a no-op.
    #[derive(Default)]
    struct Flat {
        holder: Mutex<Option<ThreadId>>,
        released: Condvar,
    }

    impl Flat {
        fn held_by_me(&self) -> bool {
            let holder = self.holder.lock().unwrap_or_else(PoisonError::into_inner);
            *holder == Some(thread::current().id())
        }
    }

    impl Timer for Flat {
        const TICK_RATE_HZ: u32 = 1000;

        fn current_ticks(&self) -> u64 {
            0
        }
    }

    impl Scheduler for Flat {
        fn start(&self) {}

        fn is_running(&self) -> bool {
            true
        }

        fn lock_scheduler(&self) {
            if self.held_by_me() {
                return;
            }
            // Slow to take effect.
            thread::sleep(Duration::from_millis(100));
            let mut holder = self.holder.lock().unwrap_or_else(PoisonError::into_inner);
            while holder.is_some() {
                holder = self
                    .released
                    .wait(holder)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            *holder = Some(thread::current().id());
        }

        fn unlock_scheduler(&self) {
            *self.holder.lock().unwrap_or_else(PoisonError::into_inner) = None;
            self.released.notify_all();
        }

        fn yield_now(&self) {}

        fn sleep(&self, _ticks: u32) {}
    }

    impl Kernel for Flat {
        const CAPS: KernelCaps = KernelCaps::PREEMPTIVE.union(KernelCaps::DYNAMIC_TASKS);
        const DEFAULT_STACK_SIZE: usize = 1024;
        const PRIORITY_NORMAL: u8 = 1;
        const PRIORITY_HIGH: u8 = 2;

        type Priority = u8;
        type TaskId = u8;
        type ControlBlock = ();
        type StackWord = u8;
        type Semaphore = ();
        type Mutex = ();

        fn task_create<A: Send + 'static>(
            &self,
            _name: &str,
            _entry: fn(A),
            _arg: A,
            _memory: TaskMemory<Self>,
            _priority: u8,
        ) -> Option<u8> {
            None
        }

        fn task_delete(&self, _task: u8) {}

        fn task_exit(&self) -> ! {
            panic!("no tasks on this kernel")
        }

        fn semaphore_create(&self, _slot: Option<u8>, _initial: u32, _max: u32) -> Option<()> {
            None
        }

        fn semaphore_take(&self, _sem: &(), _wait: Wait) -> bool {
            false
        }

        fn semaphore_give(&self, _sem: &()) -> bool {
            false
        }

        fn semaphore_give_from_isr(&self, _sem: &()) -> bool {
            false
        }

        fn semaphore_destroy(&self, _sem: &()) {}
    }

    #[test]
    fn test_noop_before_start() {
        let kernel = PoolKernel::new();
        let lock = SchedulerLock::new();

        lock.suspend(&kernel);
        assert_eq!(lock.depth(), 0);
        lock.resume(&kernel);
        assert_eq!(lock.depth(), 0);
    }

    #[test]
    fn test_layer_counts_for_flat_kernel() {
        let kernel = PoolKernel::new();
        kernel.start();
        let lock = SchedulerLock::new();

        lock.suspend(&kernel);
        lock.suspend(&kernel);
        lock.suspend(&kernel);
        assert_eq!(lock.depth(), 3);

        lock.resume(&kernel);
        lock.resume(&kernel);
        assert_eq!(lock.depth(), 1);
        lock.resume(&kernel);
        assert_eq!(lock.depth(), 0);
    }

    #[test]
    fn test_unbalanced_resume_is_ignored() {
        let kernel = ThreadKernel::new();
        kernel.start();
        let lock = SchedulerLock::new();

        lock.resume(&kernel);
        assert_eq!(lock.depth(), 0);

        lock.suspend(&kernel);
        lock.suspend(&kernel);
        lock.resume(&kernel);
        lock.resume(&kernel);
        assert_eq!(lock.depth(), 0);
    }

    #[test]
    fn test_second_suspender_waits_for_kernel_lock() {
        let kernel = Flat::default();
        let lock = SchedulerLock::new();

        thread::scope(|scope| {
            scope.spawn(|| {
                lock.suspend(&kernel);
                assert!(kernel.held_by_me());
                thread::sleep(Duration::from_millis(50));
                lock.resume(&kernel);
            });

            // Lands while the first caller is still inside lock_scheduler.
            thread::sleep(Duration::from_millis(20));
            lock.suspend(&kernel);
            assert!(kernel.held_by_me());
            assert_eq!(lock.depth(), 1);
            lock.resume(&kernel);
        });
        assert_eq!(lock.depth(), 0);
    }

    #[test]
    fn test_contended_suspend_always_holds_kernel_lock() {
        let kernel = Flat::default();
        let lock = SchedulerLock::new();

        thread::scope(|scope| {
            for _ in 0..3 {
                scope.spawn(|| {
                    for _ in 0..3 {
                        lock.suspend(&kernel);
                        assert!(kernel.held_by_me());
                        lock.suspend(&kernel);
                        assert!(kernel.held_by_me());
                        lock.resume(&kernel);
                        assert!(kernel.held_by_me());
                        lock.resume(&kernel);
                    }
                });
            }
        });
        assert_eq!(lock.depth(), 0);
        assert!(!kernel.held_by_me());
    }
}
