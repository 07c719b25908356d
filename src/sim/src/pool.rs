//! Cooperative kernel with fixed object tables.
//!
//! Semaphores live in a kernel table and are addressed by the `u8` id the
//! caller picks. Tasks are created stopped and started by a second call, and
//! only one of them runs at a time: the CPU changes hands when the running
//! task blocks, sleeps or yields.
//!
//! Threads that are not tasks (a test's main thread, say) run outside the
//! CPU token, like an interrupt or another core would.

use std::alloc::Layout;
use std::cell::{Cell, RefCell};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use kport_hal::{Kernel, KernelCaps, Scheduler, TaskMemory, Timer, Wait};
use linked_list_allocator::LockedHeap;
use log::{debug, trace, warn};

use crate::cpu::Cpu;
use crate::{exit_current, host_stack_size, run_task, ticks_since_boot, ticks_to_duration};

/// Number of kernel-tracked semaphores.
const SEMAPHORE_TABLE: usize = 32;

/// Tasks the kernel can track at once.
const TASK_TABLE: usize = 8;

/// Blocked takes re-check their semaphore at least this often.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Caller-owned control block; the kernel records the table slot in it.
#[derive(Debug, Default)]
pub struct PoolControlBlock {
    /// Task table slot occupied by the task.
    pub slot: Option<u8>,
}

struct PoolSemaphore {
    created: AtomicBool,
    count: AtomicU32,
    waiters: ArrayQueue<Thread>,
    /// Bumped after every pass that empties `waiters`.
    wakeups: AtomicU32,
}

impl PoolSemaphore {
    fn new() -> Self {
        Self {
            created: AtomicBool::new(false),
            count: AtomicU32::new(0),
            waiters: ArrayQueue::new(TASK_TABLE * 2),
            wakeups: AtomicU32::new(0),
        }
    }

    fn try_take(&self) -> bool {
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1))
            .is_ok()
    }

    fn give(&self) {
        let _ = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                Some(count.saturating_add(1))
            });
        self.wake_all();
    }

    fn wake_all(&self) {
        while let Some(waiter) = self.waiters.pop() {
            waiter.unpark();
        }
        self.wakeups.fetch_add(1, Ordering::AcqRel);
    }
}

type Entry = Box<dyn FnOnce() + Send>;

struct PoolTask {
    name: String,
    stack_bytes: usize,
    deleted: AtomicBool,
    entry: Mutex<Option<Entry>>,
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<PoolTask>>> = const { RefCell::new(None) };
    // Whether this thread holds the CPU, and whether it only borrowed it to
    // lock the scheduler from outside a task.
    static ON_CPU: Cell<bool> = const { Cell::new(false) };
    static OUTSIDER: Cell<bool> = const { Cell::new(false) };
}

fn current_task() -> Option<Arc<PoolTask>> {
    CURRENT.with(|current| current.borrow().clone())
}

struct Shared {
    started: Mutex<bool>,
    start_gate: Condvar,
    cpu: Cpu,
    sched_locked: AtomicBool,
    semaphores: [PoolSemaphore; SEMAPHORE_TABLE],
    tasks: spin::Mutex<[Option<Arc<PoolTask>>; TASK_TABLE]>,
    live: AtomicUsize,
    heap: LockedHeap,
}

impl Shared {
    fn wait_for_start(&self) {
        let mut started = self.started.lock().unwrap_or_else(PoisonError::into_inner);
        while !*started {
            started = self
                .start_gate
                .wait(started)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn checkpoint(&self) {
        if current_task().is_some_and(|task| task.deleted.load(Ordering::Acquire)) {
            exit_current();
        }
    }

    /// Give the CPU up if this thread holds it; returns whether it did.
    fn leave_cpu(&self) -> bool {
        if !ON_CPU.with(Cell::get) {
            return false;
        }
        ON_CPU.with(|on| on.set(false));
        self.cpu.release();
        true
    }

    fn enter_cpu(&self) {
        self.cpu.acquire();
        ON_CPU.with(|on| on.set(true));
    }

    /// Run `f` off the CPU, then queue up for it again.
    fn off_cpu<R>(&self, f: impl FnOnce() -> R) -> R {
        let left = self.leave_cpu();
        let result = f();
        if left {
            self.enter_cpu();
        }
        result
    }

    fn semaphore(&self, id: u8) -> Option<&PoolSemaphore> {
        self.semaphores
            .get(usize::from(id))
            .filter(|sem| sem.created.load(Ordering::Acquire))
    }

    fn task(&self, id: u8) -> Option<Arc<PoolTask>> {
        let index = usize::from(id).checked_sub(1)?;
        self.tasks.lock().get(index)?.clone()
    }

    /// Clear the table entry for `task` if it still holds it.
    fn forget(&self, task: &Arc<PoolTask>) {
        let mut tasks = self.tasks.lock();
        for slot in tasks.iter_mut() {
            if slot.as_ref().is_some_and(|t| Arc::ptr_eq(t, task)) {
                *slot = None;
            }
        }
    }
}

/// Releases the CPU when a task thread finishes, however it finishes.
struct CpuRelease<'a>(&'a Shared);

impl Drop for CpuRelease<'_> {
    fn drop(&mut self) {
        self.0.leave_cpu();
    }
}

/// Cooperative kernel with a semaphore table, a task table and its own heap.
#[derive(Clone)]
pub struct PoolKernel {
    shared: Arc<Shared>,
}

impl PoolKernel {
    /// Size of the kernel heap in bytes.
    pub const HEAP_SIZE: usize = 64 * 1024;

    /// Create a kernel with an empty heap arena of [`PoolKernel::HEAP_SIZE`].
    pub fn new() -> Self {
        let heap = LockedHeap::empty();
        let arena: &'static mut [u8] = Box::leak(vec![0u8; Self::HEAP_SIZE].into_boxed_slice());
        // SAFETY: the arena is leaked, so it stays valid and unaliased for the
        // life of the process, and it is handed to this heap only.
        unsafe {
            heap.lock().init(arena.as_mut_ptr(), arena.len());
        }

        Self {
            shared: Arc::new(Shared {
                started: Mutex::new(false),
                start_gate: Condvar::new(),
                cpu: Cpu::default(),
                sched_locked: AtomicBool::new(false),
                semaphores: std::array::from_fn(|_| PoolSemaphore::new()),
                tasks: spin::Mutex::new(Default::default()),
                live: AtomicUsize::new(0),
                heap,
            }),
        }
    }

    /// Tasks whose threads have not finished yet.
    pub fn live_tasks(&self) -> usize {
        self.shared.live.load(Ordering::Acquire)
    }

    /// Current count of semaphore `id`, or `None` if it does not exist.
    pub fn semaphore_count(&self, id: u8) -> Option<u32> {
        self.shared
            .semaphore(id)
            .map(|sem| sem.count.load(Ordering::Acquire))
    }

    fn heap_layout(size: usize) -> Option<Layout> {
        Layout::from_size_align(size.checked_add(HEAP_HEADER)?, HEAP_HEADER).ok()
    }
}

impl Default for PoolKernel {
    fn default() -> Self {
        Self::new()
    }
}

// Block size is stored in front of each heap block.
const HEAP_HEADER: usize = 16;

impl Timer for PoolKernel {
    const TICK_RATE_HZ: u32 = 100;

    fn current_ticks(&self) -> u64 {
        ticks_since_boot(Self::TICK_RATE_HZ)
    }
}

impl Scheduler for PoolKernel {
    fn start(&self) {
        *self
            .shared
            .started
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = true;
        self.shared.start_gate.notify_all();
    }

    fn is_running(&self) -> bool {
        *self
            .shared
            .started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Not nestable: one unlock undoes any number of locks.
    fn lock_scheduler(&self) {
        if !ON_CPU.with(Cell::get) {
            self.shared.enter_cpu();
            OUTSIDER.with(|outsider| outsider.set(true));
        }
        self.shared.sched_locked.store(true, Ordering::Release);
    }

    fn unlock_scheduler(&self) {
        self.shared.sched_locked.store(false, Ordering::Release);
        if OUTSIDER.with(|outsider| outsider.replace(false)) {
            self.shared.leave_cpu();
        }
    }

    fn yield_now(&self) {
        self.shared.checkpoint();
        if self.shared.sched_locked.load(Ordering::Acquire) {
            return;
        }
        self.shared.off_cpu(|| {});
        self.shared.checkpoint();
    }

    fn sleep(&self, ticks: u32) {
        self.shared.checkpoint();
        let duration = ticks_to_duration(ticks, Self::TICK_RATE_HZ);
        self.shared.off_cpu(|| thread::sleep(duration));
        self.shared.checkpoint();
    }
}

impl Kernel for PoolKernel {
    const CAPS: KernelCaps = KernelCaps::TASK_STORAGE.union(KernelCaps::HEAP);
    const SEMAPHORE_SLOTS: usize = SEMAPHORE_TABLE;
    const MAX_TASKS: usize = TASK_TABLE;
    const DEFAULT_STACK_SIZE: usize = 8 * 1024;
    // Lower number, higher priority.
    const PRIORITY_NORMAL: u8 = 3;
    const PRIORITY_HIGH: u8 = 2;

    type Priority = u8;
    type TaskId = u8;
    type ControlBlock = PoolControlBlock;
    type StackWord = u32;
    type Semaphore = u8;
    type Mutex = ();

    fn task_create<A: Send + 'static>(
        &self,
        name: &str,
        entry: fn(A),
        arg: A,
        memory: TaskMemory<Self>,
        _priority: u8,
    ) -> Option<u8> {
        let stack_bytes = match &memory {
            TaskMemory::Static { stack, .. } => core::mem::size_of_val(&**stack),
            TaskMemory::Dynamic { stack_size } => *stack_size,
        };
        let task = Arc::new(PoolTask {
            name: name.into(),
            stack_bytes,
            deleted: AtomicBool::new(false),
            entry: Mutex::new(Some(Box::new(move || run_task(entry, arg)))),
        });

        let index = {
            let mut tasks = self.shared.tasks.lock();
            let index = tasks.iter().position(Option::is_none)?;
            tasks[index] = Some(task);
            index
        };
        let id = u8::try_from(index + 1).ok()?;

        if let TaskMemory::Static { control_block, .. } = memory {
            control_block.slot = Some(id);
        }
        Some(id)
    }

    fn task_start(&self, id: u8) -> bool {
        let Some(task) = self.shared.task(id) else {
            return false;
        };
        let Some(entry) = task
            .entry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            // Already started.
            return false;
        };

        let shared = self.shared.clone();
        self.shared.live.fetch_add(1, Ordering::AcqRel);
        let spawned = thread::Builder::new()
            .name(task.name.clone())
            .stack_size(host_stack_size(task.stack_bytes))
            .spawn({
                let task = task.clone();
                move || {
                    CURRENT.with(|current| *current.borrow_mut() = Some(task.clone()));
                    shared.wait_for_start();
                    if !task.deleted.load(Ordering::Acquire) {
                        shared.enter_cpu();
                        let _release = CpuRelease(&shared);
                        entry();
                    }
                    shared.forget(&task);
                    shared.live.fetch_sub(1, Ordering::AcqRel);
                }
            });

        match spawned {
            Ok(_) => {
                debug!("sim: started task {} '{}'", id, task.name);
                true
            }
            Err(err) => {
                warn!("sim: could not start '{}': {}", task.name, err);
                self.shared.live.fetch_sub(1, Ordering::AcqRel);
                false
            }
        }
    }

    fn task_delete(&self, id: u8) {
        let Some(task) = self.shared.task(id) else {
            return;
        };
        task.deleted.store(true, Ordering::Release);
        self.shared.forget(&task);
        if current_task().is_some_and(|current| Arc::ptr_eq(&current, &task)) {
            exit_current();
        }
    }

    fn task_exit(&self) -> ! {
        exit_current()
    }

    fn semaphore_create(&self, slot: Option<u8>, initial: u32, _max: u32) -> Option<u8> {
        let id = slot?;
        let sem = self.shared.semaphores.get(usize::from(id))?;
        if sem.created.swap(true, Ordering::AcqRel) {
            warn!("sim: semaphore {} created twice", id);
            return None;
        }
        sem.count.store(initial, Ordering::Release);
        Some(id)
    }

    fn semaphore_take(&self, id: &u8, wait: Wait) -> bool {
        self.shared.checkpoint();
        let Some(sem) = self.shared.semaphore(*id) else {
            return false;
        };
        if sem.try_take() {
            return true;
        }
        let deadline = match wait {
            Wait::NoWait => return false,
            Wait::Forever => None,
            Wait::Ticks(ticks) => {
                Some(Instant::now() + ticks_to_duration(ticks, Self::TICK_RATE_HZ))
            }
        };

        // Queued as of this wake-up generation; a later generation means a
        // give emptied the queue and the thread has to enqueue again.
        let mut queued_at = None;
        let taken = self.shared.off_cpu(|| loop {
            let generation = sem.wakeups.load(Ordering::Acquire);
            if queued_at != Some(generation) {
                if sem.waiters.push(thread::current()).is_ok() {
                    queued_at = Some(generation);
                } else {
                    trace!("sim: waiter queue of semaphore {} full, polling", id);
                }
            }
            if sem.try_take() {
                break true;
            }
            let nap = match deadline {
                None => POLL_INTERVAL,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break false;
                    }
                    (deadline - now).min(POLL_INTERVAL)
                }
            };
            thread::park_timeout(nap);
        });
        self.shared.checkpoint();
        taken
    }

    fn semaphore_give(&self, id: &u8) -> bool {
        self.shared.checkpoint();
        self.semaphore_give_from_isr(id);
        self.shared.semaphore(*id).is_some()
    }

    /// No wake feedback: always `false`.
    fn semaphore_give_from_isr(&self, id: &u8) -> bool {
        if let Some(sem) = self.shared.semaphore(*id) {
            sem.give();
        }
        false
    }

    fn semaphore_destroy(&self, id: &u8) {
        if let Some(sem) = self.shared.semaphores.get(usize::from(*id)) {
            sem.created.store(false, Ordering::Release);
            sem.count.store(0, Ordering::Release);
            sem.wake_all();
        }
    }

    fn heap_alloc(&self, size: usize) -> Option<NonNull<u8>> {
        let layout = Self::heap_layout(size)?;
        let base = self.shared.heap.lock().allocate_first_fit(layout).ok()?;
        // SAFETY: the block is `HEAP_HEADER` bytes larger than asked for and
        // aligned to `HEAP_HEADER`, enough for a `usize`.
        unsafe {
            base.as_ptr().cast::<usize>().write(size);
            Some(NonNull::new_unchecked(base.as_ptr().add(HEAP_HEADER)))
        }
    }

    unsafe fn heap_free(&self, ptr: NonNull<u8>) {
        // SAFETY: the caller passes a pointer from `heap_alloc`, which sits
        // `HEAP_HEADER` bytes past its block and stored the size there.
        unsafe {
            let base = ptr.as_ptr().sub(HEAP_HEADER);
            let size = base.cast::<usize>().read();
            if let Some(layout) = Self::heap_layout(size) {
                self.shared
                    .heap
                    .lock()
                    .deallocate(NonNull::new_unchecked(base), layout);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_semaphore_ids_are_caller_chosen() {
        let kernel = PoolKernel::new();

        assert_eq!(kernel.semaphore_create(Some(5), 2, 1), Some(5));
        assert_eq!(kernel.semaphore_create(Some(5), 0, 1), None);
        assert_eq!(kernel.semaphore_create(None, 0, 1), None);
        assert_eq!(kernel.semaphore_create(Some(SEMAPHORE_TABLE as u8), 0, 1), None);

        // Bounds are not enforced here.
        assert_eq!(kernel.semaphore_count(5), Some(2));
        kernel.semaphore_destroy(&5);
        assert_eq!(kernel.semaphore_count(5), None);
        assert_eq!(kernel.semaphore_create(Some(5), 0, 1), Some(5));
    }

    #[test]
    fn test_counts_past_max() {
        let kernel = PoolKernel::new();
        let sem = kernel.semaphore_create(Some(0), 0, 1).unwrap();

        assert!(kernel.semaphore_give(&sem));
        assert!(kernel.semaphore_give(&sem));
        assert_eq!(kernel.semaphore_count(sem), Some(2));
        assert!(!kernel.semaphore_reset(&sem));
    }

    #[test]
    fn test_timed_take_expires() {
        let kernel = PoolKernel::new();
        let sem = kernel.semaphore_create(Some(1), 0, 1).unwrap();

        let before = Instant::now();
        assert!(!kernel.semaphore_take(&sem, Wait::Ticks(2)));
        assert!(before.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_blocked_taker_queues_once() {
        let kernel = PoolKernel::new();
        let sem = kernel.semaphore_create(Some(2), 0, 1).unwrap();
        let queued = || kernel.shared.semaphore(2).map(|sem| sem.waiters.len());

        thread::scope(|scope| {
            let taker = scope.spawn(|| kernel.semaphore_take(&sem, Wait::Ticks(50)));

            // Many poll intervals pass while the taker is blocked.
            thread::sleep(Duration::from_millis(150));
            assert_eq!(queued(), Some(1));

            assert!(kernel.semaphore_give(&sem));
            assert!(taker.join().unwrap());
        });
        assert!(queued().is_some_and(|len| len <= 1));
    }

    #[test]
    fn test_two_step_creation() {
        fn idle(_: ()) {}

        let kernel = PoolKernel::new();
        let id = kernel
            .task_create("idle", idle, (), TaskMemory::Dynamic { stack_size: 0 }, 3)
            .unwrap();
        assert_eq!(kernel.live_tasks(), 0);

        assert!(kernel.task_start(id));
        assert!(!kernel.task_start(id));
        assert_eq!(kernel.live_tasks(), 1);

        kernel.start();
        while kernel.live_tasks() != 0 {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(kernel.shared.task(id).is_none());
    }

    #[test]
    fn test_task_table_is_bounded() {
        fn idle(_: ()) {}

        let kernel = PoolKernel::new();
        for _ in 0..TASK_TABLE {
            assert!(kernel
                .task_create("idle", idle, (), TaskMemory::Dynamic { stack_size: 0 }, 3)
                .is_some());
        }
        assert!(kernel
            .task_create("idle", idle, (), TaskMemory::Dynamic { stack_size: 0 }, 3)
            .is_none());

        kernel.task_delete(1);
        assert_eq!(
            kernel.task_create("idle", idle, (), TaskMemory::Dynamic { stack_size: 0 }, 3),
            Some(1)
        );
    }

    #[test]
    fn test_heap_round_trip() {
        let kernel = PoolKernel::new();

        let block = kernel.heap_alloc(1000).unwrap();
        assert!(kernel.heap_alloc(PoolKernel::HEAP_SIZE).is_none());
        // SAFETY: allocated above.
        unsafe { kernel.heap_free(block) };
        assert!(kernel.heap_alloc(PoolKernel::HEAP_SIZE / 2).is_some());
    }
}
