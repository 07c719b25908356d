//! Preemptive kernel on plain host threads.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Instant;

use kport_hal::{Kernel, KernelCaps, Scheduler, TaskMemory, Timer, Wait};
use log::{debug, warn};

use crate::{exit_current, host_stack_size, run_task, ticks_since_boot, ticks_to_duration};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadTaskId(u32);

impl ThreadTaskId {
    fn new() -> Self {
        static NEXT_ID: AtomicU32 = AtomicU32::new(1);
        ThreadTaskId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Caller-owned control block; the kernel records the task in it.
#[derive(Debug, Default)]
pub struct ThreadControlBlock {
    /// Task occupying this block.
    pub task: Option<ThreadTaskId>,
    /// Priority it was created with.
    pub priority: u8,
}

struct TaskRecord {
    id: ThreadTaskId,
    priority: u8,
    deleted: AtomicBool,
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<TaskRecord>>> = const { RefCell::new(None) };
}

fn current_task() -> Option<Arc<TaskRecord>> {
    CURRENT.with(|current| current.borrow().clone())
}

/// Priority of the calling thread; `0` outside tasks.
fn current_priority() -> u8 {
    current_task().map_or(0, |task| task.priority)
}

#[derive(Default)]
struct SchedLock {
    owner: Option<ThreadId>,
    depth: usize,
}

#[derive(Default)]
struct Shared {
    started: Mutex<bool>,
    start_gate: Condvar,
    sched: Mutex<SchedLock>,
    sched_released: Condvar,
    tasks: spin::Mutex<BTreeMap<ThreadTaskId, Arc<TaskRecord>>>,
    live: AtomicUsize,
}

impl Shared {
    fn wait_for_start(&self) {
        let mut started = lock(&self.started);
        while !*started {
            started = self
                .start_gate
                .wait(started)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Kernel entry: wait out another thread's scheduler lock, then honor a
    /// pending deletion of the calling task.
    fn checkpoint(&self) {
        let me = thread::current().id();
        let mut sched = lock(&self.sched);
        while sched.owner.is_some_and(|owner| owner != me) {
            sched = self
                .sched_released
                .wait(sched)
                .unwrap_or_else(PoisonError::into_inner);
        }
        drop(sched);

        if current_task().is_some_and(|task| task.deleted.load(Ordering::Acquire)) {
            exit_current();
        }
    }
}

#[derive(Default)]
struct Count {
    count: u32,
    max: u32,
    waiting: Vec<u8>,
}

/// Counting semaphore with a bound, a one-call reset and waiter priorities.
pub struct SimSemaphore {
    state: Mutex<Count>,
    available: Condvar,
}

impl SimSemaphore {
    fn new(initial: u32, max: u32) -> Self {
        Self {
            state: Mutex::new(Count {
                count: initial.min(max),
                max,
                waiting: Vec::new(),
            }),
            available: Condvar::new(),
        }
    }

    /// Units currently available.
    pub fn count(&self) -> u32 {
        lock(&self.state).count
    }

    /// Threads currently blocked in a take.
    pub fn waiters(&self) -> usize {
        lock(&self.state).waiting.len()
    }

    fn take(&self, wait: Wait, tick_rate_hz: u32) -> bool {
        let mut state = lock(&self.state);
        if state.count > 0 {
            state.count -= 1;
            return true;
        }
        let deadline = match wait {
            Wait::NoWait => return false,
            Wait::Forever => None,
            Wait::Ticks(ticks) => Some(Instant::now() + ticks_to_duration(ticks, tick_rate_hz)),
        };

        let priority = current_priority();
        state.waiting.push(priority);
        let taken = loop {
            if state.count > 0 {
                state.count -= 1;
                break true;
            }
            match deadline {
                None => {
                    state = self
                        .available
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break false;
                    }
                    state = self
                        .available
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        };
        if let Some(index) = state.waiting.iter().position(|&p| p == priority) {
            state.waiting.swap_remove(index);
        }
        taken
    }

    /// Returns whether the unit was added and the highest waiting priority.
    fn give(&self) -> (bool, Option<u8>) {
        let mut state = lock(&self.state);
        if state.count >= state.max {
            return (false, None);
        }
        state.count += 1;
        self.available.notify_one();
        (true, state.waiting.iter().copied().max())
    }

    fn reset(&self) {
        lock(&self.state).count = 0;
    }
}

/// Owner-tracked, non-reentrant mutex.
#[derive(Default)]
pub struct SimMutex {
    owner: Mutex<Option<ThreadId>>,
    released: Condvar,
}

impl SimMutex {
    /// Returns `true` while some thread owns the mutex.
    pub fn is_locked(&self) -> bool {
        lock(&self.owner).is_some()
    }

    fn lock(&self) {
        let me = thread::current().id();
        let mut owner = lock(&self.owner);
        if *owner == Some(me) {
            warn!("sim: recursive mutex lock, deadlocking like the hardware would");
        }
        while owner.is_some() {
            owner = self
                .released
                .wait(owner)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *owner = Some(me);
    }

    fn unlock(&self) {
        let me = thread::current().id();
        let mut owner = lock(&self.owner);
        if *owner != Some(me) {
            warn!("sim: mutex unlocked by a thread that does not own it");
            return;
        }
        *owner = None;
        self.released.notify_one();
    }
}

/// Preemptive priority kernel: every task is an independent host thread.
///
/// Priorities are recorded for ISR wake feedback only; the host scheduler
/// decides who runs.
#[derive(Clone, Default)]
pub struct ThreadKernel {
    shared: Arc<Shared>,
}

impl ThreadKernel {
    /// Create a kernel; tasks run once [`Scheduler::start`] is called.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tasks whose threads have not finished yet.
    pub fn live_tasks(&self) -> usize {
        self.shared.live.load(Ordering::Acquire)
    }
}

impl Timer for ThreadKernel {
    const TICK_RATE_HZ: u32 = 1000;

    fn current_ticks(&self) -> u64 {
        ticks_since_boot(Self::TICK_RATE_HZ)
    }
}

impl Scheduler for ThreadKernel {
    fn start(&self) {
        *lock(&self.shared.started) = true;
        self.shared.start_gate.notify_all();
    }

    fn is_running(&self) -> bool {
        *lock(&self.shared.started)
    }

    fn lock_scheduler(&self) {
        let me = thread::current().id();
        let mut sched = lock(&self.shared.sched);
        while sched.owner.is_some_and(|owner| owner != me) {
            sched = self
                .shared
                .sched_released
                .wait(sched)
                .unwrap_or_else(PoisonError::into_inner);
        }
        sched.owner = Some(me);
        sched.depth += 1;
    }

    fn unlock_scheduler(&self) {
        let me = thread::current().id();
        let mut sched = lock(&self.shared.sched);
        if sched.owner != Some(me) {
            warn!("sim: scheduler unlocked by a thread that does not hold it");
            return;
        }
        sched.depth -= 1;
        if sched.depth == 0 {
            sched.owner = None;
            self.shared.sched_released.notify_all();
        }
    }

    fn yield_now(&self) {
        self.shared.checkpoint();
        thread::yield_now();
    }

    fn sleep(&self, ticks: u32) {
        self.shared.checkpoint();
        thread::sleep(ticks_to_duration(ticks, Self::TICK_RATE_HZ));
        self.shared.checkpoint();
    }

    fn exit_isr(&self, switch_required: bool) {
        if switch_required {
            thread::yield_now();
        }
    }
}

impl Kernel for ThreadKernel {
    const CAPS: KernelCaps = KernelCaps::PREEMPTIVE
        .union(KernelCaps::NATIVE_MUTEX)
        .union(KernelCaps::SEMAPHORE_RESET)
        .union(KernelCaps::ISR_FEEDBACK)
        .union(KernelCaps::NESTED_SCHED_LOCK)
        .union(KernelCaps::TASK_STORAGE)
        .union(KernelCaps::REENTRANT_HEAP);
    const DEFAULT_STACK_SIZE: usize = 16 * 1024;
    const PRIORITY_NORMAL: u8 = 1;
    const PRIORITY_HIGH: u8 = 2;

    type Priority = u8;
    type TaskId = ThreadTaskId;
    type ControlBlock = ThreadControlBlock;
    type StackWord = u32;
    type Semaphore = SimSemaphore;
    type Mutex = SimMutex;

    fn task_create<A: Send + 'static>(
        &self,
        name: &str,
        entry: fn(A),
        arg: A,
        memory: TaskMemory<Self>,
        priority: u8,
    ) -> Option<ThreadTaskId> {
        let id = ThreadTaskId::new();
        let stack_bytes = match memory {
            TaskMemory::Static {
                control_block,
                stack,
            } => {
                control_block.task = Some(id);
                control_block.priority = priority;
                core::mem::size_of_val(stack)
            }
            TaskMemory::Dynamic { stack_size } => stack_size,
        };

        let record = Arc::new(TaskRecord {
            id,
            priority,
            deleted: AtomicBool::new(false),
        });
        self.shared.tasks.lock().insert(id, record.clone());
        self.shared.live.fetch_add(1, Ordering::AcqRel);

        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name(name.into())
            .stack_size(host_stack_size(stack_bytes))
            .spawn(move || {
                CURRENT.with(|current| *current.borrow_mut() = Some(record.clone()));
                shared.wait_for_start();
                if !record.deleted.load(Ordering::Acquire) {
                    run_task(entry, arg);
                }
                shared.tasks.lock().remove(&record.id);
                shared.live.fetch_sub(1, Ordering::AcqRel);
            });

        match spawned {
            Ok(_) => {
                debug!("sim: spawned task {:?} '{}'", id, name);
                Some(id)
            }
            Err(err) => {
                warn!("sim: could not spawn '{}': {}", name, err);
                self.shared.tasks.lock().remove(&id);
                self.shared.live.fetch_sub(1, Ordering::AcqRel);
                None
            }
        }
    }

    fn task_delete(&self, task: ThreadTaskId) {
        let Some(record) = self.shared.tasks.lock().get(&task).cloned() else {
            return;
        };
        record.deleted.store(true, Ordering::Release);
        if current_task().is_some_and(|current| current.id == task) {
            exit_current();
        }
    }

    fn task_exit(&self) -> ! {
        exit_current()
    }

    fn semaphore_create(&self, _slot: Option<u8>, initial: u32, max: u32) -> Option<SimSemaphore> {
        (max > 0).then(|| SimSemaphore::new(initial, max))
    }

    fn semaphore_take(&self, sem: &SimSemaphore, wait: Wait) -> bool {
        self.shared.checkpoint();
        sem.take(wait, Self::TICK_RATE_HZ)
    }

    fn semaphore_give(&self, sem: &SimSemaphore) -> bool {
        self.shared.checkpoint();
        sem.give().0
    }

    fn semaphore_give_from_isr(&self, sem: &SimSemaphore) -> bool {
        match sem.give() {
            (true, Some(waiter)) => waiter > current_priority(),
            _ => false,
        }
    }

    fn semaphore_reset(&self, sem: &SimSemaphore) -> bool {
        sem.reset();
        true
    }

    fn semaphore_destroy(&self, _sem: &SimSemaphore) {}

    fn mutex_create(&self) -> Option<SimMutex> {
        Some(SimMutex::default())
    }

    fn mutex_lock(&self, mutex: &SimMutex) {
        self.shared.checkpoint();
        mutex.lock();
    }

    fn mutex_unlock(&self, mutex: &SimMutex) {
        mutex.unlock();
    }
}
