//! Edge-triggered event built on the kernel's counting semaphore.
//!
//! ```text
//!   nonsignaled --set--> signaled --wait succeeds--> nonsignaled
//!        ^                  |
//!        +------reset-------+
//! ```
//!
//! A successful wait consumes the signal: the event is back to nonsignaled
//! before `wait` returns, however many `set` calls preceded it. With several
//! waiters the first one to take the signal wins; the others keep waiting.

use kport_common::{Result, Timeout};
use kport_hal::Kernel;

use super::raw::RawSemaphore;
use crate::id_alloc::SlotId;
use crate::os::Os;

/// An auto-reset event.
///
/// Deleting an event consumes it, so no task can still be waiting on it.
pub struct Event<'os, K: Kernel> {
    raw: RawSemaphore<'os, K>,
}

impl<'os, K: Kernel> Event<'os, K> {
    /// Create an event in the nonsignaled state.
    pub fn create(os: &'os Os<K>) -> Result<Self> {
        let raw = RawSemaphore::create(os, 0, 1)?;
        // Some kernels hand out binary semaphores already available.
        raw.drain();
        Ok(Self { raw })
    }

    /// Set the event to signaled. Task context only.
    pub fn set(&self) {
        self.raw.give();
    }

    /// Set the event to signaled from an interrupt service routine.
    ///
    /// Returns `true` when a task with higher priority than the interrupted
    /// one was unblocked; pass it on to [`Os::exit_isr`]. Always `false` on
    /// kernels that cannot tell.
    pub fn set_from_isr(&self) -> bool {
        self.raw.give_from_isr()
    }

    /// Force the event to nonsignaled. Idempotent.
    pub fn reset(&self) {
        self.raw.drain();
    }

    /// Wait for the event to be signaled.
    ///
    /// Returns `true` if the event was signaled (and is now cleared), `false`
    /// if `timeout` elapsed first.
    #[must_use]
    pub fn wait(&self, timeout: impl Into<Timeout>) -> bool {
        let wait = timeout.into().to_wait(K::TICK_RATE_HZ);
        if !self.raw.take(wait) {
            return false;
        }
        self.raw.drain();
        true
    }

    /// Delete the event.
    pub fn delete(self) {
        drop(self);
    }

    /// The layer this event belongs to.
    pub fn os(&self) -> &'os Os<K> {
        self.raw.os()
    }

    /// Semaphore slot backing this event, on table-based kernels.
    pub fn slot(&self) -> Option<SlotId> {
        self.raw.slot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kport_sim::{PoolKernel, ThreadKernel};

    fn thread_os() -> &'static Os<ThreadKernel> {
        Box::leak(Box::new(Os::new(ThreadKernel::new())))
    }

    fn pool_os() -> &'static Os<PoolKernel> {
        Box::leak(Box::new(Os::new(PoolKernel::new())))
    }

    fn check_edge_semantics<K: Kernel>(os: &'static Os<K>) {
        let event = Event::create(os).expect("event");

        assert!(!event.wait(Timeout::Poll));
        event.set();
        assert!(event.wait(Timeout::Millis(10)));
        assert!(!event.wait(Timeout::Poll));
    }

    fn check_reset_drains<K: Kernel>(os: &'static Os<K>) {
        let event = Event::create(os).expect("event");

        for _ in 0..5 {
            event.set();
        }
        event.reset();
        assert!(!event.wait(0u32));

        event.reset();
        assert!(!event.wait(0u32));
    }

    fn check_wait_consumes_every_pending_set<K: Kernel>(os: &'static Os<K>) {
        let event = Event::create(os).expect("event");

        event.set();
        event.set();
        event.set();
        assert!(event.wait(Timeout::Infinite));
        assert!(!event.wait(Timeout::Poll));
    }

    #[test]
    fn test_event_edge_semantics() {
        check_edge_semantics(thread_os());
        check_edge_semantics(pool_os());
    }

    #[test]
    fn test_event_reset_drains() {
        check_reset_drains(thread_os());
        check_reset_drains(pool_os());
    }

    #[test]
    fn test_event_wait_consumes_every_pending_set() {
        check_wait_consumes_every_pending_set(thread_os());
        check_wait_consumes_every_pending_set(pool_os());
    }

    #[test]
    fn test_event_reset_after_many_sets() {
        // PoolKernel keeps counting past max, so every set leaves a unit.
        let os = pool_os();
        let event = Event::create(os).expect("event");
        let sets = crate::config::DRAIN_LIMIT + 44;

        for _ in 0..sets {
            event.set();
        }
        event.reset();
        assert!(!event.wait(Timeout::Poll));

        for _ in 0..sets {
            event.set();
        }
        assert!(event.wait(Timeout::Poll));
        assert!(!event.wait(Timeout::Poll));
    }

    #[test]
    fn test_event_bounded_wait_times_out() {
        let os = thread_os();
        let event = Event::create(os).expect("event");

        let before = os.now64();
        assert!(!event.wait(Timeout::Millis(30)));
        assert!(os.now64() - before >= 29);
    }

    #[test]
    fn test_event_set_from_isr_feedback() {
        let os = pool_os();
        let event = Event::create(os).expect("event");

        // No wake feedback on this kernel, whatever happened.
        assert!(!event.set_from_isr());
        assert!(event.wait(Timeout::Poll));
    }

    #[test]
    fn test_event_slot_released_on_delete() {
        let os = pool_os();
        let event = Event::create(os).expect("event");
        assert!(event.slot().is_some());
        assert_eq!(os.slots_in_use(), 1);

        event.delete();
        assert_eq!(os.slots_in_use(), 0);

        let thread_event = Event::create(thread_os()).expect("event");
        assert_eq!(thread_event.slot(), None);
    }
}
