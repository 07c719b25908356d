//! Counting semaphore for limiting concurrent access.
//!
//! This module provides a bounded counting semaphore on top of the kernel's
//! native one.

use kport_common::{OsError, Result, Timeout};
use kport_hal::Kernel;

use super::raw::RawSemaphore;
use crate::id_alloc::SlotId;
use crate::os::Os;

/// A counting semaphore for limiting concurrent access to a resource.
///
/// The semaphore starts with `capacity` units available. Tasks take units
/// with [`Semaphore::wait`] and return them with [`Semaphore::release`].
/// Releasing more units than were taken is a usage error whose effect is up
/// to the kernel (most saturate at `capacity`).
///
/// # Example
///
/// ```ignore
/// // Limit to 3 concurrent accesses
/// let sem = Semaphore::create(os, 3)?;
///
/// if sem.wait(Timeout::Millis(100)) {
///     // ... do work with limited concurrency ...
///     sem.release();
/// }
/// ```
pub struct Semaphore<'os, K: Kernel> {
    raw: RawSemaphore<'os, K>,
    capacity: u32,
}

impl<'os, K: Kernel> Semaphore<'os, K> {
    /// Create a semaphore with `capacity` units, all available.
    ///
    /// `capacity` must be at least 1.
    pub fn create(os: &'os Os<K>, capacity: u32) -> Result<Self> {
        if capacity == 0 {
            return Err(OsError::InvalidParameter);
        }
        let raw = RawSemaphore::create(os, capacity, capacity)?;
        Ok(Self { raw, capacity })
    }

    /// Maximum count fixed at creation.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Take one unit, waiting at most `timeout`.
    ///
    /// Returns `true` if a unit was taken, `false` if the timeout elapsed.
    #[must_use]
    pub fn wait(&self, timeout: impl Into<Timeout>) -> bool {
        self.raw.take(timeout.into().to_wait(K::TICK_RATE_HZ))
    }

    /// Attempt to take a unit without blocking.
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        self.wait(Timeout::Poll)
    }

    /// Take a unit and get a guard that returns it when dropped.
    pub fn acquire(&self, timeout: impl Into<Timeout>) -> Option<SemaphorePermit<'_, 'os, K>> {
        self.wait(timeout).then(|| SemaphorePermit::new(self))
    }

    /// Return one unit to the semaphore.
    pub fn release(&self) {
        self.raw.give();
    }

    /// Delete the semaphore, giving its slot back.
    pub fn delete(self) {
        drop(self);
    }

    /// Semaphore slot backing this object, on table-based kernels.
    pub fn slot(&self) -> Option<SlotId> {
        self.raw.slot()
    }
}

/// RAII guard that releases a semaphore unit when dropped.
///
/// Use this when you want automatic release on scope exit. Only
/// [`Semaphore::acquire`] hands one out, after it has taken the unit:
///
/// ```compile_fail
/// use kport::{Kernel, Semaphore, SemaphorePermit};
///
/// fn forge<'a, 'os, K: Kernel>(sem: &'a Semaphore<'os, K>) -> SemaphorePermit<'a, 'os, K> {
///     SemaphorePermit::new(sem)
/// }
/// ```
pub struct SemaphorePermit<'a, 'os, K: Kernel> {
    semaphore: &'a Semaphore<'os, K>,
}

impl<'a, 'os, K: Kernel> SemaphorePermit<'a, 'os, K> {
    /// Wraps a unit the caller has already taken.
    fn new(semaphore: &'a Semaphore<'os, K>) -> Self {
        Self { semaphore }
    }
}

impl<K: Kernel> Drop for SemaphorePermit<'_, '_, K> {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kport_sim::{PoolKernel, ThreadKernel};
    use proptest::prelude::*;

    fn thread_os() -> &'static Os<ThreadKernel> {
        Box::leak(Box::new(Os::new(ThreadKernel::new())))
    }

    fn pool_os() -> &'static Os<PoolKernel> {
        Box::leak(Box::new(Os::new(PoolKernel::new())))
    }

    fn check_capacity<K: Kernel>(os: &'static Os<K>, capacity: u32) -> bool {
        let sem = Semaphore::create(os, capacity).expect("semaphore");

        let all_taken = (0..capacity).all(|_| sem.wait(Timeout::Poll));
        let extra = sem.wait(Timeout::Poll);

        for _ in 0..capacity {
            sem.release();
        }
        let refilled = (0..capacity).all(|_| sem.try_acquire());
        all_taken && !extra && refilled && !sem.try_acquire()
    }

    #[test]
    fn test_semaphore_try_acquire() {
        let sem = Semaphore::create(thread_os(), 2).expect("semaphore");

        // Two units at creation.
        assert!(sem.try_acquire());
        assert!(sem.try_acquire());

        // Both gone.
        assert!(!sem.try_acquire());
    }

    #[test]
    fn test_semaphore_release() {
        let sem = Semaphore::create(pool_os(), 1).expect("semaphore");

        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());

        sem.release();
        assert!(sem.try_acquire());
    }

    #[test]
    fn test_semaphore_zero_capacity_rejected() {
        assert_eq!(
            Semaphore::create(thread_os(), 0).err(),
            Some(OsError::InvalidParameter)
        );
    }

    #[test]
    fn test_semaphore_max_permits() {
        let sem = Semaphore::create(thread_os(), 2).expect("semaphore");

        // This kernel saturates releases at capacity
        sem.release();
        sem.release();
        sem.release();

        assert!(sem.try_acquire());
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
    }

    #[test]
    fn test_semaphore_permit_guard() {
        let sem = Semaphore::create(thread_os(), 1).expect("semaphore");
        {
            let _permit = sem.acquire(Timeout::Poll).expect("unit available");
            assert!(sem.acquire(Timeout::Millis(5)).is_none());
        }
        assert!(sem.try_acquire());
    }

    #[test]
    fn test_semaphore_slots_exhausted() {
        let os = pool_os();
        let held: Vec<_> = (0..PoolKernel::SEMAPHORE_SLOTS)
            .map(|_| Semaphore::create(os, 1).expect("slot available"))
            .collect();

        assert_eq!(Semaphore::create(os, 1).err(), Some(OsError::NoFreeSlot));

        drop(held);
        assert!(Semaphore::create(os, 1).is_ok());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn capacity_units_then_timeout(capacity in 1u32..=24) {
            prop_assert!(check_capacity(thread_os(), capacity));
            prop_assert!(check_capacity(pool_os(), capacity));
        }
    }
}
