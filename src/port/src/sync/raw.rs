//! Kernel counting semaphore plus its identifier slot.
//!
//! Events, semaphores and emulated mutexes all sit on one of these. It owns
//! the kernel object and, on table-based kernels, the slot it occupies;
//! dropping it gives both back.

use core::sync::atomic::{AtomicU32, Ordering};

use kport_common::Result;
use kport_common::{OsError, Wait};
use kport_hal::{Kernel, KernelCaps};
use log::{debug, warn};

use crate::config::DRAIN_LIMIT;
use crate::id_alloc::SlotId;
use crate::os::Os;

pub(crate) struct RawSemaphore<'os, K: Kernel> {
    os: &'os Os<K>,
    sem: K::Semaphore,
    slot: Option<SlotId>,
    /// Units given through this handle and not yet taken back. Approximate
    /// under concurrency; only sizes the drain loop.
    pending: AtomicU32,
}

impl<'os, K: Kernel> RawSemaphore<'os, K> {
    pub(crate) fn create(os: &'os Os<K>, initial: u32, max: u32) -> Result<Self> {
        let slot = os.claim_slot()?;
        match os.kernel().semaphore_create(slot, initial, max) {
            Some(sem) => {
                debug!("kport: semaphore created (slot {:?}, {}/{})", slot, initial, max);
                Ok(Self {
                    os,
                    sem,
                    slot,
                    pending: AtomicU32::new(initial),
                })
            }
            None => {
                os.release_slot(slot);
                warn!("kport: kernel refused semaphore (slot {:?})", slot);
                Err(OsError::OutOfResources)
            }
        }
    }

    pub(crate) fn os(&self) -> &'os Os<K> {
        self.os
    }

    pub(crate) fn handle(&self) -> &K::Semaphore {
        &self.sem
    }

    pub(crate) fn take(&self, wait: Wait) -> bool {
        let taken = self.os.kernel().semaphore_take(&self.sem, wait);
        if taken {
            let _ = self
                .pending
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        }
        taken
    }

    pub(crate) fn give(&self) {
        if self.os.kernel().semaphore_give(&self.sem) {
            self.pending.fetch_add(1, Ordering::AcqRel);
        } else {
            warn!("kport: semaphore give failed (slot {:?})", self.slot);
        }
    }

    /// ISR-safe give; `false` on kernels without wake feedback.
    pub(crate) fn give_from_isr(&self) -> bool {
        let woken = self.os.kernel().semaphore_give_from_isr(&self.sem);
        self.pending.fetch_add(1, Ordering::AcqRel);
        woken && K::CAPS.contains(KernelCaps::ISR_FEEDBACK)
    }

    /// Bring the count to zero without blocking.
    ///
    /// Emulates a missing native clear: a counting semaphore standing in for
    /// a binary signal may hold several unconsumed gives, so take until a
    /// take fails. The loop runs at most the pending count plus
    /// [`DRAIN_LIMIT`] times; only a concurrent giver can exhaust it.
    pub(crate) fn drain(&self) {
        if K::CAPS.contains(KernelCaps::SEMAPHORE_RESET)
            && self.os.kernel().semaphore_reset(&self.sem)
        {
            self.pending.store(0, Ordering::Release);
            return;
        }
        let bound = (self.pending.load(Ordering::Acquire) as usize).saturating_add(DRAIN_LIMIT);
        for _ in 0..bound {
            if !self.take(Wait::NoWait) {
                self.pending.store(0, Ordering::Release);
                return;
            }
        }
        warn!("kport: drain raced a giver (slot {:?})", self.slot);
    }

    pub(crate) fn slot(&self) -> Option<SlotId> {
        self.slot
    }
}

impl<K: Kernel> Drop for RawSemaphore<'_, K> {
    fn drop(&mut self) {
        self.os.kernel().semaphore_destroy(&self.sem);
        self.os.release_slot(self.slot);
    }
}
