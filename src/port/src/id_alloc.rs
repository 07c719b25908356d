//! Identifier allocator for kernels with a fixed semaphore table.
//!
//! Some kernels track every semaphore as one entry of a small table and
//! expect the caller to pick the entry. This module hands out those entries.
//! The table is the only structure in the layer that tasks mutate
//! concurrently, so every scan-and-mark runs inside a critical section
//! (interrupts disabled on target). It never takes a blocking lock: the
//! synchronization primitives are built on top of it.

use core::cell::RefCell;

use critical_section::Mutex;

/// Index of an entry in the kernel's semaphore table.
pub type SlotId = u8;

/// Fixed table of `N` in-use flags.
///
/// Only the first `limit` entries are handed out, so one table type can
/// serve kernels with smaller tables. Every index must fit a [`SlotId`], so
/// `N` is at most 256; larger tables fail to build.
pub struct IdAllocator<const N: usize> {
    table: Mutex<RefCell<[bool; N]>>,
    limit: usize,
}

impl<const N: usize> IdAllocator<N> {
    /// Create an allocator using the whole table.
    pub const fn new() -> Self {
        Self::with_limit(N)
    }

    /// Create an allocator handing out only ids below `limit`.
    pub const fn with_limit(limit: usize) -> Self {
        assert!(
            N <= SlotId::MAX as usize + 1,
            "IdAllocator table larger than the SlotId range"
        );
        Self {
            table: Mutex::new(RefCell::new([false; N])),
            limit: if limit < N { limit } else { N },
        }
    }

    /// Number of ids this allocator can hand out.
    pub fn capacity(&self) -> usize {
        self.limit
    }

    /// Claim the lowest free id, or `None` when the table is exhausted.
    pub fn allocate(&self) -> Option<SlotId> {
        critical_section::with(|cs| {
            let mut table = self.table.borrow_ref_mut(cs);
            let index = table[..self.limit].iter().position(|used| !used)?;
            let id = SlotId::try_from(index).ok()?;
            table[index] = true;
            Some(id)
        })
    }

    /// Return an id to the table. Out-of-range ids are ignored.
    ///
    /// The caller must own `id`; freeing an id someone else holds makes it
    /// available twice.
    pub fn free(&self, id: SlotId) {
        let index = usize::from(id);
        if index >= self.limit {
            return;
        }
        critical_section::with(|cs| {
            self.table.borrow_ref_mut(cs)[index] = false;
        });
    }

    /// Returns `true` if `id` is currently handed out.
    pub fn is_allocated(&self, id: SlotId) -> bool {
        let index = usize::from(id);
        index < self.limit && critical_section::with(|cs| self.table.borrow_ref(cs)[index])
    }

    /// Number of ids currently handed out.
    pub fn in_use(&self) -> usize {
        critical_section::with(|cs| {
            self.table.borrow_ref(cs)[..self.limit]
                .iter()
                .filter(|used| **used)
                .count()
        })
    }

    /// Mark every id free. Used at kernel initialization.
    pub fn clear(&self) {
        critical_section::with(|cs| {
            self.table.borrow_ref_mut(cs).fill(false);
        });
    }
}

impl<const N: usize> Default for IdAllocator<N> {
    fn default() -> Self {
        Self::new()
    }
}
