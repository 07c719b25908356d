//! Heap front end.
//!
//! Uses the kernel heap when the kernel has one, the global allocator
//! otherwise. Kernel heaps that are not reentrant get every call bracketed
//! with scheduler suspension.

use alloc::alloc::{alloc, dealloc, Layout};
use core::ptr::NonNull;

use kport_hal::{Kernel, KernelCaps};
use log::trace;

use crate::os::Os;

/// Alignment of blocks handed out by the global allocator fallback.
pub const BLOCK_ALIGN: usize = 16;

// Room in front of each fallback block for its size.
const HEADER: usize = BLOCK_ALIGN;

impl<K: Kernel> Os<K> {
    /// Allocate `size` bytes.
    ///
    /// Returns `None` when memory is short; never panics on exhaustion.
    pub fn alloc_mem(&self, size: usize) -> Option<NonNull<u8>> {
        let ptr = self.with_heap(|| {
            if K::CAPS.contains(KernelCaps::HEAP) {
                self.kernel().heap_alloc(size)
            } else {
                fallback_alloc(size)
            }
        });
        trace!("kport: alloc_mem({}) -> {:?}", size, ptr);
        ptr
    }

    /// Return a block from [`Os::alloc_mem`].
    ///
    /// # Safety
    ///
    /// `ptr` must come from `alloc_mem` on this same `Os` and must not be
    /// used after this call.
    pub unsafe fn free_mem(&self, ptr: NonNull<u8>) {
        trace!("kport: free_mem({:?})", ptr);
        self.with_heap(|| {
            if K::CAPS.contains(KernelCaps::HEAP) {
                // SAFETY: the caller guarantees `ptr` came from `heap_alloc`
                // on this kernel.
                unsafe { self.kernel().heap_free(ptr) }
            } else {
                // SAFETY: the caller guarantees `ptr` came from
                // `fallback_alloc`.
                unsafe { fallback_free(ptr) }
            }
        })
    }

    fn with_heap<R>(&self, f: impl FnOnce() -> R) -> R {
        if K::CAPS.contains(KernelCaps::REENTRANT_HEAP) {
            return f();
        }
        self.suspend_all_tasks();
        let result = f();
        self.resume_all_tasks();
        result
    }
}

fn fallback_layout(size: usize) -> Option<Layout> {
    let total = size.checked_add(HEADER)?;
    Layout::from_size_align(total, BLOCK_ALIGN).ok()
}

fn fallback_alloc(size: usize) -> Option<NonNull<u8>> {
    let layout = fallback_layout(size)?;
    // SAFETY: `layout` has nonzero size (at least `HEADER`).
    let base = NonNull::new(unsafe { alloc(layout) })?;
    // SAFETY: the block is at least `HEADER` bytes and aligned for `usize`.
    unsafe {
        base.as_ptr().cast::<usize>().write(size);
        Some(NonNull::new_unchecked(base.as_ptr().add(HEADER)))
    }
}

unsafe fn fallback_free(ptr: NonNull<u8>) {
    // SAFETY: `ptr` is `HEADER` bytes past the start of a block from
    // `fallback_alloc`, which stored the requested size there.
    unsafe {
        let base = ptr.as_ptr().sub(HEADER);
        let size = base.cast::<usize>().read();
        if let Some(layout) = fallback_layout(size) {
            dealloc(base, layout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kport_sim::{PoolKernel, ThreadKernel};

    fn check_alloc_free<K: Kernel>(os: &Os<K>) {
        let block = os.alloc_mem(100).expect("memory");
        assert_eq!(block.as_ptr() as usize % core::mem::align_of::<usize>(), 0);

        // SAFETY: 100 bytes were just allocated.
        unsafe {
            core::ptr::write_bytes(block.as_ptr(), 0xA5, 100);
            assert_eq!(*block.as_ptr().add(99), 0xA5);
            os.free_mem(block);
        }
    }

    #[test]
    fn test_fallback_heap() {
        let os = Os::new(ThreadKernel::new());
        check_alloc_free(&os);
    }

    #[test]
    fn test_kernel_heap() {
        let os = Os::new(PoolKernel::new());
        check_alloc_free(&os);
        assert_eq!(os.suspend_depth(), 0);
    }

    #[test]
    fn test_kernel_heap_exhaustion_is_none() {
        let os = Os::new(PoolKernel::new());
        assert!(os.alloc_mem(PoolKernel::HEAP_SIZE * 2).is_none());
    }

    #[test]
    fn test_heap_bracket_balances_after_start() {
        let os = Os::new(PoolKernel::new());
        os.start();

        let block = os.alloc_mem(32).expect("memory");
        assert_eq!(os.suspend_depth(), 0);
        // SAFETY: allocated above.
        unsafe { os.free_mem(block) };
        assert_eq!(os.suspend_depth(), 0);
    }
}
