//! Mutual exclusion lock over the kernel's mutex or a binary semaphore.
//!
//! Kernels with a native mutex get it directly. The rest get a binary
//! semaphore that is created empty and given once, so the first acquire
//! succeeds immediately.

use kport_common::{OsError, Result, Wait};
use kport_hal::{Kernel, KernelCaps};
use log::warn;

use super::raw::RawSemaphore;
use crate::os::Os;

enum Inner<'os, K: Kernel> {
    Native { os: &'os Os<K>, mutex: K::Mutex },
    Emulated(RawSemaphore<'os, K>),
}

/// A binary ownership lock, created unlocked.
///
/// Not reentrant: acquiring twice from the same task does whatever the
/// kernel does (usually deadlock). Releasing a mutex the caller does not own
/// is equally kernel-defined.
///
/// # Example
///
/// ```ignore
/// let mutex = Mutex::create(os)?;
///
/// mutex.acquire();
/// // ... touch shared state ...
/// mutex.release();
///
/// // or scoped:
/// let _guard = mutex.lock();
/// ```
pub struct Mutex<'os, K: Kernel> {
    inner: Inner<'os, K>,
}

impl<'os, K: Kernel> Mutex<'os, K> {
    /// Create an unlocked mutex.
    pub fn create(os: &'os Os<K>) -> Result<Self> {
        let inner = if K::CAPS.contains(KernelCaps::NATIVE_MUTEX) {
            let mutex = os.kernel().mutex_create().ok_or(OsError::OutOfResources)?;
            Inner::Native { os, mutex }
        } else {
            let raw = RawSemaphore::create(os, 0, 1)?;
            // Binary semaphores start taken here; make the mutex available.
            if !os.kernel().semaphore_give(raw.handle()) {
                return Err(OsError::KernelFailure);
            }
            Inner::Emulated(raw)
        };
        Ok(Self { inner })
    }

    /// Block until the caller owns the mutex.
    pub fn acquire(&self) {
        match &self.inner {
            Inner::Native { os, mutex } => os.kernel().mutex_lock(mutex),
            Inner::Emulated(raw) => {
                if !raw.take(Wait::Forever) {
                    warn!("kport: mutex acquire returned without ownership");
                }
            }
        }
    }

    /// Give up ownership.
    pub fn release(&self) {
        match &self.inner {
            Inner::Native { os, mutex } => os.kernel().mutex_unlock(mutex),
            Inner::Emulated(raw) => raw.give(),
        }
    }

    /// Acquire the mutex and get a guard that releases it when dropped.
    pub fn lock(&self) -> MutexGuard<'_, 'os, K> {
        self.acquire();
        MutexGuard { mutex: self }
    }

    /// Returns `true` if this mutex is emulated on a binary semaphore.
    pub fn is_emulated(&self) -> bool {
        matches!(self.inner, Inner::Emulated(_))
    }

    /// Delete the mutex.
    pub fn delete(self) {
        drop(self);
    }
}

impl<K: Kernel> Drop for Mutex<'_, K> {
    fn drop(&mut self) {
        if let Inner::Native { os, mutex } = &self.inner {
            os.kernel().mutex_destroy(mutex);
        }
    }
}

/// RAII guard that releases the mutex when dropped.
pub struct MutexGuard<'a, 'os, K: Kernel> {
    mutex: &'a Mutex<'os, K>,
}

impl<K: Kernel> Drop for MutexGuard<'_, '_, K> {
    fn drop(&mut self) {
        self.mutex.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::Event;
    use crate::task::TaskParameters;
    use kport_common::Timeout;
    use kport_sim::{PoolKernel, ThreadKernel};

    fn thread_os() -> &'static Os<ThreadKernel> {
        Box::leak(Box::new(Os::new(ThreadKernel::new())))
    }

    fn pool_os() -> &'static Os<PoolKernel> {
        Box::leak(Box::new(Os::new(PoolKernel::new())))
    }

    struct Contender<K: Kernel> {
        mutex: Mutex<'static, K>,
        acquired: Event<'static, K>,
    }

    fn contend<K: Kernel>(shared: &'static Contender<K>) {
        shared.mutex.acquire();
        shared.acquired.set();
        shared.mutex.release();
    }

    fn check_second_acquirer_blocks<K: Kernel>(os: &'static Os<K>) {
        let shared: &'static Contender<K> = Box::leak(Box::new(Contender {
            mutex: Mutex::create(os).expect("mutex"),
            acquired: Event::create(os).expect("event"),
        }));
        os.start();

        // Available right after creation.
        shared.mutex.acquire();

        os.create_task("contender", contend::<K>, shared, TaskParameters::default())
            .expect("task");
        assert!(!shared.acquired.wait(Timeout::Millis(50)));

        shared.mutex.release();
        assert!(shared.acquired.wait(Timeout::Infinite));
    }

    #[test]
    fn test_mutex_uncontended() {
        let mutex = Mutex::create(thread_os()).expect("mutex");
        assert!(!mutex.is_emulated());

        mutex.acquire();
        mutex.release();

        // Released, so the guard gets it at once.
        let guard = mutex.lock();
        drop(guard);
        mutex.acquire();
        mutex.release();
    }

    #[test]
    fn test_emulated_mutex_starts_available() {
        let os = pool_os();
        let mutex = Mutex::create(os).expect("mutex");
        assert!(mutex.is_emulated());

        {
            let _guard = mutex.lock();
        }
        mutex.acquire();
        mutex.release();

        mutex.delete();
        assert_eq!(os.slots_in_use(), 0);
    }

    #[test]
    fn test_mutex_second_acquirer_blocks_native() {
        check_second_acquirer_blocks(thread_os());
    }

    #[test]
    fn test_mutex_second_acquirer_blocks_emulated() {
        check_second_acquirer_blocks(pool_os());
    }
}
