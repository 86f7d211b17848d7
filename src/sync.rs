//! A payload-less spin lock.
//!
//! Every lock scope here guards memory the lock itself does not own (a
//! cache's slab lists live in the region the client supplied, the global
//! cache list links `Cache` records embedded elsewhere), so the lock is
//! pure mutual exclusion, the same shape as a C `pthread_spinlock_t`.

use core::sync::atomic::{AtomicBool, Ordering};

#[repr(C)]
pub struct RawLock {
    locked: AtomicBool,
}

impl RawLock {
    #[inline]
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn lock(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
    }

    #[inline]
    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    #[inline]
    pub fn guard(&self) -> RawLockGuard<'_> {
        self.lock();
        RawLockGuard { lock: self }
    }
}

impl Default for RawLock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RawLockGuard<'a> {
    lock: &'a RawLock,
}

impl<'a> Drop for RawLockGuard<'a> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
