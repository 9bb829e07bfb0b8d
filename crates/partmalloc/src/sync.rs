//! The partition lock.
//!
//! We cannot use `std::sync::Mutex` because it may allocate, and every lock
//! acquisition here happens on an allocation path. The lock is a futex on
//! Linux with a spin fallback elsewhere.
//!
//! A `PartitionLock` carries a runtime thread-safety policy: a partition
//! configured single-threaded substitutes a no-op lock, so there is exactly
//! one locking implementation for both variants.

use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// 0 = unlocked, 1 = locked no waiters, 2 = locked with waiters.
pub struct PartitionLock {
    state: AtomicI32,
    enabled: AtomicBool,
}

unsafe impl Send for PartitionLock {}
unsafe impl Sync for PartitionLock {}

impl PartitionLock {
    pub const fn new() -> Self {
        Self {
            state: AtomicI32::new(0),
            enabled: AtomicBool::new(true),
        }
    }

    /// Switch this lock to the no-op policy. Called once at partition init,
    /// before the partition is shared between threads.
    pub fn set_thread_safe(&self, thread_safe: bool) {
        self.enabled.store(thread_safe, Ordering::Relaxed);
    }

    #[inline]
    pub fn lock(&self) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        // Fast path: uncontended
        if self
            .state
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        self.lock_slow();
    }

    #[cold]
    fn lock_slow(&self) {
        loop {
            let old = self.state.swap(2, Ordering::Acquire);
            if old == 0 {
                return;
            }
            #[cfg(target_os = "linux")]
            unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    &self.state as *const AtomicI32,
                    libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                    2i32,
                    core::ptr::null::<libc::timespec>(),
                );
            }
            #[cfg(not(target_os = "linux"))]
            {
                core::hint::spin_loop();
            }
        }
    }

    #[inline]
    pub fn unlock(&self) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        let old = self.state.fetch_sub(1, Ordering::Release);
        if old != 1 {
            self.state.store(0, Ordering::Release);
            self.wake_one();
        }
    }

    #[cold]
    fn wake_one(&self) {
        #[cfg(target_os = "linux")]
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                &self.state as *const AtomicI32,
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                1i32,
            );
        }
    }

    /// Try to lock without blocking. Returns true if the lock was acquired
    /// (always true under the no-op policy).
    #[inline]
    pub fn try_lock(&self) -> bool {
        if !self.enabled.load(Ordering::Relaxed) {
            return true;
        }
        self.state
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }
}
