//! Process-wide address-space pools.
//!
//! Two large contiguous reservations are made up front: one backing every
//! normal-bucket super page, one backing direct-map regions. Each pool hands
//! out runs of super-page-sized, super-page-aligned chunks tracked by an
//! inline bitmap, and answers "does this pointer belong to the pool?" with a
//! single range check. Address space handed back to a pool is decommitted
//! but stays reserved for the lifetime of the process.
//!
//! If the up-front reservation is refused (address-space-constrained
//! targets), the pool reports failure and callers fall back to individual
//! aligned reservations from the OS.

use crate::platform;
use crate::sync::PartitionLock;
use crate::util::{SUPER_PAGE_SIZE, SUPER_PAGE_SHIFT};
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Normal-bucket pool span: 8 GiB of address space.
pub const NORMAL_POOL_SUPER_PAGES: usize = 4096;
/// Direct-map pool span: 16 GiB of address space.
pub const DIRECT_POOL_SUPER_PAGES: usize = 8192;

const MAX_POOL_WORDS: usize = DIRECT_POOL_SUPER_PAGES / 64;

struct PoolInner {
    /// Bitmap over super pages: bit set = free.
    bitmap: [u64; MAX_POOL_WORDS],
    reserve_attempted: bool,
}

pub struct AddressPool {
    lock: PartitionLock,
    inner: UnsafeCell<PoolInner>,
    /// Base/extent published once after reservation; lock-free range checks
    /// read these.
    base: AtomicUsize,
    num_super_pages: usize,
}

unsafe impl Send for AddressPool {}
unsafe impl Sync for AddressPool {}

/// Pool for every normal-bucket super page of every caged partition.
pub static NORMAL_BUCKET_POOL: AddressPool = AddressPool::new(NORMAL_POOL_SUPER_PAGES);
/// Pool for direct-map reservations of every caged partition.
pub static DIRECT_MAP_POOL: AddressPool = AddressPool::new(DIRECT_POOL_SUPER_PAGES);

impl AddressPool {
    const fn new(num_super_pages: usize) -> Self {
        AddressPool {
            lock: PartitionLock::new(),
            inner: UnsafeCell::new(PoolInner {
                bitmap: [0; MAX_POOL_WORDS],
                reserve_attempted: false,
            }),
            base: AtomicUsize::new(0),
            num_super_pages,
        }
    }

    /// Reserve the pool's address range. Runs at most once, under the lock.
    unsafe fn ensure_reserved(&self, inner: &mut PoolInner) {
        if inner.reserve_attempted {
            return;
        }
        inner.reserve_attempted = true;

        let total = self.num_super_pages << SUPER_PAGE_SHIFT;
        let base = platform::reserve_address_space_aligned(total, SUPER_PAGE_SIZE);
        if base.is_null() {
            return;
        }
        let words = self.num_super_pages / 64;
        for w in inner.bitmap.iter_mut().take(words) {
            *w = u64::MAX;
        }
        self.base.store(base as usize, Ordering::Release);
    }

    /// Hand out `n` contiguous super pages. The region is reserved but not
    /// committed. Returns null if the pool is exhausted or was never
    /// reservable.
    pub unsafe fn alloc_super_pages(&self, n: usize) -> *mut u8 {
        debug_assert!(n >= 1);
        self.lock.lock();
        let inner = &mut *self.inner.get();
        self.ensure_reserved(inner);

        let base = self.base.load(Ordering::Relaxed);
        if base == 0 {
            self.lock.unlock();
            return ptr::null_mut();
        }

        let result = Self::find_and_claim_run(inner, self.num_super_pages, n);
        self.lock.unlock();

        match result {
            Some(index) => (base + (index << SUPER_PAGE_SHIFT)) as *mut u8,
            None => ptr::null_mut(),
        }
    }

    /// Return `n` super pages to the pool. The caller must have decommitted
    /// any pages it committed; the address range stays reserved.
    ///
    /// # Safety
    /// `ptr` must be a super-page-aligned region previously obtained from
    /// `alloc_super_pages` with the same `n`.
    pub unsafe fn free_super_pages(&self, ptr: *mut u8, n: usize) {
        let base = self.base.load(Ordering::Acquire);
        debug_assert!(base != 0);
        let index = (ptr as usize - base) >> SUPER_PAGE_SHIFT;
        debug_assert!(index + n <= self.num_super_pages);

        self.lock.lock();
        let inner = &mut *self.inner.get();
        for i in index..index + n {
            debug_assert!(inner.bitmap[i / 64] & (1u64 << (i % 64)) == 0);
            inner.bitmap[i / 64] |= 1u64 << (i % 64);
        }
        self.lock.unlock();
    }

    /// Single range check: does `ptr` fall inside this pool's reservation?
    #[inline]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let base = self.base.load(Ordering::Acquire);
        if base == 0 {
            return false;
        }
        let addr = ptr as usize;
        addr >= base && addr < base + (self.num_super_pages << SUPER_PAGE_SHIFT)
    }

    /// First-fit search for a run of `n` free bits; claims it when found.
    fn find_and_claim_run(inner: &mut PoolInner, limit: usize, n: usize) -> Option<usize> {
        let mut run = 0;
        let mut run_start = 0;
        for i in 0..limit {
            let free = inner.bitmap[i / 64] & (1u64 << (i % 64)) != 0;
            if free {
                if run == 0 {
                    run_start = i;
                }
                run += 1;
                if run == n {
                    for j in run_start..run_start + n {
                        inner.bitmap[j / 64] &= !(1u64 << (j % 64));
                    }
                    return Some(run_start);
                }
            } else {
                run = 0;
            }
        }
        None
    }
}
