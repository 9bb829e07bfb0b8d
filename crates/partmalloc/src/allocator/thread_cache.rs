//! Per-thread free-slot cache, bypassing the partition lock on the fast
//! path.
//!
//! Each thread lazily materializes one cache, bound to the single partition
//! that has the thread cache enabled. The cache keeps a bounded LIFO bin of
//! slot pointers per bucket up to a slot-size ceiling:
//! - alloc fast path: pop the matching bin, no lock
//! - free fast path: push; on overflow, flush the newest half back to the
//!   partition under one lock acquisition
//! - thread exit: every bin is flushed and the cache storage itself is
//!   returned to the partition
//!
//! The cache storage is allocated from the owning partition. While that
//! allocation runs, the partition's thread-cache flag is flipped off so a
//! reentrant allocation (e.g. from TLS machinery) cannot recurse into cache
//! creation.

use crate::allocator::root::PartitionRoot;
use crate::config;
use crate::slab::size_class::size_to_bucket_index;
use core::cell::Cell;
use core::ptr;

/// Hard bin capacity; the runtime limit can only shrink it.
pub const THREAD_CACHE_BIN_CAPACITY: usize = 32;

/// Buckets with slot sizes above this are never cached.
pub const LARGEST_CACHED_SLOT_SIZE: usize = 512;

/// Number of bins: every bucket index that can serve a cached slot size.
pub const NUM_CACHED_BUCKETS: usize = size_to_bucket_index(LARGEST_CACHED_SLOT_SIZE) + 1;

struct Bin {
    slots: [*mut u8; THREAD_CACHE_BIN_CAPACITY],
    count: usize,
}

pub struct ThreadCache {
    root: *const PartitionRoot,
    limit: usize,
    bins: [Bin; NUM_CACHED_BUCKETS],
}

impl ThreadCache {
    /// Pop a cached slot for `bucket_index`, if any.
    #[inline]
    pub fn get(&mut self, bucket_index: usize) -> *mut u8 {
        let bin = &mut self.bins[bucket_index];
        if bin.count == 0 {
            return ptr::null_mut();
        }
        bin.count -= 1;
        bin.slots[bin.count]
    }

    /// Push a freed slot for `bucket_index`; flushes the newest half of the
    /// bin first when it is at capacity.
    ///
    /// # Safety
    /// `slot_start` must be a slot of `root`'s bucket `bucket_index`, owned
    /// by the caller.
    #[inline]
    pub unsafe fn put(&mut self, bucket_index: usize, slot_start: *mut u8) {
        let limit = self.limit;
        let root = &*self.root;
        let bin = &mut self.bins[bucket_index];
        if bin.count >= limit {
            let keep = limit / 2;
            root.raw_free_batch(&bin.slots[keep..bin.count]);
            bin.count = keep;
        }
        bin.slots[bin.count] = slot_start;
        bin.count += 1;
    }

    /// Return every cached slot to the partition.
    ///
    /// # Safety
    /// The caller must own this cache (it is thread-local).
    pub unsafe fn flush_all(&mut self) {
        let root = &*self.root;
        for bin in self.bins.iter_mut() {
            if bin.count > 0 {
                root.raw_free_batch(&bin.slots[..bin.count]);
                bin.count = 0;
            }
        }
    }
}

struct ThreadCacheHandle(Cell<*mut ThreadCache>);

impl Drop for ThreadCacheHandle {
    fn drop(&mut self) {
        let tc = self.0.get();
        if tc.is_null() {
            return;
        }
        self.0.set(ptr::null_mut());
        unsafe {
            let root = (*tc).root;
            (*tc).flush_all();
            (*root).free_internal_slot(tc as *mut u8);
        }
    }
}

thread_local! {
    static TCACHE: ThreadCacheHandle = const { ThreadCacheHandle(Cell::new(ptr::null_mut())) };
}

/// The calling thread's cache if it exists and belongs to `root`.
#[inline]
pub fn current(root: &PartitionRoot) -> *mut ThreadCache {
    let tc = TCACHE
        .try_with(|handle| handle.0.get())
        .unwrap_or(ptr::null_mut());
    if tc.is_null() || unsafe { (*tc).root } != root as *const PartitionRoot {
        return ptr::null_mut();
    }
    tc
}

/// The calling thread's cache for `root`, creating it on first use.
/// Returns null if TLS is unavailable, the thread's cache belongs to a
/// different partition, or the backing allocation failed.
pub unsafe fn current_or_create(root: &PartitionRoot) -> *mut ThreadCache {
    TCACHE
        .try_with(|handle| {
            let tc = handle.0.get();
            if !tc.is_null() {
                if unsafe { (*tc).root } == root as *const PartitionRoot {
                    return tc;
                }
                return ptr::null_mut();
            }
            let created = unsafe { create(root) };
            if !created.is_null() {
                handle.0.set(created);
            }
            created
        })
        .unwrap_or(ptr::null_mut())
}

unsafe fn create(root: &PartitionRoot) -> *mut ThreadCache {
    let storage = root.alloc_internal_slot(core::mem::size_of::<ThreadCache>());
    if storage.is_null() {
        return ptr::null_mut();
    }
    // Zero is a valid initial state for every bin.
    ptr::write_bytes(storage, 0, core::mem::size_of::<ThreadCache>());
    let tc = storage as *mut ThreadCache;
    (*tc).root = root;
    let override_limit = config::thread_cache_bin_limit();
    (*tc).limit = if override_limit == 0 {
        THREAD_CACHE_BIN_CAPACITY
    } else {
        override_limit.clamp(2, THREAD_CACHE_BIN_CAPACITY)
    };
    tc
}

/// Flush the calling thread's cache into `root` if it belongs to it.
/// Used by `PurgeMemory` to materialize deferred frees.
pub unsafe fn flush_current_thread(root: &PartitionRoot) {
    let tc = current(root);
    if !tc.is_null() {
        (*tc).flush_all();
    }
}
