//! In-slot reference count for safer-pointer support.
//!
//! When a partition is configured with ref-counting, every bucketed slot
//! starts with one `PartitionRefCount` word owned by the allocator. Smart
//! pointers acquire and release against it; `Free` releases the allocator's
//! reference. Whoever drops the count to zero is responsible for the actual
//! free -- the allocator directly, or a smart pointer via
//! `PartitionRoot::free_for_ref_counting`.

use core::sync::atomic::{AtomicU32, Ordering};

/// Sized to keep the returned pointer on the minimum alignment.
pub const REF_COUNT_SIZE: usize = crate::util::MIN_ALIGN;

#[repr(C)]
pub struct PartitionRefCount {
    count: AtomicU32,
    _pad: [u32; 3],
}

const _: () = assert!(core::mem::size_of::<PartitionRefCount>() == REF_COUNT_SIZE);

impl PartitionRefCount {
    /// Place a fresh count (one reference, held by the allocator) at the
    /// start of a slot.
    ///
    /// # Safety
    /// `slot_start` must have `REF_COUNT_SIZE` writable bytes.
    #[inline]
    pub unsafe fn init(slot_start: *mut u8) {
        let rc = slot_start as *mut PartitionRefCount;
        (*rc).count.store(1, Ordering::Release);
    }

    /// View the count embedded at a slot start.
    ///
    /// # Safety
    /// The slot must have been initialized with `init` and not yet
    /// finalized.
    #[inline]
    pub unsafe fn from_slot_start<'a>(slot_start: *mut u8) -> &'a PartitionRefCount {
        &*(slot_start as *const PartitionRefCount)
    }

    /// Take a reference on behalf of a smart pointer.
    #[inline]
    pub fn acquire(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop a smart-pointer reference. Returns true if this was the last
    /// reference; the caller must then finalize the slot through
    /// `free_for_ref_counting`.
    #[inline]
    #[must_use]
    pub fn release(&self) -> bool {
        self.count.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Drop the allocator's reference on `Free`. Returns true if the slot
    /// can be reclaimed immediately, false if smart pointers still hold it.
    #[inline]
    #[must_use]
    pub fn release_from_allocator(&self) -> bool {
        self.count.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Whether the allocator holds the only reference.
    #[inline]
    pub fn has_one_ref(&self) -> bool {
        self.count.load(Ordering::Acquire) == 1
    }
}
