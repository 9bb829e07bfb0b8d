//! Direct-map path for allocations above the largest bucket.
//!
//! Each direct-map allocation owns a private super-page-aligned reservation
//! laid out to mimic a normal super page: guard system page, metadata
//! system page, guard, then the payload starting at the first partition
//! page boundary. The metadata page carries a synthetic extent header, a
//! single span descriptor and an inline one-slot bucket, so the normal
//! mask-and-index pointer lookup lands on valid metadata and `Free` /
//! `GetUsableSize` need no special cases up front. Only the payload's
//! system pages are committed; the rest of the reservation stays
//! inaccessible address space.

use crate::allocator::root::PartitionRoot;
use crate::platform;
use crate::pool::DIRECT_MAP_POOL;
use crate::slab::bucket::Bucket;
use crate::slab::page::{SlotSpan, SuperPageExtent, KIND_DIRECT_MAP};
use crate::slab::size_class::MAX_DIRECT_MAPPED;
use crate::util::{
    align_up, PAGE_METADATA_SIZE, PARTITION_PAGE_SIZE, SUPER_PAGE_BASE_MASK, SUPER_PAGE_SHIFT,
    SUPER_PAGE_SIZE, SYSTEM_PAGE_SIZE,
};
use core::mem::offset_of;
use core::ptr;

/// Bookkeeping for one direct-map region, linked off the owning root.
#[repr(C)]
pub struct DirectMapExtent {
    pub next: *mut DirectMapExtent,
    pub prev: *mut DirectMapExtent,
    pub reservation_size: usize,
    pub committed_size: usize,
}

/// Everything living in the metadata system page of a direct-map region.
/// The span descriptor must land exactly where the pointer lookup expects
/// the descriptor of partition page 1.
#[repr(C)]
pub struct DirectMapMetadata {
    pub extent: SuperPageExtent,
    _pad: [u8; PAGE_METADATA_SIZE - core::mem::size_of::<SuperPageExtent>()],
    pub page: SlotSpan,
    pub bucket: Bucket,
    pub map_extent: DirectMapExtent,
}

const _: () = assert!(offset_of!(DirectMapMetadata, page) == PAGE_METADATA_SIZE);
const _: () = assert!(core::mem::size_of::<DirectMapMetadata>() <= SYSTEM_PAGE_SIZE);

/// Metadata block of the region containing `span`.
///
/// # Safety
/// `span` must be a `KIND_DIRECT_MAP` descriptor.
#[inline]
pub unsafe fn metadata_from_span(span: *mut SlotSpan) -> *mut DirectMapMetadata {
    ((span as usize) - offset_of!(DirectMapMetadata, page)) as *mut DirectMapMetadata
}

/// Reserve, commit and describe a direct-map region. Returns the slot start
/// (the payload base) or null on reservation/commit failure. Called under
/// the root lock.
///
/// # Safety
/// `list_head` must be the root's direct-map list head, protected by the
/// root lock held by the caller.
pub unsafe fn alloc_direct_mapped(
    root: &PartitionRoot,
    list_head: &mut *mut DirectMapExtent,
    raw_size: usize,
) -> *mut u8 {
    if raw_size > MAX_DIRECT_MAPPED {
        return ptr::null_mut();
    }
    let committed = align_up(raw_size, SYSTEM_PAGE_SIZE);
    let reservation = align_up(committed + PARTITION_PAGE_SIZE, SUPER_PAGE_SIZE);

    let base = reserve(root, reservation);
    if base.is_null() {
        return ptr::null_mut();
    }

    if !platform::commit_system_pages(base.add(SYSTEM_PAGE_SIZE), SYSTEM_PAGE_SIZE) {
        unreserve(base, reservation);
        return ptr::null_mut();
    }
    let payload = base.add(PARTITION_PAGE_SIZE);
    if !platform::commit_system_pages(payload, committed) {
        platform::decommit_system_pages(base.add(SYSTEM_PAGE_SIZE), SYSTEM_PAGE_SIZE);
        unreserve(base, reservation);
        return ptr::null_mut();
    }

    let meta = (base.add(SYSTEM_PAGE_SIZE)) as *mut DirectMapMetadata;
    (*meta).extent = SuperPageExtent {
        root: root as *const PartitionRoot,
        next: ptr::null_mut(),
    };
    (*meta).bucket.init_direct_mapped(committed);
    (*meta).page = SlotSpan::empty();
    (*meta).page.kind = KIND_DIRECT_MAP;
    (*meta).page.bucket = &mut (*meta).bucket;
    (*meta).page.num_allocated_slots = 1;

    (*meta).map_extent = DirectMapExtent {
        next: *list_head,
        prev: ptr::null_mut(),
        reservation_size: reservation,
        committed_size: committed,
    };
    if !(*list_head).is_null() {
        (**list_head).prev = &mut (*meta).map_extent;
    }
    *list_head = &mut (*meta).map_extent;

    root.increase_committed(committed);
    root.note_direct_map_reserved(reservation);

    payload
}

/// Tear a direct-map region down: unlink, decommit, return the address
/// space. Called under the root lock.
///
/// # Safety
/// `span` must be the `KIND_DIRECT_MAP` descriptor of a live region owned
/// by `root`; the root lock must be held.
pub unsafe fn free_direct_mapped(
    root: &PartitionRoot,
    list_head: &mut *mut DirectMapExtent,
    span: *mut SlotSpan,
) {
    let meta = metadata_from_span(span);
    let extent = &mut (*meta).map_extent;
    let base = ((meta as usize) & SUPER_PAGE_BASE_MASK) as *mut u8;
    let reservation = extent.reservation_size;
    let committed = extent.committed_size;

    // Unlink before the metadata page goes away.
    if !extent.prev.is_null() {
        (*extent.prev).next = extent.next;
    } else {
        *list_head = extent.next;
    }
    if !extent.next.is_null() {
        (*extent.next).prev = extent.prev;
    }

    platform::decommit_system_pages(base.add(PARTITION_PAGE_SIZE), committed);
    platform::decommit_system_pages(base.add(SYSTEM_PAGE_SIZE), SYSTEM_PAGE_SIZE);
    root.decrease_committed(committed);
    root.note_direct_map_released(reservation);

    unreserve(base, reservation);
}

/// Shrink or grow a direct-map region within its existing reservation.
/// Returns false when the new size cannot be satisfied in place. Called
/// under the root lock.
///
/// # Safety
/// `span` must be a live `KIND_DIRECT_MAP` descriptor owned by `root`; the
/// root lock must be held.
pub unsafe fn try_realloc_in_place(
    root: &PartitionRoot,
    span: *mut SlotSpan,
    new_raw_size: usize,
) -> bool {
    let meta = metadata_from_span(span);
    let extent = &mut (*meta).map_extent;
    let available = extent.reservation_size - PARTITION_PAGE_SIZE;
    if new_raw_size > available {
        return false;
    }

    let new_committed = align_up(new_raw_size, SYSTEM_PAGE_SIZE);
    let old_committed = extent.committed_size;
    let base = ((meta as usize) & SUPER_PAGE_BASE_MASK) as *mut u8;
    let payload = base.add(PARTITION_PAGE_SIZE);

    if new_committed < old_committed {
        platform::decommit_system_pages(
            payload.add(new_committed),
            old_committed - new_committed,
        );
        root.decrease_committed(old_committed - new_committed);
    } else if new_committed > old_committed {
        if !platform::recommit_system_pages(
            payload.add(old_committed),
            new_committed - old_committed,
        ) {
            return false;
        }
        root.increase_committed(new_committed - old_committed);
    }

    extent.committed_size = new_committed;
    (*meta).bucket.slot_size = new_committed as u32;
    true
}

unsafe fn reserve(root: &PartitionRoot, reservation: usize) -> *mut u8 {
    if root.uses_pools() {
        let base = DIRECT_MAP_POOL.alloc_super_pages(reservation >> SUPER_PAGE_SHIFT);
        if !base.is_null() {
            return base;
        }
        // Pool exhausted or never reservable; fall through to the OS.
    }
    platform::reserve_address_space_aligned(reservation, SUPER_PAGE_SIZE)
}

unsafe fn unreserve(base: *mut u8, reservation: usize) {
    if DIRECT_MAP_POOL.contains(base) {
        DIRECT_MAP_POOL.free_super_pages(base, reservation >> SUPER_PAGE_SHIFT);
    } else {
        platform::release_address_space(base, reservation);
    }
}
