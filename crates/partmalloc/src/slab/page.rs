//! Super-page layout and per-partition-page metadata.
//!
//! A super page is laid out as:
//!
//! ```text
//! | guard sys page | metadata sys page | guard sys pages | payload ... | guard partition page |
//! <------------ partition page 0 ------------------------>
//! ```
//!
//! The metadata system page holds one 32-byte descriptor per partition page.
//! Descriptor 0 doubles as the super-page extent header (the back-pointer to
//! the owning root); descriptors 1..=126 describe the payload partition
//! pages; the last partition page is a trailing guard and its descriptor
//! stays unused. Because every descriptor for a super page lives inside one
//! system page, masking a descriptor address with the system-page mask
//! recovers the extent header, and masking a payload pointer with the
//! super-page mask recovers the super-page base. Both lookups are O(1) and
//! lock-free.

use crate::allocator::root::PartitionRoot;
use crate::slab::bucket::Bucket;
use crate::util::{
    PAGE_METADATA_SHIFT, PAGE_METADATA_SIZE, PARTITION_PAGE_SHIFT, PARTITION_PAGE_SIZE,
    SUPER_PAGE_BASE_MASK, SUPER_PAGE_SIZE, SYSTEM_PAGE_BASE_MASK, SYSTEM_PAGE_SIZE,
};

/// Descriptor kinds.
pub const KIND_UNUSED: u8 = 0;
pub const KIND_SPAN_HEAD: u8 = 1;
pub const KIND_SPAN_TAIL: u8 = 2;
pub const KIND_DIRECT_MAP: u8 = 3;

/// Index of the first payload partition page within a super page.
pub const FIRST_PAYLOAD_PAGE: usize = 1;
/// One past the last payload partition page (the trailing guard).
pub const PAYLOAD_PAGE_LIMIT: usize = SUPER_PAGE_SIZE / PARTITION_PAGE_SIZE - 1;

/// Slot-span metadata. One instance per partition page; the instance for a
/// span's first partition page is the span header, subsequent pages carry
/// only the offset back to it.
#[repr(C)]
pub struct SlotSpan {
    /// First free slot, or null. The head lives in protected metadata, so
    /// it is stored plain; in-slot links are obfuscated (see `freelist`).
    pub freelist_head: *mut u8,
    pub next_span: *mut SlotSpan,
    pub bucket: *mut Bucket,
    /// Negated while the span sits off-list as full (see the state
    /// machine in `allocator::root`).
    pub num_allocated_slots: i16,
    pub num_unprovisioned_slots: u16,
    /// Slot in the root's empty-span ring, or -1.
    pub empty_cache_index: i16,
    /// For tail pages: partition pages back to the span head.
    pub page_offset: u8,
    pub kind: u8,
}

const _: () = assert!(core::mem::size_of::<SlotSpan>() == PAGE_METADATA_SIZE);

/// Extent header stored in descriptor slot 0 of each super page.
#[repr(C)]
pub struct SuperPageExtent {
    pub root: *const PartitionRoot,
    pub next: *mut SuperPageExtent,
}

const _: () = assert!(core::mem::size_of::<SuperPageExtent>() <= PAGE_METADATA_SIZE);

/// Start of the descriptor array for a super page.
#[inline(always)]
pub fn metadata_area(super_page_base: usize) -> *mut u8 {
    (super_page_base + SYSTEM_PAGE_SIZE) as *mut u8
}

/// Descriptor for partition page `pp_index` of a super page.
///
/// # Safety
/// The super page's metadata page must be committed.
#[inline(always)]
pub unsafe fn descriptor_at(super_page_base: usize, pp_index: usize) -> *mut SlotSpan {
    metadata_area(super_page_base).add(pp_index << PAGE_METADATA_SHIFT) as *mut SlotSpan
}

/// Recover the span header for an arbitrary payload pointer. Walks back
/// from a tail descriptor to the head; no alignment requirement on `ptr`.
///
/// # Safety
/// `ptr` must point into a super page owned by some partition.
#[inline(always)]
pub unsafe fn span_from_ptr_no_alignment_check(ptr: *const u8) -> *mut SlotSpan {
    let super_base = (ptr as usize) & SUPER_PAGE_BASE_MASK;
    let pp_index = ((ptr as usize) - super_base) >> PARTITION_PAGE_SHIFT;
    let descriptor = descriptor_at(super_base, pp_index);
    descriptor.sub((*descriptor).page_offset as usize)
}

/// First payload byte of the span a head descriptor describes. Inverse of
/// the descriptor arithmetic above.
///
/// # Safety
/// `span` must be a head descriptor inside a committed metadata page.
#[inline(always)]
pub unsafe fn span_payload(span: *const SlotSpan) -> *mut u8 {
    let super_base = (span as usize) & SUPER_PAGE_BASE_MASK;
    let pp_index = ((span as usize) - metadata_area(super_base) as usize) >> PAGE_METADATA_SHIFT;
    (super_base + (pp_index << PARTITION_PAGE_SHIFT)) as *mut u8
}

/// Extent header of the super page owning `span`. All descriptors of a
/// super page share one system page, so this is a mask.
///
/// # Safety
/// `span` must be a descriptor inside a committed metadata page.
#[inline(always)]
pub unsafe fn extent_from_span(span: *const SlotSpan) -> *mut SuperPageExtent {
    ((span as usize) & SYSTEM_PAGE_BASE_MASK) as *mut SuperPageExtent
}

/// Owning root of the super page containing `span`.
///
/// # Safety
/// As for `extent_from_span`; the extent must have been initialized.
#[inline(always)]
pub unsafe fn root_from_span(span: *const SlotSpan) -> *const PartitionRoot {
    (*extent_from_span(span)).root
}

impl SlotSpan {
    pub const fn empty() -> Self {
        SlotSpan {
            freelist_head: core::ptr::null_mut(),
            next_span: core::ptr::null_mut(),
            bucket: core::ptr::null_mut(),
            num_allocated_slots: 0,
            num_unprovisioned_slots: 0,
            empty_cache_index: -1,
            page_offset: 0,
            kind: KIND_UNUSED,
        }
    }

    /// All slots free and still committed.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.num_allocated_slots == 0 && !self.is_decommitted()
    }

    /// Physical pages returned to the OS; needs a recommit before reuse.
    #[inline]
    pub fn is_decommitted(&self) -> bool {
        self.num_allocated_slots == 0
            && self.freelist_head.is_null()
            && self.num_unprovisioned_slots == 0
    }

    /// Every slot handed out (and the span not yet unlinked as full).
    ///
    /// # Safety
    /// `self.bucket` must be valid.
    #[inline]
    pub unsafe fn is_full(&self) -> bool {
        self.num_allocated_slots == (*self.bucket).slots_per_span as i16
    }

    /// Unlinked from the active list with the full marker applied.
    #[inline]
    pub fn is_marked_full(&self) -> bool {
        self.num_allocated_slots < 0
    }

    /// Has a free or provisionable slot to hand out.
    ///
    /// # Safety
    /// `self.bucket` must be valid.
    #[inline]
    pub unsafe fn is_active(&self) -> bool {
        self.num_allocated_slots > 0
            && (!self.freelist_head.is_null() || self.num_unprovisioned_slots > 0)
    }

    /// Allocated slot count regardless of the full marker.
    #[inline]
    pub fn allocated_slots(&self) -> usize {
        self.num_allocated_slots.unsigned_abs() as usize
    }
}
