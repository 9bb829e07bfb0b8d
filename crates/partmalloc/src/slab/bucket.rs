//! Per-size-class bucket state: the slot size, span geometry derived from
//! it, and the heads of the active / empty / decommitted span lists.

use crate::slab::page::SlotSpan;
use crate::slab::size_class::MAX_BUCKETED;
use crate::util::{
    align_up, MAX_PARTITION_PAGES_PER_SLOT_SPAN, PARTITION_PAGE_SHIFT, PARTITION_PAGE_SIZE,
    SYSTEM_PAGE_SIZE,
};
use core::ptr;

#[repr(C)]
pub struct Bucket {
    pub active_spans_head: *mut SlotSpan,
    pub empty_spans_head: *mut SlotSpan,
    pub decommitted_spans_head: *mut SlotSpan,
    pub slot_size: u32,
    pub num_partition_pages_per_span: u8,
    pub slots_per_span: u16,
    pub num_full_spans: u32,
}

impl Bucket {
    pub const fn empty() -> Self {
        Bucket {
            active_spans_head: ptr::null_mut(),
            empty_spans_head: ptr::null_mut(),
            decommitted_spans_head: ptr::null_mut(),
            slot_size: 0,
            num_partition_pages_per_span: 0,
            slots_per_span: 0,
            num_full_spans: 0,
        }
    }

    /// Fix the slot size and derive the span geometry. Pseudo buckets (slot
    /// sizes the lookup never produces) get geometry too; they just stay
    /// unused.
    pub fn init(&mut self, slot_size: usize) {
        let pages = partition_pages_per_span(slot_size);
        self.slot_size = slot_size as u32;
        self.num_partition_pages_per_span = pages as u8;
        self.slots_per_span = ((pages << PARTITION_PAGE_SHIFT) / slot_size).max(1) as u16;
    }

    /// Initialize as the inline bucket of a direct-map extent: one slot
    /// covering the committed payload.
    pub fn init_direct_mapped(&mut self, committed_size: usize) {
        self.active_spans_head = ptr::null_mut();
        self.empty_spans_head = ptr::null_mut();
        self.decommitted_spans_head = ptr::null_mut();
        self.slot_size = committed_size as u32;
        self.num_partition_pages_per_span = 0;
        self.slots_per_span = 1;
        self.num_full_spans = 0;
    }

    #[inline(always)]
    pub fn is_direct_mapped(&self) -> bool {
        self.slot_size as usize > MAX_BUCKETED
    }

    /// Span payload length in address space (whole partition pages).
    #[inline]
    pub fn span_payload_len(&self) -> usize {
        (self.num_partition_pages_per_span as usize) << PARTITION_PAGE_SHIFT
    }

    /// Bytes actually committed for one span. Single-slot spans commit only
    /// the system pages the slot needs; the tail of their last partition
    /// page stays inaccessible.
    #[inline]
    pub fn bytes_per_span(&self) -> usize {
        let slot_size = self.slot_size as usize;
        if self.slots_per_span == 1 && slot_size > PARTITION_PAGE_SIZE {
            align_up(slot_size, SYSTEM_PAGE_SIZE)
        } else {
            self.span_payload_len()
        }
    }
}

/// Pick the span length for a slot size: 1..=4 partition pages minimizing
/// the waste ratio, or exactly enough pages for one slot when the size
/// outgrows the multi-slot range.
pub fn partition_pages_per_span(slot_size: usize) -> usize {
    debug_assert!(slot_size > 0);
    if slot_size > MAX_PARTITION_PAGES_PER_SLOT_SPAN * PARTITION_PAGE_SIZE {
        return slot_size.div_ceil(PARTITION_PAGE_SIZE);
    }

    let mut best_pages = 0usize;
    let mut best_waste = usize::MAX;
    for pages in 1..=MAX_PARTITION_PAGES_PER_SLOT_SPAN {
        let span = pages << PARTITION_PAGE_SHIFT;
        if span / slot_size == 0 {
            continue;
        }
        let waste = span % slot_size;
        // Compare waste/pages ratios without division.
        if best_pages == 0 || waste * best_pages < best_waste * pages {
            best_pages = pages;
            best_waste = waste;
        }
    }
    debug_assert!(best_pages > 0);
    best_pages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slab::size_class::{bucket_size, NUM_BUCKETS};

    #[test]
    fn geometry_covers_every_bucket() {
        for index in 0..NUM_BUCKETS {
            let slot = bucket_size(index);
            let mut bucket = Bucket::empty();
            bucket.init(slot);
            assert!(bucket.slots_per_span >= 1);
            let payload = bucket.span_payload_len();
            assert!(payload >= slot, "span smaller than its slot for {}", slot);
            assert!(
                bucket.slots_per_span as usize * slot <= payload,
                "slots overflow span for {}",
                slot
            );
            assert!(bucket.bytes_per_span() <= payload);
            assert_eq!(bucket.bytes_per_span() % SYSTEM_PAGE_SIZE, 0);
        }
    }

    #[test]
    fn small_buckets_pack_densely() {
        let mut bucket = Bucket::empty();
        bucket.init(16);
        assert_eq!(bucket.num_partition_pages_per_span, 1);
        assert_eq!(bucket.slots_per_span as usize, PARTITION_PAGE_SIZE / 16);
    }

    #[test]
    fn huge_buckets_are_single_slot() {
        let mut bucket = Bucket::empty();
        bucket.init(983040);
        assert_eq!(bucket.slots_per_span, 1);
        assert_eq!(
            bucket.num_partition_pages_per_span as usize,
            983040usize.div_ceil(PARTITION_PAGE_SIZE)
        );
        // Only the slot's pages are committed.
        assert_eq!(bucket.bytes_per_span(), 983040);
    }
}
