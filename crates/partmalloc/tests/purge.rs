//! PurgeMemory: decommit of empty spans, discard of clean pages inside
//! partially-used spans, and idempotence. Live pointers must never be
//! disturbed.

use partmalloc::{
    PartitionOptions, PartitionRoot, PURGE_DECOMMIT_EMPTY_SPANS,
    PURGE_DISCARD_UNUSED_SYSTEM_PAGES,
};
use std::ptr;

unsafe fn fresh_root() -> &'static PartitionRoot {
    let root = Box::leak(Box::new(PartitionRoot::new()));
    root.init(PartitionOptions::default());
    root
}

// ---------------------------------------------------------------------------
// Free everything, purge, and the committed counter returns to baseline
// ---------------------------------------------------------------------------

#[test]
fn committed_returns_to_baseline_after_full_free_and_purge() {
    unsafe {
        let root = fresh_root();
        let baseline = root.total_committed_bytes();

        let mut ptrs = Vec::new();
        for _ in 0..1000 {
            ptrs.push(root.alloc(200, "test"));
        }
        assert!(root.total_committed_bytes() > baseline);
        for p in ptrs {
            root.free(p);
        }
        root.purge_memory(PURGE_DECOMMIT_EMPTY_SPANS);
        assert_eq!(
            root.total_committed_bytes(),
            baseline,
            "all spans were empty; purge must decommit them"
        );

        // Idempotence: purging again changes nothing.
        root.purge_memory(PURGE_DECOMMIT_EMPTY_SPANS | PURGE_DISCARD_UNUSED_SYSTEM_PAGES);
        assert_eq!(root.total_committed_bytes(), baseline);
    }
}

#[test]
fn single_allocation_roundtrip_returns_committed() {
    unsafe {
        let root = fresh_root();
        // Prime the super page and bucket so the measurement sees only the
        // span of interest.
        let prime = root.alloc(50_000, "test");
        root.free(prime);
        root.purge_memory(PURGE_DECOMMIT_EMPTY_SPANS);
        let baseline = root.total_committed_bytes();

        let p = root.alloc(50_000, "test");
        assert!(root.total_committed_bytes() > baseline);
        root.free(p);
        root.purge_memory(PURGE_DECOMMIT_EMPTY_SPANS);
        assert_eq!(root.total_committed_bytes(), baseline);
    }
}

// ---------------------------------------------------------------------------
// Fragmentation: free every other slot, purge, live data is untouched
// ---------------------------------------------------------------------------

#[test]
fn purge_leaves_live_allocations_intact() {
    unsafe {
        let root = fresh_root();
        let mut ptrs = Vec::new();
        for i in 0..1000usize {
            let p = root.alloc(200, "test");
            assert!(!p.is_null());
            ptr::write_bytes(p, (i & 0x7F) as u8 | 0x80, 200);
            ptrs.push(p);
        }
        // Free the even-indexed half.
        for i in (0..1000).step_by(2) {
            root.free(ptrs[i]);
        }
        let committed_before = root.total_committed_bytes();
        root.purge_memory(PURGE_DECOMMIT_EMPTY_SPANS | PURGE_DISCARD_UNUSED_SYSTEM_PAGES);
        assert!(root.total_committed_bytes() <= committed_before);

        // Every survivor still carries its pattern.
        for (i, &p) in ptrs.iter().enumerate() {
            if i % 2 == 1 {
                let expected = (i & 0x7F) as u8 | 0x80;
                for offset in [0usize, 100, 199] {
                    assert_eq!(p.add(offset).read(), expected, "survivor {} corrupted", i);
                }
            }
        }
        // And the partition is still coherent.
        assert_eq!(root.check_integrity().errors_found, 0);

        // New allocations of the same bucket reuse the committed slots.
        let again = root.alloc(200, "test");
        assert!(!again.is_null());
        root.free(again);
        for (i, &p) in ptrs.iter().enumerate() {
            if i % 2 == 1 {
                root.free(p);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Discard path for page-sized buckets: trailing free slots are handed back
// ---------------------------------------------------------------------------

#[test]
fn discard_reclaims_pages_of_page_sized_buckets() {
    unsafe {
        let root = fresh_root();
        let slot = 8192usize;

        let mut ptrs = Vec::new();
        for _ in 0..32 {
            let p = root.alloc(slot - 64, "test");
            assert!(!p.is_null());
            ptr::write_bytes(p, 0x3D, slot - 64);
            ptrs.push(p);
        }
        // Free every other allocation so spans stay partially used.
        for i in (0..32).step_by(2) {
            root.free(ptrs[i]);
        }

        root.purge_memory(PURGE_DISCARD_UNUSED_SYSTEM_PAGES);

        for (i, &p) in ptrs.iter().enumerate() {
            if i % 2 == 1 {
                for offset in [0usize, 4096, slot - 65] {
                    assert_eq!(p.add(offset).read(), 0x3D, "survivor {} corrupted", i);
                }
            }
        }
        let report = root.check_integrity();
        assert_eq!(report.errors_found, 0, "{:?}", report);

        // The discarded slots are still allocatable afterwards.
        let mut again = Vec::new();
        for _ in 0..16 {
            let p = root.alloc(slot - 64, "test");
            assert!(!p.is_null());
            ptr::write_bytes(p, 0x2A, slot - 64);
            again.push(p);
        }
        for p in again {
            root.free(p);
        }
        for (i, &p) in ptrs.iter().enumerate() {
            if i % 2 == 1 {
                root.free(p);
            }
        }
        assert_eq!(root.check_integrity().errors_found, 0);
    }
}

#[test]
fn discard_truncates_trailing_free_slots_to_unprovisioned() {
    unsafe {
        let root = fresh_root();
        // A bucket whose span holds four page-sized slots.
        let request = 4096 - 64;
        let mut ptrs = Vec::new();
        for _ in 0..4 {
            let p = root.alloc(request, "test");
            assert!(!p.is_null());
            ptr::write_bytes(p, 0x55, request);
            ptrs.push(p);
        }
        // Free the trailing two slots; the span stays half used.
        root.free(ptrs[2]);
        root.free(ptrs[3]);
        root.purge_memory(PURGE_DISCARD_UNUSED_SYSTEM_PAGES);

        assert_eq!(root.check_integrity().errors_found, 0);
        for &p in &ptrs[..2] {
            for offset in [0usize, request - 1] {
                assert_eq!(p.add(offset).read(), 0x55);
            }
        }

        // The truncated slots re-provision in address order.
        let again = root.alloc(request, "test");
        assert_eq!(again, ptrs[2], "expected the first truncated slot back");
        root.free(again);
        root.free(ptrs[0]);
        root.free(ptrs[1]);
    }
}

#[test]
fn purge_is_idempotent_on_a_fragmented_heap() {
    unsafe {
        let root = fresh_root();
        let mut ptrs = Vec::new();
        for _ in 0..64 {
            ptrs.push(root.alloc(5000, "test"));
        }
        for i in (0..64).step_by(3) {
            root.free(ptrs[i]);
        }
        root.purge_memory(PURGE_DECOMMIT_EMPTY_SPANS | PURGE_DISCARD_UNUSED_SYSTEM_PAGES);
        let committed_once = root.total_committed_bytes();
        let spans_once = root.check_integrity().total_spans;
        root.purge_memory(PURGE_DECOMMIT_EMPTY_SPANS | PURGE_DISCARD_UNUSED_SYSTEM_PAGES);
        assert_eq!(root.total_committed_bytes(), committed_once);
        assert_eq!(root.check_integrity().total_spans, spans_once);

        for (i, &p) in ptrs.iter().enumerate() {
            if i % 3 != 0 {
                root.free(p);
            }
        }
    }
}
