//! Basic allocation semantics: zero-size requests, usable sizes, realloc
//! behavior, the size cap and the counters.

use partmalloc::util::MIN_ALIGN;
use partmalloc::{
    PartitionOptions, PartitionRoot, ALLOC_RETURN_NULL, ALLOC_ZERO_FILL,
    PURGE_DECOMMIT_EMPTY_SPANS,
};
use std::collections::HashSet;
use std::ptr;

const MAX_BUCKETED: usize = 983_040;
const MAX_DIRECT_MAPPED: usize = (1 << 31) + 4096;

/// Every test gets its own partition so counter assertions cannot race
/// with the other tests in this binary.
unsafe fn fresh_root(options: PartitionOptions) -> &'static PartitionRoot {
    let root = Box::leak(Box::new(PartitionRoot::new()));
    root.init(options);
    root
}

unsafe fn plain_root() -> &'static PartitionRoot {
    fresh_root(PartitionOptions::default())
}

// ---------------------------------------------------------------------------
// alloc(0) returns a usable, distinct, freeable pointer
// ---------------------------------------------------------------------------

#[test]
fn alloc_zero_returns_distinct_pointers() {
    unsafe {
        let root = plain_root();
        let mut ptrs = Vec::new();
        for _ in 0..64 {
            let p = root.alloc(0, "test");
            assert!(!p.is_null(), "alloc(0) must return non-null");
            assert_eq!(p as usize % MIN_ALIGN, 0);
            ptrs.push(p);
        }
        let unique: HashSet<usize> = ptrs.iter().map(|p| *p as usize).collect();
        assert_eq!(unique.len(), ptrs.len(), "alloc(0) pointers must be distinct");
        for p in ptrs {
            root.free(p);
        }
    }
}

// ---------------------------------------------------------------------------
// free(null) is a no-op
// ---------------------------------------------------------------------------

#[test]
fn free_null_is_noop() {
    unsafe {
        let root = plain_root();
        root.free(ptr::null_mut());
    }
}

// ---------------------------------------------------------------------------
// usable size covers the request; the whole region is writable
// ---------------------------------------------------------------------------

#[test]
fn usable_size_covers_request() {
    unsafe {
        let root = plain_root();
        for size in [1usize, 16, 100, 1000, 4096, 50_000, MAX_BUCKETED] {
            let p = root.alloc(size, "test");
            assert!(!p.is_null());
            assert_eq!(p as usize % MIN_ALIGN, 0);
            let usable = PartitionRoot::get_usable_size(p);
            assert!(usable >= size, "usable {} < requested {}", usable, size);
            ptr::write_bytes(p, 0xAA, usable);
            root.free(p);
        }
    }
}

#[test]
fn actual_size_matches_allocation() {
    unsafe {
        let root = plain_root();
        for size in [1usize, 100, 5000, 70_000] {
            let predicted = root.actual_size(size);
            assert!(predicted >= size);
            let p = root.alloc(size, "test");
            assert_eq!(PartitionRoot::get_usable_size(p), predicted);
            root.free(p);
        }
    }
}

// ---------------------------------------------------------------------------
// A freed slot is the next candidate for the same bucket (same thread)
// ---------------------------------------------------------------------------

#[test]
fn freed_slot_is_reused_first() {
    unsafe {
        let root = plain_root();
        let p = root.alloc(100, "test");
        assert!(!p.is_null());
        ptr::write_bytes(p, 0xAA, PartitionRoot::get_usable_size(p));
        root.free(p);
        let q = root.alloc(100, "test");
        assert_eq!(p, q, "freed slot must be the next candidate");
        root.free(q);
    }
}

// ---------------------------------------------------------------------------
// Zero-fill, including recycled slots full of stale data
// ---------------------------------------------------------------------------

#[test]
fn zero_fill_is_all_zero() {
    unsafe {
        let root = plain_root();
        // Dirty a slot first so the zero-fill cannot ride on fresh pages.
        let dirty = root.alloc(1024, "test");
        ptr::write_bytes(dirty, 0x5C, 1024);
        root.free(dirty);

        let p = root.alloc_flags(ALLOC_ZERO_FILL, 1024, "test");
        assert_eq!(p, dirty, "expected the recycled slot");
        for i in 0..1024 {
            assert_eq!(p.add(i).read(), 0, "byte {} not zeroed", i);
        }
        root.free(p);
    }
}

// ---------------------------------------------------------------------------
// Size cap: ReturnNull yields null, oversized requests never succeed
// ---------------------------------------------------------------------------

#[test]
fn over_cap_with_return_null_is_null() {
    unsafe {
        let root = plain_root();
        let p = root.alloc_flags(ALLOC_RETURN_NULL, MAX_DIRECT_MAPPED + 1, "test");
        assert!(p.is_null());
        let q = root.alloc_flags(ALLOC_RETURN_NULL, usize::MAX - 100, "test");
        assert!(q.is_null());
    }
}

// ---------------------------------------------------------------------------
// Realloc
// ---------------------------------------------------------------------------

#[test]
fn realloc_null_acts_as_alloc() {
    unsafe {
        let root = plain_root();
        let p = root.realloc(ptr::null_mut(), 128, "test");
        assert!(!p.is_null());
        ptr::write_bytes(p, 0xAB, 128);
        root.free(p);
    }
}

#[test]
fn realloc_to_zero_frees() {
    unsafe {
        let root = plain_root();
        let p = root.alloc(64, "test");
        let q = root.realloc(p, 0, "test");
        assert!(q.is_null());
    }
}

#[test]
fn realloc_within_bucket_is_in_place() {
    unsafe {
        let root = plain_root();
        let p = root.alloc(150, "test");
        ptr::write_bytes(p, 0x42, 150);
        let q = root.realloc(p, 155, "test");
        assert_eq!(p, q, "same bucket must not move");
        root.free(q);
    }
}

#[test]
fn realloc_grow_preserves_contents() {
    unsafe {
        let root = plain_root();
        let p = root.alloc(32, "test");
        ptr::write_bytes(p, 0x7E, 32);
        let q = root.realloc(p, 4096, "test");
        assert!(!q.is_null());
        for i in 0..32 {
            assert_eq!(q.add(i).read(), 0x7E, "byte {} lost in realloc", i);
        }
        root.free(q);
    }
}

#[test]
fn try_realloc_over_cap_leaves_pointer_valid() {
    unsafe {
        let root = plain_root();
        let p = root.alloc(64, "test");
        ptr::write_bytes(p, 0x33, 64);
        let q = root.try_realloc(p, MAX_DIRECT_MAPPED + 1, "test");
        assert!(q.is_null());
        // p must still be intact.
        for i in 0..64 {
            assert_eq!(p.add(i).read(), 0x33);
        }
        root.free(p);
    }
}

// ---------------------------------------------------------------------------
// Pointer-to-root recovery and counters
// ---------------------------------------------------------------------------

#[test]
fn from_pointer_identifies_the_partition() {
    unsafe {
        let root = plain_root();
        let other = plain_root();
        let p = root.alloc(100, "test");
        let q = other.alloc(100, "test");
        assert_eq!(PartitionRoot::from_pointer(p), root as *const PartitionRoot);
        assert_eq!(PartitionRoot::from_pointer(q), other as *const PartitionRoot);
        assert_ne!(
            PartitionRoot::from_pointer(p),
            PartitionRoot::from_pointer(q)
        );
        root.free(p);
        other.free(q);
    }
}

#[test]
fn counters_stay_consistent() {
    unsafe {
        let root = plain_root();
        let mut ptrs = Vec::new();
        for i in 0..200 {
            ptrs.push(root.alloc(64 + (i % 7) * 512, "test"));
        }
        assert!(
            root.total_committed_bytes()
                <= root.total_super_page_bytes() + root.total_direct_mapped_bytes()
        );
        for p in ptrs {
            root.free(p);
        }
        root.purge_memory(PURGE_DECOMMIT_EMPTY_SPANS);
        assert!(
            root.total_committed_bytes()
                <= root.total_super_page_bytes() + root.total_direct_mapped_bytes()
        );
    }
}

#[test]
fn integrity_walk_is_clean_after_churn() {
    unsafe {
        let root = plain_root();
        let mut live = Vec::new();
        for round in 0..10 {
            for size in [8usize, 100, 900, 5000, 20_000] {
                live.push(root.alloc(size + round, "test"));
            }
            if round % 2 == 1 {
                for p in live.drain(..7) {
                    root.free(p);
                }
            }
        }
        let report = root.check_integrity();
        assert_eq!(report.errors_found, 0, "integrity errors: {:?}", report);
        assert_eq!(report.slots_in_use, live.len());
        for p in live {
            root.free(p);
        }
        let report = root.check_integrity();
        assert_eq!(report.errors_found, 0);
        assert_eq!(report.slots_in_use, 0);
    }
}
