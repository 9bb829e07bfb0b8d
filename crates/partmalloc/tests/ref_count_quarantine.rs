//! The deferred-free protocols: in-slot reference counts held by smart
//! pointers, and the quarantine handler taking ownership of freed pointers.

use partmalloc::slab::SlotSpan;
use partmalloc::util::QUARANTINED_BYTE;
use partmalloc::{
    PartitionOptions, PartitionRoot, QuarantineMode, RefCountMode,
};
use std::sync::Mutex;

unsafe fn rc_root() -> &'static PartitionRoot {
    let root = Box::leak(Box::new(PartitionRoot::new()));
    root.init(PartitionOptions {
        ref_count: RefCountMode::Enabled,
        ..PartitionOptions::default()
    });
    root
}

// ---------------------------------------------------------------------------
// An outstanding reference defers the reclaim and poisons the contents
// ---------------------------------------------------------------------------

#[test]
fn outstanding_reference_defers_the_free() {
    unsafe {
        let root = rc_root();
        let p = root.alloc(100, "test");
        assert!(!p.is_null());
        p.write_bytes(0x42, 100);

        // A smart pointer takes a reference.
        root.ref_count_pointer(p).acquire();

        // Free with the reference still out: the slot must not recycle.
        root.free(p);
        let q = root.alloc(100, "test");
        assert_ne!(p, q, "deferred slot must not be recycled");

        // The contents were neutralized to the quarantine byte.
        for offset in [0usize, 50, 99] {
            assert_eq!(p.add(offset).read(), QUARANTINED_BYTE);
        }

        // The last reference drops; the holder finalizes the slot.
        let slot_start = root.slot_start(p);
        assert!(root.ref_count_pointer(p).release());
        root.free_for_ref_counting(slot_start);

        // Now the slot is a reuse candidate again.
        let r = root.alloc(100, "test");
        assert_eq!(p, r, "finalized slot must be reusable");

        root.free(r);
        root.free(q);
        assert_eq!(root.check_integrity().errors_found, 0);
    }
}

#[test]
fn unreferenced_slots_free_immediately() {
    unsafe {
        let root = rc_root();
        let p = root.alloc(64, "test");
        root.free(p);
        let q = root.alloc(64, "test");
        assert_eq!(p, q, "no references: the slot recycles immediately");
        root.free(q);
    }
}

// ---------------------------------------------------------------------------
// Quarantine handler takes ownership of non-direct-map frees
// ---------------------------------------------------------------------------

static QUARANTINED: Mutex<Vec<usize>> = Mutex::new(Vec::new());

unsafe fn collector(ptr: *mut u8, _span: *mut SlotSpan) {
    QUARANTINED.lock().unwrap().push(ptr as usize);
}

#[test]
fn quarantine_intercepts_frees_until_finalized() {
    unsafe {
        let root = Box::leak(Box::new(PartitionRoot::new()));
        root.init(PartitionOptions {
            quarantine: QuarantineMode::DisabledByDefault,
            ..PartitionOptions::default()
        });

        partmalloc::allocator::root::set_quarantine_handler(collector);
        let p = root.alloc(300, "test");
        assert!(!p.is_null());

        // Quarantine still off: frees are immediate.
        root.free(p);
        assert!(QUARANTINED.lock().unwrap().is_empty());
        let p = root.alloc(300, "test");

        root.enable_quarantine();
        root.free(p);
        {
            let seen = QUARANTINED.lock().unwrap();
            assert_eq!(seen.len(), 1, "the handler must receive the freed pointer");
            assert_eq!(seen[0], p as usize);
        }

        // The slot is owned by the quarantine: not a reuse candidate.
        let q = root.alloc(300, "test");
        assert_ne!(p, q);

        // The scanner finalizes; the slot returns to circulation.
        root.free_for_ref_counting(root.slot_start(p));
        let r = root.alloc(300, "test");
        assert_eq!(p, r);

        // Direct-map allocations bypass the quarantine entirely.
        let big = root.alloc(2_000_000, "test");
        let quarantined_before = QUARANTINED.lock().unwrap().len();
        root.free(big);
        assert_eq!(QUARANTINED.lock().unwrap().len(), quarantined_before);

        root.free(q);
        root.free(r);
        assert_eq!(root.check_integrity().errors_found, 0);
    }
}
