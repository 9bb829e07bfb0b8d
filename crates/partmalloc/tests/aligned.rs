//! Aligned allocation on an AlignedAllocCapable partition: no per-slot
//! extras, slots fall on their natural power-of-two boundaries, and the
//! partition's memory stays outside the address pools.

use partmalloc::pool::NORMAL_BUCKET_POOL;
use partmalloc::util::PARTITION_PAGE_SIZE;
use partmalloc::{Alignment, PartitionOptions, PartitionRoot};
use std::ptr;

const MAX_BUCKETED: usize = 983_040;

unsafe fn aligned_root() -> &'static PartitionRoot {
    let root = Box::leak(Box::new(PartitionRoot::new()));
    root.init(PartitionOptions {
        alignment: Alignment::AlignedAllocCapable,
        ..PartitionOptions::default()
    });
    root
}

#[test]
fn alignment_matrix() {
    unsafe {
        let root = aligned_root();
        for alignment in [16usize, 64, 256, 4096] {
            for size in [1usize, 17, 4095, 4096] {
                let p = root.aligned_alloc(alignment, size);
                assert!(!p.is_null(), "aligned_alloc({}, {})", alignment, size);
                assert_eq!(
                    p as usize % alignment,
                    0,
                    "misaligned for alignment {} size {}",
                    alignment,
                    size
                );
                let usable = PartitionRoot::get_usable_size(p);
                assert!(usable >= size);
                assert!(usable >= alignment);
                ptr::write_bytes(p, 0x11, usable);
                root.free(p);
            }
        }
    }
}

#[test]
fn partition_page_alignment_is_supported() {
    unsafe {
        let root = aligned_root();
        let p = root.aligned_alloc(PARTITION_PAGE_SIZE, 1);
        assert!(!p.is_null());
        assert_eq!(p as usize % PARTITION_PAGE_SIZE, 0);
        root.free(p);
    }
}

#[test]
fn aligned_partition_lives_outside_the_pools() {
    unsafe {
        let root = aligned_root();
        let p = root.aligned_alloc(64, 64);
        assert!(!p.is_null());
        assert!(
            !NORMAL_BUCKET_POOL.contains(p),
            "aligned-alloc partitions must not allocate from the pools"
        );
        root.free(p);
    }
}

// ---------------------------------------------------------------------------
// Bucket/direct-map boundary, observable without extras in the way
// ---------------------------------------------------------------------------

#[test]
fn max_bucketed_boundary() {
    unsafe {
        let root = aligned_root();

        let before = root.total_direct_mapped_bytes();
        let p = root.alloc(MAX_BUCKETED, "test");
        assert!(!p.is_null());
        assert_eq!(
            root.total_direct_mapped_bytes(),
            before,
            "MAX_BUCKETED must use the largest bucket"
        );
        assert_eq!(PartitionRoot::get_usable_size(p), MAX_BUCKETED);

        let q = root.alloc(MAX_BUCKETED + 1, "test");
        assert!(!q.is_null());
        assert!(
            root.total_direct_mapped_bytes() > before,
            "MAX_BUCKETED + 1 must take the direct-map path"
        );

        root.free(p);
        root.free(q);
        assert_eq!(root.total_direct_mapped_bytes(), before);
    }
}

#[test]
fn power_of_two_sizes_are_naturally_aligned() {
    unsafe {
        let root = aligned_root();
        for shift in 4..=14 {
            let size = 1usize << shift;
            let p = root.aligned_alloc(size, size);
            assert!(!p.is_null());
            assert_eq!(p as usize % size, 0, "size {} not self-aligned", size);
            root.free(p);
        }
    }
}
