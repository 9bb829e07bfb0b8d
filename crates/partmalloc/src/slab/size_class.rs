//! Size classes and the size-to-bucket lookup.
//!
//! Bucket sizes partition `[SMALLEST_BUCKET, MAX_BUCKETED]` into power-of-two
//! orders, each split into 8 linear steps, bounding worst-case internal
//! waste to 1/8. Every table below is built at compile time and lives in
//! read-only data; the lookup itself is a count-leading-zeros plus two table
//! loads.
//!
//! Example for a request of 41 bytes (binary 101001): the order is 6 (the
//! highest set bit is 32), the order index is the next three bits (010 = 2),
//! and the remaining low bits bump the result up one step, landing on the
//! 48-byte class.

use crate::util::{ALLOCATION_GRANULARITY, MIN_ALIGN};

pub const SMALLEST_BUCKET: usize = MIN_ALIGN;

pub const NUM_BUCKETS_PER_ORDER_BITS: usize = 3;
pub const NUM_BUCKETS_PER_ORDER: usize = 1 << NUM_BUCKETS_PER_ORDER_BITS;

/// Order n covers sizes in (2^(n-1), 2^n]. Order 5 starts at 16 bytes;
/// order 20 ends just under 1 MiB.
pub const MIN_BUCKETED_ORDER: usize = 5;
pub const MAX_BUCKETED_ORDER: usize = 20;
pub const NUM_BUCKETED_ORDERS: usize = MAX_BUCKETED_ORDER - MIN_BUCKETED_ORDER + 1;

pub const NUM_BUCKETS: usize = NUM_BUCKETED_ORDERS * NUM_BUCKETS_PER_ORDER;

/// One past the real buckets; requests above `MAX_BUCKETED` land here and
/// take the direct-map path.
pub const SENTINEL_BUCKET_INDEX: usize = NUM_BUCKETS;

/// The largest bucketed slot size.
pub const MAX_BUCKETED: usize = 983040;

/// Hard cap on any single request. Chosen so `int`-sized attacker-controlled
/// lengths cannot reach the allocator.
pub const MAX_DIRECT_MAPPED: usize = (1 << 31) + ALLOCATION_GRANULARITY;

pub const BITS_PER_SIZE_T: usize = usize::BITS as usize;

const fn order_index_shift(order: usize) -> u32 {
    if order < NUM_BUCKETS_PER_ORDER_BITS + 1 {
        0
    } else {
        (order - (NUM_BUCKETS_PER_ORDER_BITS + 1)) as u32
    }
}

const fn order_sub_index_mask(order: usize) -> usize {
    if order == BITS_PER_SIZE_T {
        usize::MAX >> (NUM_BUCKETS_PER_ORDER_BITS + 1)
    } else if order == 0 {
        0
    } else {
        ((1usize << order) - 1) >> (NUM_BUCKETS_PER_ORDER_BITS + 1)
    }
}

const fn build_order_index_shifts() -> [u32; BITS_PER_SIZE_T + 1] {
    let mut table = [0u32; BITS_PER_SIZE_T + 1];
    let mut order = 0;
    while order <= BITS_PER_SIZE_T {
        table[order] = order_index_shift(order);
        order += 1;
    }
    table
}

const fn build_order_sub_index_masks() -> [usize; BITS_PER_SIZE_T + 1] {
    let mut table = [0usize; BITS_PER_SIZE_T + 1];
    let mut order = 0;
    while order <= BITS_PER_SIZE_T {
        table[order] = order_sub_index_mask(order);
        order += 1;
    }
    table
}

static ORDER_INDEX_SHIFT: [u32; BITS_PER_SIZE_T + 1] = build_order_index_shifts();
static ORDER_SUB_INDEX_MASK: [usize; BITS_PER_SIZE_T + 1] = build_order_sub_index_masks();

const fn build_bucket_sizes() -> [u32; NUM_BUCKETS] {
    let mut sizes = [0u32; NUM_BUCKETS];
    let mut current_size = SMALLEST_BUCKET;
    let mut current_increment = SMALLEST_BUCKET >> NUM_BUCKETS_PER_ORDER_BITS;
    let mut i = 0;
    while i < NUM_BUCKETED_ORDERS {
        let mut j = 0;
        while j < NUM_BUCKETS_PER_ORDER {
            sizes[i * NUM_BUCKETS_PER_ORDER + j] = current_size as u32;
            current_size += current_increment;
            j += 1;
        }
        current_increment <<= 1;
        i += 1;
    }
    sizes
}

/// Slot size of every bucket, ascending. Entries that are not multiples of
/// `SMALLEST_BUCKET` are pseudo buckets: the lookup never maps a size to
/// them and they stay unused for the life of the partition.
pub static BUCKET_SIZES: [u32; NUM_BUCKETS] = build_bucket_sizes();

const LOOKUP_LEN: usize = (BITS_PER_SIZE_T + 1) * NUM_BUCKETS_PER_ORDER + 1;

const fn build_bucket_index_lookup() -> [u16; LOOKUP_LEN] {
    let sizes = build_bucket_sizes();
    let mut table = [0u16; LOOKUP_LEN];
    let mut p = 0;
    let mut bucket_index = 0usize;

    let mut order = 0;
    while order <= BITS_PER_SIZE_T {
        let mut j = 0;
        while j < NUM_BUCKETS_PER_ORDER {
            let entry = if order < MIN_BUCKETED_ORDER {
                // Sub-minimum sizes (malloc(0), malloc(1), ...) use the
                // finest-granularity bucket.
                0
            } else if order > MAX_BUCKETED_ORDER {
                SENTINEL_BUCKET_INDEX as u16
            } else {
                // Skip pseudo buckets so every served size is a multiple of
                // the smallest bucket.
                let mut valid = bucket_index;
                while sizes[valid] as usize % SMALLEST_BUCKET != 0 {
                    valid += 1;
                }
                bucket_index += 1;
                valid as u16
            };
            table[p] = entry;
            p += 1;
            j += 1;
        }
        order += 1;
    }
    // One extra entry for sizes whose ceiling bump overflows past the last
    // real order (e.g. a request of usize::MAX).
    table[p] = SENTINEL_BUCKET_INDEX as u16;
    table
}

static BUCKET_INDEX_LOOKUP: [u16; LOOKUP_LEN] = build_bucket_index_lookup();

/// Map a raw request size (extras already included) to a bucket index.
/// Returns `SENTINEL_BUCKET_INDEX` for sizes above `MAX_BUCKETED`.
#[inline(always)]
pub const fn size_to_bucket_index(size: usize) -> usize {
    let order = BITS_PER_SIZE_T - size.leading_zeros() as usize;
    let order_index =
        (size >> order_index_shift(order)) & (NUM_BUCKETS_PER_ORDER - 1);
    let sub_order_index = size & order_sub_index_mask(order);
    let bump = (sub_order_index != 0) as usize;
    build_bucket_index_lookup()[(order << NUM_BUCKETS_PER_ORDER_BITS) + order_index + bump]
        as usize
}

/// Runtime lookup reading the resident tables; same result as the const
/// variant without rebuilding anything.
#[inline(always)]
pub fn bucket_index_for_size(size: usize) -> usize {
    let order = BITS_PER_SIZE_T - size.leading_zeros() as usize;
    let order_index = (size >> ORDER_INDEX_SHIFT[order]) & (NUM_BUCKETS_PER_ORDER - 1);
    let sub_order_index = size & ORDER_SUB_INDEX_MASK[order];
    let bump = (sub_order_index != 0) as usize;
    BUCKET_INDEX_LOOKUP[(order << NUM_BUCKETS_PER_ORDER_BITS) + order_index + bump] as usize
}

/// Slot size for a (non-sentinel) bucket index.
#[inline(always)]
pub fn bucket_size(index: usize) -> usize {
    BUCKET_SIZES[index] as usize
}

const _: () = assert!(build_bucket_sizes()[NUM_BUCKETS - 1] as usize == MAX_BUCKETED);
const _: () = assert!(MAX_BUCKETED % SMALLEST_BUCKET == 0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smallest_and_largest_bucket() {
        assert_eq!(BUCKET_SIZES[0] as usize, SMALLEST_BUCKET);
        assert_eq!(BUCKET_SIZES[NUM_BUCKETS - 1] as usize, MAX_BUCKETED);
    }

    #[test]
    fn lookup_boundaries() {
        // Sub-minimum sizes use bucket 0.
        assert_eq!(bucket_index_for_size(0), 0);
        assert_eq!(bucket_index_for_size(1), 0);
        assert_eq!(bucket_index_for_size(16), 0);
        // 17 cannot use the 16-byte bucket.
        assert!(bucket_index_for_size(17) > 0);
        // The largest bucketed size maps to the last bucket.
        assert_eq!(bucket_index_for_size(MAX_BUCKETED), NUM_BUCKETS - 1);
        // One past it goes to the sentinel.
        assert_eq!(bucket_index_for_size(MAX_BUCKETED + 1), SENTINEL_BUCKET_INDEX);
        assert_eq!(bucket_index_for_size(usize::MAX), SENTINEL_BUCKET_INDEX);
    }

    #[test]
    fn every_served_bucket_is_aligned() {
        let mut size = 1;
        while size <= MAX_BUCKETED {
            let idx = bucket_index_for_size(size);
            assert!(idx < NUM_BUCKETS, "size {} escaped the buckets", size);
            let slot = bucket_size(idx);
            assert!(slot >= size, "bucket {} too small for {}", slot, size);
            assert_eq!(slot % SMALLEST_BUCKET, 0, "unaligned bucket {}", slot);
            size = size * 7 / 5 + 1;
        }
    }

    #[test]
    fn lookup_is_monotonic() {
        let probes = [
            1, 15, 16, 17, 31, 32, 41, 100, 112, 127, 128, 500, 512, 4095, 4096, 8192, 65535,
            65536, 100_000, 500_000, 983_040,
        ];
        for pair in probes.windows(2) {
            assert!(
                bucket_index_for_size(pair[0]) <= bucket_index_for_size(pair[1]),
                "non-monotonic between {} and {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn waste_is_bounded() {
        // Worst-case internal waste is one linear step, i.e. 1/8 of the
        // size, plus alignment rounding for the smallest classes.
        let mut size = 128;
        while size <= MAX_BUCKETED {
            let slot = bucket_size(bucket_index_for_size(size));
            assert!(
                (slot - size) * 8 <= size + 8 * SMALLEST_BUCKET,
                "waste too high for {} -> {}",
                size,
                slot
            );
            size = size * 9 / 8 + 3;
        }
    }

    #[test]
    fn const_and_runtime_lookup_agree() {
        for size in [0usize, 1, 16, 41, 983040, 983041, 1 << 22] {
            assert_eq!(size_to_bucket_index(size), bucket_index_for_size(size));
        }
    }
}
