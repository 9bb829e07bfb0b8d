//! partmalloc: a partitioned slab allocator.
//!
//! `PartitionRoot::alloc` and `PartitionRoot::free` are approximately
//! analogous to `malloc` and `free`, except that every call names the heap
//! partition that serves it. Partitions occupy disjoint virtual address
//! ranges for their entire lifetime, so a pointer can never move between
//! partitions; if all contained objects are freed, physical memory returns
//! to the system but the address space stays reserved.
//!
//! Allocations map to size-class buckets chosen to keep worst-case internal
//! waste near 10%. Requests above the largest bucket take a direct-map
//! path with one slot per reservation. Any request up to a hard 2 GiB cap
//! is accepted; multi-threaded use of one partition is fine, locking is
//! handled, and a per-thread cache can front the lock entirely.

extern crate libc;

pub mod allocator;
pub mod config;
pub mod hardening;
pub mod hooks;
pub mod large;
pub mod oom;
pub mod platform;
pub mod pool;
pub mod slab;
pub mod sync;
pub mod util;

pub use allocator::root::{
    Alignment, PartitionOptions, PartitionRoot, QuarantineMode, RefCountMode, ThreadCacheMode,
    ThreadSafety, ALLOC_NO_HOOKS, ALLOC_RETURN_NULL, ALLOC_ZERO_FILL,
    PURGE_DECOMMIT_EMPTY_SPANS, PURGE_DISCARD_UNUSED_SYSTEM_PAGES, PURGE_FORCE_ALL_FREED,
};
pub use config::Features;
