//! The partition root: one isolated heap.
//!
//! A root owns its buckets, its super-page extents, its direct-map list and
//! one lock guarding all of them. The alloc fast path is: adjust the size
//! for extras, map it to a bucket, pop the thread cache or the active
//! span's freelist. Everything else -- provisioning, span state
//! transitions, super-page growth, the direct map -- is the slow path.
//!
//! Roots are never destroyed and never move: span metadata carries a plain
//! back-pointer to the root, and the root stores the bitwise complement of
//! its own address (`inverted_self`) which every slow-path entry checks.

use crate::allocator::thread_cache::{self, NUM_CACHED_BUCKETS};
use crate::config;
use crate::hardening::cookie::{self, COOKIE_SIZE};
use crate::hardening::ref_count::{PartitionRefCount, REF_COUNT_SIZE};
use crate::hardening::self_check::IntegrityResult;
use crate::hardening;
use crate::hooks;
use crate::large::{self, DirectMapExtent};
use crate::oom;
use crate::platform;
use crate::pool::NORMAL_BUCKET_POOL;
use crate::slab::bucket::Bucket;
use crate::slab::freelist;
use crate::slab::page::{
    self, SlotSpan, SuperPageExtent, FIRST_PAYLOAD_PAGE, KIND_DIRECT_MAP, KIND_SPAN_HEAD,
    KIND_SPAN_TAIL, PAYLOAD_PAGE_LIMIT,
};
use crate::slab::size_class::{
    bucket_index_for_size, bucket_size, BUCKET_SIZES, MAX_DIRECT_MAPPED, NUM_BUCKETS,
    SENTINEL_BUCKET_INDEX,
};
use crate::sync::PartitionLock;
use crate::util::{
    align_down, align_up, FREED_BYTE, MAX_FREEABLE_SPANS, MAX_PARTITION_PAGES_PER_SLOT_SPAN,
    PARTITION_PAGE_SIZE, QUARANTINED_BYTE, SUPER_PAGE_BASE_MASK, SUPER_PAGE_SIZE,
    SYSTEM_PAGE_SIZE, UNINITIALIZED_BYTE,
};
use core::cell::UnsafeCell;
use core::mem::offset_of;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

// ============================================================================
// Flags and options
// ============================================================================

/// Return null instead of aborting on out-of-memory.
pub const ALLOC_RETURN_NULL: u32 = 1 << 0;
/// Guarantee the returned region reads as zero.
pub const ALLOC_ZERO_FILL: u32 = 1 << 1;
/// Skip the allocation hooks.
pub const ALLOC_NO_HOOKS: u32 = 1 << 2;

/// Decommit the ring of empty slot spans.
pub const PURGE_DECOMMIT_EMPTY_SPANS: u32 = 1 << 0;
/// Discard clean system pages inside partially-used spans of buckets whose
/// slots reach a system page. Slower: walks their freelists.
pub const PURGE_DISCARD_UNUSED_SYSTEM_PAGES: u32 = 1 << 1;
/// Materialize deferred frees (the calling thread's cache bins).
pub const PURGE_FORCE_ALL_FREED: u32 = 1 << 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Alignment {
    /// Every allocation is aligned to `MIN_ALIGN`.
    Regular,
    /// Additionally supports `aligned_alloc`. Costs the per-slot extras
    /// (no cookies, no ref-count) and keeps the partition outside the
    /// address pools so pointer-origin checks can tell its allocations
    /// apart.
    AlignedAllocCapable,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadCacheMode {
    Disabled,
    Enabled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuarantineMode {
    /// No quarantine ever; frees are always immediate.
    AlwaysDisabled,
    /// Off until `enable_quarantine` is called.
    DisabledByDefault,
    ForcedEnabled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefCountMode {
    Disabled,
    Enabled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadSafety {
    /// Substitute the no-op lock. The partition must stay on one thread.
    SingleThreaded,
    MultiThreaded,
}

#[derive(Clone, Copy, Debug)]
pub struct PartitionOptions {
    pub alignment: Alignment,
    pub thread_cache: ThreadCacheMode,
    pub quarantine: QuarantineMode,
    pub ref_count: RefCountMode,
    pub thread_safety: ThreadSafety,
}

impl Default for PartitionOptions {
    fn default() -> Self {
        PartitionOptions {
            alignment: Alignment::Regular,
            thread_cache: ThreadCacheMode::Disabled,
            quarantine: QuarantineMode::AlwaysDisabled,
            ref_count: RefCountMode::Disabled,
            thread_safety: ThreadSafety::MultiThreaded,
        }
    }
}

const QUARANTINE_NON_SCANNABLE: u8 = 0;
const QUARANTINE_OFF: u8 = 1;
const QUARANTINE_ON: u8 = 2;

// ============================================================================
// Quarantine seam
// ============================================================================

/// Takes ownership of a freed pointer; the allocator will not touch the
/// slot again until the scanner finalizes it through
/// `PartitionRoot::free_for_ref_counting`.
pub type QuarantineHandler = unsafe fn(ptr: *mut u8, slot_span: *mut SlotSpan);

static QUARANTINE_HANDLER: AtomicUsize = AtomicUsize::new(0);

/// Register the process-wide quarantine scanner. May be called at most
/// once.
pub fn set_quarantine_handler(handler: QuarantineHandler) {
    if QUARANTINE_HANDLER
        .compare_exchange(0, handler as usize, Ordering::AcqRel, Ordering::Relaxed)
        .is_err()
    {
        hardening::abort_with_message("partmalloc: quarantine handler installed twice\n");
    }
}

#[inline]
fn quarantine_handler() -> Option<QuarantineHandler> {
    let raw = QUARANTINE_HANDLER.load(Ordering::Acquire);
    if raw == 0 {
        None
    } else {
        Some(unsafe { core::mem::transmute::<usize, QuarantineHandler>(raw) })
    }
}

/// Only one partition per process may enable the thread cache; a second
/// request is a configuration conflict.
static THREAD_CACHE_OWNER: AtomicUsize = AtomicUsize::new(0);

// ============================================================================
// The root
// ============================================================================

struct RootInner {
    buckets: [Bucket; NUM_BUCKETS],
    /// Provisioning cursor inside the current super page.
    next_partition_page: *mut u8,
    next_partition_page_end: *mut u8,
    current_extent: *mut SuperPageExtent,
    first_extent: *mut SuperPageExtent,
    direct_map_list: *mut DirectMapExtent,
    /// FIFO ring of empty spans; an insertion that lands on an occupied
    /// slot decommits the evicted span.
    empty_spans_ring: [*mut SlotSpan; MAX_FREEABLE_SPANS],
    empty_spans_ring_index: usize,
}

pub struct PartitionRoot {
    lock: PartitionLock,
    inner: UnsafeCell<RootInner>,

    initialized: AtomicBool,
    with_thread_cache: AtomicBool,
    quarantine_state: AtomicU8,

    allow_ref_count: bool,
    allow_cookies: bool,
    allow_aligned_alloc: bool,
    use_pools: bool,
    extras_size: u32,
    extras_offset: u32,

    /// `!(self as usize)`; checked before trusting span metadata.
    inverted_self: usize,

    // Advisory counters, relaxed ordering throughout.
    total_size_of_committed_pages: AtomicUsize,
    total_size_of_super_pages: AtomicUsize,
    total_size_of_direct_mapped_pages: AtomicUsize,
}

unsafe impl Send for PartitionRoot {}
unsafe impl Sync for PartitionRoot {}

impl PartitionRoot {
    pub const fn new() -> Self {
        const EMPTY_BUCKET: Bucket = Bucket::empty();
        PartitionRoot {
            lock: PartitionLock::new(),
            inner: UnsafeCell::new(RootInner {
                buckets: [EMPTY_BUCKET; NUM_BUCKETS],
                next_partition_page: ptr::null_mut(),
                next_partition_page_end: ptr::null_mut(),
                current_extent: ptr::null_mut(),
                first_extent: ptr::null_mut(),
                direct_map_list: ptr::null_mut(),
                empty_spans_ring: [ptr::null_mut(); MAX_FREEABLE_SPANS],
                empty_spans_ring_index: 0,
            }),
            initialized: AtomicBool::new(false),
            with_thread_cache: AtomicBool::new(false),
            quarantine_state: AtomicU8::new(QUARANTINE_NON_SCANNABLE),
            allow_ref_count: false,
            allow_cookies: false,
            allow_aligned_alloc: false,
            use_pools: false,
            extras_size: 0,
            extras_offset: 0,
            inverted_self: 0,
            total_size_of_committed_pages: AtomicUsize::new(0),
            total_size_of_super_pages: AtomicUsize::new(0),
            total_size_of_direct_mapped_pages: AtomicUsize::new(0),
        }
    }

    /// Fix the partition's configuration. The root must never move after
    /// this call: span metadata will hold its address.
    ///
    /// # Safety
    /// Must be called exactly once, before the root is shared.
    pub unsafe fn init(&mut self, options: PartitionOptions) {
        if self.initialized.load(Ordering::Relaxed) {
            hardening::abort_with_token("partition initialized twice", self as *const _ as usize);
        }
        config::ensure_initialized();

        self.lock
            .set_thread_safe(options.thread_safety == ThreadSafety::MultiThreaded);

        let aligned = options.alignment == Alignment::AlignedAllocCapable;
        self.allow_aligned_alloc = aligned;
        self.allow_cookies = !aligned;
        self.allow_ref_count =
            options.ref_count == RefCountMode::Enabled && config::ref_count_enabled() && !aligned;
        self.use_pools = config::address_pools_enabled() && !aligned;

        let mut extras_offset = 0usize;
        if self.allow_ref_count {
            extras_offset += REF_COUNT_SIZE;
        }
        let mut extras_size = 0usize;
        if cfg!(debug_assertions) && self.allow_cookies {
            extras_offset += COOKIE_SIZE;
            extras_size += COOKIE_SIZE;
        }
        extras_size += extras_offset;
        self.extras_offset = extras_offset as u32;
        self.extras_size = extras_size as u32;

        self.quarantine_state.store(
            match options.quarantine {
                QuarantineMode::AlwaysDisabled => QUARANTINE_NON_SCANNABLE,
                QuarantineMode::DisabledByDefault => {
                    if config::quarantine_enabled() {
                        QUARANTINE_OFF
                    } else {
                        QUARANTINE_NON_SCANNABLE
                    }
                }
                QuarantineMode::ForcedEnabled => QUARANTINE_ON,
            },
            Ordering::Relaxed,
        );

        if options.thread_cache == ThreadCacheMode::Enabled {
            let token = self as *const _ as usize;
            if THREAD_CACHE_OWNER
                .compare_exchange(0, token, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                hardening::abort_with_token(
                    "thread cache is already claimed by another partition",
                    token,
                );
            }
            self.with_thread_cache.store(true, Ordering::Relaxed);
        }

        let inner = self.inner.get_mut();
        for (index, bucket) in inner.buckets.iter_mut().enumerate() {
            bucket.init(BUCKET_SIZES[index] as usize);
        }

        self.inverted_self = !(self as *const _ as usize);
        self.initialized.store(true, Ordering::Release);
    }

    #[inline]
    fn token(&self) -> usize {
        self as *const _ as usize
    }

    #[inline]
    pub(crate) fn uses_pools(&self) -> bool {
        self.use_pools
    }

    // ------------------------------------------------------------------------
    // Advisory counters
    // ------------------------------------------------------------------------

    #[inline]
    pub(crate) fn increase_committed(&self, len: usize) {
        self.total_size_of_committed_pages
            .fetch_add(len, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn decrease_committed(&self, len: usize) {
        self.total_size_of_committed_pages
            .fetch_sub(len, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn note_direct_map_reserved(&self, len: usize) {
        self.total_size_of_direct_mapped_pages
            .fetch_add(len, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn note_direct_map_released(&self, len: usize) {
        self.total_size_of_direct_mapped_pages
            .fetch_sub(len, Ordering::Relaxed);
    }

    pub fn total_committed_bytes(&self) -> usize {
        self.total_size_of_committed_pages.load(Ordering::Relaxed)
    }

    pub fn total_super_page_bytes(&self) -> usize {
        self.total_size_of_super_pages.load(Ordering::Relaxed)
    }

    pub fn total_direct_mapped_bytes(&self) -> usize {
        self.total_size_of_direct_mapped_pages.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------------
    // Public allocation API
    // ------------------------------------------------------------------------

    /// Allocate `size` bytes. Aborts on out-of-memory.
    ///
    /// # Safety
    /// The root must be initialized.
    #[inline]
    pub unsafe fn alloc(&self, size: usize, type_name: &'static str) -> *mut u8 {
        self.alloc_flags(0, size, type_name)
    }

    /// Allocate with `ALLOC_*` flags.
    ///
    /// # Safety
    /// The root must be initialized.
    #[inline]
    pub unsafe fn alloc_flags(&self, flags: u32, size: usize, type_name: &'static str) -> *mut u8 {
        if flags & ALLOC_NO_HOOKS == 0 && hooks::are_hooks_enabled() {
            if let Some(overridden) = hooks::allocation_override(flags, size, type_name) {
                hooks::allocation_observer(overridden, size, type_name);
                return overridden;
            }
            let ret = self.alloc_flags_no_hooks(flags, size);
            hooks::allocation_observer(ret, size, type_name);
            return ret;
        }
        self.alloc_flags_no_hooks(flags, size)
    }

    /// Hook-free allocation entry; the path every internal caller uses.
    ///
    /// # Safety
    /// The root must be initialized.
    pub unsafe fn alloc_flags_no_hooks(&self, flags: u32, requested_size: usize) -> *mut u8 {
        debug_assert!(self.initialized.load(Ordering::Relaxed));

        let mut raw_size = requested_size;
        if self.allow_ref_count && raw_size == 0 {
            // A zero-sized slot would place the returned pointer at the next
            // slot's ref-count word.
            raw_size = 1;
        }
        let raw_size = match raw_size.checked_add(self.extras_size as usize) {
            Some(size) => size,
            None => return self.oom_result(flags, requested_size),
        };
        if raw_size > MAX_DIRECT_MAPPED {
            return self.oom_result(flags, requested_size);
        }

        let bucket_index = bucket_index_for_size(raw_size);
        let mut utilized_slot_size = 0usize;
        let mut is_already_zeroed = false;
        let mut slot_start = ptr::null_mut();

        if bucket_index < NUM_CACHED_BUCKETS && self.with_thread_cache.load(Ordering::Relaxed) {
            let tcache = thread_cache::current_or_create(self);
            if !tcache.is_null() {
                slot_start = (*tcache).get(bucket_index);
                if !slot_start.is_null() {
                    utilized_slot_size = bucket_size(bucket_index);
                }
            }
        }

        if slot_start.is_null() {
            slot_start = self.raw_alloc(
                bucket_index,
                raw_size,
                &mut utilized_slot_size,
                &mut is_already_zeroed,
            );
            if slot_start.is_null() {
                return self.oom_result(flags, requested_size);
            }
        }

        let usable_size = utilized_slot_size - self.extras_size as usize;
        let ret = slot_start.add(self.extras_offset as usize);

        if cfg!(debug_assertions) && self.allow_cookies {
            cookie::write_cookie(ret.sub(COOKIE_SIZE));
            cookie::write_cookie(ret.add(usable_size));
        }

        if flags & ALLOC_ZERO_FILL != 0 {
            if !is_already_zeroed {
                ptr::write_bytes(ret, 0, usable_size);
            }
        } else if cfg!(debug_assertions) {
            ptr::write_bytes(ret, UNINITIALIZED_BYTE, usable_size);
        }

        if self.allow_ref_count && bucket_index != SENTINEL_BUCKET_INDEX {
            PartitionRefCount::init(slot_start);
        }

        ret
    }

    /// Returns a pointer aligned on `alignment`. Only partitions created
    /// with `Alignment::AlignedAllocCapable` support this; the alignment
    /// must be a power of two, at least pointer-sized, and no larger than a
    /// partition page.
    ///
    /// # Safety
    /// The root must be initialized.
    #[inline]
    pub unsafe fn aligned_alloc(&self, alignment: usize, size: usize) -> *mut u8 {
        self.aligned_alloc_flags(0, alignment, size)
    }

    /// # Safety
    /// The root must be initialized.
    pub unsafe fn aligned_alloc_flags(&self, flags: u32, alignment: usize, size: usize) -> *mut u8 {
        if !self.allow_aligned_alloc {
            hardening::abort_with_token(
                "aligned_alloc on a partition without AlignedAllocCapable",
                self.token(),
            );
        }
        debug_assert!(self.extras_size == 0);
        if !alignment.is_power_of_two() || alignment < core::mem::size_of::<*mut u8>() {
            hardening::abort_with_token("aligned_alloc alignment is invalid", self.token());
        }
        if alignment > PARTITION_PAGE_SIZE {
            hardening::abort_with_token(
                "aligned_alloc alignment exceeds the partition page size",
                self.token(),
            );
        }

        // Natural slot alignment covers power-of-two sizes: a slot of a
        // power-of-two bucket sits on a multiple of its size within a
        // partition-page-aligned span, and direct-map payloads start on a
        // partition page boundary.
        let requested_size = if size < alignment {
            alignment
        } else {
            match size.checked_next_power_of_two() {
                Some(pow2) => pow2,
                None => return self.oom_result(flags, size),
            }
        };

        let ret = self.alloc_flags(flags, requested_size, "");
        if !ret.is_null() && (ret as usize) & (alignment - 1) != 0 {
            hardening::abort_with_token("aligned_alloc produced a misaligned slot", self.token());
        }
        ret
    }

    /// Free a pointer previously returned by this partition. Null is a
    /// no-op; a pointer from anywhere else aborts.
    ///
    /// # Safety
    /// `ptr` must be null or a live allocation of this partition.
    #[inline]
    pub unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        if hooks::are_hooks_enabled() {
            hooks::free_observer(ptr);
            if hooks::free_override(ptr) {
                return;
            }
        }
        self.free_no_hooks(ptr);
    }

    /// # Safety
    /// As for `free`.
    pub unsafe fn free_no_hooks(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let span = page::span_from_ptr_no_alignment_check(ptr);
        self.check_span_ownership(span);

        if self.quarantine_state.load(Ordering::Acquire) == QUARANTINE_ON
            && (*span).kind != KIND_DIRECT_MAP
        {
            if let Some(handler) = quarantine_handler() {
                handler(ptr, span);
                return;
            }
        }

        self.free_no_hooks_immediate(ptr, span);
    }

    unsafe fn free_no_hooks_immediate(&self, ptr: *mut u8, span: *mut SlotSpan) {
        let bucket = (*span).bucket;
        let slot_size = (*bucket).slot_size as usize;
        let usable_size = slot_size - self.extras_size as usize;

        if cfg!(debug_assertions) && self.allow_cookies {
            let leading_ok = cookie::check_cookie(ptr.sub(COOKIE_SIZE));
            let trailing_ok = cookie::check_cookie(ptr.add(usable_size));
            if !leading_ok || !trailing_ok {
                hardening::abort_with_token(
                    "freed region has a corrupt cookie (buffer under/overflow or double free)",
                    self.token(),
                );
            }
        }

        let slot_start = ptr.sub(self.extras_offset as usize);

        if (*span).kind == KIND_DIRECT_MAP {
            self.lock.lock();
            let inner = &mut *self.inner.get();
            large::free_direct_mapped(self, &mut inner.direct_map_list, span);
            self.lock.unlock();
            return;
        }

        let payload = page::span_payload(span) as usize;
        let offset = slot_start as usize - payload;
        if offset % slot_size != 0 {
            hardening::abort_with_token("free of a misaligned pointer", self.token());
        }

        if self.allow_ref_count {
            let ref_count = PartitionRefCount::from_slot_start(slot_start);
            if !ref_count.has_one_ref() {
                // Outstanding references: defer the reclaim and neutralize
                // the contents so a use-after-free reads poison.
                ptr::write_bytes(ptr, QUARANTINED_BYTE, usable_size);
            }
            if !ref_count.release_from_allocator() {
                return;
            }
        }

        if cfg!(debug_assertions) || cfg!(feature = "poison-on-free") {
            ptr::write_bytes(slot_start, FREED_BYTE, slot_size);
        }

        self.raw_free_with_thread_cache(slot_start, span);
    }

    /// Finalize a slot whose free was deferred by the quarantine or by an
    /// outstanding reference count. Bypasses the quarantine.
    ///
    /// # Safety
    /// `slot_start` must be the slot start of a deferred slot of this
    /// partition, with no remaining references.
    pub unsafe fn free_for_ref_counting(&self, slot_start: *mut u8) {
        let span = page::span_from_ptr_no_alignment_check(slot_start);
        self.check_span_ownership(span);
        if cfg!(debug_assertions) || cfg!(feature = "poison-on-free") {
            let slot_size = (*(*span).bucket).slot_size as usize;
            ptr::write_bytes(slot_start, FREED_BYTE, slot_size);
        }
        self.raw_free_with_thread_cache(slot_start, span);
    }

    /// Reallocate. Shrinks in place within the same bucket, grows or
    /// shrinks direct-map regions in place within their reservation,
    /// otherwise allocates, copies and frees. Aborts on OOM.
    ///
    /// # Safety
    /// `ptr` must be null or a live allocation of this partition.
    #[inline]
    pub unsafe fn realloc(&self, ptr: *mut u8, new_size: usize, type_name: &'static str) -> *mut u8 {
        self.realloc_flags(0, ptr, new_size, type_name)
    }

    /// Like `realloc`, but returns null (leaving `ptr` valid) when the new
    /// allocation cannot be satisfied.
    ///
    /// # Safety
    /// As for `realloc`.
    #[inline]
    pub unsafe fn try_realloc(
        &self,
        ptr: *mut u8,
        new_size: usize,
        type_name: &'static str,
    ) -> *mut u8 {
        self.realloc_flags(ALLOC_RETURN_NULL, ptr, new_size, type_name)
    }

    unsafe fn realloc_flags(
        &self,
        flags: u32,
        ptr: *mut u8,
        new_size: usize,
        type_name: &'static str,
    ) -> *mut u8 {
        if ptr.is_null() {
            return self.alloc_flags(flags, new_size, type_name);
        }
        if new_size == 0 {
            self.free(ptr);
            return ptr::null_mut();
        }

        let span = page::span_from_ptr_no_alignment_check(ptr);
        self.check_span_ownership(span);
        let old_usable = (*(*span).bucket).slot_size as usize - self.extras_size as usize;

        let new_raw = match new_size.checked_add(self.extras_size as usize) {
            Some(size) if size <= MAX_DIRECT_MAPPED => size,
            _ => return self.oom_result(flags, new_size),
        };

        if (*span).kind == KIND_DIRECT_MAP {
            self.lock.lock();
            let resized = large::try_realloc_in_place(self, span, new_raw);
            self.lock.unlock();
            if resized {
                if cfg!(debug_assertions) && self.allow_cookies {
                    // The usable size changed, so the trailing cookie moved.
                    let new_usable =
                        (*(*span).bucket).slot_size as usize - self.extras_size as usize;
                    cookie::write_cookie(ptr.add(new_usable));
                }
                return ptr;
            }
        } else {
            let new_index = bucket_index_for_size(new_raw);
            if new_index < NUM_BUCKETS
                && bucket_size(new_index) == (*(*span).bucket).slot_size as usize
            {
                // Same bucket: the slot already fits.
                return ptr;
            }
        }

        let new_ptr = self.alloc_flags_no_hooks(flags, new_size);
        if new_ptr.is_null() {
            return ptr::null_mut();
        }
        ptr::copy_nonoverlapping(ptr, new_ptr, old_usable.min(new_size));
        self.free_no_hooks(ptr);
        new_ptr
    }

    /// App-visible size of an allocation: its slot size minus the extras.
    ///
    /// # Safety
    /// `ptr` must be null or a live allocation of some partition.
    pub unsafe fn get_usable_size(ptr: *mut u8) -> usize {
        if ptr.is_null() {
            return 0;
        }
        let span = page::span_from_ptr_no_alignment_check(ptr);
        let root = &*page::root_from_span(span);
        (*(*span).bucket).slot_size as usize - root.extras_size as usize
    }

    /// The usable size `alloc(size)` would return, letting callers grow
    /// containers to the slot boundary without reallocating.
    ///
    /// # Safety
    /// The root must be initialized.
    pub unsafe fn actual_size(&self, size: usize) -> usize {
        let raw_size = match size.checked_add(self.extras_size as usize) {
            Some(raw) => raw,
            None => return size,
        };
        let index = bucket_index_for_size(raw_size);
        let slot_size = if index < NUM_BUCKETS {
            bucket_size(index)
        } else if raw_size > MAX_DIRECT_MAPPED {
            return size;
        } else {
            align_up(raw_size, SYSTEM_PAGE_SIZE)
        };
        slot_size - self.extras_size as usize
    }

    /// Root owning the super page containing `ptr`.
    ///
    /// # Safety
    /// `ptr` must point into memory managed by some partition.
    pub unsafe fn from_pointer(ptr: *const u8) -> *const PartitionRoot {
        let span = page::span_from_ptr_no_alignment_check(ptr);
        page::root_from_span(span)
    }

    /// Slot start backing a returned pointer: the address the extras
    /// (ref-count, leading cookie) precede. This is the address
    /// `free_for_ref_counting` takes.
    ///
    /// # Safety
    /// `ptr` must be a live allocation of this partition.
    #[inline]
    pub unsafe fn slot_start(&self, ptr: *mut u8) -> *mut u8 {
        ptr.sub(self.extras_offset as usize)
    }

    /// The reference count embedded in the slot backing `ptr`. Aborts when
    /// the partition was not configured with ref-counting.
    ///
    /// # Safety
    /// `ptr` must be a live bucketed allocation of this partition.
    pub unsafe fn ref_count_pointer(&self, ptr: *mut u8) -> &PartitionRefCount {
        if !self.allow_ref_count {
            hardening::abort_with_token(
                "ref_count_pointer on a partition without ref-counting",
                self.token(),
            );
        }
        PartitionRefCount::from_slot_start(self.slot_start(ptr))
    }

    /// Switch the quarantine on. The partition must have been created
    /// scannable (`DisabledByDefault` or `ForcedEnabled`).
    pub fn enable_quarantine(&self) {
        if self.quarantine_state.load(Ordering::Relaxed) == QUARANTINE_NON_SCANNABLE {
            hardening::abort_with_token(
                "enable_quarantine on a non-scannable partition",
                self.token(),
            );
        }
        self.quarantine_state.store(QUARANTINE_ON, Ordering::Release);
    }

    // ------------------------------------------------------------------------
    // Central allocation
    // ------------------------------------------------------------------------

    #[cold]
    unsafe fn oom_result(&self, flags: u32, size: usize) -> *mut u8 {
        if flags & ALLOC_RETURN_NULL != 0 {
            return ptr::null_mut();
        }
        oom::out_of_memory(self.token(), size)
    }

    unsafe fn raw_alloc(
        &self,
        bucket_index: usize,
        raw_size: usize,
        utilized_slot_size: &mut usize,
        is_already_zeroed: &mut bool,
    ) -> *mut u8 {
        self.lock.lock();
        let inner = &mut *self.inner.get();
        let ret = self.alloc_from_bucket(
            inner,
            bucket_index,
            raw_size,
            utilized_slot_size,
            is_already_zeroed,
        );
        self.lock.unlock();
        ret
    }

    unsafe fn alloc_from_bucket(
        &self,
        inner: &mut RootInner,
        bucket_index: usize,
        raw_size: usize,
        utilized_slot_size: &mut usize,
        is_already_zeroed: &mut bool,
    ) -> *mut u8 {
        if self.inverted_self != !(self as *const _ as usize) {
            hardening::abort_with_token("partition integrity token mismatch", self.token());
        }

        if bucket_index == SENTINEL_BUCKET_INDEX {
            let ret = large::alloc_direct_mapped(self, &mut inner.direct_map_list, raw_size);
            if !ret.is_null() {
                *utilized_slot_size = align_up(raw_size, SYSTEM_PAGE_SIZE);
                *is_already_zeroed = true;
            }
            return ret;
        }

        let bucket: *mut Bucket = &mut inner.buckets[bucket_index];
        *utilized_slot_size = (*bucket).slot_size as usize;

        let span = (*bucket).active_spans_head;
        if !span.is_null() && (*span).is_active() {
            return Self::pop_or_provision(bucket);
        }
        self.slow_path_alloc(inner, bucket_index, is_already_zeroed)
    }

    /// Take a slot from the bucket's (active, usable) head span: pop the
    /// freelist, or provision the next batch of slots.
    unsafe fn pop_or_provision(bucket: *mut Bucket) -> *mut u8 {
        let span = (*bucket).active_spans_head;
        let head = (*span).freelist_head;
        if !head.is_null() {
            let payload = page::span_payload(span) as usize;
            let next = freelist::read_next(
                head,
                payload,
                (*bucket).span_payload_len(),
                (*bucket).slot_size as usize,
            );
            (*span).freelist_head = next;
            (*span).num_allocated_slots += 1;
            return head;
        }
        Self::provision_and_alloc(bucket, span)
    }

    /// Lazily provision slots from the span's unprovisioned tail: hand out
    /// the first, link the rest of the current system page's worth into the
    /// freelist. Amortizes fresh-page touches across allocations.
    unsafe fn provision_and_alloc(bucket: *mut Bucket, span: *mut SlotSpan) -> *mut u8 {
        let slot_size = (*bucket).slot_size as usize;
        let slots_per_span = (*bucket).slots_per_span as usize;
        let num_unprovisioned = (*span).num_unprovisioned_slots as usize;
        debug_assert!(num_unprovisioned > 0);
        debug_assert!((*span).freelist_head.is_null());

        let payload = page::span_payload(span);
        let first_fresh_index = slots_per_span - num_unprovisioned;
        let return_slot = payload.add(first_fresh_index * slot_size);

        // Provision slots whose link word lands before the next system page
        // boundary (or the end of the span, whichever is first).
        let first_link = return_slot as usize + slot_size;
        let sub_page_limit = align_up(first_link, SYSTEM_PAGE_SIZE);
        let slots_limit = return_slot as usize + num_unprovisioned * slot_size;
        let freelist_limit = sub_page_limit.min(slots_limit);

        let mut num_new_entries = 0;
        if first_link + core::mem::size_of::<usize>() <= freelist_limit {
            num_new_entries =
                1 + (freelist_limit - first_link - core::mem::size_of::<usize>()) / slot_size;
        }

        // Chain the fresh slots in address order.
        let mut head: *mut u8 = ptr::null_mut();
        let mut i = num_new_entries;
        while i >= 1 {
            let slot = return_slot.add(i * slot_size);
            freelist::write_next(slot, head);
            head = slot;
            i -= 1;
        }
        (*span).freelist_head = head;
        (*span).num_unprovisioned_slots -= (1 + num_new_entries) as u16;
        (*span).num_allocated_slots += 1;
        return_slot
    }

    unsafe fn slow_path_alloc(
        &self,
        inner: &mut RootInner,
        bucket_index: usize,
        is_already_zeroed: &mut bool,
    ) -> *mut u8 {
        let bucket: *mut Bucket = &mut inner.buckets[bucket_index];
        debug_assert!((*bucket).slot_size != 0);

        // 1. Another span in the active list may be usable.
        if Self::set_new_active_span(bucket) {
            return Self::pop_or_provision(bucket);
        }

        // 2. Prefer empty spans: their pages are still committed.
        loop {
            let span = (*bucket).empty_spans_head;
            if span.is_null() {
                break;
            }
            (*bucket).empty_spans_head = (*span).next_span;
            if (*span).is_decommitted() {
                // Ring eviction beat us to it; file it where it belongs.
                (*span).next_span = (*bucket).decommitted_spans_head;
                (*bucket).decommitted_spans_head = span;
                continue;
            }
            (*span).next_span = ptr::null_mut();
            (*bucket).active_spans_head = span;
            return Self::pop_or_provision(bucket);
        }

        // 3. Then decommitted spans, paying a recommit.
        let span = (*bucket).decommitted_spans_head;
        if !span.is_null() {
            (*bucket).decommitted_spans_head = (*span).next_span;
            let payload = page::span_payload(span);
            let committed_len = (*bucket).bytes_per_span();
            if !platform::recommit_system_pages(payload, committed_len) {
                (*span).next_span = (*bucket).decommitted_spans_head;
                (*bucket).decommitted_spans_head = span;
                return ptr::null_mut();
            }
            self.increase_committed(committed_len);
            (*span).freelist_head = ptr::null_mut();
            (*span).num_unprovisioned_slots = (*bucket).slots_per_span;
            (*span).num_allocated_slots = 0;
            (*span).next_span = ptr::null_mut();
            (*bucket).active_spans_head = span;
            *is_already_zeroed = true;
            return Self::pop_or_provision(bucket);
        }

        // 4. Carve a fresh span.
        let span = self.alloc_new_span(inner, bucket_index);
        if span.is_null() {
            return ptr::null_mut();
        }
        let bucket: *mut Bucket = &mut inner.buckets[bucket_index];
        *is_already_zeroed = true;
        (*bucket).active_spans_head = span;
        Self::pop_or_provision(bucket)
    }

    /// Walk the active list looking for a usable span, pruning what the
    /// walk encounters: empty and decommitted spans move to their lists,
    /// full spans are unlinked and marked by negating their allocated
    /// count.
    unsafe fn set_new_active_span(bucket: *mut Bucket) -> bool {
        let mut span = (*bucket).active_spans_head;
        while !span.is_null() {
            let next = (*span).next_span;
            if (*span).is_active() {
                (*bucket).active_spans_head = span;
                return true;
            }
            if (*span).num_allocated_slots == 0 {
                if (*span).is_decommitted() {
                    (*span).next_span = (*bucket).decommitted_spans_head;
                    (*bucket).decommitted_spans_head = span;
                } else {
                    (*span).next_span = (*bucket).empty_spans_head;
                    (*bucket).empty_spans_head = span;
                }
            } else {
                debug_assert!((*span).is_full());
                (*span).num_allocated_slots = -(*span).num_allocated_slots;
                (*bucket).num_full_spans += 1;
                (*span).next_span = ptr::null_mut();
            }
            span = next;
        }
        (*bucket).active_spans_head = ptr::null_mut();
        false
    }

    /// Carve a new span for `bucket_index` out of the current super page,
    /// reserving a fresh super page when the cursor runs out.
    unsafe fn alloc_new_span(&self, inner: &mut RootInner, bucket_index: usize) -> *mut SlotSpan {
        let bucket: *mut Bucket = &mut inner.buckets[bucket_index];
        let payload_len = (*bucket).span_payload_len();

        if inner.next_partition_page.is_null()
            || inner.next_partition_page.add(payload_len) > inner.next_partition_page_end
        {
            if !self.alloc_new_super_page(inner) {
                return ptr::null_mut();
            }
        }

        let span_start = inner.next_partition_page;
        inner.next_partition_page = span_start.add(payload_len);

        let committed_len = (*bucket).bytes_per_span();
        if !platform::commit_system_pages(span_start, committed_len) {
            // The skipped pages stay reserved; their descriptors remain
            // unused.
            return ptr::null_mut();
        }
        self.increase_committed(committed_len);

        let super_base = span_start as usize & SUPER_PAGE_BASE_MASK;
        let pp_index = (span_start as usize - super_base) >> crate::util::PARTITION_PAGE_SHIFT;
        let span = page::descriptor_at(super_base, pp_index);
        (*span).freelist_head = ptr::null_mut();
        (*span).next_span = ptr::null_mut();
        (*span).bucket = bucket;
        (*span).num_allocated_slots = 0;
        (*span).num_unprovisioned_slots = (*bucket).slots_per_span;
        (*span).empty_cache_index = -1;
        (*span).page_offset = 0;
        (*span).kind = KIND_SPAN_HEAD;

        let num_partition_pages = (*bucket).num_partition_pages_per_span as usize;
        for i in 1..num_partition_pages {
            let tail = page::descriptor_at(super_base, pp_index + i);
            (*tail).freelist_head = ptr::null_mut();
            (*tail).next_span = ptr::null_mut();
            (*tail).bucket = bucket;
            (*tail).num_allocated_slots = 0;
            (*tail).num_unprovisioned_slots = 0;
            (*tail).empty_cache_index = -1;
            (*tail).page_offset = i as u8;
            (*tail).kind = KIND_SPAN_TAIL;
        }

        span
    }

    /// Reserve and describe a fresh super page, making its payload the
    /// provisioning cursor.
    unsafe fn alloc_new_super_page(&self, inner: &mut RootInner) -> bool {
        let mut base = ptr::null_mut();
        if self.use_pools {
            base = NORMAL_BUCKET_POOL.alloc_super_pages(1);
        }
        if base.is_null() {
            base = platform::reserve_address_space_aligned(SUPER_PAGE_SIZE, SUPER_PAGE_SIZE);
        }
        if base.is_null() {
            return false;
        }

        if !platform::commit_system_pages(base.add(SYSTEM_PAGE_SIZE), SYSTEM_PAGE_SIZE) {
            if NORMAL_BUCKET_POOL.contains(base) {
                NORMAL_BUCKET_POOL.free_super_pages(base, 1);
            } else {
                platform::release_address_space(base, SUPER_PAGE_SIZE);
            }
            return false;
        }

        let extent = page::metadata_area(base as usize) as *mut SuperPageExtent;
        (*extent).root = self;
        (*extent).next = ptr::null_mut();
        if inner.current_extent.is_null() {
            inner.first_extent = extent;
        } else {
            (*inner.current_extent).next = extent;
        }
        inner.current_extent = extent;

        self.total_size_of_super_pages
            .fetch_add(SUPER_PAGE_SIZE, Ordering::Relaxed);

        inner.next_partition_page = base.add(PARTITION_PAGE_SIZE);
        inner.next_partition_page_end = base.add(SUPER_PAGE_SIZE - PARTITION_PAGE_SIZE);
        true
    }

    // ------------------------------------------------------------------------
    // Central free
    // ------------------------------------------------------------------------

    unsafe fn check_span_ownership(&self, span: *mut SlotSpan) {
        let kind = (*span).kind;
        if kind != KIND_SPAN_HEAD && kind != KIND_DIRECT_MAP {
            hardening::abort_with_token("pointer is outside any slot span", self.token());
        }
        let root = page::root_from_span(span);
        if root != self as *const PartitionRoot {
            hardening::abort_with_token("pointer belongs to another partition", self.token());
        }
        if self.inverted_self != !(self as *const _ as usize) {
            hardening::abort_with_token("partition integrity token mismatch", self.token());
        }
    }

    pub(crate) unsafe fn raw_free_with_thread_cache(&self, slot_start: *mut u8, span: *mut SlotSpan) {
        if self.with_thread_cache.load(Ordering::Relaxed) && (*span).kind == KIND_SPAN_HEAD {
            let bucket_index = self.bucket_index_of((*span).bucket);
            if bucket_index < NUM_CACHED_BUCKETS {
                let tcache = thread_cache::current(self);
                if !tcache.is_null() {
                    (*tcache).put(bucket_index, slot_start);
                    return;
                }
            }
        }
        self.raw_free(slot_start, span);
    }

    unsafe fn raw_free(&self, slot_start: *mut u8, span: *mut SlotSpan) {
        self.lock.lock();
        let inner = &mut *self.inner.get();
        if (*span).kind == KIND_DIRECT_MAP {
            large::free_direct_mapped(self, &mut inner.direct_map_list, span);
        } else {
            self.span_free_locked(inner, span, slot_start);
        }
        self.lock.unlock();
    }

    /// Return a batch of slots under one lock acquisition. Thread-cache
    /// flushes come through here.
    pub(crate) unsafe fn raw_free_batch(&self, slots: &[*mut u8]) {
        if slots.is_empty() {
            return;
        }
        self.lock.lock();
        let inner = &mut *self.inner.get();
        for &slot_start in slots {
            let span = page::span_from_ptr_no_alignment_check(slot_start);
            self.span_free_locked(inner, span, slot_start);
        }
        self.lock.unlock();
    }

    unsafe fn span_free_locked(
        &self,
        inner: &mut RootInner,
        span: *mut SlotSpan,
        slot_start: *mut u8,
    ) {
        if (*span).freelist_head == slot_start {
            hardening::abort_with_token("double free", self.token());
        }
        freelist::write_next(slot_start, (*span).freelist_head);
        (*span).freelist_head = slot_start;
        (*span).num_allocated_slots -= 1;
        if (*span).num_allocated_slots <= 0 {
            self.span_free_slow(inner, span);
        }
    }

    unsafe fn span_free_slow(&self, inner: &mut RootInner, span: *mut SlotSpan) {
        if (*span).num_allocated_slots == 0 {
            // Became empty.
            self.register_empty_span(inner, span);
            return;
        }
        // The span was unlinked as full; the decrement ran on the negated
        // count. Restore it and put the span back at the active head.
        debug_assert!((*span).num_allocated_slots < 0);
        let bucket = (*span).bucket;
        (*span).num_allocated_slots = -(*span).num_allocated_slots - 2;
        debug_assert!(
            (*span).num_allocated_slots == (*bucket).slots_per_span as i16 - 1
        );
        (*span).next_span = (*bucket).active_spans_head;
        (*bucket).active_spans_head = span;
        (*bucket).num_full_spans -= 1;
        if (*span).num_allocated_slots == 0 {
            // Single-slot span: full and empty are one free apart.
            self.register_empty_span(inner, span);
        }
    }

    /// FIFO ring of empty spans. Registering into an occupied slot
    /// decommits the span evicted from it.
    unsafe fn register_empty_span(&self, inner: &mut RootInner, span: *mut SlotSpan) {
        if (*span).empty_cache_index >= 0 {
            return;
        }
        let index = inner.empty_spans_ring_index;
        let evicted = inner.empty_spans_ring[index];
        if !evicted.is_null() {
            (*evicted).empty_cache_index = -1;
            if (*evicted).is_empty() {
                self.decommit_span(evicted);
            }
        }
        inner.empty_spans_ring[index] = span;
        (*span).empty_cache_index = index as i16;
        inner.empty_spans_ring_index = (index + 1) % MAX_FREEABLE_SPANS;
    }

    unsafe fn decommit_span(&self, span: *mut SlotSpan) {
        debug_assert!((*span).is_empty());
        let bucket = (*span).bucket;
        let payload = page::span_payload(span);
        let committed_len = (*bucket).bytes_per_span();
        platform::decommit_system_pages(payload, committed_len);
        self.decrease_committed(committed_len);
        (*span).freelist_head = ptr::null_mut();
        (*span).num_unprovisioned_slots = 0;
    }

    #[inline]
    unsafe fn bucket_index_of(&self, bucket: *mut Bucket) -> usize {
        let base = self.inner.get() as usize + offset_of!(RootInner, buckets);
        (bucket as usize - base) / core::mem::size_of::<Bucket>()
    }

    // ------------------------------------------------------------------------
    // Internal slots (thread-cache storage)
    // ------------------------------------------------------------------------

    /// Allocate a bare bucketed slot for internal bookkeeping. Flips the
    /// thread-cache flag off for the duration so reentrant allocations
    /// cannot recurse into cache creation.
    pub(crate) unsafe fn alloc_internal_slot(&self, size: usize) -> *mut u8 {
        let had_cache = self.with_thread_cache.swap(false, Ordering::Relaxed);
        let mut utilized = 0usize;
        let mut zeroed = false;
        let ret = self.raw_alloc(bucket_index_for_size(size), size, &mut utilized, &mut zeroed);
        self.with_thread_cache.store(had_cache, Ordering::Relaxed);
        ret
    }

    pub(crate) unsafe fn free_internal_slot(&self, slot_start: *mut u8) {
        let span = page::span_from_ptr_no_alignment_check(slot_start);
        self.raw_free(slot_start, span);
    }

    // ------------------------------------------------------------------------
    // Purge
    // ------------------------------------------------------------------------

    /// Reclaim physical memory without disturbing live pointers. `flags`
    /// is an OR of `PURGE_*`.
    ///
    /// # Safety
    /// The root must be initialized.
    pub unsafe fn purge_memory(&self, flags: u32) {
        if flags & PURGE_FORCE_ALL_FREED != 0 {
            thread_cache::flush_current_thread(self);
        }
        self.lock.lock();
        let inner = &mut *self.inner.get();
        if flags & PURGE_DECOMMIT_EMPTY_SPANS != 0 {
            self.decommit_empty_spans(inner);
        }
        if flags & PURGE_DISCARD_UNUSED_SYSTEM_PAGES != 0 {
            for index in 0..NUM_BUCKETS {
                let bucket: *mut Bucket = &mut inner.buckets[index];
                if (*bucket).slot_size as usize >= SYSTEM_PAGE_SIZE
                    && (*bucket).slots_per_span > 1
                {
                    self.purge_bucket_discard(bucket);
                }
            }
        }
        self.lock.unlock();
    }

    unsafe fn decommit_empty_spans(&self, inner: &mut RootInner) {
        for index in 0..MAX_FREEABLE_SPANS {
            let span = inner.empty_spans_ring[index];
            if !span.is_null() {
                (*span).empty_cache_index = -1;
                if (*span).is_empty() {
                    self.decommit_span(span);
                }
                inner.empty_spans_ring[index] = ptr::null_mut();
            }
        }
        inner.empty_spans_ring_index = 0;
    }

    unsafe fn purge_bucket_discard(&self, bucket: *mut Bucket) {
        let mut span = (*bucket).active_spans_head;
        while !span.is_null() {
            if !(*span).freelist_head.is_null() {
                self.discard_span_free_pages(bucket, span);
            }
            span = (*span).next_span;
        }
    }

    /// Discard the clean system pages covered by free slots of a
    /// partially-used span. Trailing free slots are converted back to
    /// unprovisioned (their link words go away with the pages); interior
    /// free slots keep the page holding their link word.
    unsafe fn discard_span_free_pages(&self, bucket: *mut Bucket, span: *mut SlotSpan) {
        const MAX_DISCARDABLE_SLOTS: usize =
            MAX_PARTITION_PAGES_PER_SLOT_SPAN * PARTITION_PAGE_SIZE / SYSTEM_PAGE_SIZE;

        let slot_size = (*bucket).slot_size as usize;
        let slots_per_span = (*bucket).slots_per_span as usize;
        debug_assert!(slots_per_span <= MAX_DISCARDABLE_SLOTS);
        let provisioned = slots_per_span - (*span).num_unprovisioned_slots as usize;
        let payload = page::span_payload(span);
        let payload_len = (*bucket).span_payload_len();

        let mut is_free = [false; MAX_DISCARDABLE_SLOTS];
        let mut free_count = 0usize;
        let mut entry = (*span).freelist_head;
        while !entry.is_null() {
            let index = (entry as usize - payload as usize) / slot_size;
            debug_assert!(index < provisioned);
            is_free[index] = true;
            free_count += 1;
            entry = freelist::read_next(entry, payload as usize, payload_len, slot_size);
        }
        if free_count == 0 {
            return;
        }

        // Convert the trailing run of free slots back to unprovisioned and
        // rebuild the freelist without them.
        let mut trailing = 0usize;
        while trailing < provisioned && is_free[provisioned - 1 - trailing] {
            trailing += 1;
        }
        let remaining = provisioned - trailing;
        if trailing > 0 {
            let mut head: *mut u8 = ptr::null_mut();
            let mut index = remaining;
            while index > 0 {
                index -= 1;
                if is_free[index] {
                    let slot = payload.add(index * slot_size);
                    freelist::write_next(slot, head);
                    head = slot;
                }
            }
            (*span).freelist_head = head;
            (*span).num_unprovisioned_slots += trailing as u16;

            let begin = align_up(payload as usize + remaining * slot_size, SYSTEM_PAGE_SIZE);
            let end = payload as usize + (*bucket).bytes_per_span();
            if end > begin {
                platform::discard_system_pages(begin as *mut u8, end - begin);
            }
        }

        // Interior free slots: drop every whole page of the slot except the
        // one holding the link word.
        for index in 0..remaining {
            if !is_free[index] {
                continue;
            }
            let slot = payload as usize + index * slot_size;
            let begin = align_up(slot + core::mem::size_of::<usize>(), SYSTEM_PAGE_SIZE);
            let end = align_down(slot + slot_size, SYSTEM_PAGE_SIZE);
            if end > begin {
                platform::discard_system_pages(begin as *mut u8, end - begin);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Self check
    // ------------------------------------------------------------------------

    /// Walk every super page, span and freelist of this partition and
    /// verify the bookkeeping against the bucket geometry. Meant for tests
    /// and post-mortem triage; takes the lock for the whole walk.
    ///
    /// # Safety
    /// The root must be initialized.
    pub unsafe fn check_integrity(&self) -> IntegrityResult {
        let mut result = IntegrityResult::default();
        self.lock.lock();
        let inner = &*self.inner.get();

        let mut extent = inner.first_extent;
        while !extent.is_null() {
            result.total_super_pages += 1;
            let super_base = extent as usize - SYSTEM_PAGE_SIZE;
            for pp_index in FIRST_PAYLOAD_PAGE..PAYLOAD_PAGE_LIMIT {
                let span = page::descriptor_at(super_base, pp_index);
                if (*span).kind != KIND_SPAN_HEAD {
                    continue;
                }
                result.total_spans += 1;
                let bucket = (*span).bucket;
                let slot_size = (*bucket).slot_size as usize;
                let slots_per_span = (*bucket).slots_per_span as usize;
                let payload = page::span_payload(span) as usize;
                let payload_len = (*bucket).span_payload_len();

                let mut freelist_len = 0usize;
                let mut corrupt = false;
                let mut entry = (*span).freelist_head;
                while !entry.is_null() && freelist_len <= slots_per_span {
                    match freelist::try_read_next(entry, payload, payload_len, slot_size) {
                        Some(next) => {
                            freelist_len += 1;
                            entry = next;
                        }
                        None => {
                            corrupt = true;
                            break;
                        }
                    }
                }
                if corrupt || freelist_len > slots_per_span {
                    result.freelist_corruptions += 1;
                    result.errors_found += 1;
                    continue;
                }

                let allocated = (*span).allocated_slots();
                let unprovisioned = (*span).num_unprovisioned_slots as usize;
                if allocated + freelist_len + unprovisioned != slots_per_span {
                    result.span_inconsistencies += 1;
                    result.errors_found += 1;
                }
                result.slots_in_use += allocated;
            }
            extent = (*extent).next;
        }

        let mut map_extent = inner.direct_map_list;
        while !map_extent.is_null() {
            result.direct_map_regions += 1;
            result.slots_in_use += 1;
            map_extent = (*map_extent).next;
        }

        self.lock.unlock();
        result
    }
}

impl Default for PartitionRoot {
    fn default() -> Self {
        Self::new()
    }
}
