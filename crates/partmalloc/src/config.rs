//! Process-wide configuration, latched once.
//!
//! `global_init` selects which process-wide facilities exist (the address
//! pools, ref-count support, quarantine support) and installs the OOM
//! handler. Partitions read these values once at construction; changing them
//! afterwards has no effect on existing partitions.

use crate::oom::{self, OutOfMemoryHandler};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Process-wide feature selection.
#[derive(Clone, Copy, Debug)]
pub struct Features {
    /// Reserve the two address pools up front and serve partitions from
    /// them, so pointer-origin tests are a single range check.
    pub address_pools: bool,
    /// Allow partitions to enable the in-slot reference count.
    pub ref_count: bool,
    /// Allow partitions to divert frees to the quarantine scanner.
    pub quarantine: bool,
}

impl Default for Features {
    fn default() -> Self {
        Features {
            address_pools: true,
            ref_count: true,
            quarantine: true,
        }
    }
}

static INITIALIZED: AtomicBool = AtomicBool::new(false);
static ADDRESS_POOLS: AtomicBool = AtomicBool::new(true);
static REF_COUNT: AtomicBool = AtomicBool::new(true);
static QUARANTINE: AtomicBool = AtomicBool::new(true);
static THREAD_CACHE_BIN_LIMIT: AtomicUsize = AtomicUsize::new(0);

/// One-time process configuration. Later calls are ignored; partitions
/// created before the first call see the defaults.
pub fn global_init(features: Features, on_out_of_memory: Option<OutOfMemoryHandler>) {
    if INITIALIZED.swap(true, Ordering::AcqRel) {
        return;
    }
    ADDRESS_POOLS.store(features.address_pools, Ordering::Relaxed);
    REF_COUNT.store(features.ref_count, Ordering::Relaxed);
    QUARANTINE.store(features.quarantine, Ordering::Relaxed);
    unsafe {
        read_env_overrides();
    }
    if let Some(handler) = on_out_of_memory {
        oom::set_out_of_memory_handler(handler);
    }
}

/// Latch defaults if `global_init` was never called. Invoked from partition
/// construction.
pub(crate) fn ensure_initialized() {
    if !INITIALIZED.swap(true, Ordering::AcqRel) {
        unsafe {
            read_env_overrides();
        }
    }
}

pub fn address_pools_enabled() -> bool {
    ADDRESS_POOLS.load(Ordering::Relaxed)
}

pub fn ref_count_enabled() -> bool {
    REF_COUNT.load(Ordering::Relaxed)
}

pub fn quarantine_enabled() -> bool {
    QUARANTINE.load(Ordering::Relaxed)
}

/// Per-bucket thread-cache bin capacity override (0 = compiled default).
pub fn thread_cache_bin_limit() -> usize {
    THREAD_CACHE_BIN_LIMIT.load(Ordering::Relaxed)
}

/// Read configuration from environment variables.
///
/// # Safety
/// Calls libc::getenv, which is not thread-safe against concurrent
/// setenv; must run during init.
unsafe fn read_env_overrides() {
    if getenv_flag(b"PARTMALLOC_NO_ADDRESS_POOLS\0") {
        ADDRESS_POOLS.store(false, Ordering::Relaxed);
    }
    if let Some(val) = getenv_usize(b"PARTMALLOC_THREAD_CACHE_LIMIT\0") {
        THREAD_CACHE_BIN_LIMIT.store(val, Ordering::Relaxed);
    }
}

unsafe fn getenv_flag(key: &[u8]) -> bool {
    !libc::getenv(key.as_ptr() as *const libc::c_char).is_null()
}

/// Parse an environment variable as a usize, without allocating.
unsafe fn getenv_usize(key: &[u8]) -> Option<usize> {
    let val = libc::getenv(key.as_ptr() as *const libc::c_char);
    if val.is_null() {
        return None;
    }

    let mut result: usize = 0;
    let mut ptr = val as *const u8;
    loop {
        let byte = *ptr;
        if byte == 0 {
            break;
        }
        if !byte.is_ascii_digit() {
            return None;
        }
        result = result.checked_mul(10)?.checked_add((byte - b'0') as usize)?;
        ptr = ptr.add(1);
    }
    Some(result)
}
