//! Process-wide out-of-memory handling. The handler is installed once at
//! startup and read-only afterwards; allocation paths never retry, an OOM is
//! terminal for the failing call.

use crate::hardening;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Called with the requested size just before the process aborts on OOM.
/// Must not allocate.
pub type OutOfMemoryHandler = fn(size: usize);

static HANDLER: AtomicUsize = AtomicUsize::new(0);

/// Install the process-wide OOM handler. May be called at most once, before
/// any partition is created.
pub fn set_out_of_memory_handler(handler: OutOfMemoryHandler) {
    if HANDLER
        .compare_exchange(0, handler as usize, Ordering::AcqRel, Ordering::Relaxed)
        .is_err()
    {
        hardening::abort_with_message("partmalloc: out-of-memory handler installed twice\n");
    }
}

/// Terminal out-of-memory path: invoke the handler (if any), then abort
/// identifying the partition by its address token.
#[cold]
#[inline(never)]
pub fn out_of_memory(partition_token: usize, size: usize) -> ! {
    let raw = HANDLER.load(Ordering::Acquire);
    if raw != 0 {
        let handler = unsafe { core::mem::transmute::<usize, OutOfMemoryHandler>(raw) };
        handler(size);
    }
    hardening::abort_with_token("out of memory", partition_token);
}
