use core::ptr;

/// Reserve inaccessible address space. PROT_NONE + MAP_NORESERVE means no
/// commit charge is taken until the pages are committed.
///
/// # Safety
/// `size` must be page-aligned and non-zero.
pub unsafe fn reserve_address_space(size: usize) -> *mut u8 {
    let result = libc::mmap(
        ptr::null_mut(),
        size,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
        -1,
        0,
    );
    if result == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        result as *mut u8
    }
}

/// Release a reservation (or a trimmed edge of one).
///
/// # Safety
/// `ptr`/`size` must exactly cover reserved address space owned by the
/// caller.
pub unsafe fn release_address_space(ptr: *mut u8, size: usize) {
    libc::munmap(ptr as *mut libc::c_void, size);
}

/// Commit pages read-write. Returns false if the kernel refused.
///
/// # Safety
/// Range must lie inside a reservation and be page-aligned.
pub unsafe fn commit_system_pages(ptr: *mut u8, len: usize) -> bool {
    libc::mprotect(
        ptr as *mut libc::c_void,
        len,
        libc::PROT_READ | libc::PROT_WRITE,
    ) == 0
}

/// Decommit pages: drop the physical pages, then make the range
/// inaccessible. MADV_DONTNEED guarantees zero-filled pages on the next
/// access after recommit.
///
/// # Safety
/// Range must be committed and page-aligned.
pub unsafe fn decommit_system_pages(ptr: *mut u8, len: usize) {
    let ret = libc::madvise(ptr as *mut libc::c_void, len, libc::MADV_DONTNEED);
    debug_assert!(ret == 0, "madvise(MADV_DONTNEED) failed");
    libc::mprotect(ptr as *mut libc::c_void, len, libc::PROT_NONE);
}

/// Discard page contents while keeping the range mapped read-write.
///
/// # Safety
/// Range must be committed and page-aligned.
pub unsafe fn discard_system_pages(ptr: *mut u8, len: usize) {
    let ret = libc::madvise(ptr as *mut libc::c_void, len, libc::MADV_DONTNEED);
    debug_assert!(ret == 0, "madvise(MADV_DONTNEED) failed");
}

/// Get the number of online CPUs.
pub fn num_cpus() -> usize {
    unsafe {
        let n = libc::sysconf(libc::_SC_NPROCESSORS_ONLN);
        if n < 1 {
            1
        } else {
            n as usize
        }
    }
}

/// Get a cheap thread identifier.
/// Cached in TLS to avoid a syscall on every use.
#[inline]
pub fn thread_id() -> usize {
    use std::cell::Cell;

    thread_local! {
        static CACHED_TID: Cell<usize> = const { Cell::new(0) };
    }

    CACHED_TID
        .try_with(|tid| {
            let cached = tid.get();
            if cached != 0 {
                return cached;
            }
            let new_tid = unsafe { libc::syscall(libc::SYS_gettid) as usize };
            tid.set(new_tid);
            new_tid
        })
        .unwrap_or_else(|_| unsafe { libc::syscall(libc::SYS_gettid) as usize })
}
