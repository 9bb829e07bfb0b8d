use core::ptr;

/// Reserve inaccessible address space.
///
/// # Safety
/// `size` must be page-aligned and non-zero.
pub unsafe fn reserve_address_space(size: usize) -> *mut u8 {
    let result = libc::mmap(
        ptr::null_mut(),
        size,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANON,
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

/// Decommit pages by replacing the range with a fresh inaccessible
/// mapping. MADV_FREE alone would let old contents reappear; the fixed
/// remap guarantees zero pages after a later commit.
///
/// # Safety
/// Range must be committed and page-aligned.
pub unsafe fn decommit_system_pages(ptr: *mut u8, len: usize) {
    let result = libc::mmap(
        ptr as *mut libc::c_void,
        len,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_FIXED,
        -1,
        0,
    );
    debug_assert!(result != libc::MAP_FAILED, "fixed remap failed");
}

/// Discard page contents while keeping the range mapped read-write.
///
/// # Safety
/// Range must be committed and page-aligned.
pub unsafe fn discard_system_pages(ptr: *mut u8, len: usize) {
    libc::madvise(ptr as *mut libc::c_void, len, libc::MADV_FREE);
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
            let mut id: u64 = 0;
            unsafe {
                libc::pthread_threadid_np(ptr::null_mut(), &mut id);
            }
            tid.set(id as usize);
            id as usize
        })
        .unwrap_or(1)
}
