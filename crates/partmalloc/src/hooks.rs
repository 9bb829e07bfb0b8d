//! Allocation hooks: observer and override callbacks consulted on the
//! hook-aware entry points. Installed once, read-only afterwards; the fast
//! path pays a single flag load when no hooks are present.

use crate::hardening;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

/// Post-allocation notification.
pub type AllocationObserverHook = fn(ptr: *mut u8, size: usize, type_name: &'static str);
/// Pre-allocation override; returning true short-circuits the allocator and
/// `out` is used verbatim.
pub type AllocationOverrideHook =
    fn(out: &mut *mut u8, flags: u32, size: usize, type_name: &'static str) -> bool;
/// Pre-free notification.
pub type FreeObserverHook = fn(ptr: *mut u8);
/// Free override; returning true means the hook took ownership of the
/// pointer.
pub type FreeOverrideHook = fn(ptr: *mut u8) -> bool;

#[derive(Clone, Copy, Default)]
pub struct HookTable {
    pub allocation_observer: Option<AllocationObserverHook>,
    pub allocation_override: Option<AllocationOverrideHook>,
    pub free_observer: Option<FreeObserverHook>,
    pub free_override: Option<FreeOverrideHook>,
}

struct HookSlot(UnsafeCell<HookTable>);
unsafe impl Sync for HookSlot {}

static HOOKS: HookSlot = HookSlot(UnsafeCell::new(HookTable {
    allocation_observer: None,
    allocation_override: None,
    free_observer: None,
    free_override: None,
}));
static HOOKS_ENABLED: AtomicBool = AtomicBool::new(false);

/// Install the hook table. May be called at most once, before the hooks can
/// be observed by concurrent allocations.
pub fn set_hooks(table: HookTable) {
    if HOOKS_ENABLED.load(Ordering::Relaxed) {
        hardening::abort_with_message("partmalloc: allocation hooks installed twice\n");
    }
    unsafe {
        *HOOKS.0.get() = table;
    }
    HOOKS_ENABLED.store(true, Ordering::Release);
}

#[inline(always)]
pub fn are_hooks_enabled() -> bool {
    HOOKS_ENABLED.load(Ordering::Acquire)
}

/// Run the allocation override hook. Returns Some(ptr) if the hook serviced
/// the request.
#[inline]
pub fn allocation_override(flags: u32, size: usize, type_name: &'static str) -> Option<*mut u8> {
    let table = unsafe { &*HOOKS.0.get() };
    if let Some(hook) = table.allocation_override {
        let mut out = core::ptr::null_mut();
        if hook(&mut out, flags, size, type_name) {
            return Some(out);
        }
    }
    None
}

#[inline]
pub fn allocation_observer(ptr: *mut u8, size: usize, type_name: &'static str) {
    let table = unsafe { &*HOOKS.0.get() };
    if let Some(hook) = table.allocation_observer {
        hook(ptr, size, type_name);
    }
}

/// Run the free override hook. Returns true if the hook took ownership.
#[inline]
pub fn free_override(ptr: *mut u8) -> bool {
    let table = unsafe { &*HOOKS.0.get() };
    match table.free_override {
        Some(hook) => hook(ptr),
        None => false,
    }
}

#[inline]
pub fn free_observer(ptr: *mut u8) {
    let table = unsafe { &*HOOKS.0.get() };
    if let Some(hook) = table.free_observer {
        hook(ptr);
    }
}
