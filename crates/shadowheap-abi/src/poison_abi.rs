//! ABI layer for manual poisoning and access reports.

use std::ffi::c_void;

use crate::runtime_state::{runtime, with_thread};

/// Marks `[addr, addr + size)` unaddressable.
///
/// Only granules wholly covered by the range are poisoned. Ignored when
/// `allow_user_poisoning=0` or the range lies outside the heap space.
///
/// # Safety
///
/// `addr` is only inspected, never dereferenced.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn shadowheap_poison_region(addr: *const c_void, size: usize) {
    // Only the heap space is shadowed; other ranges are left alone.
    let _ = runtime().poison_region(addr as usize, size);
}

/// Marks `[addr, addr + size)` addressable, possibly a little more at the
/// granule edges.
///
/// # Safety
///
/// `addr` is only inspected, never dereferenced.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn shadowheap_unpoison_region(addr: *const c_void, size: usize) {
    let _ = runtime().unpoison_region(addr as usize, size);
}

/// Would a 1-byte access at `addr` be reported?
///
/// # Safety
///
/// `addr` is only inspected, never dereferenced.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn shadowheap_is_poisoned(addr: *const c_void) -> bool {
    runtime().is_poisoned(addr as usize)
}

/// Reports a bad access of `size` bytes at `addr` and ends the process.
///
/// # Safety
///
/// `addr` is only inspected, never dereferenced.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn shadowheap_report_error(addr: *const c_void, is_write: bool, size: usize) {
    with_thread(|runtime, thread| {
        let report = runtime.classify(thread.tid(), addr as usize, is_write, size);
        runtime.die(&report)
    })
}
