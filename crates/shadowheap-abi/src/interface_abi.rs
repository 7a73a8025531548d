//! ABI layer for runtime control and allocator statistics.

use std::ffi::{c_int, c_void};

use shadowheap_core::DeathCallback;

use crate::runtime_state::runtime;

/// Sets the exit code of the fatal path and returns the previous one.
#[unsafe(no_mangle)]
pub extern "C" fn shadowheap_set_error_exit_code(code: c_int) -> c_int {
    runtime().set_error_exit_code(code)
}

/// Installs (or clears, with null) a hook the fatal path runs before exiting.
#[unsafe(no_mangle)]
pub extern "C" fn shadowheap_set_death_callback(callback: Option<DeathCallback>) {
    runtime().set_death_callback(callback);
}

#[unsafe(no_mangle)]
pub extern "C" fn shadowheap_get_estimated_allocated_size(size: usize) -> usize {
    runtime().estimated_allocated_size(size)
}

/// 1 when `ptr` is the start of a live chunk, 0 otherwise.
///
/// # Safety
///
/// `ptr` is only inspected, never dereferenced.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn shadowheap_get_ownership(ptr: *const c_void) -> c_int {
    c_int::from(runtime().ownership(ptr as usize))
}

/// Requested size of the live chunk at `ptr`, 0 if there is none.
///
/// # Safety
///
/// `ptr` is only inspected, never dereferenced.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn shadowheap_get_allocated_size(ptr: *const c_void) -> usize {
    runtime().allocated_size(ptr as usize)
}

#[unsafe(no_mangle)]
pub extern "C" fn shadowheap_get_current_allocated_bytes() -> usize {
    runtime().current_allocated_bytes()
}

#[unsafe(no_mangle)]
pub extern "C" fn shadowheap_get_heap_size() -> usize {
    runtime().heap_size()
}

#[unsafe(no_mangle)]
pub extern "C" fn shadowheap_get_free_bytes() -> usize {
    runtime().free_bytes()
}

/// Prints the accumulated counters to stderr.
#[unsafe(no_mangle)]
pub extern "C" fn shadowheap_print_accumulated_stats() {
    eprintln!("{}", runtime().report_stats());
}
