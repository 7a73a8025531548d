//! ABI layer for heap chunks.
//!
//! Every entry point allocates through the calling thread's cache and frees
//! into its quarantine batch. Allocation failures and invalid frees end the
//! process through the fatal path; double frees and API mismatches do too
//! unless `halt_on_free_error=0`, in which case they are only logged.

use std::ffi::c_void;

use shadowheap_core::{AllocApi, StackTraceId};

use crate::runtime_state::{check, with_thread};

const MIN_ALIGNMENT: usize = 8;

fn allocate(size: usize, alignment: usize, api: AllocApi, stack: StackTraceId) -> *mut c_void {
    with_thread(|runtime, thread| {
        match runtime.allocate_traced(thread, size, alignment, api, stack) {
            Ok(p) => p as *mut c_void,
            Err(err) => runtime.die_with_error(&err.into()),
        }
    })
}

fn free(ptr: *mut c_void, api: AllocApi, stack: StackTraceId) {
    with_thread(|runtime, thread| {
        let result = runtime.deallocate_traced(thread, ptr as usize, api, stack);
        check(runtime, result);
    });
}

// ---------------------------------------------------------------------------
// Instrumentation entry points
// ---------------------------------------------------------------------------

/// Allocates `size` bytes aligned to `alignment` and records `stack` as the
/// allocation trace (0 captures one).
///
/// # Safety
///
/// Caller must eventually free the returned pointer exactly once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn shadowheap_allocate_chunk(
    size: usize,
    alignment: usize,
    stack: u32,
) -> *mut c_void {
    allocate(size, alignment, AllocApi::Malloc, StackTraceId(stack))
}

/// Frees a chunk into the quarantine. Null is a no-op.
///
/// # Safety
///
/// `ptr` must not be used after this call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn shadowheap_free_chunk(ptr: *mut c_void, stack: u32) {
    free(ptr, AllocApi::Malloc, StackTraceId(stack));
}

// ---------------------------------------------------------------------------
// malloc family
// ---------------------------------------------------------------------------

/// # Safety
///
/// Caller must eventually free the returned pointer exactly once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn shadowheap_malloc(size: usize) -> *mut c_void {
    allocate(size, MIN_ALIGNMENT, AllocApi::Malloc, StackTraceId::NONE)
}

/// Zeroed `nmemb * size` bytes. An overflowing product is fatal.
///
/// # Safety
///
/// Caller must eventually free the returned pointer exactly once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn shadowheap_calloc(nmemb: usize, size: usize) -> *mut c_void {
    with_thread(|runtime, thread| match runtime.calloc(thread, nmemb, size) {
        Ok(p) => p as *mut c_void,
        Err(err) => runtime.die_with_error(&err.into()),
    })
}

/// Moves `ptr` into a chunk of `size` bytes; null allocates, size 0 frees.
///
/// # Safety
///
/// `ptr` must be null or a live chunk; it must not be used after this call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn shadowheap_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    with_thread(|runtime, thread| match runtime.reallocate(thread, ptr as usize, size) {
        Ok(p) => p as *mut c_void,
        Err(err) if runtime.error_is_fatal(&err) => runtime.die_with_error(&err),
        Err(_) => std::ptr::null_mut(),
    })
}

/// `size` bytes aligned to `alignment` (a power of two).
///
/// # Safety
///
/// Caller must eventually free the returned pointer exactly once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn shadowheap_memalign(alignment: usize, size: usize) -> *mut c_void {
    allocate(size, alignment, AllocApi::Malloc, StackTraceId::NONE)
}

/// # Safety
///
/// `ptr` must not be used after this call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn shadowheap_free(ptr: *mut c_void) {
    free(ptr, AllocApi::Malloc, StackTraceId::NONE);
}

// ---------------------------------------------------------------------------
// operator new / delete
// ---------------------------------------------------------------------------

/// # Safety
///
/// The result must be released with [`shadowheap_delete`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn shadowheap_new(size: usize) -> *mut c_void {
    allocate(size, MIN_ALIGNMENT, AllocApi::New, StackTraceId::NONE)
}

/// # Safety
///
/// The result must be released with [`shadowheap_delete_array`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn shadowheap_new_array(size: usize) -> *mut c_void {
    allocate(size, MIN_ALIGNMENT, AllocApi::NewArray, StackTraceId::NONE)
}

/// # Safety
///
/// `ptr` must not be used after this call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn shadowheap_delete(ptr: *mut c_void) {
    free(ptr, AllocApi::New, StackTraceId::NONE);
}

/// # Safety
///
/// `ptr` must not be used after this call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn shadowheap_delete_array(ptr: *mut c_void) {
    free(ptr, AllocApi::NewArray, StackTraceId::NONE);
}
