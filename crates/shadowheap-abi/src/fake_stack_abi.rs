//! ABI layer for fake stack frames.
//!
//! A frame that cannot be served from the fake stack is served from the real
//! stack: the returned address equals `real_stack` and the matching free is a
//! no-op. Invalid classes, oversized frames and frees of frames that were
//! never handed out are fatal.

use shadowheap_core::Error;

use crate::runtime_state::with_thread;

/// A frame of at least `size` bytes from class `class_id` for a function
/// running on `real_stack`.
///
/// # Safety
///
/// The frame must be released with [`shadowheap_free_fake_frame`] before the
/// owning function returns, or abandoned through
/// [`shadowheap_handle_no_return`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn shadowheap_allocate_fake_frame(
    class_id: usize,
    size: usize,
    real_stack: usize,
) -> usize {
    with_thread(|runtime, thread| {
        match runtime.allocate_fake_frame(thread, class_id, size, real_stack) {
            Ok(frame) => frame,
            Err(err) => runtime.die_with_error(&Error::from(err)),
        }
    })
}

/// Poisons a frame from [`shadowheap_allocate_fake_frame`].
///
/// # Safety
///
/// Locals in the frame must not be used after this call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn shadowheap_free_fake_frame(
    ptr: usize,
    class_id: usize,
    size: usize,
    real_stack: usize,
) {
    with_thread(|runtime, thread| {
        if let Err(err) = runtime.free_fake_frame(thread, ptr, class_id, size, real_stack) {
            runtime.die_with_error(&Error::from(err));
        }
    });
}

/// The calling thread is about to unwind past frames without freeing them.
///
/// # Safety
///
/// Always safe to call; `unsafe` for symmetry with the rest of the surface.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn shadowheap_handle_no_return() {
    with_thread(|runtime, thread| runtime.handle_no_return(thread));
}
