//! Process-wide runtime and per-thread state.
//!
//! The runtime is built on first use from `SHADOWHEAP_OPTIONS` and never torn
//! down. Uses manual atomic init instead of `OnceLock` so a thread racing the
//! initializer spins instead of parking inside the allocator.
//!
//! Each thread registers lazily on its first call; a TLS destructor hands its
//! cache, quarantine batch and fake stack back when the thread exits.

use std::cell::Cell;
use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

use shadowheap_core::{Config, Error, Runtime, ThreadState};

const STATE_UNINIT: u8 = 0;
const STATE_INITIALIZING: u8 = 1;
const STATE_READY: u8 = 2;

static RUNTIME_STATE: AtomicU8 = AtomicU8::new(STATE_UNINIT);
static RUNTIME_PTR: AtomicPtr<Runtime> = AtomicPtr::new(std::ptr::null_mut());

/// The runtime, if initialization already finished.
pub(crate) fn try_runtime() -> Option<&'static Runtime> {
    if RUNTIME_STATE.load(Ordering::Acquire) != STATE_READY {
        return None;
    }
    let ptr = RUNTIME_PTR.load(Ordering::Acquire);
    // SAFETY: READY is published after RUNTIME_PTR holds a leaked, never-freed
    // `Box<Runtime>`.
    Some(unsafe { &*ptr })
}

/// The runtime, built on first call.
pub(crate) fn runtime() -> &'static Runtime {
    loop {
        if let Some(runtime) = try_runtime() {
            return runtime;
        }
        if RUNTIME_STATE
            .compare_exchange(
                STATE_UNINIT,
                STATE_INITIALIZING,
                Ordering::SeqCst,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            return initialize();
        }
        std::thread::yield_now();
    }
}

fn initialize() -> &'static Runtime {
    let runtime = match Config::from_env()
        .map_err(Error::from)
        .and_then(Runtime::init)
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("ShadowHeap: failed to initialize: {err}");
            std::process::exit(1);
        }
    };
    let runtime: &'static Runtime = Box::leak(Box::new(runtime));
    RUNTIME_PTR.store(std::ptr::from_ref(runtime).cast_mut(), Ordering::Release);
    RUNTIME_STATE.store(STATE_READY, Ordering::Release);
    runtime
}

/// Owns one registered [`ThreadState`]; unregisters it on drop.
struct ThreadGuard {
    state: Option<ThreadState>,
}

fn register(runtime: &Runtime) -> ThreadState {
    match runtime.register_thread() {
        Ok(state) => state,
        Err(err) => runtime.die_with_error(&err),
    }
}

impl Drop for ThreadGuard {
    fn drop(&mut self) {
        let (Some(state), Some(runtime)) = (self.state.take(), try_runtime()) else {
            return;
        };
        if let Err(err) = runtime.unregister_thread(state) {
            runtime.die_with_error(&err);
        }
    }
}

thread_local! {
    static THREAD: Cell<Option<ThreadGuard>> = const { Cell::new(None) };
}

/// Runs `f` with the runtime and the calling thread's state.
///
/// The state is taken out of TLS for the duration of the call. A nested call
/// (from a death callback, say) or a call after TLS teardown gets a temporary
/// registration instead.
pub(crate) fn with_thread<R>(f: impl FnOnce(&'static Runtime, &mut ThreadState) -> R) -> R {
    let runtime = runtime();
    let mut guard = THREAD
        .try_with(Cell::take)
        .ok()
        .flatten()
        .unwrap_or(ThreadGuard { state: None });
    let state = guard.state.get_or_insert_with(|| register(runtime));
    let result = f(runtime, state);
    // A guard displaced by a nested call, or this one when TLS is gone, is
    // dropped and unregistered here.
    let _ = THREAD.try_with(move |slot| drop(slot.replace(Some(guard))));
    result
}

/// Ends the process for `err` when it is fatal.
pub(crate) fn check(runtime: &Runtime, result: Result<(), Error>) {
    if let Err(err) = result {
        if runtime.error_is_fatal(&err) {
            runtime.die_with_error(&err);
        }
    }
}
