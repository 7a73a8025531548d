//! The runtime context.
//!
//! [`Runtime`] owns every shared component: the reserved heap space and its
//! shadow, the redzone manager, the quarantine, the fake-stack registry,
//! counters and the event log. Each thread registers once and then passes its
//! [`ThreadState`] (allocator cache, quarantine batch, fake stack) into every
//! call.

#![allow(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use parking_lot::Mutex;
use serde_json::json;

use crate::chunk::{AllocApi, Chunk, ChunkState};
use crate::classifier::{AccessInfo, BugReport, ErrorClassifier};
use crate::combined::CombinedAllocator;
use crate::config::Config;
use crate::error::{AllocError, Error, FreeError, Result};
use crate::fake_stack::{FakeFrame, FakeStack, FakeStackError, NUM_CLASSES, frame_size};
use crate::local_cache::AllocatorCache;
use crate::metrics::{HeapGauges, RuntimeMetrics, StatsSnapshot};
use crate::quarantine::{QuarantineBatch, QuarantineEntry, QuarantineQueue};
use crate::redzone::{Origin, RedzoneManager};
use crate::report::{REPORT_GUARD, render_free_error};
use crate::shadow::{SHADOW_GRANULARITY, ShadowError, ShadowMemoryMap};
use crate::stack::{NoStackCapture, StackCapture, StackTraceId};
use crate::structured_log::{EventLog, LogEntry, LogLevel};

/// Hook run by the fatal path right before the process exits.
pub type DeathCallback = extern "C" fn();

/// Per-thread state. Owned by exactly one thread.
#[derive(Debug)]
pub struct ThreadState {
    tid: u32,
    cache: AllocatorCache,
    batch: QuarantineBatch,
    fake_stack: Option<Arc<FakeStack>>,
}

impl ThreadState {
    #[must_use]
    pub const fn tid(&self) -> u32 {
        self.tid
    }

    #[must_use]
    pub const fn cache(&self) -> &AllocatorCache {
        &self.cache
    }

    #[must_use]
    pub const fn quarantine_batch(&self) -> &QuarantineBatch {
        &self.batch
    }

    #[must_use]
    pub fn fake_stack(&self) -> Option<&Arc<FakeStack>> {
        self.fake_stack.as_ref()
    }
}

pub struct Runtime {
    config: Config,
    redzones: RedzoneManager,
    quarantine: QuarantineQueue,
    fake_stacks: Mutex<Vec<Arc<FakeStack>>>,
    next_tid: AtomicU32,
    metrics: RuntimeMetrics,
    log: EventLog,
    stack_capture: Box<dyn StackCapture>,
    exit_code: AtomicI32,
    death_callback: Mutex<Option<DeathCallback>>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("space", &self.redzones.allocator().space())
            .field("next_tid", &self.next_tid)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Builds a runtime without stack capture, logging to stderr.
    pub fn init(config: Config) -> Result<Self> {
        Self::init_with(config, NoStackCapture)
    }

    pub fn init_with(config: Config, stack_capture: impl StackCapture + 'static) -> Result<Self> {
        let log = EventLog::stderr(LogLevel::from_verbosity(config.verbosity));
        Self::init_with_log(config, stack_capture, log)
    }

    /// Validates `config`, reserves the heap space and its shadow, and builds
    /// every component.
    pub fn init_with_log(
        config: Config,
        stack_capture: impl StackCapture + 'static,
        log: EventLog,
    ) -> Result<Self> {
        config.validate()?;
        let allocator = CombinedAllocator::new(
            config.size_class_map(),
            config.region_size_log,
            config.secondary_space_log,
        )?;
        let (space_beg, space_end) = allocator.space();
        let runtime = Self {
            redzones: RedzoneManager::new(allocator, config.redzone_options()),
            quarantine: QuarantineQueue::new(config.quarantine_size, config.thread_quarantine_size),
            fake_stacks: Mutex::new(Vec::new()),
            next_tid: AtomicU32::new(0),
            metrics: RuntimeMetrics::new(),
            log,
            stack_capture: Box::new(stack_capture),
            exit_code: AtomicI32::new(config.exitcode),
            death_callback: Mutex::new(None),
            config,
        };
        runtime.emit(
            LogEntry::new(LogLevel::Info, "runtime_init").with_details(json!({
                "space_beg": format!("{space_beg:#x}"),
                "space_end": format!("{space_end:#x}"),
                "size_classes": runtime.redzones.allocator().primary().classes().num_classes(),
                "redzone": runtime.config.redzone,
                "quarantine_size": runtime.config.quarantine_size,
            })),
        );
        Ok(runtime)
    }

    /// Flushes the quarantine back to the allocator and logs final stats.
    ///
    /// Threads must be unregistered before.
    pub fn shutdown(self) -> Result<StatsSnapshot> {
        let mut cache = self.redzones.allocator().new_cache();
        let purged = self.quarantine.purge();
        self.recycle(&mut cache, &purged)?;
        self.redzones.allocator().swallow_cache(&mut cache);
        let stats = self.stats();
        self.emit(
            LogEntry::new(LogLevel::Info, "stats")
                .with_details(serde_json::to_value(stats).unwrap_or_default()),
        );
        self.emit(LogEntry::new(LogLevel::Info, "runtime_shutdown"));
        Ok(stats)
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub const fn redzones(&self) -> &RedzoneManager {
        &self.redzones
    }

    #[must_use]
    pub const fn quarantine(&self) -> &QuarantineQueue {
        &self.quarantine
    }

    #[must_use]
    pub const fn metrics(&self) -> &RuntimeMetrics {
        &self.metrics
    }

    #[must_use]
    pub fn shadow(&self) -> &ShadowMemoryMap {
        self.redzones.allocator().shadow()
    }

    /// Writes `entry` to the event log. Log failures are dropped.
    pub fn emit(&self, entry: LogEntry) {
        let _ = self.log.emit(&entry);
    }

    /// `stack`, or a freshly captured trace when `stack` is none.
    fn origin(&self, tid: u32, stack: StackTraceId) -> Origin {
        Origin {
            stack: if stack.is_none() {
                self.stack_capture.capture(self.config.malloc_context_size)
            } else {
                stack
            },
            tid,
        }
    }

    // ---------------------------------------------------------------------
    // Threads
    // ---------------------------------------------------------------------

    /// Assigns the next thread id and builds the thread's private state.
    pub fn register_thread(&self) -> Result<ThreadState> {
        let tid = self.next_tid.fetch_add(1, Ordering::Relaxed);
        let fake_stack = if self.config.use_fake_stack {
            let fake = Arc::new(FakeStack::create(
                self.redzones.allocator(),
                self.config.fake_stack_size_log,
            )?);
            self.fake_stacks.lock().push(Arc::clone(&fake));
            Some(fake)
        } else {
            None
        };
        self.emit(
            LogEntry::new(LogLevel::Info, "thread_register")
                .with_tid(tid)
                .with_details(json!({
                    "fake_stack": fake_stack.as_ref().map(|fake| format!("{:#x}", fake.beg())),
                })),
        );
        Ok(ThreadState {
            tid,
            cache: self.redzones.allocator().new_cache(),
            batch: QuarantineBatch::default(),
            fake_stack,
        })
    }

    /// Hands everything `thread` holds back to the shared structures.
    pub fn unregister_thread(&self, mut thread: ThreadState) -> Result<()> {
        let evicted = self.quarantine.drain(&mut thread.batch);
        self.recycle(&mut thread.cache, &evicted)?;
        self.redzones.allocator().swallow_cache(&mut thread.cache);
        if let Some(fake) = thread.fake_stack.take() {
            self.fake_stacks.lock().retain(|other| !Arc::ptr_eq(other, &fake));
            fake.release(self.redzones.allocator())?;
        }
        self.emit(LogEntry::new(LogLevel::Info, "thread_unregister").with_tid(thread.tid));
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Heap
    // ---------------------------------------------------------------------

    pub fn allocate(
        &self,
        thread: &mut ThreadState,
        size: usize,
        alignment: usize,
        api: AllocApi,
    ) -> Result<usize, AllocError> {
        self.allocate_traced(thread, size, alignment, api, StackTraceId::NONE)
    }

    /// [`Self::allocate`] recording `stack` as the allocation trace.
    pub fn allocate_traced(
        &self,
        thread: &mut ThreadState,
        size: usize,
        alignment: usize,
        api: AllocApi,
        stack: StackTraceId,
    ) -> Result<usize, AllocError> {
        let origin = self.origin(thread.tid, stack);
        let user = self
            .redzones
            .allocate(&mut thread.cache, size, alignment, api, origin)?;
        RuntimeMetrics::inc(&self.metrics.mallocs);
        RuntimeMetrics::add(&self.metrics.bytes_allocated, size);
        Ok(user)
    }

    /// `count * size` zeroed bytes; the product is checked.
    pub fn calloc(&self, thread: &mut ThreadState, count: usize, size: usize) -> Result<usize, AllocError> {
        let origin = self.origin(thread.tid, StackTraceId::NONE);
        let user = self
            .redzones
            .allocate_zeroed(&mut thread.cache, count, size, origin)?;
        RuntimeMetrics::inc(&self.metrics.mallocs);
        RuntimeMetrics::add(&self.metrics.bytes_allocated, count * size);
        Ok(user)
    }

    /// Moves the chunk at `p` into a fresh chunk of `new_size` bytes.
    ///
    /// Null allocates; `new_size == 0` frees and returns 0. The old chunk
    /// goes through the quarantine, and is left untouched when anything fails.
    pub fn reallocate(&self, thread: &mut ThreadState, p: usize, new_size: usize) -> Result<usize> {
        if p == 0 {
            return Ok(self.allocate(thread, new_size, SHADOW_GRANULARITY, AllocApi::Malloc)?);
        }
        if new_size == 0 {
            self.deallocate(thread, p, AllocApi::Malloc)?;
            return Ok(0);
        }
        let tid = thread.tid;
        let old = match self.redzones.chunk(p).filter(|chunk| chunk.user_beg == p) {
            Some(chunk) if chunk.state == ChunkState::Allocated => chunk,
            Some(chunk) if chunk.state == ChunkState::Quarantined => {
                return Err(self
                    .free_failed(
                        tid,
                        FreeError::DoubleFree {
                            addr: p,
                            tid,
                            requested_size: chunk.requested_size,
                            alloc_stack: chunk.alloc_stack,
                            alloc_tid: chunk.alloc_tid,
                            free_stack: chunk.free_stack,
                            free_tid: chunk.free_tid,
                        },
                    )
                    .into());
            }
            _ => return Err(self.free_failed(tid, FreeError::InvalidFree { addr: p, tid }).into()),
        };
        let options = self.redzones.options();
        if options.alloc_dealloc_mismatch && options.halt_on_free_error && old.api != AllocApi::Malloc {
            let mismatch = FreeError::AllocDeallocMismatch {
                addr: p,
                tid,
                alloc: old.api,
                dealloc: AllocApi::Malloc,
                alloc_stack: old.alloc_stack,
            };
            return Err(self.free_failed(tid, mismatch).into());
        }

        let fresh = self.allocate(thread, new_size, SHADOW_GRANULARITY, AllocApi::Malloc)?;
        // SAFETY: `old` is allocated with `requested_size` addressable bytes,
        // `fresh` has `new_size`, and the two chunks are distinct.
        unsafe {
            std::ptr::copy_nonoverlapping(
                p as *const u8,
                fresh as *mut u8,
                old.requested_size.min(new_size),
            );
        }
        if let Err(err) = self.deallocate(thread, p, AllocApi::Malloc) {
            // Lost a race with another free of `p`.
            let _ = self.deallocate(thread, fresh, AllocApi::Malloc);
            return Err(err);
        }
        RuntimeMetrics::inc(&self.metrics.reallocs);
        Ok(fresh)
    }

    /// Frees the chunk at `p` into the quarantine. Null is a no-op.
    pub fn deallocate(&self, thread: &mut ThreadState, p: usize, api: AllocApi) -> Result<()> {
        self.deallocate_traced(thread, p, api, StackTraceId::NONE)
    }

    /// [`Self::deallocate`] recording `stack` as the free trace.
    pub fn deallocate_traced(
        &self,
        thread: &mut ThreadState,
        p: usize,
        api: AllocApi,
        stack: StackTraceId,
    ) -> Result<()> {
        let tid = thread.tid;
        let freed = match self.redzones.deallocate(p, api, self.origin(tid, stack)) {
            Ok(Some(freed)) => freed,
            Ok(None) => return Ok(()),
            Err(err) => return Err(self.free_failed(tid, err).into()),
        };
        if let Some(warning) = &freed.warning {
            self.note_free_error(tid, warning, LogLevel::Warn);
        }
        RuntimeMetrics::inc(&self.metrics.frees);
        RuntimeMetrics::add(&self.metrics.bytes_freed, freed.requested_size);
        let evicted = self.quarantine.put(&mut thread.batch, freed.entry);
        self.recycle(&mut thread.cache, &evicted)?;
        Ok(())
    }

    fn recycle(&self, cache: &mut AllocatorCache, entries: &[QuarantineEntry]) -> Result<(), AllocError> {
        for entry in entries {
            self.redzones.recycle(cache, entry)?;
            RuntimeMetrics::inc(&self.metrics.recycled_chunks);
            RuntimeMetrics::add(&self.metrics.recycled_bytes, entry.size);
        }
        Ok(())
    }

    fn note_free_error(&self, tid: u32, err: &FreeError, level: LogLevel) {
        let (counter, event) = match err {
            FreeError::DoubleFree { .. } => (Some(&self.metrics.double_frees), "double_free"),
            FreeError::AllocDeallocMismatch { .. } => {
                (Some(&self.metrics.alloc_dealloc_mismatches), "alloc_dealloc_mismatch")
            }
            FreeError::InvalidFree { .. } => (Some(&self.metrics.invalid_frees), "invalid_free"),
            FreeError::Shadow(_) => (None, "shadow_error"),
        };
        if let Some(counter) = counter {
            RuntimeMetrics::inc(counter);
        }
        let mut entry = LogEntry::new(level, event)
            .with_tid(tid)
            .with_details(json!({ "error": err.to_string() }));
        if let Some(addr) = err.addr() {
            entry = entry.with_addr(addr);
        }
        self.emit(entry);
    }

    fn free_failed(&self, tid: u32, err: FreeError) -> FreeError {
        self.note_free_error(tid, &err, LogLevel::Error);
        err
    }

    /// Must `err` end the process?
    ///
    /// Double frees and API mismatches only halt under `halt_on_free_error`.
    #[must_use]
    pub fn error_is_fatal(&self, err: &Error) -> bool {
        match err {
            Error::Free(FreeError::DoubleFree { .. } | FreeError::AllocDeallocMismatch { .. }) => {
                self.config.halt_on_free_error
            }
            _ => true,
        }
    }

    /// Snapshot of the chunk whose block contains `p`.
    #[must_use]
    pub fn chunk(&self, p: usize) -> Option<Chunk> {
        self.redzones.chunk(p)
    }

    /// Is `p` the start of a live chunk from this heap?
    #[must_use]
    pub fn ownership(&self, p: usize) -> bool {
        self.redzones.usable_size(p).is_some()
    }

    /// Requested size of the live chunk at `p`, 0 for anything else.
    #[must_use]
    pub fn allocated_size(&self, p: usize) -> usize {
        self.redzones.usable_size(p).unwrap_or(0)
    }

    /// What an allocation of `size` bytes will report as its size.
    #[must_use]
    pub const fn estimated_allocated_size(&self, size: usize) -> usize {
        size
    }

    // ---------------------------------------------------------------------
    // User poisoning
    // ---------------------------------------------------------------------

    pub fn poison_region(&self, addr: usize, size: usize) -> Result<(), ShadowError> {
        if !self.config.allow_user_poisoning {
            return Ok(());
        }
        RuntimeMetrics::inc(&self.metrics.user_poison_calls);
        self.shadow().poison_user_region(addr, size)
    }

    pub fn unpoison_region(&self, addr: usize, size: usize) -> Result<(), ShadowError> {
        if !self.config.allow_user_poisoning {
            return Ok(());
        }
        RuntimeMetrics::inc(&self.metrics.user_poison_calls);
        self.shadow().unpoison_user_region(addr, size)
    }

    /// False for addresses outside the heap space.
    #[must_use]
    pub fn is_poisoned(&self, addr: usize) -> bool {
        self.shadow().is_poisoned(addr).unwrap_or(false)
    }

    // ---------------------------------------------------------------------
    // Fake stack
    // ---------------------------------------------------------------------

    fn check_frame(class_id: usize, size: usize) -> Result<(), FakeStackError> {
        if class_id >= NUM_CLASSES {
            return Err(FakeStackError::InvalidClass { class_id });
        }
        if size > frame_size(class_id) {
            return Err(FakeStackError::FrameTooLarge { class_id, size });
        }
        Ok(())
    }

    /// A frame for a function running on `real_stack`, or `real_stack`
    /// itself when no fake frame is available.
    pub fn allocate_fake_frame(
        &self,
        thread: &ThreadState,
        class_id: usize,
        size: usize,
        real_stack: usize,
    ) -> Result<usize, FakeStackError> {
        Self::check_frame(class_id, size)?;
        let Some(fake) = &thread.fake_stack else {
            RuntimeMetrics::inc(&self.metrics.fake_stack_fallbacks);
            return Ok(real_stack);
        };
        let collected_before = fake.collected_frames();
        let result = fake.allocate(class_id, real_stack);
        RuntimeMetrics::add(
            &self.metrics.fake_frames_collected,
            fake.collected_frames() - collected_before,
        );
        match result {
            Ok(frame) => {
                RuntimeMetrics::inc(&self.metrics.fake_frames_allocated);
                Ok(frame)
            }
            Err(FakeStackError::Exhausted { .. }) => {
                RuntimeMetrics::inc(&self.metrics.fake_stack_fallbacks);
                self.emit(
                    LogEntry::new(LogLevel::Debug, "fake_stack_exhausted")
                        .with_tid(thread.tid)
                        .with_size(size)
                        .with_details(json!({ "class_id": class_id })),
                );
                Ok(real_stack)
            }
            Err(err) => Err(err),
        }
    }

    /// Returns a frame from [`Self::allocate_fake_frame`]. A frame that was
    /// served from the real stack is ignored.
    pub fn free_fake_frame(
        &self,
        thread: &ThreadState,
        ptr: usize,
        class_id: usize,
        size: usize,
        real_stack: usize,
    ) -> Result<(), FakeStackError> {
        if ptr == real_stack {
            return Ok(());
        }
        Self::check_frame(class_id, size)?;
        let fake = thread
            .fake_stack
            .as_ref()
            .ok_or(FakeStackError::NotAllocated { addr: ptr })?;
        fake.deallocate(ptr, class_id)?;
        RuntimeMetrics::inc(&self.metrics.fake_frames_freed);
        Ok(())
    }

    /// The thread is about to leave frames without returning through them.
    pub fn handle_no_return(&self, thread: &ThreadState) {
        if let Some(fake) = &thread.fake_stack {
            fake.handle_no_return();
        }
    }

    #[must_use]
    pub fn addr_is_in_fake_stack(&self, addr: usize) -> Option<FakeFrame> {
        self.fake_stacks
            .lock()
            .iter()
            .find_map(|fake| fake.addr_is_in_fake_stack(addr))
    }

    // ---------------------------------------------------------------------
    // Diagnostics
    // ---------------------------------------------------------------------

    /// Describes a bad access of `size` bytes at `addr` made by `thread_id`.
    #[must_use]
    pub fn classify(&self, thread_id: u32, addr: usize, is_write: bool, size: usize) -> BugReport {
        let access_stack = self.stack_capture.capture(self.config.malloc_context_size);
        let fake_stacks = self.fake_stacks.lock();
        ErrorClassifier {
            shadow: self.shadow(),
            redzones: &self.redzones,
            fake_stacks: &fake_stacks,
        }
        .classify(
            AccessInfo {
                addr,
                size,
                is_write,
            },
            thread_id,
            access_stack,
        )
    }

    /// Prints `report` and ends the process.
    pub fn die(&self, report: &BugReport) -> ! {
        let details = serde_json::to_value(report).unwrap_or_default();
        self.terminate(&report.render_text(), "bug_report", details)
    }

    /// Prints a fatal runtime error and ends the process.
    pub fn die_with_error(&self, err: &Error) -> ! {
        let text = match err {
            Error::Free(free) => render_free_error(free, &self.redzones),
            other => format!(
                "=================================================================\n\
                 ERROR: ShadowHeap: {other}\n"
            ),
        };
        self.terminate(&text, "fatal_error", json!({ "error": err.to_string() }))
    }

    fn terminate(&self, text: &str, event: &str, details: serde_json::Value) -> ! {
        if !REPORT_GUARD.try_begin() {
            // Another thread owns the report and will exit the process.
            loop {
                std::thread::park();
            }
        }
        eprint!("{text}");
        self.emit(LogEntry::new(LogLevel::Fatal, event).with_details(details));
        if let Some(callback) = *self.death_callback.lock() {
            callback();
        }
        std::process::exit(self.exit_code.load(Ordering::Relaxed))
    }

    /// Returns the previous exit code.
    pub fn set_error_exit_code(&self, code: i32) -> i32 {
        self.exit_code.swap(code, Ordering::Relaxed)
    }

    pub fn set_death_callback(&self, callback: Option<DeathCallback>) {
        *self.death_callback.lock() = callback;
    }

    // ---------------------------------------------------------------------
    // Stats
    // ---------------------------------------------------------------------

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        let allocator = self.redzones.allocator();
        self.metrics.snapshot(HeapGauges {
            heap_size: allocator.total_memory_used(),
            quarantine_bytes: self.quarantine.bytes(),
            quarantine_chunks: self.quarantine.len(),
            live_large_chunks: allocator.secondary().live_count(),
        })
    }

    #[must_use]
    pub fn current_allocated_bytes(&self) -> usize {
        self.metrics.current_allocated_bytes() as usize
    }

    #[must_use]
    pub fn heap_size(&self) -> usize {
        self.redzones.allocator().total_memory_used()
    }

    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.stats().free_bytes as usize
    }

    /// Logs the current counters as a `stats` event and returns their text form.
    pub fn report_stats(&self) -> String {
        let stats = self.stats();
        self.emit(
            LogEntry::new(LogLevel::Info, "stats")
                .with_details(serde_json::to_value(stats).unwrap_or_default()),
        );
        stats.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{AddressDescription, BugKind, Relation};
    use crate::structured_log::LogBuffer;

    fn small_config() -> Config {
        Config::parse("region_size_log=22:secondary_space_log=28:compact_size_classes=1:fake_stack_size_log=16")
            .unwrap()
    }

    fn runtime_with(config: Config) -> (Runtime, LogBuffer) {
        let (log, buffer) = EventLog::memory(LogLevel::Debug);
        let capture = |_: usize| StackTraceId(7);
        (Runtime::init_with_log(config, capture, log).unwrap(), buffer)
    }

    #[test]
    fn init_logs_and_assigns_thread_ids() {
        let (rt, log) = runtime_with(small_config());
        assert_eq!(log.events("runtime_init").len(), 1);
        let t0 = rt.register_thread().unwrap();
        let t1 = rt.register_thread().unwrap();
        assert_eq!((t0.tid(), t1.tid()), (0, 1));
        assert!(t0.fake_stack().is_some());
        rt.unregister_thread(t1).unwrap();
        rt.unregister_thread(t0).unwrap();
        assert_eq!(log.events("thread_unregister").len(), 2);
        rt.shutdown().unwrap();
        assert_eq!(log.events("runtime_shutdown").len(), 1);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = small_config();
        config.redzone = 100;
        let err = Runtime::init(config).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn overflow_is_classified() {
        let (rt, _log) = runtime_with(small_config());
        let mut t = rt.register_thread().unwrap();
        let p = rt.allocate(&mut t, 10, 8, AllocApi::Malloc).unwrap();
        assert_eq!(rt.allocated_size(p), 10);
        assert!(rt.ownership(p));
        assert!(!rt.ownership(p + 1));

        let report = rt.classify(t.tid(), p + 10, false, 1);
        assert_eq!(report.kind, BugKind::HeapBufferOverflow);
        let Some(AddressDescription::Heap(location)) = report.description else {
            panic!("expected heap description");
        };
        assert_eq!(location.offset, 10);
        assert_eq!(location.relation, Relation::Right);
        assert_eq!(location.chunk.alloc_stack, StackTraceId(7));

        let q = rt
            .allocate_traced(&mut t, 8, 8, AllocApi::Malloc, StackTraceId(99))
            .unwrap();
        rt.deallocate_traced(&mut t, q, AllocApi::Malloc, StackTraceId(100))
            .unwrap();
        let chunk = rt.chunk(q).unwrap();
        assert_eq!((chunk.alloc_stack, chunk.free_stack), (StackTraceId(99), StackTraceId(100)));
        rt.unregister_thread(t).unwrap();
    }

    #[test]
    fn use_after_free_then_double_free() {
        let (rt, log) = runtime_with(small_config());
        let mut t = rt.register_thread().unwrap();
        let p = rt.allocate(&mut t, 64, 8, AllocApi::Malloc).unwrap();
        rt.deallocate(&mut t, p, AllocApi::Malloc).unwrap();
        assert!(rt.is_poisoned(p));
        assert_eq!(rt.classify(t.tid(), p, true, 8).kind, BugKind::HeapUseAfterFree);

        let err = rt.deallocate(&mut t, p, AllocApi::Malloc).unwrap_err();
        assert!(matches!(err, Error::Free(FreeError::DoubleFree { .. })));
        assert!(rt.error_is_fatal(&err));
        assert_eq!(log.events("double_free").len(), 1);
        assert_eq!(rt.stats().double_frees, 1);
        rt.unregister_thread(t).unwrap();
    }

    #[test]
    fn tolerated_mismatch_frees_and_warns() {
        let mut config = small_config();
        config.halt_on_free_error = false;
        let (rt, log) = runtime_with(config);
        let mut t = rt.register_thread().unwrap();
        let p = rt.allocate(&mut t, 16, 8, AllocApi::NewArray).unwrap();
        rt.deallocate(&mut t, p, AllocApi::Malloc).unwrap();
        let warnings = log.events("alloc_dealloc_mismatch");
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].level, LogLevel::Warn);
        let err = rt.deallocate(&mut t, p, AllocApi::NewArray).unwrap_err();
        assert!(!rt.error_is_fatal(&err));
        rt.unregister_thread(t).unwrap();
    }

    #[test]
    fn realloc_copies_and_quarantines_old_chunk() {
        let (rt, _log) = runtime_with(small_config());
        let mut t = rt.register_thread().unwrap();
        let p = rt.allocate(&mut t, 4, 8, AllocApi::Malloc).unwrap();
        // SAFETY: four addressable bytes at `p`.
        unsafe { std::ptr::copy_nonoverlapping([1u8, 2, 3, 4].as_ptr(), p as *mut u8, 4) };
        let q = rt.reallocate(&mut t, p, 100).unwrap();
        assert_ne!(p, q);
        // SAFETY: `q` holds at least four addressable bytes.
        let copied = unsafe { std::slice::from_raw_parts(q as *const u8, 4) };
        assert_eq!(copied, [1, 2, 3, 4]);
        assert!(rt.is_poisoned(p));
        assert_eq!(rt.allocated_size(q), 100);

        assert!(matches!(
            rt.reallocate(&mut t, p, 8),
            Err(Error::Free(FreeError::DoubleFree { .. }))
        ));
        let n = rt.allocate(&mut t, 8, 8, AllocApi::New).unwrap();
        assert!(matches!(
            rt.reallocate(&mut t, n, 32),
            Err(Error::Free(FreeError::AllocDeallocMismatch { .. }))
        ));
        assert_eq!(rt.allocated_size(n), 8);
        assert_eq!(rt.reallocate(&mut t, q, 0).unwrap(), 0);
        assert_eq!(rt.stats().reallocs, 1);
        rt.unregister_thread(t).unwrap();
    }

    #[test]
    fn calloc_zeroes_and_checks_overflow() {
        let mut config = small_config();
        config.max_malloc_fill_size = 4096;
        let (rt, _log) = runtime_with(config);
        let mut t = rt.register_thread().unwrap();
        let p = rt.calloc(&mut t, 8, 16).unwrap();
        // SAFETY: 128 addressable bytes at `p`.
        let bytes = unsafe { std::slice::from_raw_parts(p as *const u8, 128) };
        assert!(bytes.iter().all(|&b| b == 0));
        assert!(matches!(
            rt.calloc(&mut t, usize::MAX, 2),
            Err(AllocError::CallocOverflow { .. })
        ));
        rt.unregister_thread(t).unwrap();
    }

    #[test]
    fn user_poisoning_respects_option() {
        let (rt, _log) = runtime_with(small_config());
        let mut t = rt.register_thread().unwrap();
        let p = rt.allocate(&mut t, 64, 8, AllocApi::Malloc).unwrap();
        rt.poison_region(p, 32).unwrap();
        assert!(rt.is_poisoned(p));
        assert_eq!(rt.classify(t.tid(), p, false, 1).kind, BugKind::UseAfterPoison);
        rt.unpoison_region(p, 32).unwrap();
        assert!(!rt.is_poisoned(p));
        assert!(!rt.is_poisoned(0x1000));
        rt.unregister_thread(t).unwrap();

        let mut config = small_config();
        config.allow_user_poisoning = false;
        let (rt, _log) = runtime_with(config);
        let mut t = rt.register_thread().unwrap();
        let p = rt.allocate(&mut t, 64, 8, AllocApi::Malloc).unwrap();
        rt.poison_region(p, 32).unwrap();
        assert!(!rt.is_poisoned(p));
        rt.unregister_thread(t).unwrap();
    }

    #[test]
    fn fake_frames_detect_use_after_return() {
        let (rt, _log) = runtime_with(small_config());
        let t = rt.register_thread().unwrap();
        let real_stack = 0x7fff_0000;
        let frame = rt.allocate_fake_frame(&t, 0, 48, real_stack).unwrap();
        assert_ne!(frame, real_stack);
        assert!(!rt.is_poisoned(frame));
        rt.free_fake_frame(&t, frame, 0, 48, real_stack).unwrap();
        assert_eq!(rt.classify(t.tid(), frame, false, 8).kind, BugKind::StackUseAfterReturn);
        assert!(rt.addr_is_in_fake_stack(frame).is_some());

        assert_eq!(
            rt.allocate_fake_frame(&t, 0, 65, real_stack),
            Err(FakeStackError::FrameTooLarge { class_id: 0, size: 65 })
        );
        assert_eq!(
            rt.allocate_fake_frame(&t, NUM_CLASSES, 8, real_stack),
            Err(FakeStackError::InvalidClass { class_id: NUM_CLASSES })
        );
        rt.free_fake_frame(&t, real_stack, 0, 48, real_stack).unwrap();
        rt.unregister_thread(t).unwrap();
        assert!(rt.addr_is_in_fake_stack(frame).is_none());
    }

    #[test]
    fn exhausted_fake_class_falls_back_and_gc_reclaims() {
        let (rt, log) = runtime_with(small_config());
        let t = rt.register_thread().unwrap();
        let class_id = NUM_CLASSES - 1;
        let frames = t.fake_stack().map_or(0, |f| f.frames_in_class(class_id));
        let deep = 0x7000_0000;
        for _ in 0..frames {
            assert_ne!(rt.allocate_fake_frame(&t, class_id, 64, deep).unwrap(), deep);
        }
        assert_eq!(rt.allocate_fake_frame(&t, class_id, 64, deep).unwrap(), deep);
        let exhausted = log.events("fake_stack_exhausted");
        assert_eq!(exhausted.len(), 1);
        assert_eq!(exhausted[0].size, Some(64));
        assert_eq!(exhausted[0].tid, Some(t.tid()));

        rt.handle_no_return(&t);
        let shallow = deep + 0x1000;
        assert_ne!(rt.allocate_fake_frame(&t, class_id, 64, shallow).unwrap(), shallow);
        let stats = rt.stats();
        assert_eq!(stats.fake_frames_collected, frames as u64);
        assert_eq!(stats.fake_stack_fallbacks, 1);
        rt.unregister_thread(t).unwrap();
    }

    #[test]
    fn threads_without_fake_stack_use_real_stack() {
        let mut config = small_config();
        config.use_fake_stack = false;
        let (rt, _log) = runtime_with(config);
        let t = rt.register_thread().unwrap();
        assert_eq!(rt.allocate_fake_frame(&t, 2, 100, 0x1234).unwrap(), 0x1234);
        rt.free_fake_frame(&t, 0x1234, 2, 100, 0x1234).unwrap();
        rt.unregister_thread(t).unwrap();
    }

    #[test]
    fn stats_track_heap_and_quarantine() {
        let (rt, log) = runtime_with(small_config());
        let mut t = rt.register_thread().unwrap();
        let small = rt.allocate(&mut t, 100, 8, AllocApi::Malloc).unwrap();
        let large = rt.allocate(&mut t, 1 << 20, 8, AllocApi::Malloc).unwrap();
        assert_eq!(rt.current_allocated_bytes(), 100 + (1 << 20));
        assert!(rt.heap_size() > 1 << 20);
        assert!(rt.stats().live_large_chunks >= 2);

        rt.deallocate(&mut t, small, AllocApi::Malloc).unwrap();
        rt.deallocate(&mut t, large, AllocApi::Malloc).unwrap();
        assert_eq!(rt.current_allocated_bytes(), 0);
        rt.unregister_thread(t).unwrap();
        assert!(rt.stats().quarantine_bytes > 1 << 20);
        assert!(rt.report_stats().contains("2 mallocs"));
        assert_eq!(log.events("stats").len(), 1);

        let final_stats = rt.shutdown().unwrap();
        assert_eq!(final_stats.quarantine_bytes, 0);
        assert_eq!(final_stats.recycled_chunks, 2);
    }

    #[test]
    fn exit_code_swaps() {
        let (rt, _log) = runtime_with(small_config());
        assert_eq!(rt.set_error_exit_code(42), 1);
        assert_eq!(rt.set_error_exit_code(1), 42);
        rt.set_death_callback(None);
    }
}
