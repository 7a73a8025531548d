use shadowheap_core::classifier::Relation;
use shadowheap_core::structured_log::LogBuffer;
use shadowheap_core::{
    AddressDescription, AllocApi, BugKind, ChunkState, Config, Error, EventLog, FreeError, LogLevel,
    Runtime, StackTraceId,
};
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Clone, Copy, Debug)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn gen_range_usize(&mut self, low: usize, high_inclusive: usize) -> usize {
        assert!(low <= high_inclusive);
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }
}

const SMALL: &str = "region_size_log=22:secondary_space_log=28:compact_size_classes=1:fake_stack_size_log=16";

fn runtime(extra: &str) -> (Runtime, LogBuffer) {
    let mut config = Config::parse(SMALL).unwrap();
    config.apply_options(extra).unwrap();
    config.validate().unwrap();
    let (log, buffer) = EventLog::memory(LogLevel::Debug);
    // Every capture gets a fresh id so stacks can be told apart.
    let next = AtomicU32::new(1);
    let capture = move |_: usize| StackTraceId(next.fetch_add(1, Ordering::Relaxed));
    (Runtime::init_with_log(config, capture, log).unwrap(), buffer)
}

#[test]
fn heap_buffer_overflow_one_past_end() {
    let (rt, _log) = runtime("");
    let mut t = rt.register_thread().unwrap();
    let p = rt.allocate(&mut t, 10, 8, AllocApi::Malloc).unwrap();
    for i in 0..10 {
        assert!(!rt.is_poisoned(p + i), "byte {i} should be addressable");
    }
    let report = rt.classify(t.tid(), p + 10, true, 1);
    assert_eq!(report.kind, BugKind::HeapBufferOverflow);
    let Some(AddressDescription::Heap(location)) = report.description else {
        panic!("expected heap description, got {:?}", report.description);
    };
    assert_eq!(location.offset, 10);
    assert_eq!(location.chunk.requested_size, 10);
    assert!(report.render_text().contains("0 bytes to the right of 10-byte region"));
    rt.unregister_thread(t).unwrap();
}

#[test]
fn underflow_is_reported_left_of_region() {
    let (rt, _log) = runtime("");
    let mut t = rt.register_thread().unwrap();
    let p = rt.allocate(&mut t, 48, 8, AllocApi::Malloc).unwrap();
    let report = rt.classify(t.tid(), p - 4, false, 4);
    assert_eq!(report.kind, BugKind::HeapBufferOverflow);
    let Some(AddressDescription::Heap(location)) = report.description else {
        panic!("expected heap description");
    };
    assert_eq!(location.relation, Relation::Left);
    assert_eq!(location.distance, 4);
    assert_eq!(location.offset, -4);
    rt.unregister_thread(t).unwrap();
}

#[test]
fn use_after_free_names_both_stacks() {
    let (rt, _log) = runtime("");
    let mut t = rt.register_thread().unwrap();
    let p = rt.allocate(&mut t, 32, 8, AllocApi::Malloc).unwrap();
    let alloc_stack = rt.chunk(p).unwrap().alloc_stack;
    assert!(!alloc_stack.is_none());
    rt.deallocate(&mut t, p, AllocApi::Malloc).unwrap();

    let report = rt.classify(t.tid(), p + 8, false, 8);
    assert_eq!(report.kind, BugKind::HeapUseAfterFree);
    let Some(AddressDescription::Heap(location)) = report.description else {
        panic!("expected heap description");
    };
    assert_eq!(location.chunk.state, ChunkState::Quarantined);
    assert_eq!(location.chunk.alloc_stack, alloc_stack);
    assert_ne!(location.chunk.free_stack, alloc_stack);
    let text = report.render_text();
    assert!(text.contains("freed by thread T0 here:"));
    assert!(text.contains(&format!("previously allocated by thread T0 here:\n    {alloc_stack}")));
    rt.unregister_thread(t).unwrap();
}

#[test]
fn double_free_is_not_use_after_free() {
    let (rt, log) = runtime("");
    let mut t = rt.register_thread().unwrap();
    let p = rt.allocate(&mut t, 200, 8, AllocApi::Malloc).unwrap();
    rt.deallocate(&mut t, p, AllocApi::Malloc).unwrap();
    let err = rt.deallocate(&mut t, p, AllocApi::Malloc).unwrap_err();
    let Error::Free(FreeError::DoubleFree {
        requested_size,
        free_tid,
        ..
    }) = err
    else {
        panic!("expected double free, got {err:?}");
    };
    assert_eq!(requested_size, 200);
    assert_eq!(free_tid, 0);
    let events = log.events("double_free");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].addr.as_deref(), Some(format!("{p:#x}").as_str()));
    rt.unregister_thread(t).unwrap();
}

#[test]
fn interior_and_foreign_frees_are_invalid() {
    let (rt, log) = runtime("");
    let mut t = rt.register_thread().unwrap();
    let p = rt.allocate(&mut t, 64, 8, AllocApi::Malloc).unwrap();
    for bad in [p + 8, 0x1000] {
        assert!(matches!(
            rt.deallocate(&mut t, bad, AllocApi::Malloc),
            Err(Error::Free(FreeError::InvalidFree { .. }))
        ));
    }
    assert_eq!(log.events("invalid_free").len(), 2);
    rt.deallocate(&mut t, 0, AllocApi::Malloc).unwrap();
    rt.deallocate(&mut t, p, AllocApi::Malloc).unwrap();
    rt.unregister_thread(t).unwrap();
}

#[test]
fn mismatched_delete_halts_by_default() {
    let (rt, _log) = runtime("");
    let mut t = rt.register_thread().unwrap();
    let p = rt.allocate(&mut t, 24, 8, AllocApi::New).unwrap();
    let err = rt.deallocate(&mut t, p, AllocApi::NewArray).unwrap_err();
    assert!(rt.error_is_fatal(&err));
    // The chunk is still live after the refused free.
    assert_eq!(rt.allocated_size(p), 24);
    rt.deallocate(&mut t, p, AllocApi::New).unwrap();

    let (rt, _log) = runtime("alloc_dealloc_mismatch=0");
    let mut t2 = rt.register_thread().unwrap();
    let p = rt.allocate(&mut t2, 24, 8, AllocApi::New).unwrap();
    rt.deallocate(&mut t2, p, AllocApi::Malloc).unwrap();
    rt.unregister_thread(t2).unwrap();
}

#[test]
fn stack_use_after_return() {
    let (rt, _log) = runtime("");
    let t = rt.register_thread().unwrap();
    let real_stack = 0x7ffc_0000_usize;
    let frame = rt.allocate_fake_frame(&t, 3, 300, real_stack).unwrap();
    assert_ne!(frame, real_stack);
    assert!(!rt.is_poisoned(frame + 299));
    rt.free_fake_frame(&t, frame, 3, 300, real_stack).unwrap();

    let report = rt.classify(t.tid(), frame + 16, false, 8);
    assert_eq!(report.kind, BugKind::StackUseAfterReturn);
    let Some(AddressDescription::FakeFrame(location)) = report.description else {
        panic!("expected fake frame description");
    };
    assert_eq!(location.frame.class_id, 3);
    assert_eq!(location.offset, 16);
    assert!(!location.frame.allocated);
    rt.unregister_thread(t).unwrap();
}

#[test]
fn large_allocations_are_guarded_and_aligned() {
    let (rt, _log) = runtime("");
    let mut t = rt.register_thread().unwrap();
    let p = rt.allocate(&mut t, 100_000, 4096, AllocApi::Malloc).unwrap();
    assert_eq!(p % 4096, 0);
    assert!(!rt.is_poisoned(p + 99_999));
    assert_eq!(rt.classify(t.tid(), p + 100_000, true, 1).kind, BugKind::HeapBufferOverflow);
    rt.deallocate(&mut t, p, AllocApi::Malloc).unwrap();
    assert_eq!(rt.classify(t.tid(), p, false, 1).kind, BugKind::HeapUseAfterFree);
    rt.unregister_thread(t).unwrap();
}

#[test]
fn tiny_quarantine_recycles() {
    let (rt, _log) = runtime("quarantine_size=4096:thread_quarantine_size=512");
    let mut t = rt.register_thread().unwrap();
    for _ in 0..65 {
        let p = rt.allocate(&mut t, 100, 8, AllocApi::Malloc).unwrap();
        rt.deallocate(&mut t, p, AllocApi::Malloc).unwrap();
    }
    let stats = rt.stats();
    // 100 bytes plus two 128-byte redzones land in the 512-byte class, so the
    // global queue holds at most 8 chunks and the thread batch at most one.
    assert!(stats.quarantine_bytes <= 4096);
    assert!(stats.quarantine_chunks <= 8);
    assert!(stats.recycled_chunks >= 56, "{stats:?}");
    rt.unregister_thread(t).unwrap();
}

#[test]
fn recycled_chunk_comes_back_addressable_with_fresh_metadata() {
    let (rt, _log) = runtime("quarantine_size=0");
    let mut t = rt.register_thread().unwrap();
    let p = rt.allocate(&mut t, 100, 8, AllocApi::New).unwrap();
    let first = rt.chunk(p).unwrap();
    rt.deallocate(&mut t, p, AllocApi::New).unwrap();

    let freed = rt.chunk(p).unwrap();
    assert_eq!(freed.state, ChunkState::Recycled);
    assert_ne!(freed.free_stack, StackTraceId::NONE);
    assert!(rt.is_poisoned(p));
    assert_eq!(rt.stats().recycled_chunks, 1);
    assert_eq!(rt.stats().quarantine_chunks, 0);

    let q = rt.allocate(&mut t, 100, 8, AllocApi::Malloc).unwrap();
    assert_eq!(q, p, "the cache hands the recycled block out first");
    for i in 0..100 {
        assert!(!rt.is_poisoned(q + i), "byte {i} should be addressable");
    }
    assert!(rt.is_poisoned(q + 100));
    assert!(rt.is_poisoned(q - 1));

    let fresh = rt.chunk(q).unwrap();
    assert_eq!(fresh.state, ChunkState::Allocated);
    assert_eq!(fresh.api, AllocApi::Malloc);
    assert_eq!(fresh.requested_size, 100);
    assert_ne!(fresh.alloc_stack, first.alloc_stack);
    assert_eq!(fresh.free_stack, StackTraceId::NONE);
    assert_eq!(fresh.free_tid, 0);
    assert_eq!(rt.allocated_size(q), 100);
    rt.deallocate(&mut t, q, AllocApi::Malloc).unwrap();
    rt.unregister_thread(t).unwrap();
}

#[test]
fn unaligned_access_straddling_the_end_is_an_overflow() {
    let (rt, _log) = runtime("");
    let mut t = rt.register_thread().unwrap();
    let p = rt.allocate(&mut t, 10, 8, AllocApi::Malloc).unwrap();
    for (offset, size) in [(4, 8), (6, 4)] {
        let report = rt.classify(t.tid(), p + offset, false, size);
        assert_eq!(report.kind, BugKind::HeapBufferOverflow, "access at +{offset} of {size}");
        let Some(AddressDescription::Heap(location)) = report.description else {
            panic!("expected heap description, got {:?}", report.description);
        };
        assert_eq!(location.chunk.user_beg, p);
    }
    rt.deallocate(&mut t, p, AllocApi::Malloc).unwrap();
    rt.unregister_thread(t).unwrap();
}

#[test]
fn deterministic_sequences_keep_shadow_consistent() {
    const SEEDS: [u64; 3] = [0x1234, 0xdead_beef, 42];
    const STEPS: usize = 1_500;
    const SLOTS: usize = 24;

    for seed in SEEDS {
        let (rt, _log) = runtime("quarantine_size=65536:thread_quarantine_size=4096");
        let mut t = rt.register_thread().unwrap();
        let mut rng = XorShift64::new(seed);
        let mut live: Vec<Option<(usize, usize)>> = vec![None; SLOTS];
        let mut freed: Vec<usize> = Vec::new();

        for _ in 0..STEPS {
            let slot = rng.gen_range_usize(0, SLOTS - 1);
            match live[slot].take() {
                Some((p, _)) => {
                    rt.deallocate(&mut t, p, AllocApi::Malloc).unwrap();
                    freed.push(p);
                }
                None => {
                    let size = if rng.gen_range_usize(0, 15) == 0 {
                        rng.gen_range_usize(40_000, 120_000)
                    } else {
                        rng.gen_range_usize(1, 3000)
                    };
                    let align = 1 << rng.gen_range_usize(3, 7);
                    let p = rt.allocate(&mut t, size, align, AllocApi::Malloc).unwrap();
                    assert_eq!(p % align, 0, "seed {seed:#x}");
                    assert!(!rt.is_poisoned(p));
                    assert!(!rt.is_poisoned(p + size - 1));
                    assert!(rt.is_poisoned(p + size), "seed {seed:#x} size {size}");
                    assert!(rt.is_poisoned(p - 1));
                    live[slot] = Some((p, size));
                }
            }
        }

        for &(p, size) in live.iter().flatten() {
            assert_eq!(rt.allocated_size(p), size);
        }
        for &p in &freed {
            // Recycled chunks may have been handed out again.
            if let Some(chunk) = rt.chunk(p) {
                if chunk.state == ChunkState::Quarantined && chunk.user_beg == p {
                    assert!(rt.is_poisoned(p));
                }
            }
        }
        let stats = rt.stats();
        assert!(stats.quarantine_bytes <= 65_536);
        assert_eq!(stats.mallocs - stats.frees, live.iter().flatten().count() as u64);
        rt.unregister_thread(t).unwrap();
        rt.shutdown().unwrap();
    }
}
