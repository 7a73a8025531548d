use shadowheap_core::{AllocApi, ChunkState, Config, Error, EventLog, FreeError, LogLevel, NoStackCapture, Runtime};
use std::sync::Barrier;
use std::thread;

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
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }
}

fn runtime(options: &str) -> Runtime {
    let config = Config::parse(options).unwrap();
    let (log, _buffer) = EventLog::memory(LogLevel::Warn);
    Runtime::init_with_log(config, NoStackCapture, log).unwrap()
}

#[test]
fn threads_allocate_and_free_through_their_own_caches() {
    const THREADS: usize = 8;
    const STEPS: usize = 3_000;

    // The global quarantine holds every byte the workers can free, so a chunk
    // freed here is never recycled to another thread before it is checked.
    let rt = runtime(
        "region_size_log=24:secondary_space_log=30:compact_size_classes=1:\
         fake_stack_size_log=16:quarantine_size=0x4000000:thread_quarantine_size=0x4000",
    );

    thread::scope(|scope| {
        for worker in 0..THREADS {
            let rt = &rt;
            scope.spawn(move || {
                let mut t = rt.register_thread().unwrap();
                let mut rng = XorShift64::new(0x9e37_79b9 + worker as u64);
                let mut live: Vec<(usize, usize, u8)> = Vec::new();
                for _ in 0..STEPS {
                    if live.is_empty() || rng.gen_range_usize(0, 2) > 0 {
                        let size = rng.gen_range_usize(1, 2048);
                        let p = rt.allocate(&mut t, size, 8, AllocApi::Malloc).unwrap();
                        let tag = (rng.next_u64() & 0xff) as u8;
                        // SAFETY: `size` addressable bytes were just allocated at `p`.
                        unsafe { std::ptr::write_bytes(p as *mut u8, tag, size) };
                        live.push((p, size, tag));
                    } else {
                        let idx = rng.gen_range_usize(0, live.len() - 1);
                        let (p, size, tag) = live.swap_remove(idx);
                        // SAFETY: the chunk is still allocated and owned by this thread.
                        let bytes = unsafe { std::slice::from_raw_parts(p as *const u8, size) };
                        assert!(bytes.iter().all(|&b| b == tag), "chunk {p:#x} was clobbered");
                        assert!(!rt.is_poisoned(p + size - 1));
                        assert!(rt.is_poisoned(p + size));
                        rt.deallocate(&mut t, p, AllocApi::Malloc).unwrap();
                        assert_eq!(rt.chunk(p).map(|c| c.state), Some(ChunkState::Quarantined));
                        assert!(rt.is_poisoned(p));
                    }
                }
                for (p, _, _) in live {
                    rt.deallocate(&mut t, p, AllocApi::Malloc).unwrap();
                }
                rt.unregister_thread(t).unwrap();
            });
        }
    });

    let stats = rt.stats();
    assert_eq!(stats.mallocs, stats.frees);
    assert_eq!(stats.current_allocated_bytes, 0);
    assert_eq!(stats.double_frees, 0);
    assert_eq!(stats.recycled_chunks, 0);
    assert!(stats.quarantine_bytes <= 0x4000000);
    rt.shutdown().unwrap();
}

#[test]
fn racing_double_frees_yield_exactly_one_error_each() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 50;

    let rt = runtime("region_size_log=22:secondary_space_log=28:compact_size_classes=1:use_fake_stack=0");
    let mut owner = rt.register_thread().unwrap();

    for round in 0..ROUNDS {
        let size = 16 + round * 8;
        let p = rt.allocate(&mut owner, size, 8, AllocApi::Malloc).unwrap();
        let barrier = Barrier::new(THREADS);
        let results: Vec<Result<(), Error>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    let rt = &rt;
                    let barrier = &barrier;
                    scope.spawn(move || {
                        let mut t = rt.register_thread().unwrap();
                        barrier.wait();
                        let result = rt.deallocate(&mut t, p, AllocApi::Malloc);
                        rt.unregister_thread(t).unwrap();
                        result
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let ok = results.iter().filter(|r| r.is_ok()).count();
        let double = results
            .iter()
            .filter(|r| matches!(r, Err(Error::Free(FreeError::DoubleFree { .. }))))
            .count();
        assert_eq!(ok, 1, "round {round}: {results:?}");
        assert_eq!(double, THREADS - 1, "round {round}: {results:?}");
    }

    assert_eq!(rt.stats().double_frees, (ROUNDS * (THREADS - 1)) as u64);
    rt.unregister_thread(owner).unwrap();
}

#[test]
fn fake_stacks_are_per_thread() {
    let rt = runtime("region_size_log=22:secondary_space_log=28:compact_size_classes=1:fake_stack_size_log=16");
    let frames: Vec<usize> = thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let rt = &rt;
                scope.spawn(move || {
                    let t = rt.register_thread().unwrap();
                    let real_stack = 0x7000_0000 + i * 0x10000;
                    let frame = rt.allocate_fake_frame(&t, 1, 100, real_stack).unwrap();
                    assert!(rt.addr_is_in_fake_stack(frame).is_some());
                    rt.free_fake_frame(&t, frame, 1, 100, real_stack).unwrap();
                    rt.unregister_thread(t).unwrap();
                    frame
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(frames.len(), 4);
    for frame in frames {
        assert!(rt.addr_is_in_fake_stack(frame).is_none());
    }
}
