//! Allocator hot-path benchmarks.
//!
//! Measures the cost of a redzoned allocation, of a free into the
//! quarantine, and of a fake frame round trip.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use shadowheap_core::{AllocApi, Config, Runtime};

fn bench_runtime() -> Runtime {
    let config = Config::parse(
        "region_size_log=26:secondary_space_log=30:quarantine_size=0x100000:thread_quarantine_size=0x10000",
    )
    .expect("bench config");
    Runtime::init(config).expect("runtime")
}

fn bench_malloc_free(c: &mut Criterion) {
    let rt = bench_runtime();
    let mut thread = rt.register_thread().expect("thread");
    let mut group = c.benchmark_group("malloc_free");
    for size in [16usize, 128, 1024, 16 * 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let p = rt
                    .allocate(&mut thread, size, 8, AllocApi::Malloc)
                    .expect("alloc");
                criterion::black_box(p);
                rt.deallocate(&mut thread, p, AllocApi::Malloc).expect("free");
            });
        });
    }
    group.finish();
    rt.unregister_thread(thread).expect("unregister");
}

fn bench_large_allocation(c: &mut Criterion) {
    let rt = bench_runtime();
    let mut thread = rt.register_thread().expect("thread");
    c.bench_function("malloc_free_large", |b| {
        b.iter(|| {
            let p = rt
                .allocate(&mut thread, 1 << 20, 4096, AllocApi::Malloc)
                .expect("alloc");
            criterion::black_box(p);
            rt.deallocate(&mut thread, p, AllocApi::Malloc).expect("free");
        });
    });
    rt.unregister_thread(thread).expect("unregister");
}

fn bench_fake_frame(c: &mut Criterion) {
    let rt = bench_runtime();
    let thread = rt.register_thread().expect("thread");
    let real_stack = 0x7ffc_0000_usize;
    c.bench_function("fake_frame_roundtrip", |b| {
        b.iter(|| {
            let frame = rt
                .allocate_fake_frame(&thread, 2, 200, real_stack)
                .expect("frame");
            rt.free_fake_frame(&thread, frame, 2, 200, real_stack)
                .expect("free frame");
        });
    });
    rt.unregister_thread(thread).expect("unregister");
}

criterion_group!(
    benches,
    bench_malloc_free,
    bench_large_allocation,
    bench_fake_frame
);
criterion_main!(benches);
