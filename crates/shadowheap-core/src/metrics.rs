//! Atomic counters for allocator observability.
//!
//! All counters use relaxed ordering; they are diagnostic only.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Per-runtime operation counters.
#[derive(Debug)]
pub struct RuntimeMetrics {
    /// Successful allocations (every API).
    pub mallocs: AtomicU64,
    /// Successful deallocations that reached the quarantine.
    pub frees: AtomicU64,
    /// Successful reallocations.
    pub reallocs: AtomicU64,
    /// Requested bytes handed out.
    pub bytes_allocated: AtomicU64,
    /// Requested bytes of freed chunks.
    pub bytes_freed: AtomicU64,
    /// Chunks evicted from the quarantine and returned to the allocator.
    pub recycled_chunks: AtomicU64,
    /// Block bytes of recycled chunks.
    pub recycled_bytes: AtomicU64,
    pub alloc_dealloc_mismatches: AtomicU64,
    pub double_frees: AtomicU64,
    pub invalid_frees: AtomicU64,
    pub fake_frames_allocated: AtomicU64,
    pub fake_frames_freed: AtomicU64,
    /// Frames reclaimed by the deferred collector after a non-returning exit.
    pub fake_frames_collected: AtomicU64,
    /// Frame requests served from the real stack instead.
    pub fake_stack_fallbacks: AtomicU64,
    /// Honoured user poison / unpoison calls.
    pub user_poison_calls: AtomicU64,
}

impl RuntimeMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mallocs: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            reallocs: AtomicU64::new(0),
            bytes_allocated: AtomicU64::new(0),
            bytes_freed: AtomicU64::new(0),
            recycled_chunks: AtomicU64::new(0),
            recycled_bytes: AtomicU64::new(0),
            alloc_dealloc_mismatches: AtomicU64::new(0),
            double_frees: AtomicU64::new(0),
            invalid_frees: AtomicU64::new(0),
            fake_frames_allocated: AtomicU64::new(0),
            fake_frames_freed: AtomicU64::new(0),
            fake_frames_collected: AtomicU64::new(0),
            fake_stack_fallbacks: AtomicU64::new(0),
            user_poison_calls: AtomicU64::new(0),
        }
    }

    /// Increment a counter by 1.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, amount: usize) {
        counter.fetch_add(amount as u64, Ordering::Relaxed);
    }

    /// Read a counter value.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Requested bytes currently allocated and not yet freed.
    #[must_use]
    pub fn current_allocated_bytes(&self) -> u64 {
        Self::get(&self.bytes_allocated).saturating_sub(Self::get(&self.bytes_freed))
    }

    /// Snapshot all counters together with heap gauges.
    #[must_use]
    pub fn snapshot(&self, gauges: HeapGauges) -> StatsSnapshot {
        let current_allocated_bytes = self.current_allocated_bytes();
        StatsSnapshot {
            mallocs: Self::get(&self.mallocs),
            frees: Self::get(&self.frees),
            reallocs: Self::get(&self.reallocs),
            bytes_allocated: Self::get(&self.bytes_allocated),
            bytes_freed: Self::get(&self.bytes_freed),
            recycled_chunks: Self::get(&self.recycled_chunks),
            recycled_bytes: Self::get(&self.recycled_bytes),
            alloc_dealloc_mismatches: Self::get(&self.alloc_dealloc_mismatches),
            double_frees: Self::get(&self.double_frees),
            invalid_frees: Self::get(&self.invalid_frees),
            fake_frames_allocated: Self::get(&self.fake_frames_allocated),
            fake_frames_freed: Self::get(&self.fake_frames_freed),
            fake_frames_collected: Self::get(&self.fake_frames_collected),
            fake_stack_fallbacks: Self::get(&self.fake_stack_fallbacks),
            user_poison_calls: Self::get(&self.user_poison_calls),
            current_allocated_bytes,
            heap_size: gauges.heap_size as u64,
            free_bytes: (gauges.heap_size as u64)
                .saturating_sub(current_allocated_bytes)
                .saturating_sub(gauges.quarantine_bytes as u64),
            quarantine_bytes: gauges.quarantine_bytes as u64,
            quarantine_chunks: gauges.quarantine_chunks as u64,
            live_large_chunks: gauges.live_large_chunks as u64,
        }
    }
}

impl Default for RuntimeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocator state sampled when a snapshot is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapGauges {
    /// Committed primary and secondary bytes.
    pub heap_size: usize,
    pub quarantine_bytes: usize,
    pub quarantine_chunks: usize,
    pub live_large_chunks: usize,
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    pub mallocs: u64,
    pub frees: u64,
    pub reallocs: u64,
    pub bytes_allocated: u64,
    pub bytes_freed: u64,
    pub recycled_chunks: u64,
    pub recycled_bytes: u64,
    pub alloc_dealloc_mismatches: u64,
    pub double_frees: u64,
    pub invalid_frees: u64,
    pub fake_frames_allocated: u64,
    pub fake_frames_freed: u64,
    pub fake_frames_collected: u64,
    pub fake_stack_fallbacks: u64,
    pub user_poison_calls: u64,
    pub current_allocated_bytes: u64,
    pub heap_size: u64,
    /// Committed bytes neither allocated nor quarantined.
    pub free_bytes: u64,
    pub quarantine_bytes: u64,
    pub quarantine_chunks: u64,
    pub live_large_chunks: u64,
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Stats: {} mallocs, {} frees, {} reallocs", self.mallocs, self.frees, self.reallocs)?;
        writeln!(
            f,
            "Stats: {} bytes allocated, {} bytes freed, {} bytes in use",
            self.bytes_allocated, self.bytes_freed, self.current_allocated_bytes
        )?;
        writeln!(
            f,
            "Stats: heap {} bytes, free {} bytes, quarantine {} bytes in {} chunks, {} large chunks",
            self.heap_size, self.free_bytes, self.quarantine_bytes, self.quarantine_chunks, self.live_large_chunks
        )?;
        writeln!(
            f,
            "Stats: recycled {} chunks ({} bytes)",
            self.recycled_chunks, self.recycled_bytes
        )?;
        write!(
            f,
            "Stats: fake frames {} allocated, {} freed, {} collected, {} fallbacks",
            self.fake_frames_allocated,
            self.fake_frames_freed,
            self.fake_frames_collected,
            self.fake_stack_fallbacks
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let m = RuntimeMetrics::new();
        assert_eq!(RuntimeMetrics::get(&m.mallocs), 0);
        assert_eq!(m.snapshot(HeapGauges::default()), StatsSnapshot::default());
    }

    #[test]
    fn snapshot_derives_in_use_and_free() {
        let m = RuntimeMetrics::new();
        RuntimeMetrics::inc(&m.mallocs);
        RuntimeMetrics::inc(&m.mallocs);
        RuntimeMetrics::add(&m.bytes_allocated, 300);
        RuntimeMetrics::add(&m.bytes_freed, 100);
        let snap = m.snapshot(HeapGauges {
            heap_size: 4096,
            quarantine_bytes: 256,
            quarantine_chunks: 1,
            live_large_chunks: 0,
        });
        assert_eq!(snap.mallocs, 2);
        assert_eq!(snap.current_allocated_bytes, 200);
        assert_eq!(snap.free_bytes, 4096 - 200 - 256);
        let json = serde_json::to_value(snap).unwrap();
        assert_eq!(json["quarantine_chunks"], 1);
        assert!(snap.to_string().contains("2 mallocs"));
    }
}
