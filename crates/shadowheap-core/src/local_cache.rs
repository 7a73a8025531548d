//! Per-thread chunk cache in front of the primary allocator.
//!
//! Each thread keeps a stack of free chunks per size class. Misses refill a
//! whole batch from the region, and a list that grows to twice its cap flushes
//! half of it back, so the region lock is taken once per batch rather than once
//! per chunk.

use crate::error::AllocError;
use crate::primary::PrimaryAllocator;

/// Thread-owned cache. Must be drained into the allocator before it is dropped.
#[derive(Debug, Default)]
pub struct AllocatorCache {
    /// One stack of free chunk addresses per size class.
    lists: Box<[Vec<usize>]>,
    /// Number of chunks cached across all classes.
    total_cached: usize,
}

impl AllocatorCache {
    #[must_use]
    pub fn new(num_classes: usize) -> Self {
        Self {
            lists: (0..num_classes).map(|_| Vec::new()).collect(),
            total_cached: 0,
        }
    }

    /// Pops a chunk of `class_id`, refilling from `primary` on a miss.
    pub fn allocate(
        &mut self,
        primary: &PrimaryAllocator,
        class_id: usize,
    ) -> Result<usize, AllocError> {
        let list = &mut self.lists[class_id];
        if list.is_empty() {
            let before = list.len();
            primary.bulk_allocate(class_id, list)?;
            self.total_cached += list.len() - before;
        }
        let chunk = list.pop().ok_or(AllocError::RegionExhausted {
            class_id,
            region_size: primary.region_size(),
        })?;
        self.total_cached -= 1;
        Ok(chunk)
    }

    /// Caches `p`; flushes half the list once it reaches twice the class cap.
    pub fn deallocate(&mut self, primary: &PrimaryAllocator, class_id: usize, p: usize) {
        let cap = primary.classes().max_cached(class_id).max(1);
        let list = &mut self.lists[class_id];
        list.push(p);
        self.total_cached += 1;
        if list.len() >= 2 * cap {
            let mut flushed = list.split_off(list.len() - cap);
            self.total_cached -= flushed.len();
            primary.bulk_deallocate(class_id, &mut flushed);
        }
    }

    /// Returns every cached chunk to `primary`.
    pub fn drain(&mut self, primary: &PrimaryAllocator) {
        for (class_id, list) in self.lists.iter_mut().enumerate() {
            if !list.is_empty() {
                primary.bulk_deallocate(class_id, list);
            }
        }
        self.total_cached = 0;
    }

    #[must_use]
    pub fn cached(&self, class_id: usize) -> usize {
        self.lists.get(class_id).map_or(0, Vec::len)
    }

    #[must_use]
    pub const fn total_cached(&self) -> usize {
        self.total_cached
    }
}
