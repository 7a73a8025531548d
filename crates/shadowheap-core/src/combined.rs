//! Front door over the primary and secondary allocators.
//!
//! Owns the reserved heap space: the primary regions come first, the
//! secondary range right after them. One shadow map covers both.

#![allow(unsafe_code)]

use std::sync::Arc;

use crate::chunk::{ChunkClass, ChunkMeta};
use crate::error::AllocError;
use crate::local_cache::AllocatorCache;
use crate::primary::PrimaryAllocator;
use crate::secondary::LargeMmapAllocator;
use crate::shadow::{SHADOW_GRANULARITY, ShadowMemoryMap};
use crate::size_class::SizeClassMap;
use crate::vm::Mapping;

#[derive(Debug)]
pub struct CombinedAllocator {
    primary: PrimaryAllocator,
    secondary: LargeMmapAllocator,
    shadow: Arc<ShadowMemoryMap>,
    // Declared last: unmapped after everything that points into it.
    space: Mapping,
}

impl CombinedAllocator {
    /// Reserves the heap space and maps its shadow.
    pub fn new(
        classes: SizeClassMap,
        region_size_log: u32,
        secondary_space_log: u32,
    ) -> Result<Self, AllocError> {
        let primary_size = PrimaryAllocator::space_size(&classes, region_size_log);
        let secondary_size = 1usize << secondary_space_log;
        let space = Mapping::reserve(primary_size + secondary_size, 1 << region_size_log)?;
        let shadow = Arc::new(ShadowMemoryMap::new(space.beg(), space.size())?);
        // SAFETY: both ranges partition `space`, which is region-aligned, covered
        // by `shadow`, and dropped after the allocators (field order).
        let (primary, secondary) = unsafe {
            (
                PrimaryAllocator::new(space.beg(), region_size_log, classes, Arc::clone(&shadow)),
                LargeMmapAllocator::new(space.beg() + primary_size, secondary_size, Arc::clone(&shadow)),
            )
        };
        Ok(Self {
            primary,
            secondary,
            shadow,
            space,
        })
    }

    #[must_use]
    pub fn shadow(&self) -> &Arc<ShadowMemoryMap> {
        &self.shadow
    }

    #[must_use]
    pub const fn primary(&self) -> &PrimaryAllocator {
        &self.primary
    }

    #[must_use]
    pub const fn secondary(&self) -> &LargeMmapAllocator {
        &self.secondary
    }

    /// Whole reserved heap range.
    #[must_use]
    pub const fn space(&self) -> (usize, usize) {
        (self.space.beg(), self.space.end())
    }

    #[must_use]
    pub fn new_cache(&self) -> AllocatorCache {
        AllocatorCache::new(self.primary.classes().num_classes())
    }

    pub fn allocate(
        &self,
        cache: &mut AllocatorCache,
        size: usize,
        alignment: usize,
    ) -> Result<usize, AllocError> {
        if !alignment.is_power_of_two() {
            return Err(AllocError::InvalidAlignment { alignment });
        }
        let mut size = size.max(1);
        if size.checked_add(alignment).is_none() {
            return Err(AllocError::Overflow { size, alignment });
        }
        if alignment > SHADOW_GRANULARITY {
            size = size.next_multiple_of(alignment);
        }
        if self.primary.can_allocate(size, alignment) {
            let class_id = self
                .primary
                .classes()
                .class_id_aligned(size, alignment)
                .ok_or(AllocError::NoSizeClass { size })?;
            cache.allocate(&self.primary, class_id)
        } else {
            self.secondary.allocate(size, alignment)
        }
    }

    /// Returns a block obtained from [`Self::allocate`]. Null is a no-op.
    pub fn deallocate(&self, cache: &mut AllocatorCache, p: usize) -> Result<(), AllocError> {
        if p == 0 {
            return Ok(());
        }
        if self.primary.pointer_is_mine(p) {
            if self.primary.block_begin(p) != Some(p) {
                return Err(AllocError::UnknownPointer { addr: p });
            }
            cache.deallocate(&self.primary, self.primary.class_of(p), p);
            Ok(())
        } else {
            self.secondary.deallocate(p)
        }
    }

    /// Moves a block's contents into a fresh block of `new_size` bytes.
    ///
    /// On failure the old block is left untouched.
    pub fn reallocate(
        &self,
        cache: &mut AllocatorCache,
        p: usize,
        new_size: usize,
        alignment: usize,
    ) -> Result<usize, AllocError> {
        if p == 0 {
            return self.allocate(cache, new_size, alignment);
        }
        if new_size == 0 {
            self.deallocate(cache, p)?;
            return Ok(0);
        }
        let old_size = self
            .actually_allocated_size(p)
            .ok_or(AllocError::UnknownPointer { addr: p })?;
        let fresh = self.allocate(cache, new_size, alignment)?;
        // SAFETY: both blocks are live, committed, and distinct.
        unsafe {
            std::ptr::copy_nonoverlapping(p as *const u8, fresh as *mut u8, old_size.min(new_size));
        }
        self.deallocate(cache, p)?;
        Ok(fresh)
    }

    /// Is `p` inside a carved primary slot or a live large mapping?
    #[must_use]
    pub fn pointer_is_mine(&self, p: usize) -> bool {
        self.primary.locate(p).is_some() || self.secondary.find_block(p).is_some()
    }

    #[must_use]
    pub fn block_begin(&self, p: usize) -> Option<usize> {
        if self.primary.pointer_is_mine(p) {
            self.primary.block_begin(p)
        } else {
            self.secondary.block_begin(p)
        }
    }

    #[must_use]
    pub fn chunk_class(&self, block: usize) -> ChunkClass {
        if self.primary.pointer_is_mine(block) {
            ChunkClass::Class(self.primary.class_of(block))
        } else {
            ChunkClass::Large
        }
    }

    /// Metadata record of the block starting at `block`.
    #[must_use]
    pub fn chunk_meta(&self, block: usize) -> Option<&ChunkMeta> {
        if self.primary.pointer_is_mine(block) {
            self.primary.metadata(block)
        } else {
            self.secondary.metadata(block)
        }
    }

    #[must_use]
    pub fn metadata_addr(&self, block: usize) -> Option<usize> {
        if let Some(location) = self.primary.locate(block) {
            return Some(self.primary.metadata_addr(location));
        }
        self.secondary
            .pointer_is_mine(block)
            .then(|| self.secondary.metadata_addr(block))
    }

    #[must_use]
    pub fn actually_allocated_size(&self, block: usize) -> Option<usize> {
        if self.primary.pointer_is_mine(block) {
            self.primary
                .locate(block)
                .map(|_| self.primary.actually_allocated_size(block))
        } else {
            self.secondary.actually_allocated_size(block)
        }
    }

    #[must_use]
    pub fn total_memory_used(&self) -> usize {
        self.primary.total_memory_used() + self.secondary.total_memory_used()
    }

    /// Returns everything a dying thread's cache holds.
    pub fn swallow_cache(&self, cache: &mut AllocatorCache) {
        cache.drain(&self.primary);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm;

    fn combined() -> CombinedAllocator {
        CombinedAllocator::new(SizeClassMap::compact(), 22, 28).unwrap()
    }

    #[test]
    fn routes_by_size_and_alignment() {
        let heap = combined();
        let mut cache = heap.new_cache();
        let small = heap.allocate(&mut cache, 100, 8).unwrap();
        assert!(heap.primary().pointer_is_mine(small));
        assert_eq!(heap.chunk_class(small), ChunkClass::Class(heap.primary().class_of(small)));
        assert_eq!(heap.actually_allocated_size(small), Some(112));

        let large = heap.allocate(&mut cache, 40_000, 8).unwrap();
        assert!(!heap.primary().pointer_is_mine(large));
        assert_eq!(heap.chunk_class(large), ChunkClass::Large);

        let aligned = heap.allocate(&mut cache, 10, vm::page_size() * 2).unwrap();
        assert_eq!(aligned % (vm::page_size() * 2), 0);
        assert_eq!(heap.chunk_class(aligned), ChunkClass::Large);

        let (beg, end) = heap.space();
        for p in [small, large, aligned] {
            assert!(p >= beg && p < end);
            assert!(heap.pointer_is_mine(p));
            assert_eq!(heap.block_begin(p), Some(p));
            assert!(heap.chunk_meta(p).is_some());
            assert!(heap.metadata_addr(p).is_some());
            heap.deallocate(&mut cache, p).unwrap();
        }
        heap.swallow_cache(&mut cache);
        assert_eq!(cache.total_cached(), 0);
    }

    #[test]
    fn alignment_rounds_size() {
        let heap = combined();
        let mut cache = heap.new_cache();
        let p = heap.allocate(&mut cache, 33, 64).unwrap();
        assert_eq!(p % 64, 0);
        assert!(heap.actually_allocated_size(p).unwrap() >= 64);
        let zero = heap.allocate(&mut cache, 0, 8).unwrap();
        assert_eq!(heap.actually_allocated_size(zero), Some(8));
    }

    #[test]
    fn argument_errors() {
        let heap = combined();
        let mut cache = heap.new_cache();
        assert_eq!(
            heap.allocate(&mut cache, 8, 24),
            Err(AllocError::InvalidAlignment { alignment: 24 })
        );
        assert!(matches!(
            heap.allocate(&mut cache, usize::MAX, 8),
            Err(AllocError::Overflow { .. })
        ));
        let p = heap.allocate(&mut cache, 64, 8).unwrap();
        assert_eq!(
            heap.deallocate(&mut cache, p + 8),
            Err(AllocError::UnknownPointer { addr: p + 8 })
        );
        assert_eq!(heap.deallocate(&mut cache, 0), Ok(()));
    }

    #[test]
    fn reallocate_copies_prefix() {
        let heap = combined();
        let mut cache = heap.new_cache();
        let p = heap.allocate(&mut cache, 32, 8).unwrap();
        // SAFETY: the block is live and 32 bytes long.
        unsafe {
            for i in 0..32 {
                *((p + i) as *mut u8) = i as u8;
            }
        }
        let q = heap.reallocate(&mut cache, p, 50_000, 8).unwrap();
        assert_ne!(p, q);
        // SAFETY: the new block holds at least 32 bytes.
        let copied = unsafe { std::slice::from_raw_parts(q as *const u8, 32) };
        assert!(copied.iter().enumerate().all(|(i, &b)| b == i as u8));

        let r = heap.reallocate(&mut cache, q, 16, 8).unwrap();
        // SAFETY: 16 live bytes.
        let copied = unsafe { std::slice::from_raw_parts(r as *const u8, 16) };
        assert!(copied.iter().enumerate().all(|(i, &b)| b == i as u8));

        assert_eq!(heap.reallocate(&mut cache, r, 0, 8), Ok(0));
        let fresh = heap.reallocate(&mut cache, 0, 24, 8).unwrap();
        assert_ne!(fresh, 0);

        // Failed growth leaves the old block alone.
        let err = heap.reallocate(&mut cache, fresh, 1 << 29, 8);
        assert!(matches!(err, Err(AllocError::SecondaryExhausted { .. })));
        assert_eq!(heap.block_begin(fresh), Some(fresh));
    }
}
