//! Size-class allocator for small chunks.
//!
//! The primary space is split into one region of `2^region_size_log` bytes per
//! size class. Chunks are carved upward from the region start and their
//! metadata records downward from the region end, so the metadata of a chunk
//! is a pure function of `(class_id, slot)`.

#![allow(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::chunk::{ChunkMeta, METADATA_SIZE};
use crate::error::AllocError;
use crate::shadow::{ShadowMagic, ShadowMemoryMap};
use crate::size_class::SizeClassMap;
use crate::vm;

/// Minimum bytes carved per populate.
pub const POPULATE_SIZE: usize = 1 << 18;
/// User memory is committed in steps of this many bytes.
pub const USER_MAP_SIZE: usize = 1 << 22;
/// Metadata is committed in steps of this many bytes.
pub const META_MAP_SIZE: usize = 1 << 20;

/// Position of a chunk inside the primary space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkLocation {
    pub class_id: usize,
    pub slot: usize,
}

/// Bookkeeping of one region. Guarded by the region lock.
#[derive(Debug, Default)]
struct RegionInfo {
    /// Free chunk addresses; the last element is handed out first.
    free_list: Vec<usize>,
    /// Bytes carved into chunks from the region start.
    allocated_user: usize,
    /// Bytes of metadata records from the region end.
    allocated_meta: usize,
    /// Committed bytes from the region start.
    mapped_user: usize,
    /// Committed bytes from the region end.
    mapped_meta: usize,
}

#[derive(Debug, Default)]
struct Region {
    info: Mutex<RegionInfo>,
    /// Mirror of `allocated_user` readable without the lock.
    carved_user: AtomicUsize,
}

/// Region-per-class allocator over a reserved range.
#[derive(Debug)]
pub struct PrimaryAllocator {
    space_beg: usize,
    region_size_log: u32,
    classes: SizeClassMap,
    regions: Box<[Region]>,
    shadow: Arc<ShadowMemoryMap>,
}

impl PrimaryAllocator {
    /// Bytes of address space needed for `classes` with the given region size.
    #[must_use]
    pub fn space_size(classes: &SizeClassMap, region_size_log: u32) -> usize {
        classes.num_classes() << region_size_log
    }

    /// # Safety
    ///
    /// `[space_beg, space_beg + space_size(..))` must be reserved address space
    /// owned by the caller, aligned to the region size, covered by `shadow`,
    /// and must outlive the allocator.
    pub unsafe fn new(
        space_beg: usize,
        region_size_log: u32,
        classes: SizeClassMap,
        shadow: Arc<ShadowMemoryMap>,
    ) -> Self {
        let regions = (0..classes.num_classes())
            .map(|_| Region::default())
            .collect();
        Self {
            space_beg,
            region_size_log,
            classes,
            regions,
            shadow,
        }
    }

    #[must_use]
    pub const fn space_beg(&self) -> usize {
        self.space_beg
    }

    #[must_use]
    pub fn space_end(&self) -> usize {
        self.space_beg + (self.regions.len() << self.region_size_log)
    }

    #[must_use]
    pub const fn region_size(&self) -> usize {
        1 << self.region_size_log
    }

    #[must_use]
    pub fn classes(&self) -> &SizeClassMap {
        &self.classes
    }

    fn region_beg(&self, class_id: usize) -> usize {
        self.space_beg + (class_id << self.region_size_log)
    }

    #[must_use]
    pub fn can_allocate(&self, size: usize, alignment: usize) -> bool {
        size <= self.classes.max_size() && alignment <= vm::page_size()
    }

    #[must_use]
    pub fn pointer_is_mine(&self, p: usize) -> bool {
        p >= self.space_beg && p < self.space_end()
    }

    /// Size class of the region holding `p`. Meaningful only when
    /// [`Self::pointer_is_mine`] holds.
    #[must_use]
    pub const fn class_of(&self, p: usize) -> usize {
        (p - self.space_beg) >> self.region_size_log
    }

    /// Chunk slot containing `p`, if that slot has been carved.
    #[must_use]
    pub fn locate(&self, p: usize) -> Option<ChunkLocation> {
        if !self.pointer_is_mine(p) {
            return None;
        }
        let class_id = self.class_of(p);
        let size = self.classes.size(class_id);
        let slot = (p - self.region_beg(class_id)) / size;
        let carved = self.regions[class_id].carved_user.load(Ordering::Acquire);
        ((slot + 1) * size <= carved).then_some(ChunkLocation { class_id, slot })
    }

    #[must_use]
    pub fn block_begin(&self, p: usize) -> Option<usize> {
        let location = self.locate(p)?;
        Some(self.region_beg(location.class_id) + location.slot * self.classes.size(location.class_id))
    }

    #[must_use]
    pub fn metadata_addr(&self, location: ChunkLocation) -> usize {
        self.region_beg(location.class_id) + self.region_size() - (location.slot + 1) * METADATA_SIZE
    }

    /// Metadata record of the chunk containing `p`.
    #[must_use]
    pub fn metadata(&self, p: usize) -> Option<&ChunkMeta> {
        let location = self.locate(p)?;
        let addr = self.metadata_addr(location);
        // SAFETY: a carved slot always has its metadata committed, zero-initialized
        // memory is a valid `ChunkMeta`, and the space outlives `self`.
        Some(unsafe { &*(addr as *const ChunkMeta) })
    }

    #[must_use]
    pub fn actually_allocated_size(&self, p: usize) -> usize {
        self.classes.size(self.class_of(p))
    }

    /// Pops one chunk of `class_id`, populating the region if needed.
    pub fn allocate(&self, size: usize, alignment: usize) -> Result<usize, AllocError> {
        if !self.can_allocate(size, alignment) {
            return Err(AllocError::NoSizeClass { size });
        }
        let class_id = self
            .classes
            .class_id(size)
            .ok_or(AllocError::NoSizeClass { size })?;
        let region = &self.regions[class_id];
        let mut info = region.info.lock();
        if info.free_list.is_empty() {
            self.populate(class_id, region, &mut info)?;
        }
        info.free_list
            .pop()
            .ok_or(AllocError::RegionExhausted {
                class_id,
                region_size: self.region_size(),
            })
    }

    /// Returns one chunk to its region.
    pub fn deallocate(&self, p: usize) {
        let class_id = self.class_of(p);
        self.regions[class_id].info.lock().free_list.push(p);
    }

    /// Moves up to `max_cached(class_id)` chunks into `into`. The chunk handed
    /// out first sits at the end of `into`.
    pub fn bulk_allocate(&self, class_id: usize, into: &mut Vec<usize>) -> Result<(), AllocError> {
        let region = &self.regions[class_id];
        let mut info = region.info.lock();
        if info.free_list.is_empty() {
            self.populate(class_id, region, &mut info)?;
        }
        let take = self.classes.max_cached(class_id).min(info.free_list.len());
        let split = info.free_list.len() - take;
        into.extend(info.free_list.drain(split..));
        Ok(())
    }

    /// Returns every chunk in `list` to the region under one lock acquisition.
    pub fn bulk_deallocate(&self, class_id: usize, list: &mut Vec<usize>) {
        self.regions[class_id].info.lock().free_list.append(list);
    }

    #[must_use]
    pub fn free_list_len(&self, class_id: usize) -> usize {
        self.regions
            .get(class_id)
            .map_or(0, |region| region.info.lock().free_list.len())
    }

    /// Committed bytes across all regions.
    #[must_use]
    pub fn total_memory_used(&self) -> usize {
        self.regions
            .iter()
            .map(|region| {
                let info = region.info.lock();
                (info.mapped_user + info.mapped_meta).min(self.region_size())
            })
            .sum()
    }

    /// Carves a fresh batch of chunks into the free list.
    ///
    /// Commits happen with the region lock released; overlapping commits from
    /// racing threads are harmless because `mprotect` keeps committed bytes.
    fn populate(
        &self,
        class_id: usize,
        region: &Region,
        info: &mut MutexGuard<'_, RegionInfo>,
    ) -> Result<(), AllocError> {
        let page = vm::page_size();
        let size = self.classes.size(class_id);
        let count = (POPULATE_SIZE / (size + METADATA_SIZE)).max(1);
        let region_beg = self.region_beg(class_id);
        let region_size = self.region_size();
        let region_end = region_beg + region_size;

        loop {
            if !info.free_list.is_empty() {
                return Ok(());
            }
            let user_end = info.allocated_user + count * size;
            let meta_end = info.allocated_meta + count * METADATA_SIZE;
            let user_pages = user_end.next_multiple_of(page);
            let meta_pages = meta_end.next_multiple_of(page);
            if user_pages + meta_pages > region_size {
                return Err(AllocError::RegionExhausted {
                    class_id,
                    region_size,
                });
            }

            if user_end > info.mapped_user || meta_end > info.mapped_meta {
                let user_target = user_end
                    .next_multiple_of(USER_MAP_SIZE)
                    .min(region_size)
                    .max(info.mapped_user);
                let meta_target = meta_end
                    .next_multiple_of(META_MAP_SIZE)
                    .min(region_size)
                    .max(info.mapped_meta);
                let (mapped_user, mapped_meta) = (info.mapped_user, info.mapped_meta);
                MutexGuard::unlocked(info, || -> Result<(), AllocError> {
                    // SAFETY: both ranges lie inside this class's region of the
                    // reserved space. Where they overlap, live bytes are kept.
                    unsafe {
                        vm::commit(region_beg + mapped_user, user_target - mapped_user)?;
                        vm::commit(region_end - meta_target, meta_target - mapped_meta)?;
                    }
                    Ok(())
                })?;
                if user_target > info.mapped_user {
                    self.shadow.poison_range(
                        region_beg + info.mapped_user,
                        user_target - info.mapped_user,
                        ShadowMagic::HeapLeftRedzone.byte(),
                    )?;
                    info.mapped_user = user_target;
                }
                info.mapped_meta = info.mapped_meta.max(meta_target);
                continue;
            }

            let first = region_beg + info.allocated_user;
            info.free_list
                .extend((0..count).rev().map(|i| first + i * size));
            info.allocated_user = user_end;
            info.allocated_meta = meta_end;
            region.carved_user.store(user_end, Ordering::Release);
            return Ok(());
        }
    }
}
