//! Redzone placement around user chunks.
//!
//! Each user chunk is wrapped in poisoned left and right redzones inside one
//! allocator block:
//!
//! ```text
//! block                user               user + size          block + actual
//!   | left redzone (fa) | addressable bytes | right redzone (fb) ... slack |
//! ```
//!
//! On free the whole block is poisoned as freed (fd) and parked in the
//! quarantine; only recycling hands it back to the allocator.

#![allow(unsafe_code)]

use std::sync::Arc;

use crate::chunk::{AllocApi, AllocRecord, Chunk, ChunkClass, ChunkState};
use crate::combined::CombinedAllocator;
use crate::error::{AllocError, FreeError};
use crate::local_cache::AllocatorCache;
use crate::quarantine::QuarantineEntry;
use crate::shadow::{SHADOW_GRANULARITY, ShadowMagic, ShadowMemoryMap};
use crate::stack::StackTraceId;

/// Who is allocating or freeing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Origin {
    pub stack: StackTraceId,
    pub tid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedzoneOptions {
    /// Minimum redzone on each side, power of two in `32..=2048`.
    pub redzone: usize,
    pub max_malloc_fill_size: usize,
    pub malloc_fill_byte: u8,
    pub alloc_dealloc_mismatch: bool,
    pub halt_on_free_error: bool,
}

impl Default for RedzoneOptions {
    fn default() -> Self {
        Self {
            redzone: 128,
            max_malloc_fill_size: 0,
            malloc_fill_byte: 0xbe,
            alloc_dealloc_mismatch: true,
            halt_on_free_error: true,
        }
    }
}

/// A chunk that was just freed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreedChunk {
    pub entry: QuarantineEntry,
    pub requested_size: usize,
    /// A non-fatal problem detected on the way, e.g. a tolerated API mismatch.
    pub warning: Option<FreeError>,
}

#[derive(Debug)]
pub struct RedzoneManager {
    allocator: CombinedAllocator,
    options: RedzoneOptions,
}

impl RedzoneManager {
    #[must_use]
    pub const fn new(allocator: CombinedAllocator, options: RedzoneOptions) -> Self {
        Self { allocator, options }
    }

    #[must_use]
    pub const fn allocator(&self) -> &CombinedAllocator {
        &self.allocator
    }

    #[must_use]
    pub const fn options(&self) -> &RedzoneOptions {
        &self.options
    }

    fn shadow(&self) -> &Arc<ShadowMemoryMap> {
        self.allocator.shadow()
    }

    /// Allocates `user_size` addressable bytes aligned to `alignment`.
    pub fn allocate(
        &self,
        cache: &mut AllocatorCache,
        user_size: usize,
        alignment: usize,
        api: AllocApi,
        origin: Origin,
    ) -> Result<usize, AllocError> {
        if !alignment.is_power_of_two() {
            return Err(AllocError::InvalidAlignment { alignment });
        }
        let alignment = alignment.max(SHADOW_GRANULARITY);
        let redzone = self.options.redzone;
        let left = redzone.max(alignment);
        let padded = left
            .checked_add(user_size)
            .and_then(|size| size.checked_add(redzone))
            .ok_or(AllocError::Overflow {
                size: user_size,
                alignment,
            })?;

        let block = self.allocator.allocate(cache, padded, alignment)?;
        let unknown = AllocError::UnknownPointer { addr: block };
        let actual = self
            .allocator
            .actually_allocated_size(block)
            .ok_or_else(|| unknown.clone())?;
        let meta = self.allocator.chunk_meta(block).ok_or(unknown)?;
        let user = block + left;

        let shadow = self.shadow();
        shadow.poison_range(block, left, ShadowMagic::HeapLeftRedzone.byte())?;
        shadow.unpoison_range(user, user_size)?;
        let right = (user + user_size).next_multiple_of(SHADOW_GRANULARITY);
        shadow.poison_range(
            right,
            block + actual - right,
            ShadowMagic::HeapRightRedzone.byte(),
        )?;

        let fill = user_size.min(self.options.max_malloc_fill_size);
        if fill > 0 {
            // SAFETY: `[user, user + user_size)` lies inside the live block.
            unsafe { std::ptr::write_bytes(user as *mut u8, self.options.malloc_fill_byte, fill) };
        }

        meta.record_allocation(&AllocRecord {
            user_beg: user,
            requested_size: user_size,
            actual_size: actual,
            stack: origin.stack,
            tid: origin.tid,
            api,
        });
        Ok(user)
    }

    /// calloc: `count * size` zeroed bytes.
    pub fn allocate_zeroed(
        &self,
        cache: &mut AllocatorCache,
        count: usize,
        size: usize,
        origin: Origin,
    ) -> Result<usize, AllocError> {
        let total = count
            .checked_mul(size)
            .ok_or(AllocError::CallocOverflow { count, size })?;
        let user = self.allocate(cache, total, SHADOW_GRANULARITY, AllocApi::Malloc, origin)?;
        // SAFETY: `total` addressable bytes were just allocated at `user`.
        unsafe { std::ptr::write_bytes(user as *mut u8, 0, total) };
        Ok(user)
    }

    /// Moves the chunk at `p` to the quarantined state and poisons it.
    ///
    /// Null yields `Ok(None)`. The caller parks the returned entry in the
    /// quarantine.
    pub fn deallocate(
        &self,
        p: usize,
        api: AllocApi,
        origin: Origin,
    ) -> Result<Option<FreedChunk>, FreeError> {
        if p == 0 {
            return Ok(None);
        }
        let invalid = FreeError::InvalidFree {
            addr: p,
            tid: origin.tid,
        };
        let Some(block) = self.allocator.block_begin(p) else {
            return Err(invalid);
        };
        let Some(meta) = self.allocator.chunk_meta(block) else {
            return Err(invalid);
        };
        if meta.user_beg() != p {
            return Err(invalid);
        }
        let double_free = || FreeError::DoubleFree {
            addr: p,
            tid: origin.tid,
            requested_size: meta.requested_size(),
            alloc_stack: meta.alloc_stack(),
            alloc_tid: meta.alloc_tid(),
            free_stack: meta.free_stack(),
            free_tid: meta.free_tid(),
        };
        match meta.state() {
            ChunkState::Quarantined => return Err(double_free()),
            ChunkState::Recycled => return Err(invalid),
            ChunkState::Allocated => {}
        }

        let mut warning = None;
        if self.options.alloc_dealloc_mismatch && meta.api() != api {
            let mismatch = FreeError::AllocDeallocMismatch {
                addr: p,
                tid: origin.tid,
                alloc: meta.api(),
                dealloc: api,
                alloc_stack: meta.alloc_stack(),
            };
            if self.options.halt_on_free_error {
                return Err(mismatch);
            }
            warning = Some(mismatch);
        }

        match meta.try_quarantine() {
            Ok(()) => {}
            Err(ChunkState::Quarantined) => return Err(double_free()),
            Err(_) => return Err(invalid),
        }
        meta.record_free(origin.stack, origin.tid);

        let actual = meta.actual_size();
        self.shadow()
            .poison_range(block, actual, ShadowMagic::HeapFreed.byte())?;
        Ok(Some(FreedChunk {
            entry: QuarantineEntry {
                block,
                user: p,
                size: actual,
            },
            requested_size: meta.requested_size(),
            warning,
        }))
    }

    /// Hands a chunk evicted from the quarantine back to the allocator.
    pub fn recycle(
        &self,
        cache: &mut AllocatorCache,
        entry: &QuarantineEntry,
    ) -> Result<(), AllocError> {
        let meta = self
            .allocator
            .chunk_meta(entry.block)
            .ok_or(AllocError::UnknownPointer { addr: entry.block })?;
        meta.mark_recycled();
        self.allocator.deallocate(cache, entry.block)
    }

    /// Snapshot of the chunk whose block contains `p`, whatever its state.
    #[must_use]
    pub fn chunk(&self, p: usize) -> Option<Chunk> {
        let block = self.allocator.block_begin(p)?;
        let meta = self.allocator.chunk_meta(block)?;
        Some(meta.snapshot(block, self.allocator.chunk_class(block)))
    }

    /// Chunk an access at `addr` most plausibly belongs to.
    ///
    /// An address in a left redzone is attributed to the previous chunk when it
    /// lies closer to that chunk's end than to this chunk's start. Recycled
    /// chunks are never returned.
    #[must_use]
    pub fn find_chunk(&self, addr: usize) -> Option<Chunk> {
        let live = |chunk: &Chunk| chunk.state != ChunkState::Recycled;
        let current = self.chunk(addr).filter(live);
        if let Some(chunk) = current {
            if addr >= chunk.user_beg {
                return current;
            }
        }
        let block = self.allocator.block_begin(addr)?;
        let previous = match self.allocator.chunk_class(block) {
            ChunkClass::Class(_) => block
                .checked_sub(1)
                .and_then(|p| self.chunk(p))
                .filter(|prev| live(prev) && prev.block != block && addr >= prev.user_end()),
            ChunkClass::Large => None,
        };
        match (current, previous) {
            (Some(cur), Some(prev)) => {
                if addr - prev.user_end() < cur.user_beg - addr {
                    Some(prev)
                } else {
                    Some(cur)
                }
            }
            (cur, prev) => cur.or(prev),
        }
    }

    /// Requested size of the allocated chunk whose user pointer is `p`.
    #[must_use]
    pub fn usable_size(&self, p: usize) -> Option<usize> {
        self.chunk(p)
            .filter(|chunk| chunk.user_beg == p && chunk.state == ChunkState::Allocated)
            .map(|chunk| chunk.requested_size)
    }
}
