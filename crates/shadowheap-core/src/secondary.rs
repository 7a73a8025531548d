//! Large-object allocator.
//!
//! Every large chunk gets its own page-granular mapping carved from a
//! dedicated sub-range of the heap space. The page right below the user
//! pointer holds a header and the chunk's metadata record; live
//! headers are chained into one intrusive list.

#![allow(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::chunk::ChunkMeta;
use crate::error::AllocError;
use crate::shadow::{ShadowMagic, ShadowMemoryMap};
use crate::vm;

/// Offset of the chunk metadata record inside the header page.
pub const LARGE_META_OFFSET: usize = 64;

#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct LargeHeader {
    map_beg: usize,
    map_size: usize,
    size: usize,
    prev: usize,
    next: usize,
}

const _: () = assert!(size_of::<LargeHeader>() <= LARGE_META_OFFSET);

/// First-fit allocator of address spans with a bump pointer for fresh space.
#[derive(Debug)]
struct SpanAllocator {
    free: BTreeMap<usize, usize>,
    bump: usize,
    end: usize,
}

impl SpanAllocator {
    fn new(beg: usize, end: usize) -> Self {
        Self {
            free: BTreeMap::new(),
            bump: beg,
            end,
        }
    }

    fn alloc(&mut self, size: usize) -> Option<usize> {
        let fit = self
            .free
            .iter()
            .find(|&(_, &len)| len >= size)
            .map(|(&beg, &len)| (beg, len));
        if let Some((beg, len)) = fit {
            self.free.remove(&beg);
            if len > size {
                self.free.insert(beg + size, len - size);
            }
            return Some(beg);
        }
        if self.end - self.bump < size {
            return None;
        }
        let beg = self.bump;
        self.bump += size;
        Some(beg)
    }

    fn free(&mut self, mut beg: usize, mut len: usize) {
        let prev = self
            .free
            .range(..beg)
            .next_back()
            .map(|(&b, &l)| (b, l));
        if let Some((prev_beg, prev_len)) = prev {
            if prev_beg + prev_len == beg {
                self.free.remove(&prev_beg);
                beg = prev_beg;
                len += prev_len;
            }
        }
        if let Some(next_len) = self.free.remove(&(beg + len)) {
            len += next_len;
        }
        if beg + len == self.bump {
            self.bump = beg;
        } else {
            self.free.insert(beg, len);
        }
    }
}

#[derive(Debug, Default)]
struct LargeList {
    /// Address of the most recently allocated header, 0 when empty.
    head: usize,
    count: usize,
    total_mapped: usize,
}

/// Summary of one live large chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LargeBlock {
    pub user: usize,
    pub size: usize,
    pub map_beg: usize,
    pub map_size: usize,
}

#[derive(Debug)]
pub struct LargeMmapAllocator {
    beg: usize,
    end: usize,
    spans: Mutex<SpanAllocator>,
    list: Mutex<LargeList>,
    shadow: Arc<ShadowMemoryMap>,
}

impl LargeMmapAllocator {
    /// # Safety
    ///
    /// `[beg, beg + size)` must be page-aligned reserved address space owned by
    /// the caller, covered by `shadow`, and must outlive the allocator.
    pub unsafe fn new(beg: usize, size: usize, shadow: Arc<ShadowMemoryMap>) -> Self {
        Self {
            beg,
            end: beg + size,
            spans: Mutex::new(SpanAllocator::new(beg, beg + size)),
            list: Mutex::new(LargeList::default()),
            shadow,
        }
    }

    #[must_use]
    pub const fn space_beg(&self) -> usize {
        self.beg
    }

    #[must_use]
    pub const fn space_end(&self) -> usize {
        self.end
    }

    /// Maps a chunk of at least `size` bytes aligned to `alignment`. The result
    /// is always page-aligned.
    pub fn allocate(&self, size: usize, alignment: usize) -> Result<usize, AllocError> {
        let page = vm::page_size();
        let overflow = AllocError::Overflow { size, alignment };
        let mut map_size = size
            .checked_next_multiple_of(page)
            .and_then(|rounded| rounded.checked_add(page))
            .ok_or_else(|| overflow.clone())?;
        if alignment > page {
            map_size = map_size.checked_add(alignment).ok_or(overflow)?;
        }

        let map_beg = self
            .spans
            .lock()
            .alloc(map_size)
            .ok_or(AllocError::SecondaryExhausted { size })?;
        // SAFETY: the span was just carved from our reserved range.
        if let Err(err) = unsafe { vm::commit(map_beg, map_size) } {
            self.spans.lock().free(map_beg, map_size);
            return Err(err.into());
        }
        self.shadow
            .poison_range(map_beg, map_size, ShadowMagic::HeapLeftRedzone.byte())?;

        let user = (map_beg + page).next_multiple_of(alignment.max(page));
        let header = user - page;
        let mut list = self.list.lock();
        // SAFETY: the header page is committed and owned by this chunk; list
        // links are only written under the list lock.
        unsafe {
            (header as *mut LargeHeader).write(LargeHeader {
                map_beg,
                map_size,
                size,
                prev: 0,
                next: list.head,
            });
            if list.head != 0 {
                (*(list.head as *mut LargeHeader)).prev = header;
            }
        }
        list.head = header;
        list.count += 1;
        list.total_mapped += map_size;
        Ok(user)
    }

    /// Unmaps the chunk whose user pointer is `p`.
    pub fn deallocate(&self, p: usize) -> Result<(), AllocError> {
        let unknown = AllocError::UnknownPointer { addr: p };
        let page = vm::page_size();
        if p % page != 0 || p < self.beg + page || p >= self.end {
            return Err(unknown);
        }
        let header = p - page;
        let (map_beg, map_size) = {
            let mut list = self.list.lock();
            if !Self::is_linked(&list, header) {
                return Err(unknown);
            }
            // SAFETY: `header` and its neighbours are live headers, and their
            // links are only touched under the list lock.
            let h = unsafe { *(header as *const LargeHeader) };
            // SAFETY: as above.
            unsafe {
                if h.prev != 0 {
                    (*(h.prev as *mut LargeHeader)).next = h.next;
                } else {
                    list.head = h.next;
                }
                if h.next != 0 {
                    (*(h.next as *mut LargeHeader)).prev = h.prev;
                }
            }
            list.count -= 1;
            list.total_mapped -= h.map_size;
            (h.map_beg, h.map_size)
        };
        // SAFETY: the chunk is unlinked, so nothing else references its pages.
        unsafe { vm::release(map_beg, map_size) }?;
        self.spans.lock().free(map_beg, map_size);
        Ok(())
    }

    fn is_linked(list: &LargeList, header: usize) -> bool {
        let mut cursor = list.head;
        while cursor != 0 {
            if cursor == header {
                return true;
            }
            // SAFETY: every linked header is committed while the lock is held.
            cursor = unsafe { (*(cursor as *const LargeHeader)).next };
        }
        false
    }

    /// Is `p` the user pointer of a live large chunk?
    #[must_use]
    pub fn pointer_is_mine(&self, p: usize) -> bool {
        let page = vm::page_size();
        if p % page != 0 || p < self.beg + page || p >= self.end {
            return false;
        }
        Self::is_linked(&self.list.lock(), p - page)
    }

    /// Live chunk whose mapping covers `p`, header page included.
    #[must_use]
    pub fn find_block(&self, p: usize) -> Option<LargeBlock> {
        if p < self.beg || p >= self.end {
            return None;
        }
        let page = vm::page_size();
        let list = self.list.lock();
        let mut cursor = list.head;
        while cursor != 0 {
            // SAFETY: linked headers stay committed while the lock is held.
            let h = unsafe { *(cursor as *const LargeHeader) };
            let user = cursor + page;
            let user_end = user + h.size.next_multiple_of(page);
            if p >= h.map_beg && p < user_end {
                return Some(LargeBlock {
                    user,
                    size: h.size,
                    map_beg: h.map_beg,
                    map_size: h.map_size,
                });
            }
            cursor = h.next;
        }
        None
    }

    #[must_use]
    pub fn block_begin(&self, p: usize) -> Option<usize> {
        self.find_block(p).map(|block| block.user)
    }

    /// Metadata record of the live chunk whose user pointer is `block`.
    ///
    /// The record lives in the chunk's header page and stays readable until the
    /// chunk is deallocated.
    #[must_use]
    pub fn metadata(&self, block: usize) -> Option<&ChunkMeta> {
        if !self.pointer_is_mine(block) {
            return None;
        }
        let addr = block - vm::page_size() + LARGE_META_OFFSET;
        // SAFETY: the header page of a live chunk is committed; it was zeroed
        // by the kernel when mapped and zero bytes are a valid `ChunkMeta`.
        Some(unsafe { &*(addr as *const ChunkMeta) })
    }

    #[must_use]
    pub fn metadata_addr(&self, block: usize) -> usize {
        block - vm::page_size() + LARGE_META_OFFSET
    }

    /// Usable bytes of the chunk starting at `block`.
    #[must_use]
    pub fn actually_allocated_size(&self, block: usize) -> Option<usize> {
        self.find_block(block)
            .filter(|found| found.user == block)
            .map(|found| found.size.next_multiple_of(vm::page_size()))
    }

    #[must_use]
    pub fn total_memory_used(&self) -> usize {
        self.list.lock().total_mapped
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.list.lock().count
    }
}
