//! Chunk metadata.
//!
//! Every chunk has one [`ChunkMeta`] record stored outside its user bytes:
//! at the end of its primary region, or in the header page of a large
//! mapping. Fields are atomics so diagnostics on any thread can read them
//! while the owner mutates them.

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicUsize, Ordering};

use serde::Serialize;

use crate::stack::StackTraceId;

/// Lifecycle of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ChunkState {
    /// Free in the allocator, or never handed out.
    Recycled = 0,
    Allocated = 1,
    Quarantined = 2,
}

impl ChunkState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Allocated,
            2 => Self::Quarantined,
            _ => Self::Recycled,
        }
    }
}

/// Allocation entry point a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum AllocApi {
    Malloc = 1,
    New = 2,
    NewArray = 3,
}

impl AllocApi {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            2 => Self::New,
            3 => Self::NewArray,
            _ => Self::Malloc,
        }
    }

    /// Name of the allocating function.
    #[must_use]
    pub const fn alloc_name(self) -> &'static str {
        match self {
            Self::Malloc => "malloc",
            Self::New => "operator new",
            Self::NewArray => "operator new []",
        }
    }

    /// Name of the matching deallocating function.
    #[must_use]
    pub const fn dealloc_name(self) -> &'static str {
        match self {
            Self::Malloc => "free",
            Self::New => "operator delete",
            Self::NewArray => "operator delete []",
        }
    }
}

impl fmt::Display for AllocApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.alloc_name())
    }
}

/// In-memory metadata record. Exactly [`METADATA_SIZE`] bytes.
#[derive(Debug)]
#[repr(C)]
pub struct ChunkMeta {
    state: AtomicU8,
    api: AtomicU8,
    alloc_stack: AtomicU32,
    free_stack: AtomicU32,
    alloc_tid: AtomicU32,
    free_tid: AtomicU32,
    user_beg: AtomicUsize,
    requested_size: AtomicUsize,
    actual_size: AtomicUsize,
}

/// Bytes reserved per chunk for its [`ChunkMeta`].
pub const METADATA_SIZE: usize = size_of::<ChunkMeta>();

const _: () = assert!(METADATA_SIZE == 48);

/// What the allocating thread records in a fresh chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocRecord {
    pub user_beg: usize,
    pub requested_size: usize,
    pub actual_size: usize,
    pub stack: StackTraceId,
    pub tid: u32,
    pub api: AllocApi,
}

impl ChunkMeta {
    #[must_use]
    pub fn state(&self) -> ChunkState {
        ChunkState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn api(&self) -> AllocApi {
        AllocApi::from_u8(self.api.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn user_beg(&self) -> usize {
        self.user_beg.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn requested_size(&self) -> usize {
        self.requested_size.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn actual_size(&self) -> usize {
        self.actual_size.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn alloc_stack(&self) -> StackTraceId {
        StackTraceId(self.alloc_stack.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn free_stack(&self) -> StackTraceId {
        StackTraceId(self.free_stack.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn alloc_tid(&self) -> u32 {
        self.alloc_tid.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn free_tid(&self) -> u32 {
        self.free_tid.load(Ordering::Relaxed)
    }

    /// Fills the record for a fresh allocation and publishes it as Allocated.
    pub fn record_allocation(&self, record: &AllocRecord) {
        self.user_beg.store(record.user_beg, Ordering::Relaxed);
        self.requested_size
            .store(record.requested_size, Ordering::Relaxed);
        self.actual_size.store(record.actual_size, Ordering::Relaxed);
        self.alloc_stack.store(record.stack.0, Ordering::Relaxed);
        self.alloc_tid.store(record.tid, Ordering::Relaxed);
        self.free_stack.store(StackTraceId::NONE.0, Ordering::Relaxed);
        self.free_tid.store(0, Ordering::Relaxed);
        self.api.store(record.api as u8, Ordering::Relaxed);
        self.state
            .store(ChunkState::Allocated as u8, Ordering::Release);
    }

    /// Allocated -> Quarantined. Exactly one of several racing callers wins;
    /// the others get the state they observed.
    pub fn try_quarantine(&self) -> Result<(), ChunkState> {
        self.state
            .compare_exchange(
                ChunkState::Allocated as u8,
                ChunkState::Quarantined as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(ChunkState::from_u8)
    }

    pub fn record_free(&self, stack: StackTraceId, tid: u32) {
        self.free_stack.store(stack.0, Ordering::Relaxed);
        self.free_tid.store(tid, Ordering::Relaxed);
    }

    pub fn mark_recycled(&self) {
        self.state
            .store(ChunkState::Recycled as u8, Ordering::Release);
    }

    /// Consistent-enough copy for reporting.
    #[must_use]
    pub fn snapshot(&self, block: usize, class: ChunkClass) -> Chunk {
        Chunk {
            block,
            user_beg: self.user_beg(),
            requested_size: self.requested_size(),
            actual_size: self.actual_size(),
            class,
            state: self.state(),
            api: self.api(),
            alloc_stack: self.alloc_stack(),
            alloc_tid: self.alloc_tid(),
            free_stack: self.free_stack(),
            free_tid: self.free_tid(),
        }
    }
}

/// Which allocator served a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkClass {
    /// Primary size class id.
    Class(usize),
    Large,
}

/// Read-only view of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Chunk {
    /// Start of the allocator block (left redzone included).
    pub block: usize,
    pub user_beg: usize,
    pub requested_size: usize,
    /// Bytes the allocator actually handed out for the block.
    pub actual_size: usize,
    pub class: ChunkClass,
    pub state: ChunkState,
    pub api: AllocApi,
    pub alloc_stack: StackTraceId,
    pub alloc_tid: u32,
    pub free_stack: StackTraceId,
    pub free_tid: u32,
}

impl Chunk {
    #[must_use]
    pub const fn user_end(&self) -> usize {
        self.user_beg + self.requested_size
    }

    #[must_use]
    pub const fn block_end(&self) -> usize {
        self.block + self.actual_size
    }
}
