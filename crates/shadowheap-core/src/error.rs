//! Error types shared across the allocator stack.

use thiserror::Error;

use crate::chunk::AllocApi;
use crate::config::ConfigError;
use crate::fake_stack::FakeStackError;
use crate::shadow::ShadowError;
use crate::size_class::SizeClassError;
use crate::stack::StackTraceId;
use crate::vm::MapError;

/// Allocation failures. All of them are fatal at the ABI boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("size class {class_id} region exhausted ({region_size:#x} bytes)")]
    RegionExhausted { class_id: usize, region_size: usize },
    #[error("large allocation of {size:#x} bytes exhausts the secondary space")]
    SecondaryExhausted { size: usize },
    #[error("requested size {size:#x} with alignment {alignment:#x} overflows")]
    Overflow { size: usize, alignment: usize },
    #[error("alignment {alignment:#x} is not a power of two")]
    InvalidAlignment { alignment: usize },
    #[error("calloc parameters overflow: count ({count:#x}) * size ({size:#x})")]
    CallocOverflow { count: usize, size: usize },
    #[error("no size class serves {size:#x} bytes")]
    NoSizeClass { size: usize },
    #[error("pointer {addr:#x} was not allocated by this heap")]
    UnknownPointer { addr: usize },
    #[error(transparent)]
    Map(#[from] MapError),
    #[error(transparent)]
    Shadow(#[from] ShadowError),
}

/// Invalid deallocation requests.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FreeError {
    #[error("attempting double-free on {addr:#x} in thread T{tid}")]
    DoubleFree {
        addr: usize,
        tid: u32,
        requested_size: usize,
        alloc_stack: StackTraceId,
        alloc_tid: u32,
        free_stack: StackTraceId,
        free_tid: u32,
    },
    #[error("alloc-dealloc-mismatch ({alloc} vs {dealloc}) on {addr:#x}")]
    AllocDeallocMismatch {
        addr: usize,
        tid: u32,
        alloc: AllocApi,
        dealloc: AllocApi,
        alloc_stack: StackTraceId,
    },
    #[error("attempting free on address which was not malloc()-ed: {addr:#x} in thread T{tid}")]
    InvalidFree { addr: usize, tid: u32 },
    #[error(transparent)]
    Shadow(#[from] ShadowError),
}

impl FreeError {
    /// Bug category name used in reports and log events.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::DoubleFree { .. } => "double-free",
            Self::AllocDeallocMismatch { .. } => "alloc-dealloc-mismatch",
            Self::InvalidFree { .. } => "bad-free",
            Self::Shadow(_) => "shadow-error",
        }
    }

    #[must_use]
    pub const fn addr(&self) -> Option<usize> {
        match self {
            Self::DoubleFree { addr, .. }
            | Self::AllocDeallocMismatch { addr, .. }
            | Self::InvalidFree { addr, .. } => Some(*addr),
            Self::Shadow(_) => None,
        }
    }
}

/// Crate-level error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Map(#[from] MapError),
    #[error(transparent)]
    Shadow(#[from] ShadowError),
    #[error(transparent)]
    SizeClass(#[from] SizeClassError),
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error(transparent)]
    Free(#[from] FreeError),
    #[error(transparent)]
    FakeStack(#[from] FakeStackError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
