//! Virtual memory primitives.
//!
//! The heap space is reserved once as an inaccessible, uncommitted range and
//! committed piecewise as the allocators grow. The shadow array is a separate
//! read-write mapping whose pages the kernel materializes on first touch.

#![allow(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;

/// A failed memory-mapping system call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{op} of {size:#x} bytes at {addr:#x} failed (errno {errno})")]
pub struct MapError {
    pub op: &'static str,
    pub addr: usize,
    pub size: usize,
    pub errno: i32,
}

impl MapError {
    fn last(op: &'static str, addr: usize, size: usize) -> Self {
        Self {
            op,
            addr,
            size,
            errno: std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::EINVAL),
        }
    }
}

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// System page size, queried once.
#[must_use]
pub fn page_size() -> usize {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    // SAFETY: sysconf has no memory-safety preconditions.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let page = usize::try_from(raw)
        .ok()
        .filter(|p| p.is_power_of_two())
        .unwrap_or(4096);
    PAGE_SIZE.store(page, Ordering::Relaxed);
    page
}

/// An owned anonymous mapping, unmapped on drop.
#[derive(Debug)]
pub struct Mapping {
    beg: usize,
    size: usize,
}

impl Mapping {
    /// Reserves `size` bytes of inaccessible address space aligned to `align`.
    ///
    /// Nothing is committed: every page must go through [`commit`] before use.
    pub fn reserve(size: usize, align: usize) -> Result<Self, MapError> {
        let page = page_size();
        let align = align.max(page);
        let overflow = || MapError {
            op: "mmap",
            addr: 0,
            size,
            errno: libc::ENOMEM,
        };
        let size = size.checked_next_multiple_of(page).ok_or_else(overflow)?;
        let total = size.checked_add(align).ok_or_else(overflow)?;

        let raw = map_anonymous(total, libc::PROT_NONE)?;
        let beg = raw.next_multiple_of(align);
        if beg > raw {
            unmap(raw, beg - raw)?;
        }
        let tail = raw + total - (beg + size);
        if tail > 0 {
            unmap(beg + size, tail)?;
        }
        Ok(Self { beg, size })
    }

    /// Maps `size` bytes of zero-filled read-write memory without reserving swap.
    pub fn anonymous(size: usize) -> Result<Self, MapError> {
        let size = size.max(1).next_multiple_of(page_size());
        let beg = map_anonymous(size, libc::PROT_READ | libc::PROT_WRITE)?;
        Ok(Self { beg, size })
    }

    #[must_use]
    pub const fn beg(&self) -> usize {
        self.beg
    }

    #[must_use]
    pub const fn end(&self) -> usize {
        self.beg + self.size
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.beg && addr < self.beg + self.size
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        let _ = unmap(self.beg, self.size);
    }
}

/// Makes `[addr, addr + size)` readable and writable.
///
/// Committing an already committed range leaves its contents untouched.
///
/// # Safety
///
/// The range must lie inside a [`Mapping`] owned by the caller.
pub unsafe fn commit(addr: usize, size: usize) -> Result<(), MapError> {
    if size == 0 {
        return Ok(());
    }
    // SAFETY: the caller guarantees the range belongs to one of our mappings.
    let rc = unsafe {
        libc::mprotect(
            addr as *mut libc::c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
        )
    };
    if rc != 0 {
        return Err(MapError::last("mprotect", addr, size));
    }
    Ok(())
}

/// Returns the pages of `[addr, addr + size)` to the OS and makes them
/// inaccessible again. The address range stays reserved.
///
/// # Safety
///
/// The range must lie inside a [`Mapping`] owned by the caller and must hold
/// no live Rust objects.
pub unsafe fn release(addr: usize, size: usize) -> Result<(), MapError> {
    if size == 0 {
        return Ok(());
    }
    // SAFETY: the caller guarantees exclusive ownership of the range.
    let rc = unsafe { libc::madvise(addr as *mut libc::c_void, size, libc::MADV_DONTNEED) };
    if rc != 0 {
        return Err(MapError::last("madvise", addr, size));
    }
    // SAFETY: as above.
    let rc = unsafe { libc::mprotect(addr as *mut libc::c_void, size, libc::PROT_NONE) };
    if rc != 0 {
        return Err(MapError::last("mprotect", addr, size));
    }
    Ok(())
}

fn map_anonymous(size: usize, prot: libc::c_int) -> Result<usize, MapError> {
    // SAFETY: anonymous private mapping at a kernel-chosen address.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            prot,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(MapError::last("mmap", 0, size));
    }
    Ok(ptr as usize)
}

fn unmap(addr: usize, size: usize) -> Result<(), MapError> {
    // SAFETY: callers only unmap ranges they mapped and no longer reference.
    let rc = unsafe { libc::munmap(addr as *mut libc::c_void, size) };
    if rc != 0 {
        return Err(MapError::last("munmap", addr, size));
    }
    Ok(())
}
