//! Shadow memory.
//!
//! Every 8-byte granule of the tracked application range has one shadow byte:
//!
//! - `0`: all 8 bytes addressable,
//! - `1..=7`: only that many leading bytes addressable,
//! - a [`ShadowMagic`] value: the whole granule is poisoned, and the value says why.
//!
//! The translation is `shadow = (addr >> 3) + offset`. The offset is fixed when
//! the map is created so the shadow array and the application range never overlap.

#![allow(unsafe_code)]

use serde::Serialize;
use thiserror::Error;

use crate::vm::{MapError, Mapping};

/// log2 of the number of application bytes per shadow byte.
pub const SHADOW_SCALE: u32 = 3;
/// Application bytes described by one shadow byte.
pub const SHADOW_GRANULARITY: usize = 1 << SHADOW_SCALE;

/// Rows in a report's shadow window.
pub const SHADOW_WINDOW_ROWS: usize = 9;
/// Shadow bytes per window row.
pub const SHADOW_WINDOW_ROW_BYTES: usize = 8;

/// Reserved shadow values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ShadowMagic {
    HeapLeftRedzone = 0xfa,
    HeapRightRedzone = 0xfb,
    HeapFreed = 0xfd,
    StackLeftRedzone = 0xf1,
    StackMidRedzone = 0xf2,
    StackRightRedzone = 0xf3,
    StackPartialRedzone = 0xf4,
    StackAfterReturn = 0xf5,
    UserPoisoned = 0xf7,
    GlobalRedzone = 0xf9,
    AllocatorInternal = 0xfe,
}

impl ShadowMagic {
    pub const ALL: [Self; 11] = [
        Self::HeapLeftRedzone,
        Self::HeapRightRedzone,
        Self::HeapFreed,
        Self::StackLeftRedzone,
        Self::StackMidRedzone,
        Self::StackRightRedzone,
        Self::StackPartialRedzone,
        Self::StackAfterReturn,
        Self::UserPoisoned,
        Self::GlobalRedzone,
        Self::AllocatorInternal,
    ];

    #[must_use]
    pub const fn byte(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|magic| magic.byte() == byte)
    }

    /// Legend text used in reports.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::HeapLeftRedzone => "Heap left redzone",
            Self::HeapRightRedzone => "Heap right redzone",
            Self::HeapFreed => "Freed heap region",
            Self::StackLeftRedzone => "Stack left redzone",
            Self::StackMidRedzone => "Stack mid redzone",
            Self::StackRightRedzone => "Stack right redzone",
            Self::StackPartialRedzone => "Stack partial redzone",
            Self::StackAfterReturn => "Stack after return",
            Self::UserPoisoned => "Poisoned by user",
            Self::GlobalRedzone => "Global redzone",
            Self::AllocatorInternal => "Allocator internal",
        }
    }
}

/// State of one application granule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct ShadowByte(pub u8);

impl ShadowByte {
    pub const ADDRESSABLE: Self = Self(0);

    /// A granule whose first `valid` bytes are addressable (`1..=7`).
    #[must_use]
    pub const fn partial(valid: usize) -> Self {
        debug_assert!(valid > 0 && valid < SHADOW_GRANULARITY);
        Self(valid as u8)
    }

    #[must_use]
    pub const fn is_addressable(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn is_partial(self) -> bool {
        matches!(self.0, 1..=7)
    }

    /// Number of leading addressable bytes in the granule.
    #[must_use]
    pub const fn addressable_bytes(self) -> usize {
        match self.0 {
            0 => SHADOW_GRANULARITY,
            1..=7 => self.0 as usize,
            _ => 0,
        }
    }

    #[must_use]
    pub fn magic(self) -> Option<ShadowMagic> {
        ShadowMagic::from_byte(self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShadowError {
    #[error("range {addr:#x}+{size:#x} is outside the tracked range [{beg:#x}, {end:#x})")]
    InvalidRange {
        addr: usize,
        size: usize,
        beg: usize,
        end: usize,
    },
    #[error("address {addr:#x} is not aligned to the 8-byte shadow granule")]
    Unaligned { addr: usize },
    #[error(transparent)]
    Map(#[from] MapError),
}

/// Raw shadow bytes around a faulting address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShadowWindow {
    /// Shadow address of `bytes[0]`.
    pub shadow_beg: usize,
    /// Application address described by `bytes[0]`.
    pub app_beg: usize,
    /// Index of the faulting address's shadow byte.
    pub focus: usize,
    pub bytes: Vec<u8>,
}

/// Shadow array covering one application range.
#[derive(Debug)]
pub struct ShadowMemoryMap {
    app_beg: usize,
    app_end: usize,
    offset: usize,
    _shadow: Mapping,
}

impl ShadowMemoryMap {
    /// Maps shadow for `[app_beg, app_beg + app_size)`. The range itself does
    /// not have to be mapped.
    pub fn new(app_beg: usize, app_size: usize) -> Result<Self, ShadowError> {
        if app_beg % SHADOW_GRANULARITY != 0 {
            return Err(ShadowError::Unaligned { addr: app_beg });
        }
        let app_end = app_beg
            .checked_add(app_size)
            .ok_or(ShadowError::InvalidRange {
                addr: app_beg,
                size: app_size,
                beg: 0,
                end: usize::MAX,
            })?;
        let shadow = Mapping::anonymous(app_size.div_ceil(SHADOW_GRANULARITY))?;
        let offset = shadow.beg().wrapping_sub(app_beg >> SHADOW_SCALE);
        Ok(Self {
            app_beg,
            app_end,
            offset,
            _shadow: shadow,
        })
    }

    #[must_use]
    pub const fn app_beg(&self) -> usize {
        self.app_beg
    }

    #[must_use]
    pub const fn app_end(&self) -> usize {
        self.app_end
    }

    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    #[must_use]
    pub const fn addr_to_shadow(&self, addr: usize) -> usize {
        (addr >> SHADOW_SCALE).wrapping_add(self.offset)
    }

    #[inline]
    #[must_use]
    pub const fn shadow_to_addr(&self, shadow: usize) -> usize {
        shadow.wrapping_sub(self.offset) << SHADOW_SCALE
    }

    #[inline]
    #[must_use]
    pub const fn addr_is_tracked(&self, addr: usize) -> bool {
        addr >= self.app_beg && addr < self.app_end
    }

    fn check_range(&self, addr: usize, size: usize) -> Result<(), ShadowError> {
        let inside = addr >= self.app_beg
            && addr
                .checked_add(size)
                .is_some_and(|end| end <= self.app_end);
        if inside {
            Ok(())
        } else {
            Err(ShadowError::InvalidRange {
                addr,
                size,
                beg: self.app_beg,
                end: self.app_end,
            })
        }
    }

    #[inline]
    fn read(&self, addr: usize) -> ShadowByte {
        // SAFETY: callers checked that `addr` is tracked, so its shadow byte
        // lies inside `self._shadow`.
        ShadowByte(unsafe { *(self.addr_to_shadow(addr) as *const u8) })
    }

    #[inline]
    fn write(&self, addr: usize, value: u8) {
        // SAFETY: as in `read`.
        unsafe { *(self.addr_to_shadow(addr) as *mut u8) = value };
    }

    fn fill(&self, addr: usize, granules: usize, value: u8) {
        if granules == 0 {
            return;
        }
        // SAFETY: callers checked `[addr, addr + granules * 8)`, whose shadow
        // bytes are contiguous inside `self._shadow`.
        unsafe {
            std::ptr::write_bytes(self.addr_to_shadow(addr) as *mut u8, value, granules);
        }
    }

    /// Writes `value` to the shadow of `[addr, addr + size)`.
    ///
    /// A trailing partial granule gets `size % 8` when unpoisoning (`value == 0`)
    /// and `value` otherwise. `addr` must be granule-aligned.
    pub fn poison_range(&self, addr: usize, size: usize, value: u8) -> Result<(), ShadowError> {
        if size == 0 {
            return Ok(());
        }
        self.check_range(addr, size)?;
        if addr % SHADOW_GRANULARITY != 0 {
            return Err(ShadowError::Unaligned { addr });
        }
        let full = size / SHADOW_GRANULARITY;
        self.fill(addr, full, value);
        let tail = size % SHADOW_GRANULARITY;
        if tail != 0 {
            let last = addr + full * SHADOW_GRANULARITY;
            self.write(last, if value == 0 { tail as u8 } else { value });
        }
        Ok(())
    }

    /// Marks `[addr, addr + size)` addressable. Inverse of [`Self::poison_range`].
    pub fn unpoison_range(&self, addr: usize, size: usize) -> Result<(), ShadowError> {
        self.poison_range(addr, size, 0)
    }

    pub fn shadow_byte(&self, addr: usize) -> Result<ShadowByte, ShadowError> {
        self.check_range(addr, 1)?;
        Ok(self.read(addr))
    }

    /// Would a 1-byte access at `addr` be reported?
    pub fn is_poisoned(&self, addr: usize) -> Result<bool, ShadowError> {
        self.access_is_poisoned(addr, 1)
    }

    /// Would an access of `size` bytes at `addr` touch a poisoned byte?
    pub fn access_is_poisoned(&self, addr: usize, size: usize) -> Result<bool, ShadowError> {
        Ok(self.first_bad_granule(addr, size)?.is_some())
    }

    /// First granule of `[addr, addr + size)` holding a poisoned byte that the
    /// access touches.
    pub fn first_bad_granule(&self, addr: usize, size: usize) -> Result<Option<usize>, ShadowError> {
        if size == 0 {
            return Ok(None);
        }
        self.check_range(addr, size)?;
        let end = addr + size;
        let mut granule = addr & !(SHADOW_GRANULARITY - 1);
        while granule < end {
            let last_touched = end.min(granule + SHADOW_GRANULARITY) - 1 - granule;
            if last_touched >= self.read(granule).addressable_bytes() {
                return Ok(Some(granule));
            }
            granule += SHADOW_GRANULARITY;
        }
        Ok(None)
    }

    /// Poisons a user-supplied, possibly unaligned range.
    ///
    /// Only bytes the encoding can express are poisoned: a head granule keeps
    /// its bytes below `addr`, and a tail granule is poisoned only when all of
    /// its addressable bytes fall inside the range.
    pub fn poison_user_region(&self, addr: usize, size: usize) -> Result<(), ShadowError> {
        if size == 0 {
            return Ok(());
        }
        self.check_range(addr, size)?;
        let magic = ShadowMagic::UserPoisoned.byte();
        let end = addr + size;
        let beg_granule = addr & !(SHADOW_GRANULARITY - 1);
        let beg_offset = addr - beg_granule;
        let end_granule = end & !(SHADOW_GRANULARITY - 1);
        let end_offset = end - end_granule;

        if beg_granule == end_granule {
            let current = self.read(beg_granule);
            if current.0 < SHADOW_GRANULARITY as u8 && end_offset >= current.addressable_bytes() {
                let keep = beg_offset.min(current.addressable_bytes());
                self.write(beg_granule, if keep == 0 { magic } else { keep as u8 });
            }
            return Ok(());
        }

        let mut cursor = beg_granule;
        if beg_offset > 0 {
            let current = self.read(beg_granule);
            if current.0 < SHADOW_GRANULARITY as u8 && beg_offset < current.addressable_bytes() {
                self.write(beg_granule, beg_offset as u8);
            }
            cursor += SHADOW_GRANULARITY;
        }
        self.fill(cursor, (end_granule - cursor) / SHADOW_GRANULARITY, magic);
        if end_offset > 0 {
            let current = self.read(end_granule);
            if current.0 < SHADOW_GRANULARITY as u8 && current.addressable_bytes() <= end_offset {
                self.write(end_granule, magic);
            }
        }
        Ok(())
    }

    /// Unpoisons a user-supplied range. May unpoison a superregion: the start
    /// is rounded down to its granule and a tail granule is only ever widened.
    pub fn unpoison_user_region(&self, addr: usize, size: usize) -> Result<(), ShadowError> {
        if size == 0 {
            return Ok(());
        }
        self.check_range(addr, size)?;
        let end = addr + size;
        let beg_granule = addr & !(SHADOW_GRANULARITY - 1);
        let end_granule = end & !(SHADOW_GRANULARITY - 1);
        self.fill(beg_granule, (end_granule - beg_granule) / SHADOW_GRANULARITY, 0);
        let end_offset = end - end_granule;
        if end_offset > 0 {
            let current = self.read(end_granule);
            let valid = if current.0 < SHADOW_GRANULARITY as u8 {
                current.addressable_bytes().max(end_offset)
            } else {
                end_offset
            };
            self.write(
                end_granule,
                if valid == SHADOW_GRANULARITY { 0 } else { valid as u8 },
            );
        }
        Ok(())
    }

    /// Raw shadow bytes in rows around `addr`, clamped to the shadow array.
    #[must_use]
    pub fn shadow_window(&self, addr: usize) -> Option<ShadowWindow> {
        if !self.addr_is_tracked(addr) {
            return None;
        }
        let focus = self.addr_to_shadow(addr);
        let first_row = (focus & !(SHADOW_WINDOW_ROW_BYTES - 1))
            .saturating_sub((SHADOW_WINDOW_ROWS / 2) * SHADOW_WINDOW_ROW_BYTES);
        let beg = first_row.max(self.addr_to_shadow(self.app_beg));
        let end = (first_row + SHADOW_WINDOW_ROWS * SHADOW_WINDOW_ROW_BYTES)
            .min(self.addr_to_shadow(self.app_end - 1) + 1);
        // SAFETY: `[beg, end)` is clamped to the shadow of the tracked range.
        let bytes = unsafe { std::slice::from_raw_parts(beg as *const u8, end - beg) }.to_vec();
        Some(ShadowWindow {
            shadow_beg: beg,
            app_beg: self.shadow_to_addr(beg),
            focus: focus - beg,
            bytes,
        })
    }
}
