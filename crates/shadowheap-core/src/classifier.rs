//! Turning a bad access into a bug report.
//!
//! The classifier only reads state: the shadow byte under the access decides
//! the bug kind, and the allocator and fake stacks describe where the address
//! sits.

use std::fmt::{self, Write as _};
use std::sync::Arc;

use serde::Serialize;

use crate::chunk::{Chunk, ChunkState};
use crate::fake_stack::{FakeFrame, FakeStack};
use crate::redzone::RedzoneManager;
use crate::shadow::{
    SHADOW_GRANULARITY, SHADOW_WINDOW_ROW_BYTES, ShadowByte, ShadowMagic, ShadowMemoryMap,
    ShadowWindow,
};
use crate::stack::StackTraceId;

/// Bug categories, named as they appear in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BugKind {
    HeapBufferOverflow,
    HeapUseAfterFree,
    StackBufferUnderflow,
    StackBufferOverflow,
    StackUseAfterReturn,
    UseAfterPoison,
    GlobalBufferOverflow,
    UnknownCrash,
}

impl BugKind {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::HeapBufferOverflow => "heap-buffer-overflow",
            Self::HeapUseAfterFree => "heap-use-after-free",
            Self::StackBufferUnderflow => "stack-buffer-underflow",
            Self::StackBufferOverflow => "stack-buffer-overflow",
            Self::StackUseAfterReturn => "stack-use-after-return",
            Self::UseAfterPoison => "use-after-poison",
            Self::GlobalBufferOverflow => "global-buffer-overflow",
            Self::UnknownCrash => "unknown-crash",
        }
    }

    #[must_use]
    pub const fn from_shadow(byte: ShadowByte) -> Self {
        match byte.0 {
            0xfa | 0xfb => Self::HeapBufferOverflow,
            0xfd => Self::HeapUseAfterFree,
            0xf1 => Self::StackBufferUnderflow,
            0xf2..=0xf4 => Self::StackBufferOverflow,
            0xf5 => Self::StackUseAfterReturn,
            0xf7 => Self::UseAfterPoison,
            0xf9 => Self::GlobalBufferOverflow,
            _ => Self::UnknownCrash,
        }
    }
}

impl fmt::Display for BugKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Picks the shadow byte that explains an access of `size` bytes at `addr`.
///
/// A fully addressable first granule defers to the next one when the access
/// crosses into it, and a partial granule defers to the next one as well.
#[must_use]
pub fn explaining_shadow_byte(shadow: &ShadowMemoryMap, addr: usize, size: usize) -> Option<ShadowByte> {
    let mut granule = addr & !(SHADOW_GRANULARITY - 1);
    let mut byte = shadow.shadow_byte(granule).ok()?;
    let straddles = addr - granule + size > SHADOW_GRANULARITY;
    if byte.is_addressable() && straddles {
        granule += SHADOW_GRANULARITY;
        byte = shadow.shadow_byte(granule).unwrap_or(byte);
    }
    if byte.is_partial() {
        granule += SHADOW_GRANULARITY;
        byte = shadow.shadow_byte(granule).unwrap_or(byte);
    }
    Some(byte)
}

#[must_use]
pub fn classify_shadow(shadow: &ShadowMemoryMap, addr: usize, size: usize) -> BugKind {
    explaining_shadow_byte(shadow, addr, size).map_or(BugKind::UnknownCrash, BugKind::from_shadow)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AccessInfo {
    pub addr: usize,
    pub size: usize,
    pub is_write: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    Left,
    Inside,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HeapLocation {
    pub chunk: Chunk,
    /// `addr - user_beg`.
    pub offset: isize,
    pub relation: Relation,
    /// Bytes to the region edge named by `relation`.
    pub distance: usize,
}

impl HeapLocation {
    #[must_use]
    pub fn new(chunk: Chunk, addr: usize) -> Self {
        let (relation, distance) = if addr < chunk.user_beg {
            (Relation::Left, chunk.user_beg - addr)
        } else if addr >= chunk.user_end() {
            (Relation::Right, addr - chunk.user_end())
        } else {
            (Relation::Inside, addr - chunk.user_beg)
        };
        Self {
            chunk,
            offset: addr.wrapping_sub(chunk.user_beg) as isize,
            relation,
            distance,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameLocation {
    pub frame: FakeFrame,
    /// `addr - frame.addr`.
    pub offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AddressDescription {
    Heap(HeapLocation),
    FakeFrame(FrameLocation),
}

/// One structured bug report. Built once, then only rendered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BugReport {
    pub kind: BugKind,
    pub access: AccessInfo,
    pub thread_id: u32,
    pub access_stack: StackTraceId,
    pub shadow_byte: u8,
    pub description: Option<AddressDescription>,
    pub shadow_window: Option<ShadowWindow>,
}

pub struct ErrorClassifier<'a> {
    pub shadow: &'a ShadowMemoryMap,
    pub redzones: &'a RedzoneManager,
    pub fake_stacks: &'a [Arc<FakeStack>],
}

impl ErrorClassifier<'_> {
    /// Where `addr` lives: a fake frame, or the nearest non-recycled chunk.
    #[must_use]
    pub fn describe(&self, addr: usize) -> Option<AddressDescription> {
        if let Some(frame) = self
            .fake_stacks
            .iter()
            .find_map(|fake| fake.addr_is_in_fake_stack(addr))
        {
            return Some(AddressDescription::FakeFrame(FrameLocation {
                frame,
                offset: addr - frame.addr,
            }));
        }
        self.redzones
            .find_chunk(addr)
            .map(|chunk| AddressDescription::Heap(HeapLocation::new(chunk, addr)))
    }

    #[must_use]
    pub fn classify(&self, access: AccessInfo, thread_id: u32, access_stack: StackTraceId) -> BugReport {
        let byte = explaining_shadow_byte(self.shadow, access.addr, access.size);
        BugReport {
            kind: byte.map_or(BugKind::UnknownCrash, BugKind::from_shadow),
            access,
            thread_id,
            access_stack,
            shadow_byte: byte.map_or(0, |b| b.0),
            description: self.describe(access.addr),
            shadow_window: self.shadow.shadow_window(access.addr),
        }
    }
}

impl BugReport {
    /// Human-readable report.
    #[must_use]
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = self.write_text(&mut out);
        out
    }

    fn write_text(&self, out: &mut String) -> fmt::Result {
        let access = &self.access;
        writeln!(out, "=================================================================")?;
        writeln!(
            out,
            "ERROR: ShadowHeap: {} on address {:#x}",
            self.kind, access.addr
        )?;
        writeln!(
            out,
            "{} of size {} at {:#x} thread T{}",
            if access.is_write { "WRITE" } else { "READ" },
            access.size,
            access.addr,
            self.thread_id
        )?;
        writeln!(out, "    {}", self.access_stack)?;
        writeln!(out)?;

        match &self.description {
            Some(AddressDescription::Heap(location)) => write_heap_location(out, access.addr, location)?,
            Some(AddressDescription::FakeFrame(location)) => {
                let frame = &location.frame;
                writeln!(
                    out,
                    "Address {:#x} is located at offset {} in fake stack frame {:#x} \
                     (class {}, slot {}, owner real stack {:#x})",
                    access.addr, location.offset, frame.addr, frame.class_id, frame.slot, frame.real_stack
                )?;
            }
            None => writeln!(out, "Address {:#x} is not described by any known chunk", access.addr)?,
        }

        if let Some(window) = &self.shadow_window {
            writeln!(out)?;
            write_shadow_window(out, window)?;
            write_legend(out)?;
        }
        writeln!(out, "SUMMARY: ShadowHeap: {}", self.kind)
    }
}

impl fmt::Display for BugReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render_text())
    }
}

fn write_heap_location(out: &mut String, addr: usize, location: &HeapLocation) -> fmt::Result {
    let chunk = &location.chunk;
    let side = match location.relation {
        Relation::Left => "to the left of",
        Relation::Inside => "inside of",
        Relation::Right => "to the right of",
    };
    writeln!(
        out,
        "{:#x} is located {} bytes {} {}-byte region [{:#x},{:#x})",
        addr,
        location.distance,
        side,
        chunk.requested_size,
        chunk.user_beg,
        chunk.user_end()
    )?;
    if chunk.state == ChunkState::Quarantined {
        writeln!(out, "freed by thread T{} here:", chunk.free_tid)?;
        writeln!(out, "    {}", chunk.free_stack)?;
        writeln!(out)?;
        writeln!(out, "previously allocated by thread T{} here:", chunk.alloc_tid)?;
    } else {
        writeln!(out, "allocated by thread T{} here:", chunk.alloc_tid)?;
    }
    writeln!(out, "    {}", chunk.alloc_stack)
}

fn write_shadow_window(out: &mut String, window: &ShadowWindow) -> fmt::Result {
    writeln!(out, "Shadow bytes around the buggy address:")?;
    for (row, bytes) in window.bytes.chunks(SHADOW_WINDOW_ROW_BYTES).enumerate() {
        let row_beg = row * SHADOW_WINDOW_ROW_BYTES;
        let focused = (row_beg..row_beg + bytes.len()).contains(&window.focus);
        write!(
            out,
            "{}{:#x}:",
            if focused { "=>" } else { "  " },
            window.shadow_beg + row_beg
        )?;
        for (i, byte) in bytes.iter().enumerate() {
            if row_beg + i == window.focus {
                write!(out, "[{byte:02x}]")?;
            } else if row_beg + i == window.focus + 1 {
                write!(out, "{byte:02x}")?;
            } else {
                write!(out, " {byte:02x}")?;
            }
        }
        writeln!(out)?;
    }
    Ok(())
}

fn write_legend(out: &mut String) -> fmt::Result {
    writeln!(out, "Shadow byte legend (one shadow byte represents 8 application bytes):")?;
    writeln!(out, "  Addressable:           00")?;
    writeln!(out, "  Partially addressable: 01 02 03 04 05 06 07")?;
    for magic in ShadowMagic::ALL {
        writeln!(out, "  {:<22} {:02x}", format!("{}:", magic.description()), magic.byte())?;
    }
    Ok(())
}
