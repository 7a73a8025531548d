//! Per-thread fake stack.
//!
//! Instrumented functions may place their locals in a heap-backed frame
//! instead of on the real stack. When the function returns the frame is
//! poisoned with the after-return magic, so a dangling pointer to a local is
//! caught like a use-after-free.
//!
//! The fake stack is split into [`NUM_CLASSES`] equally sized class ranges;
//! class `c` holds frames of `2^(6 + c)` bytes. Frames are claimed through an
//! atomic flag per slot.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use thiserror::Error;

use crate::combined::CombinedAllocator;
use crate::error::AllocError;
use crate::shadow::{ShadowError, ShadowMagic, ShadowMemoryMap};
use crate::vm;

pub const NUM_CLASSES: usize = 11;
pub const MIN_FRAME_SIZE_LOG: u32 = 6;
pub const MIN_STACK_SIZE_LOG: u32 = 16;
pub const MAX_STACK_SIZE_LOG: u32 = 28;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FakeStackError {
    #[error("fake stack class {class_id} does not exist")]
    InvalidClass { class_id: usize },
    #[error("fake stack size log {log} outside 16..=28")]
    InvalidSizeLog { log: u32 },
    #[error("fake stack class {class_id} has no free frame")]
    Exhausted { class_id: usize },
    #[error("fake frame {addr:#x} is not allocated")]
    NotAllocated { addr: usize },
    #[error("frame of {size} bytes does not fit fake stack class {class_id}")]
    FrameTooLarge { class_id: usize, size: usize },
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error(transparent)]
    Shadow(#[from] ShadowError),
}

/// A fake frame an address falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct FakeFrame {
    /// First byte of the frame.
    pub addr: usize,
    pub class_id: usize,
    pub slot: usize,
    /// Real stack pointer of the frame's owner, 0 if never allocated.
    pub real_stack: usize,
    pub allocated: bool,
}

#[derive(Debug)]
struct FrameClass {
    flags: Box<[AtomicBool]>,
    real_stacks: Box<[AtomicUsize]>,
    hint: AtomicUsize,
}

impl FrameClass {
    fn new(frames: usize) -> Self {
        Self {
            flags: (0..frames).map(|_| AtomicBool::new(false)).collect(),
            real_stacks: (0..frames).map(|_| AtomicUsize::new(0)).collect(),
            hint: AtomicUsize::new(0),
        }
    }
}

#[derive(Debug)]
pub struct FakeStack {
    beg: usize,
    stack_size_log: u32,
    classes: Box<[FrameClass]>,
    needs_gc: AtomicBool,
    /// Bit `c` set once class `c` handed out a frame.
    used_classes: AtomicU32,
    /// Frames reclaimed by [`FakeStack::gc`] so far.
    collected: AtomicUsize,
    shadow: Arc<ShadowMemoryMap>,
}

#[must_use]
pub const fn frame_size(class_id: usize) -> usize {
    1 << (MIN_FRAME_SIZE_LOG as usize + class_id)
}

impl FakeStack {
    /// Carves the fake stack from the large-object allocator and poisons it.
    pub fn create(allocator: &CombinedAllocator, stack_size_log: u32) -> Result<Self, FakeStackError> {
        if !(MIN_STACK_SIZE_LOG..=MAX_STACK_SIZE_LOG).contains(&stack_size_log) {
            return Err(FakeStackError::InvalidSizeLog {
                log: stack_size_log,
            });
        }
        let size = NUM_CLASSES << stack_size_log;
        let beg = allocator.secondary().allocate(size, vm::page_size())?;
        let shadow = Arc::clone(allocator.shadow());
        shadow.poison_range(beg, size, ShadowMagic::StackAfterReturn.byte())?;
        let classes = (0..NUM_CLASSES)
            .map(|class_id| {
                FrameClass::new(1 << (stack_size_log - MIN_FRAME_SIZE_LOG - class_id as u32))
            })
            .collect();
        Ok(Self {
            beg,
            stack_size_log,
            classes,
            needs_gc: AtomicBool::new(false),
            used_classes: AtomicU32::new(0),
            collected: AtomicUsize::new(0),
            shadow,
        })
    }

    /// Returns the backing memory. Frames must no longer be in use.
    pub fn release(&self, allocator: &CombinedAllocator) -> Result<(), FakeStackError> {
        allocator.secondary().deallocate(self.beg)?;
        Ok(())
    }

    #[must_use]
    pub const fn beg(&self) -> usize {
        self.beg
    }

    #[must_use]
    pub const fn end(&self) -> usize {
        self.beg + (NUM_CLASSES << self.stack_size_log)
    }

    #[must_use]
    pub const fn stack_size_log(&self) -> u32 {
        self.stack_size_log
    }

    #[must_use]
    pub fn frames_in_class(&self, class_id: usize) -> usize {
        self.classes.get(class_id).map_or(0, |class| class.flags.len())
    }

    #[must_use]
    pub fn collected_frames(&self) -> usize {
        self.collected.load(Ordering::Relaxed)
    }

    fn frame_addr(&self, class_id: usize, slot: usize) -> usize {
        self.beg + (class_id << self.stack_size_log) + slot * frame_size(class_id)
    }

    /// Claims a free frame of `class_id` for a function running on `real_stack`.
    pub fn allocate(&self, class_id: usize, real_stack: usize) -> Result<usize, FakeStackError> {
        let class = self
            .classes
            .get(class_id)
            .ok_or(FakeStackError::InvalidClass { class_id })?;
        if self.needs_gc.swap(false, Ordering::AcqRel) {
            self.gc(real_stack)?;
        }
        let frames = class.flags.len();
        let start = class.hint.fetch_add(1, Ordering::Relaxed) % frames;
        for step in 0..frames {
            let slot = (start + step) % frames;
            let flag = &class.flags[slot];
            if flag.load(Ordering::Relaxed) || flag.swap(true, Ordering::Acquire) {
                continue;
            }
            class.real_stacks[slot].store(real_stack, Ordering::Relaxed);
            class.hint.store(slot + 1, Ordering::Relaxed);
            self.used_classes
                .fetch_or(1 << class_id, Ordering::Relaxed);
            let addr = self.frame_addr(class_id, slot);
            self.shadow.unpoison_range(addr, frame_size(class_id))?;
            return Ok(addr);
        }
        Err(FakeStackError::Exhausted { class_id })
    }

    /// Poisons the frame at `addr` and makes it available again.
    pub fn deallocate(&self, addr: usize, class_id: usize) -> Result<(), FakeStackError> {
        let class = self
            .classes
            .get(class_id)
            .ok_or(FakeStackError::InvalidClass { class_id })?;
        let class_beg = self.beg + (class_id << self.stack_size_log);
        let not_allocated = FakeStackError::NotAllocated { addr };
        if addr < class_beg || (addr - class_beg) % frame_size(class_id) != 0 {
            return Err(not_allocated);
        }
        let slot = (addr - class_beg) / frame_size(class_id);
        let Some(flag) = class.flags.get(slot) else {
            return Err(not_allocated);
        };
        if !flag.load(Ordering::Acquire) {
            return Err(not_allocated);
        }
        self.shadow.poison_range(
            addr,
            frame_size(class_id),
            ShadowMagic::StackAfterReturn.byte(),
        )?;
        flag.store(false, Ordering::Release);
        Ok(())
    }

    /// The owning thread left frames behind without returning through them.
    pub fn handle_no_return(&self) {
        self.needs_gc.store(true, Ordering::Release);
    }

    /// Releases every frame whose owner's real stack lies below `real_stack`.
    pub fn gc(&self, real_stack: usize) -> Result<usize, FakeStackError> {
        let used = self.used_classes.load(Ordering::Relaxed);
        let mut collected = 0;
        for (class_id, class) in self.classes.iter().enumerate() {
            if used & (1 << class_id) == 0 {
                continue;
            }
            for (slot, flag) in class.flags.iter().enumerate() {
                if !flag.load(Ordering::Acquire)
                    || class.real_stacks[slot].load(Ordering::Relaxed) >= real_stack
                {
                    continue;
                }
                self.shadow.poison_range(
                    self.frame_addr(class_id, slot),
                    frame_size(class_id),
                    ShadowMagic::StackAfterReturn.byte(),
                )?;
                flag.store(false, Ordering::Release);
                collected += 1;
            }
        }
        self.collected.fetch_add(collected, Ordering::Relaxed);
        Ok(collected)
    }

    #[must_use]
    pub fn addr_is_in_fake_stack(&self, addr: usize) -> Option<FakeFrame> {
        if addr < self.beg || addr >= self.end() {
            return None;
        }
        let class_id = (addr - self.beg) >> self.stack_size_log;
        let class_beg = self.beg + (class_id << self.stack_size_log);
        let slot = (addr - class_beg) >> (MIN_FRAME_SIZE_LOG as usize + class_id);
        let class = &self.classes[class_id];
        Some(FakeFrame {
            addr: self.frame_addr(class_id, slot),
            class_id,
            slot,
            real_stack: class.real_stacks[slot].load(Ordering::Relaxed),
            allocated: class.flags[slot].load(Ordering::Acquire),
        })
    }
}
