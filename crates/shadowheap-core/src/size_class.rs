//! Size class table for the primary allocator.
//!
//! Classes follow a piecewise-linear spline: between consecutive anchors
//! `l[i]` and `l[i + 1]` sizes advance by `s[i]`. The table is computed once
//! and looked up by binary search.

use thiserror::Error;

use crate::shadow::SHADOW_GRANULARITY;

/// Maximum number of classes a map may define.
pub const MAX_NUM_CLASSES: usize = 256;

/// Segments of the spline.
pub const NUM_SEGMENTS: usize = 5;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SizeClassError {
    #[error("step {step} of segment {segment} is not a power of two >= 8")]
    BadStep { segment: usize, step: usize },
    #[error("segment {segment} [{beg}, {end}] is not a positive multiple of its step {step}")]
    BadSegment {
        segment: usize,
        beg: usize,
        end: usize,
        step: usize,
    },
    #[error("first anchor {0} is not a non-zero multiple of 8")]
    BadMinSize(usize),
    #[error("last anchor {0} is not a power of two")]
    BadMaxSize(usize),
    #[error("spline yields {0} classes, more than the supported 256")]
    TooManyClasses(usize),
}

/// Anchors, steps and per-segment cache caps of a size class map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClassSpline {
    pub anchors: [usize; NUM_SEGMENTS + 1],
    pub steps: [usize; NUM_SEGMENTS],
    pub max_cached: [usize; NUM_SEGMENTS],
}

impl SizeClassSpline {
    /// 256 classes from 16 bytes to 2 MiB.
    pub const DEFAULT: Self = Self {
        anchors: [16, 512, 4096, 32768, 262_144, 2 << 20],
        steps: [16, 64, 512, 4096, 32768],
        max_cached: [256, 64, 16, 4, 1],
    };

    /// 32 classes from 8 bytes to 32 KiB, for small heaps.
    pub const COMPACT: Self = Self {
        anchors: [8, 16, 128, 256, 4096, 32768],
        steps: [8, 16, 128, 256, 4096],
        max_cached: [256, 128, 64, 16, 4],
    };

    fn validate(&self) -> Result<(), SizeClassError> {
        let min = self.anchors[0];
        if min == 0 || min % SHADOW_GRANULARITY != 0 {
            return Err(SizeClassError::BadMinSize(min));
        }
        let max = self.anchors[NUM_SEGMENTS];
        if !max.is_power_of_two() {
            return Err(SizeClassError::BadMaxSize(max));
        }
        let mut count = 1;
        for segment in 0..NUM_SEGMENTS {
            let step = self.steps[segment];
            if !step.is_power_of_two() || step < SHADOW_GRANULARITY {
                return Err(SizeClassError::BadStep { segment, step });
            }
            let (beg, end) = (self.anchors[segment], self.anchors[segment + 1]);
            if end <= beg || (end - beg) % step != 0 {
                return Err(SizeClassError::BadSegment {
                    segment,
                    beg,
                    end,
                    step,
                });
            }
            count += (end - beg) / step;
        }
        if count > MAX_NUM_CLASSES {
            return Err(SizeClassError::TooManyClasses(count));
        }
        Ok(())
    }
}

/// Immutable id <-> size table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeClassMap {
    sizes: Box<[usize]>,
    max_cached: Box<[usize]>,
}

impl SizeClassMap {
    /// Validates `spline` and builds its table.
    pub fn new(spline: &SizeClassSpline) -> Result<Self, SizeClassError> {
        spline.validate()?;
        Ok(Self::build(spline))
    }

    #[must_use]
    pub fn default_map() -> Self {
        Self::build(&SizeClassSpline::DEFAULT)
    }

    #[must_use]
    pub fn compact() -> Self {
        Self::build(&SizeClassSpline::COMPACT)
    }

    fn build(spline: &SizeClassSpline) -> Self {
        let mut sizes = vec![spline.anchors[0]];
        let mut max_cached = vec![spline.max_cached[0]];
        for segment in 0..NUM_SEGMENTS {
            let step = spline.steps[segment];
            let mut size = spline.anchors[segment] + step;
            while size <= spline.anchors[segment + 1] {
                sizes.push(size);
                max_cached.push(spline.max_cached[segment]);
                size += step;
            }
        }
        Self {
            sizes: sizes.into_boxed_slice(),
            max_cached: max_cached.into_boxed_slice(),
        }
    }

    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.sizes.len()
    }

    #[must_use]
    pub fn min_size(&self) -> usize {
        self.sizes[0]
    }

    #[must_use]
    pub fn max_size(&self) -> usize {
        self.sizes[self.sizes.len() - 1]
    }

    /// Chunk size of `class_id`, or 0 when out of range.
    #[must_use]
    pub fn size(&self, class_id: usize) -> usize {
        self.sizes.get(class_id).copied().unwrap_or(0)
    }

    /// Smallest class whose size is at least `size`.
    #[must_use]
    pub fn class_id(&self, size: usize) -> Option<usize> {
        if size > self.max_size() {
            return None;
        }
        Some(self.sizes.partition_point(|&class_size| class_size < size))
    }

    /// Smallest class holding `size` bytes whose size is a multiple of
    /// `alignment`, so every chunk of a region-aligned class is aligned too.
    #[must_use]
    pub fn class_id_aligned(&self, size: usize, alignment: usize) -> Option<usize> {
        let first = self.class_id(size)?;
        (first..self.num_classes()).find(|&class_id| self.sizes[class_id] % alignment == 0)
    }

    /// How many chunks of `class_id` a thread cache keeps before flushing.
    #[must_use]
    pub fn max_cached(&self, class_id: usize) -> usize {
        self.max_cached.get(class_id).copied().unwrap_or(0)
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }
}

impl Default for SizeClassMap {
    fn default() -> Self {
        Self::default_map()
    }
}
