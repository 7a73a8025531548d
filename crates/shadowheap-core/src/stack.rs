//! Stack-capture seam.
//!
//! Stack unwinding and symbolization live outside this crate. The runtime
//! only stores the opaque ids a [`StackCapture`] hands back.

use std::fmt;

use serde::Serialize;

/// Opaque handle to a captured stack trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize)]
#[serde(transparent)]
pub struct StackTraceId(pub u32);

impl StackTraceId {
    /// No trace was captured.
    pub const NONE: Self = Self(0);

    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for StackTraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("<no stack>")
        } else {
            write!(f, "stack#{}", self.0)
        }
    }
}

/// Captures the current call stack, keeping at most `max_frames` frames.
pub trait StackCapture: Send + Sync {
    fn capture(&self, max_frames: usize) -> StackTraceId;
}

/// Default collaborator: never captures anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoStackCapture;

impl StackCapture for NoStackCapture {
    fn capture(&self, _max_frames: usize) -> StackTraceId {
        StackTraceId::NONE
    }
}

impl<F> StackCapture for F
where
    F: Fn(usize) -> StackTraceId + Send + Sync,
{
    fn capture(&self, max_frames: usize) -> StackTraceId {
        self(max_frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn closures_are_collaborators() {
        let next = AtomicU32::new(1);
        let capture = move |_frames: usize| StackTraceId(next.fetch_add(1, Ordering::Relaxed));
        assert_eq!(capture.capture(30), StackTraceId(1));
        assert_eq!(capture.capture(30), StackTraceId(2));
        assert_eq!(NoStackCapture.capture(30), StackTraceId::NONE);
    }

    #[test]
    fn display() {
        assert_eq!(StackTraceId::NONE.to_string(), "<no stack>");
        assert_eq!(StackTraceId(7).to_string(), "stack#7");
    }
}
