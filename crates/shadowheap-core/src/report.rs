//! Fatal-report plumbing shared by every thread.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::classifier::HeapLocation;
use crate::error::FreeError;
use crate::redzone::RedzoneManager;

/// Environment variable carrying runtime options.
pub const OPTIONS_ENV: &str = "SHADOWHEAP_OPTIONS";

/// Lets exactly one thread print the fatal report.
#[derive(Debug, Default)]
pub struct ReportGuard {
    reporting: AtomicBool,
}

impl ReportGuard {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            reporting: AtomicBool::new(false),
        }
    }

    /// `true` for the first caller only.
    #[must_use]
    pub fn try_begin(&self) -> bool {
        !self.reporting.swap(true, Ordering::AcqRel)
    }

    #[must_use]
    pub fn is_reporting(&self) -> bool {
        self.reporting.load(Ordering::Acquire)
    }
}

/// Process-wide guard used by the fatal path.
pub static REPORT_GUARD: ReportGuard = ReportGuard::new();

/// Renders a bad deallocation the way access reports are rendered.
#[must_use]
pub fn render_free_error(error: &FreeError, redzones: &RedzoneManager) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "=================================================================");
    let _ = writeln!(out, "ERROR: ShadowHeap: {}: {error}", error.name());
    match error {
        FreeError::DoubleFree {
            free_stack,
            free_tid,
            alloc_stack,
            alloc_tid,
            ..
        } => {
            let _ = writeln!(out, "freed by thread T{free_tid} here:\n    {free_stack}");
            let _ = writeln!(out, "previously allocated by thread T{alloc_tid} here:\n    {alloc_stack}");
        }
        FreeError::AllocDeallocMismatch {
            alloc,
            dealloc,
            alloc_stack,
            ..
        } => {
            let _ = writeln!(
                out,
                "  allocated with {}, deallocated with {}",
                alloc.alloc_name(),
                dealloc.dealloc_name()
            );
            let _ = writeln!(out, "allocated here:\n    {alloc_stack}");
            let _ = writeln!(
                out,
                "HINT: if you don't care about these errors you may set {OPTIONS_ENV}=alloc_dealloc_mismatch=0"
            );
        }
        FreeError::InvalidFree { addr, .. } => {
            if let Some(chunk) = redzones.find_chunk(*addr) {
                let location = HeapLocation::new(chunk, *addr);
                let _ = writeln!(
                    out,
                    "{addr:#x} is located {} bytes from the start of a {}-byte region [{:#x},{:#x})",
                    location.offset,
                    chunk.requested_size,
                    chunk.user_beg,
                    chunk.user_end()
                );
            }
        }
        FreeError::Shadow(_) => {}
    }
    let _ = writeln!(out, "SUMMARY: ShadowHeap: {}", error.name());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::AllocApi;
    use crate::combined::CombinedAllocator;
    use crate::redzone::{Origin, RedzoneOptions};
    use crate::size_class::SizeClassMap;
    use crate::stack::StackTraceId;

    #[test]
    fn only_first_caller_reports() {
        let guard = ReportGuard::new();
        assert!(!guard.is_reporting());
        assert!(guard.try_begin());
        assert!(!guard.try_begin());
        assert!(guard.is_reporting());
    }

    #[test]
    fn free_error_texts() {
        let allocator = CombinedAllocator::new(SizeClassMap::compact(), 22, 28).unwrap();
        let redzones = RedzoneManager::new(allocator, RedzoneOptions::default());
        let mut cache = redzones.allocator().new_cache();
        let user = redzones
            .allocate(&mut cache, 32, 8, AllocApi::New, Origin::default())
            .unwrap();

        let mismatch = redzones
            .deallocate(user, AllocApi::Malloc, Origin::default())
            .unwrap_err();
        let text = render_free_error(&mismatch, &redzones);
        assert!(text.contains("alloc-dealloc-mismatch"));
        assert!(text.contains("operator new"));
        assert!(text.contains("SHADOWHEAP_OPTIONS=alloc_dealloc_mismatch=0"));

        let invalid = redzones
            .deallocate(user + 16, AllocApi::New, Origin::default())
            .unwrap_err();
        let text = render_free_error(&invalid, &redzones);
        assert!(text.contains("bad-free"));
        assert!(text.contains("16 bytes from the start of a 32-byte region"));

        redzones
            .deallocate(
                user,
                AllocApi::New,
                Origin {
                    stack: StackTraceId(4),
                    tid: 2,
                },
            )
            .unwrap();
        let double = redzones
            .deallocate(user, AllocApi::New, Origin::default())
            .unwrap_err();
        let text = render_free_error(&double, &redzones);
        assert!(text.contains("double-free"));
        assert!(text.contains("freed by thread T2 here:\n    stack#4"));
    }
}
