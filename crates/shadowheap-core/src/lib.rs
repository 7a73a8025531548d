//! # shadowheap-core
//!
//! Shadow-memory heap for memory-error detection.
//!
//! Every heap chunk is wrapped in poisoned redzones, freed chunks sit poisoned
//! in a quarantine before reuse, and instrumented functions may keep their
//! locals on a per-thread fake stack. One shadow byte describes each 8-byte
//! granule of the heap space; a bad access is classified from the shadow byte
//! under it.
//!
//! # Architecture
//!
//! ```text
//! Runtime -> RedzoneManager -> CombinedAllocator -> PrimaryAllocator (size classes)
//!                                                -> LargeMmapAllocator (mmap-style)
//!         -> QuarantineQueue
//!         -> FakeStack (per thread)
//!         -> ErrorClassifier -> BugReport
//! ```
//!
//! Unsafe code is confined to the modules that touch raw memory; each of them
//! opts in with a module-level `allow`.

#![deny(unsafe_code)]

pub mod chunk;
pub mod classifier;
pub mod combined;
pub mod config;
pub mod error;
pub mod fake_stack;
pub mod local_cache;
pub mod metrics;
pub mod primary;
pub mod quarantine;
pub mod redzone;
pub mod report;
pub mod runtime;
pub mod secondary;
pub mod shadow;
pub mod size_class;
pub mod stack;
pub mod structured_log;
pub mod vm;

#[cfg(test)]
pub(crate) mod testing;

pub use chunk::{AllocApi, Chunk, ChunkState};
pub use classifier::{AccessInfo, AddressDescription, BugKind, BugReport};
pub use config::{Config, ConfigError};
pub use error::{AllocError, Error, FreeError, Result};
pub use fake_stack::FakeStackError;
pub use metrics::StatsSnapshot;
pub use runtime::{DeathCallback, Runtime, ThreadState};
pub use stack::{NoStackCapture, StackCapture, StackTraceId};
pub use structured_log::{EventLog, LogEntry, LogLevel};
