//! # shadowheap-abi
//!
//! `extern "C"` entry points called by compiler instrumentation.
//!
//! The crate produces a `cdylib` exposing the `shadowheap_*` symbols. Every
//! call goes to one lazily built process-wide [`shadowheap_core::Runtime`]
//! configured from the `SHADOWHEAP_OPTIONS` environment variable.
//!
//! # Architecture
//!
//! ```text
//! instrumented code -> ABI entry (this crate) -> thread state (TLS) -> Runtime
//!                                             -> fatal path (report, exit)
//! ```

pub mod alloc_abi;
pub mod fake_stack_abi;
pub mod interface_abi;
pub mod poison_abi;
mod runtime_state;
