#![feature(c_variadic)]
// All extern "C" exports accept raw pointers from C callers; the runtime
// validates at call time, so per-function safety docs would be redundant
// boilerplate.
#![allow(clippy::missing_safety_doc)]
//! # rezzan-abi
//!
//! `extern "C"` boundary of the rezzan heap sanitizer. This crate produces a
//! `cdylib` meant to be preloaded in front of the host C library: it exports
//! the common heap entry points (`malloc`, `free`, ...), the C++ operator
//! new/delete mangled names, and instrumented replacements for the bulk and
//! string routines.
//!
//! # Architecture
//!
//! ```text
//! C caller -> ABI entry (this crate) -> token checks -> byte/word loop
//!                                   \-> rezzan-runtime allocator façade
//! ```
//!
//! Foreign pointers (anything outside the arena) and every call made while
//! `REZZAN_DISABLED` is set are delegated to the host allocator.

// Gated behind cfg(not(test)) because these modules export #[no_mangle]
// symbols (malloc, free, memcpy, strlen, ...) that would shadow the system
// allocator and libc in the test binary, causing infinite recursion or
// deadlock.
#[cfg(not(test))]
pub mod cxx_abi;
#[cfg(not(test))]
pub mod malloc_abi;
#[cfg(not(test))]
pub mod stdio_abi;
#[cfg(not(test))]
pub mod string_abi;
#[cfg(not(test))]
pub mod wchar_abi;

pub mod util;
