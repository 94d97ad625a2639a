//! # rezzan-runtime
//!
//! Core of the rezzan heap sanitizer: every allocation lives in a *capsule*
//! of 16-byte units carved from one fixed arena, fenced by *poison tokens*
//! derived from a per-process secret nonce. Freed capsules are poisoned
//! whole and parked in a size-classed quarantine before reuse, so
//! out-of-bounds accesses, use-after-free, and double/bad frees all reduce
//! to "does this word hold a token?" — one add-and-compare per word.
//!
//! The companion `rezzan-abi` crate exposes this runtime under the standard
//! allocator and string symbol names for preloading.
//!
//! # Architecture
//!
//! ```text
//! interposed call -> access checker (token tests) -> byte/word loop
//!                 \-> allocator façade -> quarantine -> arena
//! ```

pub mod arena;
pub mod check;
pub mod config;
pub mod heap;
pub mod nonce;
pub mod quarantine;
pub mod report;
pub mod stats;
pub mod token;

/// Base page size the arena, nonce page, and checker assume.
pub const PAGE_SIZE: usize = 4096;

/// One allocation unit: two token words. All capsules are whole units and
/// all allocations are unit-aligned.
pub const UNIT_BYTES: usize = 16;

pub use config::{ConfigError, RuntimeOptions, TokenMode};
pub use heap::{InitError, Runtime, installed_runtime, try_runtime};
pub use report::Violation;
