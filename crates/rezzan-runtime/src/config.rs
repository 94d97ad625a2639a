//! Runtime configuration.
//!
//! All tuning is read once from the process environment when the global
//! runtime initializes:
//! - `REZZAN_DISABLED`: non-zero passes everything through to the host
//!   allocator.
//! - `REZZAN_NONCE_SIZE`: `61` (default, byte-accurate trailing checks) or
//!   `64` (word-granular).
//! - `REZZAN_QUARANTINE_SIZE`: bytes of freed memory to park before reuse
//!   begins (default 256 MiB).
//! - `REZZAN_POOL_SIZE`: arena reservation in bytes (default 2 GiB); must be
//!   page-aligned and larger than one growth chunk.
//! - `REZZAN_POPULATE`: non-zero prefaults committed arena pages.
//! - `REZZAN_DEBUG`: non-zero emits one trace line per heap operation.
//! - `REZZAN_CHECKS`: non-zero runs expensive post-allocation self-checks.
//! - `REZZAN_STATS`: non-zero prints counters at process exit.
//! - `REZZAN_PRINTF`: non-zero validates `%s` arguments in the printf
//!   interceptor.
//!
//! Malformed values are configuration errors and fatal at startup.

use thiserror::Error;

use crate::arena::GROWTH_CHUNK;
use crate::PAGE_SIZE;

/// Token interpretation, fixed process-wide at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenMode {
    /// The poison word is the full 64-bit negated nonce.
    Wide64,
    /// The low three bits of the poison word carry the payload boundary of
    /// the preceding partial word, enabling byte-accurate overflow checks.
    Precise61,
}

/// A malformed environment value. Always fatal at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: expected an integer, got `{value}`")]
    InvalidInteger { var: &'static str, value: String },
    #[error("REZZAN_NONCE_SIZE: expected 61 or 64, got `{value}`")]
    InvalidNonceSize { value: String },
    #[error("REZZAN_POOL_SIZE: {size} is not a multiple of the {page}-byte page size")]
    PoolNotPageAligned { size: usize, page: usize },
    #[error("REZZAN_POOL_SIZE: {size} does not exceed the {chunk}-byte growth chunk")]
    PoolTooSmall { size: usize, chunk: usize },
}

/// Parsed runtime options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeOptions {
    /// Pass everything through to the host allocator.
    pub disabled: bool,
    /// Token interpretation (61- or 64-bit nonce).
    pub mode: TokenMode,
    /// Quarantined bytes beyond which freed memory starts being reused.
    pub quarantine_size: usize,
    /// Arena reservation in bytes.
    pub pool_size: usize,
    /// Prefault committed arena pages.
    pub populate: bool,
    /// Per-operation trace lines on stderr.
    pub debug: bool,
    /// Expensive post-allocation self-checks.
    pub checks: bool,
    /// Counter dump at process exit.
    pub stats: bool,
    /// Validate `%s` arguments in the printf interceptor.
    pub printf: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            disabled: false,
            mode: TokenMode::Precise61,
            quarantine_size: 256 * 1024 * 1024,
            pool_size: 2 * 1024 * 1024 * 1024,
            populate: false,
            debug: false,
            checks: false,
            stats: false,
            printf: false,
        }
    }
}

impl RuntimeOptions {
    /// Read and validate all `REZZAN_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut options = Self::default();
        options.disabled = read_switch("REZZAN_DISABLED")?;
        options.mode = read_nonce_size()?;
        if let Some(size) = read_size("REZZAN_QUARANTINE_SIZE")? {
            options.quarantine_size = size;
        }
        if let Some(size) = read_size("REZZAN_POOL_SIZE")? {
            options.pool_size = size;
        }
        options.populate = read_switch("REZZAN_POPULATE")?;
        options.debug = read_switch("REZZAN_DEBUG")?;
        options.checks = read_switch("REZZAN_CHECKS")?;
        options.stats = read_switch("REZZAN_STATS")?;
        options.printf = read_switch("REZZAN_PRINTF")?;
        options.validate()?;
        Ok(options)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.pool_size.is_multiple_of(PAGE_SIZE) {
            return Err(ConfigError::PoolNotPageAligned {
                size: self.pool_size,
                page: PAGE_SIZE,
            });
        }
        if self.pool_size <= GROWTH_CHUNK {
            return Err(ConfigError::PoolTooSmall {
                size: self.pool_size,
                chunk: GROWTH_CHUNK,
            });
        }
        Ok(())
    }
}

/// Parse an on/off switch: any integer, non-zero means on.
fn parse_switch(var: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().parse::<i64>() {
        Ok(v) => Ok(v != 0),
        Err(_) => Err(ConfigError::InvalidInteger {
            var,
            value: raw.to_owned(),
        }),
    }
}

/// Parse a byte count.
fn parse_size(var: &'static str, raw: &str) -> Result<usize, ConfigError> {
    raw.trim()
        .parse::<usize>()
        .map_err(|_| ConfigError::InvalidInteger {
            var,
            value: raw.to_owned(),
        })
}

fn parse_nonce_size(raw: &str) -> Result<TokenMode, ConfigError> {
    match raw.trim() {
        "61" => Ok(TokenMode::Precise61),
        "64" => Ok(TokenMode::Wide64),
        _ => Err(ConfigError::InvalidNonceSize {
            value: raw.to_owned(),
        }),
    }
}

fn read_switch(var: &'static str) -> Result<bool, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => parse_switch(var, &raw),
        Err(_) => Ok(false),
    }
}

fn read_size(var: &'static str) -> Result<Option<usize>, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => parse_size(var, &raw).map(Some),
        Err(_) => Ok(None),
    }
}

fn read_nonce_size() -> Result<TokenMode, ConfigError> {
    match std::env::var("REZZAN_NONCE_SIZE") {
        Ok(raw) => parse_nonce_size(&raw),
        Err(_) => Ok(TokenMode::Precise61),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switch_accepts_integers_only() {
        assert_eq!(parse_switch("REZZAN_DEBUG", "0"), Ok(false));
        assert_eq!(parse_switch("REZZAN_DEBUG", "1"), Ok(true));
        assert_eq!(parse_switch("REZZAN_DEBUG", " 2 "), Ok(true));
        assert!(matches!(
            parse_switch("REZZAN_DEBUG", "yes"),
            Err(ConfigError::InvalidInteger { var: "REZZAN_DEBUG", .. })
        ));
    }

    #[test]
    fn nonce_size_is_61_or_64() {
        assert_eq!(parse_nonce_size("61"), Ok(TokenMode::Precise61));
        assert_eq!(parse_nonce_size("64"), Ok(TokenMode::Wide64));
        assert!(matches!(
            parse_nonce_size("62"),
            Err(ConfigError::InvalidNonceSize { .. })
        ));
        assert!(matches!(
            parse_nonce_size(""),
            Err(ConfigError::InvalidNonceSize { .. })
        ));
    }

    #[test]
    fn size_rejects_text() {
        assert_eq!(parse_size("REZZAN_POOL_SIZE", "4096"), Ok(4096));
        assert!(parse_size("REZZAN_POOL_SIZE", "2G").is_err());
    }

    #[test]
    fn defaults_match_documented_values() {
        let options = RuntimeOptions::default();
        assert!(!options.disabled);
        assert_eq!(options.mode, TokenMode::Precise61);
        assert_eq!(options.quarantine_size, 256 * 1024 * 1024);
        assert_eq!(options.pool_size, 2 * 1024 * 1024 * 1024);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn pool_size_must_be_page_aligned_and_larger_than_a_chunk() {
        let mut options = RuntimeOptions::default();
        options.pool_size = PAGE_SIZE + 1;
        assert!(matches!(
            options.validate(),
            Err(ConfigError::PoolNotPageAligned { .. })
        ));

        options.pool_size = PAGE_SIZE;
        assert!(matches!(
            options.validate(),
            Err(ConfigError::PoolTooSmall { .. })
        ));
    }
}
