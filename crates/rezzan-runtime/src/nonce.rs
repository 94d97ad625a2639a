//! The process nonce.
//!
//! One page-aligned, page-sized static holds the 64-bit secret every poison
//! token is derived from. Keeping it in a dedicated static means the token
//! routines compile to a literal-address load, and letting it fill a whole
//! page means it can be write-protected after startup without touching any
//! neighboring data.

use std::cell::UnsafeCell;
use std::sync::Once;
use std::sync::atomic::{AtomicU8, Ordering};

use thiserror::Error;

use crate::PAGE_SIZE;
use crate::config::TokenMode;

#[repr(C, align(4096))]
struct NoncePage {
    word: UnsafeCell<u64>,
    _pad: [u8; PAGE_SIZE - 8],
}

// SAFETY: the word is written once under the `INIT` guard before any reader
// can observe the READY state, and is read-only afterwards.
unsafe impl Sync for NoncePage {}

static NONCE_PAGE: NoncePage = NoncePage {
    word: UnsafeCell::new(0),
    _pad: [0; PAGE_SIZE - 8],
};

static INIT: Once = Once::new();

const STATE_UNINIT: u8 = 0;
const STATE_READY: u8 = 1;
const STATE_NO_ENTROPY: u8 = 2;
const STATE_NO_PROTECT: u8 = 3;

static STATE: AtomicU8 = AtomicU8::new(STATE_UNINIT);

/// Failure to establish the nonce. Fatal at startup.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum NonceError {
    #[error("failed to read entropy for the nonce")]
    Entropy,
    #[error("failed to write-protect the nonce page")]
    Protect,
}

/// Fill the nonce from the OS entropy source and write-protect its page.
///
/// Idempotent; the first caller's `mode` wins (the mode is process-wide)
/// and later callers see the first outcome. In 61-bit mode the low three
/// bits are forced to zero so a zero boundary field still forms a valid
/// token.
pub fn init(mode: TokenMode) -> Result<(), NonceError> {
    INIT.call_once(|| {
        let state = match fill_and_protect(mode) {
            Ok(()) => STATE_READY,
            Err(NonceError::Entropy) => STATE_NO_ENTROPY,
            Err(NonceError::Protect) => STATE_NO_PROTECT,
        };
        STATE.store(state, Ordering::Release);
    });
    match STATE.load(Ordering::Acquire) {
        STATE_READY => Ok(()),
        STATE_NO_PROTECT => Err(NonceError::Protect),
        _ => Err(NonceError::Entropy),
    }
}

fn fill_and_protect(mode: TokenMode) -> Result<(), NonceError> {
    let mut word = 0u64;
    loop {
        let rc = {
            // SAFETY: 8 writable bytes of a local are handed to getrandom.
            unsafe { libc::getrandom((&raw mut word).cast(), 8, 0) }
        };
        if rc != 8 {
            return Err(NonceError::Entropy);
        }
        if mode == TokenMode::Precise61 {
            word &= !7;
        }
        // A zero nonce would make ordinary zero words read as poison.
        if word != 0 {
            break;
        }
    }

    // SAFETY: the slot is not yet observable by readers (STATE is still
    // UNINIT).
    unsafe { *NONCE_PAGE.word.get() = word };

    let rc = {
        // SAFETY: NONCE_PAGE is page-aligned and exactly one page long, so the
        // protection change cannot affect unrelated data.
        unsafe {
            libc::mprotect(
                (&raw const NONCE_PAGE).cast_mut().cast(),
                PAGE_SIZE,
                libc::PROT_READ,
            )
        }
    };
    if rc != 0 {
        return Err(NonceError::Protect);
    }
    Ok(())
}

/// The process nonce. Must not be called before [`init`] succeeded.
#[inline]
#[must_use]
pub fn nonce() -> u64 {
    debug_assert_eq!(
        STATE.load(Ordering::Relaxed),
        STATE_READY,
        "nonce read before init"
    );
    // SAFETY: read-only after init; see the Sync rationale above.
    unsafe { *NONCE_PAGE.word.get() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent_and_yields_a_stable_nonzero_nonce() {
        init(TokenMode::Precise61).expect("nonce init");
        let first = nonce();
        assert_ne!(first, 0);
        init(TokenMode::Precise61).expect("second init is a no-op");
        assert_eq!(nonce(), first);
    }

    #[test]
    fn precise_mode_masks_the_boundary_bits() {
        init(TokenMode::Precise61).expect("nonce init");
        assert_eq!(nonce() & 7, 0, "61-bit nonce must have zero low bits");
    }
}
