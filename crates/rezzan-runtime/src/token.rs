//! Poison-token primitives.
//!
//! A token is one aligned 8-byte word derived from the process nonce; its
//! presence marks the word as inaccessible. Storing the *negated* nonce lets
//! every test compile to an add-and-compare-to-zero instead of an equality
//! against a known constant. In 61-bit mode the low three bits carry the
//! boundary field: how many bytes of the preceding partial word are live
//! payload, with 0 meaning a full 8.
//!
//! All stores and loads are single 8-byte volatile accesses so a checker
//! running without the allocator lock never observes a torn token.

use crate::config::TokenMode;
use crate::nonce::nonce;

/// Store a 64-bit-mode token.
///
/// # Safety
///
/// `slot` must be valid for an aligned 8-byte write.
#[inline]
pub unsafe fn set_token64(slot: *mut u64) {
    // SAFETY: caller guarantees an aligned writable slot.
    unsafe { slot.write_volatile(nonce().wrapping_neg()) };
}

/// Store a 61-bit-mode token carrying `boundary` (0..=7) in its low bits.
///
/// # Safety
///
/// `slot` must be valid for an aligned 8-byte write.
#[inline]
pub unsafe fn set_token61(slot: *mut u64, boundary: u8) {
    debug_assert!(boundary < 8);
    let word = (nonce().wrapping_neg() & !7) ^ u64::from(boundary);
    // SAFETY: caller guarantees an aligned writable slot.
    unsafe { slot.write_volatile(word) };
}

/// Does `slot` hold a 64-bit-mode token?
///
/// # Safety
///
/// `slot` must be valid for an aligned 8-byte read.
#[inline]
#[must_use]
pub unsafe fn test_token64(slot: *const u64) -> bool {
    // SAFETY: caller guarantees an aligned readable slot.
    let word = unsafe { slot.read_volatile() };
    word.wrapping_add(nonce()) == 0
}

/// Does `slot` hold a 61-bit-mode token (any boundary value)?
///
/// # Safety
///
/// `slot` must be valid for an aligned 8-byte read.
#[inline]
#[must_use]
pub unsafe fn test_token61(slot: *const u64) -> bool {
    // SAFETY: caller guarantees an aligned readable slot.
    let word = unsafe { slot.read_volatile() };
    (word & !7).wrapping_add(nonce()) == 0
}

/// Clear a token slot.
///
/// # Safety
///
/// `slot` must be valid for an aligned 8-byte write.
#[inline]
pub unsafe fn zero_token(slot: *mut u64) {
    // SAFETY: caller guarantees an aligned writable slot.
    unsafe { slot.write_volatile(0) };
}

/// Mode-dispatched poison store. 64-bit mode ignores the boundary.
///
/// # Safety
///
/// `slot` must be valid for an aligned 8-byte write.
#[inline]
pub unsafe fn write_poison(slot: *mut u64, boundary: u8, mode: TokenMode) {
    match mode {
        // SAFETY: forwarded caller contract.
        TokenMode::Wide64 => unsafe { set_token64(slot) },
        // SAFETY: forwarded caller contract.
        TokenMode::Precise61 => unsafe { set_token61(slot, boundary) },
    }
}

/// Mode-dispatched poison test.
///
/// # Safety
///
/// `slot` must be valid for an aligned 8-byte read.
#[inline]
#[must_use]
pub unsafe fn is_poisoned(slot: *const u64, mode: TokenMode) -> bool {
    match mode {
        // SAFETY: forwarded caller contract.
        TokenMode::Wide64 => unsafe { test_token64(slot) },
        // SAFETY: forwarded caller contract.
        TokenMode::Precise61 => unsafe { test_token61(slot) },
    }
}

/// The boundary field of a 61-bit token. Meaningless unless
/// [`test_token61`] holds for the slot.
///
/// # Safety
///
/// `slot` must be valid for an aligned 8-byte read.
#[inline]
#[must_use]
pub unsafe fn boundary_of(slot: *const u64) -> u8 {
    // SAFETY: caller guarantees an aligned readable slot.
    let word = unsafe { slot.read_volatile() };
    (word & 7) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TokenMode;
    use crate::nonce;

    fn setup() {
        nonce::init(TokenMode::Precise61).expect("nonce init");
    }

    #[test]
    fn token64_round_trip() {
        setup();
        let mut slot = 0u64;
        let p = &raw mut slot;
        // SAFETY: stack slot, aligned.
        unsafe {
            set_token64(p);
            assert!(test_token64(p));
            zero_token(p);
            assert!(!test_token64(p));
        }
    }

    #[test]
    fn token61_holds_for_every_boundary() {
        setup();
        let mut slot = 0u64;
        let p = &raw mut slot;
        for boundary in 0..8u8 {
            // SAFETY: stack slot, aligned.
            unsafe {
                set_token61(p, boundary);
                assert!(test_token61(p), "boundary {boundary}");
                assert_eq!(boundary_of(p), boundary);
            }
        }
    }

    #[test]
    fn boundary_zero_matches_the_wide_token() {
        // With the low nonce bits masked, a boundary-0 precise token and a
        // wide token are the same word.
        setup();
        let mut a = 0u64;
        let mut b = 0u64;
        // SAFETY: stack slots, aligned.
        unsafe {
            set_token61(&raw mut a, 0);
            set_token64(&raw mut b);
        }
        assert_eq!(a, b);
    }

    #[test]
    fn ordinary_words_are_not_tokens() {
        setup();
        for word in [0u64, 1, 0xFFFF_FFFF_FFFF_FFFF, 0x4141_4141_4141_4141] {
            let slot = &raw const word;
            // SAFETY: stack slot, aligned.
            unsafe {
                assert!(!test_token64(slot), "{word:#x}");
                assert!(!test_token61(slot), "{word:#x}");
            }
        }
    }

    #[test]
    fn mode_dispatch_agrees_with_the_families() {
        setup();
        let mut slot = 0u64;
        let p = &raw mut slot;
        // SAFETY: stack slot, aligned.
        unsafe {
            write_poison(p, 3, TokenMode::Precise61);
            assert!(is_poisoned(p, TokenMode::Precise61));
            write_poison(p, 0, TokenMode::Wide64);
            assert!(is_poisoned(p, TokenMode::Wide64));
        }
    }
}
