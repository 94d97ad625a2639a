//! The access checker: "does this byte range touch a poisoned word?"
//!
//! Called by every interceptor before the bulk operation runs, so aborts are
//! precise (nothing half-written). The predicate itself is pure; the public
//! entry point's only side effect is terminating the process on a violation.

use crate::PAGE_SIZE;
use crate::config::TokenMode;
use crate::report::{self, Violation};
use crate::token;

/// Classify an access of `len` bytes at `base`. `None` means clean.
///
/// Every 8-byte word overlapping the range is tested. In 61-bit mode a
/// range ending mid-word additionally consults the next word past the range
/// (skipped when that read would cross into the next page): a valid token
/// there whose boundary field says fewer bytes are live than the access
/// uses is a byte-accurate overflow.
#[must_use]
pub fn find_violation(base: usize, len: usize, mode: TokenMode) -> Option<Violation> {
    if len == 0 {
        return None;
    }
    let front_delta = base & 7;
    let mut word = base & !7;
    let word_count = (len + front_delta).div_ceil(8);
    for _ in 0..word_count {
        // SAFETY: each tested word overlaps the caller's byte range, which
        // the caller is about to read or write anyway.
        if unsafe { token::is_poisoned(word as *const u64, mode) } {
            return Some(Violation::PoisonedAccess {
                addr: word,
                base,
                len,
            });
        }
        word += 8;
    }

    if mode == TokenMode::Precise61 {
        let end = base + len;
        let end_delta = end & 7;
        if end_delta != 0 {
            let next = (end & !7) + 8;
            // Never fault on a mapping edge for the extra read.
            if !next.is_multiple_of(PAGE_SIZE) {
                let next = next as *const u64;
                // SAFETY: same page as the last covered word, checked above.
                if unsafe { token::test_token61(next) } {
                    // SAFETY: as above.
                    let live = unsafe { token::boundary_of(next) };
                    if live != 0 && usize::from(live) < end_delta {
                        return Some(Violation::TrailingOverflow { base, len, live });
                    }
                }
            }
        }
    }
    None
}

/// Trap-on-violation wrapper around [`find_violation`].
pub fn check_range(base: usize, len: usize, mode: TokenMode) {
    if let Some(violation) = find_violation(base, len, mode) {
        report::fatal(violation);
    }
}

/// Trap when the word containing `addr` is poisoned. The string scanners use
/// this to reject a pointer whose very first byte already sits in redzone.
pub fn check_word_of(addr: usize, mode: TokenMode) {
    let word = addr & !7;
    // SAFETY: the caller is about to read the byte at `addr`, which this
    // word contains.
    if unsafe { token::is_poisoned(word as *const u64, mode) } {
        report::fatal(Violation::PoisonedAccess {
            addr: word,
            base: addr,
            len: 1,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nonce;

    // One page so the 61-bit extra read never leaves owned memory, plus
    // alignment guarantees for the word math.
    #[repr(C, align(4096))]
    struct Page([u64; PAGE_SIZE / 8]);

    fn page() -> Box<Page> {
        nonce::init(TokenMode::Precise61).expect("nonce init");
        Box::new(Page([0; PAGE_SIZE / 8]))
    }

    fn addr(page: &Page, word: usize) -> usize {
        (&raw const page.0[word]) as usize
    }

    #[test]
    fn clean_ranges_pass_in_both_modes() {
        let p = page();
        for mode in [TokenMode::Precise61, TokenMode::Wide64] {
            assert_eq!(find_violation(addr(&p, 0), 64, mode), None);
            assert_eq!(find_violation(addr(&p, 0) + 3, 10, mode), None);
            assert_eq!(find_violation(addr(&p, 0), 0, mode), None);
        }
    }

    #[test]
    fn a_poisoned_word_anywhere_in_the_range_is_reported() {
        let mut p = page();
        // SAFETY: in-bounds word of our page.
        unsafe { token::set_token61(&raw mut p.0[4], 0) };
        let base = addr(&p, 0);
        assert!(matches!(
            find_violation(base, 64, TokenMode::Precise61),
            Some(Violation::PoisonedAccess { addr: a, .. }) if a == base + 32
        ));
        // A range stopping short of the token is clean.
        assert_eq!(find_violation(base, 32, TokenMode::Precise61), None);
    }

    #[test]
    fn unaligned_base_still_covers_the_first_word() {
        let mut p = page();
        // SAFETY: in-bounds word of our page.
        unsafe { token::set_token61(&raw mut p.0[0], 0) };
        // A one-byte access at offset 5 overlaps word 0.
        assert!(find_violation(addr(&p, 0) + 5, 1, TokenMode::Precise61).is_some());
    }

    #[test]
    fn boundary_field_enforces_byte_accurate_object_ends() {
        let mut p = page();
        // Object of 10 bytes: words 0 holds 8, word 1 holds 2 live bytes;
        // the trailing token in word 2 records boundary 2.
        // SAFETY: in-bounds words of our page.
        unsafe { token::set_token61(&raw mut p.0[2], 2) };
        let base = addr(&p, 0);
        // Reads of 9 and 10 bytes are fine.
        assert_eq!(find_violation(base, 9, TokenMode::Precise61), None);
        assert_eq!(find_violation(base, 10, TokenMode::Precise61), None);
        // Byte 11 runs one past the recorded boundary.
        assert!(matches!(
            find_violation(base, 11, TokenMode::Precise61),
            Some(Violation::TrailingOverflow { live: 2, .. })
        ));
        // Word-granular mode cannot see it.
        assert_eq!(find_violation(base, 11, TokenMode::Wide64), None);
        // Reaching the token word itself is caught.
        assert!(find_violation(base, 17, TokenMode::Precise61).is_some());
    }

    #[test]
    fn wide_mode_catches_the_first_fully_dead_word() {
        let mut p = page();
        // SAFETY: in-bounds word of our page.
        unsafe { token::set_token64(&raw mut p.0[2]) };
        let base = addr(&p, 0);
        assert_eq!(find_violation(base, 16, TokenMode::Wide64), None);
        assert!(find_violation(base, 17, TokenMode::Wide64).is_some());
    }

    #[test]
    fn boundary_zero_means_the_whole_previous_word_is_live() {
        let mut p = page();
        // SAFETY: in-bounds word of our page.
        unsafe { token::set_token61(&raw mut p.0[1], 0) };
        let base = addr(&p, 0);
        for len in 1..=8 {
            assert_eq!(
                find_violation(base, len, TokenMode::Precise61),
                None,
                "len {len}"
            );
        }
    }

    #[test]
    fn the_extra_read_never_crosses_a_page_boundary() {
        let p = page();
        let words = PAGE_SIZE / 8;
        // Access ending mid-way into the page's final word: the next word
        // is the next page, so the boundary probe must be skipped, not
        // performed.
        let base = addr(&p, words - 1);
        assert_eq!(find_violation(base, 3, TokenMode::Precise61), None);
    }
}
