//! Instrumented replacements for the `<string.h>` bulk and string routines.
//!
//! Each entry point:
//! 1. Validates every word the operation will touch against the poison
//!    tokens — *before* writing anything, so an abort leaves the destination
//!    untouched.
//! 2. Performs the operation with a plain byte loop (word-at-a-time for
//!    `strlen`) that never calls back into another instrumented routine.
//!
//! While the runtime is initializing or disabled the operations run
//! unchecked; they are pure loops with no allocation, so no reentry guard is
//! needed here.

use std::ffi::{c_char, c_void};

use crate::malloc_abi::sanitizer;
use crate::util::{has_zero_byte, scan_str};

/// POSIX `memcpy` — copies `n` non-overlapping bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn memcpy(dst: *mut c_void, src: *const c_void, n: usize) -> *mut c_void {
    if n == 0 || dst.is_null() || src.is_null() {
        return dst;
    }
    if let Some(rt) = sanitizer() {
        rt.check_access(src as usize, n);
        rt.check_access(dst as usize, n);
    }
    let d = dst.cast::<u8>();
    let s = src.cast::<u8>();
    for i in 0..n {
        // SAFETY: both ranges were checked (or checking is off); the caller
        // asserts validity for `n` bytes.
        unsafe { *d.add(i) = *s.add(i) };
    }
    dst
}

/// POSIX `memmove` — overlap-safe copy; direction follows the pointer order.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn memmove(dst: *mut c_void, src: *const c_void, n: usize) -> *mut c_void {
    if n == 0 || dst.is_null() || src.is_null() {
        return dst;
    }
    if let Some(rt) = sanitizer() {
        rt.check_access(src as usize, n);
        rt.check_access(dst as usize, n);
    }
    let d = dst.cast::<u8>();
    let s = src.cast::<u8>();
    if (d as usize) <= (s as usize) {
        for i in 0..n {
            // SAFETY: checked ranges; copying low-to-high cannot clobber
            // unread source bytes when dst precedes src.
            unsafe { *d.add(i) = *s.add(i) };
        }
    } else {
        for i in (0..n).rev() {
            // SAFETY: checked ranges; copying high-to-low cannot clobber
            // unread source bytes when dst follows src.
            unsafe { *d.add(i) = *s.add(i) };
        }
    }
    dst
}

/// POSIX `strlen`, word-at-a-time.
///
/// The word holding the first byte is vetted before anything is read: a
/// pointer into freed or redzone memory trips immediately even when its
/// first byte happens to be non-NUL. An unterminated string cannot run off
/// the end of an instrumented allocation — the scan hits the trailing token
/// first.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strlen(s: *const c_char) -> usize {
    let rt = sanitizer();
    let addr = s as usize;
    if let Some(rt) = rt {
        rt.check_first_word(addr);
    }

    // Head: bytes up to the first aligned word.
    let mut p = addr;
    while !p.is_multiple_of(8) {
        // SAFETY: still inside the vetted first word.
        if unsafe { *(p as *const u8) } == 0 {
            return finish_str(rt, addr, p - addr);
        }
        p += 1;
    }

    // Whole words.
    loop {
        if let Some(rt) = rt {
            rt.check_first_word(p);
        }
        // SAFETY: aligned word just vetted (or checking is off).
        let word = unsafe { (p as *const u64).read() };
        if has_zero_byte(word) {
            let mut q = p;
            // SAFETY: the NUL lies within this word.
            while unsafe { *(q as *const u8) } != 0 {
                q += 1;
            }
            return finish_str(rt, addr, q - addr);
        }
        p += 8;
    }
}

/// Re-validate the discovered extent; in 61-bit mode this is where the
/// byte-accurate trailing rule fires for a NUL found in dead tail bytes.
fn finish_str(rt: Option<&rezzan_runtime::Runtime>, addr: usize, len: usize) -> usize {
    if let Some(rt) = rt {
        rt.check_access(addr, len + 1);
    }
    len
}

/// POSIX `strnlen` — `strlen` with a hard bound.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strnlen(s: *const c_char, maxlen: usize) -> usize {
    // SAFETY: bounded scan; validity up to the bound is the caller's
    // contract, poison is ours.
    let (len, _) = unsafe { scan_str(s, Some(maxlen), sanitizer()) };
    len
}

/// POSIX `strcpy`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strcpy(dst: *mut c_char, src: *const c_char) -> *mut c_char {
    let rt = sanitizer();
    // SAFETY: caller provides a NUL-terminated source.
    let (len, _) = unsafe { scan_str(src, None, rt) };
    if let Some(rt) = rt {
        rt.check_access(dst as usize, len + 1);
    }
    for i in 0..=len {
        // SAFETY: both extents checked above; the terminator is included.
        unsafe { *dst.add(i) = *src.add(i) };
    }
    dst
}

/// POSIX `strncpy` — copies at most `n` bytes and zero-fills the rest.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strncpy(dst: *mut c_char, src: *const c_char, n: usize) -> *mut c_char {
    let rt = sanitizer();
    // SAFETY: bounded source scan.
    let (len, _) = unsafe { scan_str(src, Some(n), rt) };
    if let Some(rt) = rt {
        if n > 0 {
            rt.check_access(dst as usize, n);
        }
    }
    for i in 0..len {
        // SAFETY: source extent scanned, destination checked for `n`.
        unsafe { *dst.add(i) = *src.add(i) };
    }
    for i in len..n {
        // SAFETY: destination checked for `n`.
        unsafe { *dst.add(i) = 0 };
    }
    dst
}

/// POSIX `strcat`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strcat(dst: *mut c_char, src: *const c_char) -> *mut c_char {
    let rt = sanitizer();
    // SAFETY: caller provides NUL-terminated operands.
    let (dlen, _) = unsafe { scan_str(dst.cast_const(), None, rt) };
    // SAFETY: as above.
    let (slen, _) = unsafe { scan_str(src, None, rt) };
    if let Some(rt) = rt {
        rt.check_access(dst as usize + dlen, slen + 1);
    }
    for i in 0..=slen {
        // SAFETY: the write extent past dst's terminator was checked.
        unsafe { *dst.add(dlen + i) = *src.add(i) };
    }
    dst
}

/// POSIX `strncat` — appends at most `n` source bytes plus a terminator.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strncat(dst: *mut c_char, src: *const c_char, n: usize) -> *mut c_char {
    let rt = sanitizer();
    // SAFETY: caller provides a NUL-terminated destination.
    let (dlen, _) = unsafe { scan_str(dst.cast_const(), None, rt) };
    // SAFETY: bounded source scan.
    let (slen, _) = unsafe { scan_str(src, Some(n), rt) };
    if let Some(rt) = rt {
        rt.check_access(dst as usize + dlen, slen + 1);
    }
    for i in 0..slen {
        // SAFETY: the write extent past dst's terminator was checked.
        unsafe { *dst.add(dlen + i) = *src.add(i) };
    }
    // SAFETY: included in the checked extent.
    unsafe { *dst.add(dlen + slen) = 0 };
    dst
}
