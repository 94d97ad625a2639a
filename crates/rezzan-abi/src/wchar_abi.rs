//! Instrumented replacements for the `<wchar.h>` routines.
//!
//! On Linux/glibc `wchar_t` is 32-bit, so every element is four bytes and
//! ranges are checked in byte units.

use rezzan_runtime::Runtime;

use crate::malloc_abi::sanitizer;

/// Scan a wide string, validating each touched 8-byte word when a runtime
/// is supplied. Returns the element length before the NUL.
///
/// # Safety
///
/// `ptr` must be valid to read through its terminating NUL element; an
/// instrumented allocation ends in a poison token, which traps the scan.
unsafe fn scan_wstr(ptr: *const u32, rt: Option<&Runtime>) -> usize {
    let addr = ptr as usize;
    if let Some(rt) = rt {
        rt.check_first_word(addr);
    }
    let mut i = 0usize;
    loop {
        let p = addr + i * 4;
        if i > 0 && p.is_multiple_of(8) {
            if let Some(rt) = rt {
                rt.check_first_word(p);
            }
        }
        // SAFETY: the containing word was poison-checked on entry.
        if unsafe { *(p as *const u32) } == 0 {
            if let Some(rt) = rt {
                rt.check_access(addr, (i + 1) * 4);
            }
            return i;
        }
        i += 1;
    }
}

/// POSIX `wmemcpy` — copies `n` wide characters.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn wmemcpy(dst: *mut u32, src: *const u32, n: usize) -> *mut u32 {
    if n == 0 || dst.is_null() || src.is_null() {
        return dst;
    }
    if let Some(rt) = sanitizer() {
        rt.check_access(src as usize, n * 4);
        rt.check_access(dst as usize, n * 4);
    }
    for i in 0..n {
        // SAFETY: both element ranges were checked; the caller asserts
        // validity for `n` elements.
        unsafe { *dst.add(i) = *src.add(i) };
    }
    dst
}

/// POSIX `wcslen`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn wcslen(s: *const u32) -> usize {
    // SAFETY: forwarded caller contract.
    unsafe { scan_wstr(s, sanitizer()) }
}

/// POSIX `wcscpy`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn wcscpy(dst: *mut u32, src: *const u32) -> *mut u32 {
    let rt = sanitizer();
    // SAFETY: caller provides a NUL-terminated wide source.
    let len = unsafe { scan_wstr(src, rt) };
    if let Some(rt) = rt {
        rt.check_access(dst as usize, (len + 1) * 4);
    }
    for i in 0..=len {
        // SAFETY: both extents checked above; the terminator is included.
        unsafe { *dst.add(i) = *src.add(i) };
    }
    dst
}
