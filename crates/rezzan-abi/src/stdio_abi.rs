//! Instrumented formatted-print entry points.
//!
//! Formatting itself is delegated to the host (`vsnprintf` / `vprintf`);
//! this layer only enforces memory safety around it. `snprintf` bounds-checks
//! the destination buffer. `printf` is opt-in (`REZZAN_PRINTF`): when
//! enabled, the format is walked with a copy of the argument list and every
//! `%s` string is validated before the host ever dereferences it.

use std::ffi::{VaList, c_char, c_int, c_void};

use rezzan_runtime::Runtime;

use crate::malloc_abi::sanitizer;
use crate::util::scan_str;

unsafe extern "C" {
    fn vsnprintf(s: *mut c_char, n: usize, format: *const c_char, ap: VaList) -> c_int;
    fn vprintf(format: *const c_char, ap: VaList) -> c_int;
}

/// POSIX `snprintf`. Destination bounds only; the format layer is the
/// host's problem.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn snprintf(
    s: *mut c_char,
    n: usize,
    format: *const c_char,
    args: ...
) -> c_int {
    if n > 0 && !s.is_null() {
        if let Some(rt) = sanitizer() {
            rt.check_access(s as usize, n);
        }
    }
    // SAFETY: forwarding our own variadic list to the host formatter.
    unsafe { vsnprintf(s, n, format, args) }
}

/// POSIX `printf` with opt-in `%s` validation.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn printf(format: *const c_char, args: ...) -> c_int {
    if let Some(rt) = sanitizer() {
        if rt.options().printf && !format.is_null() {
            let ap = args.clone();
            // SAFETY: the walker consumes a copy of the list; printf's
            // own contract makes the format describe the arguments.
            unsafe { validate_percent_s_args(format, ap, rt) }
        }
    }
    // SAFETY: forwarding our own variadic list to the host formatter.
    unsafe { vprintf(format, args) }
}

/// Walk a printf format, consuming arguments in step, and validate each
/// `%s` string against the poison tokens. Stops at the first conversion it
/// cannot classify, since argument tracking would be wrong from there on.
///
/// # Safety
///
/// `format` must be a NUL-terminated string matching the supplied argument
/// list, as printf itself already requires.
unsafe fn validate_percent_s_args(format: *const c_char, mut ap: VaList, rt: &Runtime) {
    let byte = |offset: usize| -> u8 {
        // SAFETY: the format is NUL-terminated; the walk never passes the
        // terminator.
        unsafe { *format.add(offset) as u8 }
    };

    let mut i = 0usize;
    while byte(i) != 0 {
        if byte(i) != b'%' {
            i += 1;
            continue;
        }
        i += 1;

        // Flags.
        while matches!(byte(i), b'-' | b'+' | b' ' | b'#' | b'0' | b'\'') {
            i += 1;
        }

        // Field width.
        if byte(i) == b'*' {
            let _: c_int = unsafe { ap.next_arg() };
            i += 1;
        } else {
            while byte(i).is_ascii_digit() {
                i += 1;
            }
        }

        // Precision: for %s this bounds how many bytes may be read.
        let mut precision: Option<usize> = None;
        if byte(i) == b'.' {
            i += 1;
            if byte(i) == b'*' {
                let p: c_int = unsafe { ap.next_arg() };
                precision = Some(p.max(0) as usize);
                i += 1;
            } else {
                let mut p = 0usize;
                while byte(i).is_ascii_digit() {
                    p = p * 10 + usize::from(byte(i) - b'0');
                    i += 1;
                }
                precision = Some(p);
            }
        }

        // Length modifiers.
        let mut wide_int = false;
        loop {
            match byte(i) {
                b'h' => i += 1,
                b'l' | b'q' | b'j' | b'z' | b't' | b'L' => {
                    wide_int = true;
                    i += 1;
                }
                _ => break,
            }
        }

        // Conversion.
        match byte(i) {
            b's' => {
                let p: *const c_char = unsafe { ap.next_arg() };
                if !p.is_null() {
                    // SAFETY: printf's own contract makes the string
                    // readable; poison vetting is the point of this walk.
                    unsafe { scan_str(p, precision, Some(rt)) };
                }
            }
            b'd' | b'i' | b'u' | b'o' | b'x' | b'X' | b'c' => {
                if wide_int {
                    let _: i64 = unsafe { ap.next_arg() };
                } else {
                    let _: c_int = unsafe { ap.next_arg() };
                }
            }
            b'f' | b'F' | b'e' | b'E' | b'g' | b'G' | b'a' | b'A' => {
                let _: f64 = unsafe { ap.next_arg() };
            }
            b'p' | b'n' => {
                let _: *const c_void = unsafe { ap.next_arg() };
            }
            b'%' | b'm' => {}
            // Unknown conversion: argument positions are no longer
            // trustworthy.
            _ => return,
        }
        i += 1;
    }
}
