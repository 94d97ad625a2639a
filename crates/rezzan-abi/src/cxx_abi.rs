//! C++ operator new/delete surface (Itanium mangled names).
//!
//! C++ binaries reach the heap through these symbols rather than `malloc`,
//! so the preload must own them too. All variants funnel into the same
//! allocate/release paths as the C entry points; the nothrow tag and the
//! sized-delete size are accepted and ignored (the capsule knows its own
//! length).

#![allow(non_snake_case)]

use std::ffi::c_void;

use crate::malloc_abi::{enter_reentry_guard, host_free, host_malloc, sanitizer};

#[inline]
fn operator_new(size: usize) -> *mut c_void {
    let Some(_guard) = enter_reentry_guard() else {
        // SAFETY: reentrant call; the host serves it.
        return unsafe { host_malloc(size) };
    };
    match sanitizer() {
        Some(rt) => rt.allocate(size).cast(),
        // SAFETY: passthrough to the host allocator.
        None => unsafe { host_malloc(size) },
    }
}

#[inline]
fn operator_delete(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    let Some(_guard) = enter_reentry_guard() else {
        // SAFETY: reentrant call; reentrant allocations came from the host.
        return unsafe { host_free(ptr) };
    };
    match sanitizer() {
        Some(rt) if rt.is_arena_ptr(ptr as usize) => rt.release(ptr.cast()),
        // SAFETY: foreign or passthrough pointer.
        _ => unsafe { host_free(ptr) },
    }
}

/// `operator new(size_t)`
#[unsafe(no_mangle)]
pub unsafe extern "C" fn _Znwm(size: usize) -> *mut c_void {
    operator_new(size)
}

/// `operator new[](size_t)`
#[unsafe(no_mangle)]
pub unsafe extern "C" fn _Znam(size: usize) -> *mut c_void {
    operator_new(size)
}

/// `operator new(size_t, const std::nothrow_t&)`
#[unsafe(no_mangle)]
pub unsafe extern "C" fn _ZnwmRKSt9nothrow_t(size: usize, _tag: *const c_void) -> *mut c_void {
    operator_new(size)
}

/// `operator new[](size_t, const std::nothrow_t&)`
#[unsafe(no_mangle)]
pub unsafe extern "C" fn _ZnamRKSt9nothrow_t(size: usize, _tag: *const c_void) -> *mut c_void {
    operator_new(size)
}

/// `operator delete(void*)`
#[unsafe(no_mangle)]
pub unsafe extern "C" fn _ZdlPv(ptr: *mut c_void) {
    operator_delete(ptr);
}

/// `operator delete[](void*)`
#[unsafe(no_mangle)]
pub unsafe extern "C" fn _ZdaPv(ptr: *mut c_void) {
    operator_delete(ptr);
}

/// `operator delete(void*, size_t)`
#[unsafe(no_mangle)]
pub unsafe extern "C" fn _ZdlPvm(ptr: *mut c_void, _size: usize) {
    operator_delete(ptr);
}

/// `operator delete[](void*, size_t)`
#[unsafe(no_mangle)]
pub unsafe extern "C" fn _ZdaPvm(ptr: *mut c_void, _size: usize) {
    operator_delete(ptr);
}

/// `operator delete(void*, const std::nothrow_t&)`
#[unsafe(no_mangle)]
pub unsafe extern "C" fn _ZdlPvRKSt9nothrow_t(ptr: *mut c_void, _tag: *const c_void) {
    operator_delete(ptr);
}

/// `operator delete[](void*, const std::nothrow_t&)`
#[unsafe(no_mangle)]
pub unsafe extern "C" fn _ZdaPvRKSt9nothrow_t(ptr: *mut c_void, _tag: *const c_void) {
    operator_delete(ptr);
}
