//! ABI layer for the heap entry points (`malloc`, `free`, `calloc`,
//! `realloc`, `malloc_usable_size`).
//!
//! Every entry resolves the sanitizer runtime without blocking: while the
//! runtime is still initializing (its own environment parsing allocates and
//! re-enters `malloc` on the same thread), or while a thread is already
//! inside the sanitizer, the call is delegated to the host allocator via the
//! `__libc_*` symbols. Foreign pointers — anything outside the arena — take
//! the same path, so mixed ownership never corrupts either heap.
//!
//! In test mode, this module is suppressed to avoid shadowing the system
//! allocator (which would cause infinite recursion in the test binary
//! itself).

use std::cell::Cell;
use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};

use rezzan_runtime::{Runtime, try_runtime};

unsafe extern "C" {
    #[link_name = "__libc_malloc"]
    fn host_malloc_sym(size: usize) -> *mut c_void;
    #[link_name = "__libc_calloc"]
    fn host_calloc_sym(nmemb: usize, size: usize) -> *mut c_void;
    #[link_name = "__libc_realloc"]
    fn host_realloc_sym(ptr: *mut c_void, size: usize) -> *mut c_void;
    #[link_name = "__libc_free"]
    fn host_free_sym(ptr: *mut c_void);
}

#[inline]
pub(crate) unsafe fn host_malloc(size: usize) -> *mut c_void {
    // SAFETY: direct call to the host allocator symbol.
    unsafe { host_malloc_sym(size) }
}

#[inline]
unsafe fn host_calloc(nmemb: usize, size: usize) -> *mut c_void {
    // SAFETY: direct call to the host allocator symbol.
    unsafe { host_calloc_sym(nmemb, size) }
}

#[inline]
unsafe fn host_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    // SAFETY: direct call to the host allocator symbol.
    unsafe { host_realloc_sym(ptr, size) }
}

#[inline]
pub(crate) unsafe fn host_free(ptr: *mut c_void) {
    // SAFETY: direct call to the host allocator symbol.
    unsafe { host_free_sym(ptr) }
}

thread_local! {
    static ALLOCATOR_REENTRY_DEPTH: Cell<u32> = const { Cell::new(0) };
}

pub(crate) struct ReentryGuard;

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        ALLOCATOR_REENTRY_DEPTH.with(|depth| {
            let current = depth.get();
            depth.set(current.saturating_sub(1));
        });
    }
}

/// Claim the allocator for this thread. `None` means the caller arrived
/// reentrantly (e.g. the lock or the runtime initializer allocated) and must
/// delegate to the host.
#[inline]
pub(crate) fn enter_reentry_guard() -> Option<ReentryGuard> {
    ALLOCATOR_REENTRY_DEPTH.with(|depth| {
        let current = depth.get();
        if current > 0 {
            None
        } else {
            depth.set(current + 1);
            Some(ReentryGuard)
        }
    })
}

/// The runtime, when it exists and is not in passthrough mode.
#[inline]
pub(crate) fn sanitizer() -> Option<&'static Runtime> {
    try_runtime().filter(|rt| !rt.options().disabled)
}

/// POSIX `malloc`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
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

/// POSIX `free`. NULL is a no-op; foreign pointers go back to the host.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    let Some(_guard) = enter_reentry_guard() else {
        // SAFETY: reentrant call; reentrant allocations always came from the
        // host, so the host frees them.
        return unsafe { host_free(ptr) };
    };
    match sanitizer() {
        Some(rt) if rt.is_arena_ptr(ptr as usize) => rt.release(ptr.cast()),
        // SAFETY: foreign or passthrough pointer.
        _ => unsafe { host_free(ptr) },
    }
}

/// POSIX `calloc`. The element-count product is deliberately unchecked,
/// matching the allocator this sanitizer replaces.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    let Some(_guard) = enter_reentry_guard() else {
        // SAFETY: reentrant call; the host serves it.
        return unsafe { host_calloc(nmemb, size) };
    };
    match sanitizer() {
        Some(rt) => rt.zeroed_allocate(nmemb, size).cast(),
        // SAFETY: passthrough to the host allocator.
        None => unsafe { host_calloc(nmemb, size) },
    }
}

/// POSIX `realloc`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    let Some(_guard) = enter_reentry_guard() else {
        // SAFETY: reentrant call; the host serves it.
        return unsafe { host_realloc(ptr, size) };
    };
    match sanitizer() {
        Some(rt) => {
            if ptr.is_null() {
                rt.allocate(size).cast()
            } else if rt.is_arena_ptr(ptr as usize) {
                rt.resize(ptr.cast(), size).cast()
            } else {
                // SAFETY: foreign pointer stays with the host allocator.
                unsafe { host_realloc(ptr, size) }
            }
        }
        // SAFETY: passthrough to the host allocator.
        None => unsafe { host_realloc(ptr, size) },
    }
}

type UsableSizeFn = unsafe extern "C" fn(*mut c_void) -> usize;

static HOST_USABLE_SIZE: AtomicUsize = AtomicUsize::new(0);

fn host_usable_size(ptr: *mut c_void) -> usize {
    let mut looked_up = HOST_USABLE_SIZE.load(Ordering::Relaxed);
    if looked_up == 0 {
        // SAFETY: symbol lookup past our own interposition.
        looked_up =
            unsafe { libc::dlsym(libc::RTLD_NEXT, c"malloc_usable_size".as_ptr()) } as usize;
        if looked_up == 0 {
            return 0;
        }
        HOST_USABLE_SIZE.store(looked_up, Ordering::Relaxed);
    }
    // SAFETY: the resolved symbol has the malloc_usable_size signature.
    let host: UsableSizeFn = unsafe { std::mem::transmute(looked_up) };
    // SAFETY: forwarding a pointer the host allocator owns.
    unsafe { host(ptr) }
}

/// glibc `malloc_usable_size`: whole words up to the redzone for arena
/// objects, host lookup for everything else.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
    if ptr.is_null() {
        return 0;
    }
    match sanitizer() {
        Some(rt) if rt.is_arena_ptr(ptr as usize) => rt.usable_size(ptr.cast_const().cast()),
        _ => host_usable_size(ptr),
    }
}
