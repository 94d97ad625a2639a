//! The allocator façade.
//!
//! Couples the arena and the quarantine behind one process-wide lock and
//! implements the instrumented object layout: a capsule of 16-byte units
//! holding the payload, with every word after the payload filled with poison
//! tokens. The word before a capsule is always poison too — either the
//! arena's permanent sentinel at unit 0 or the previous capsule's trailing
//! redzone — so underflow and overflow are both one token test away.
//!
//! Locking: `allocate` holds the lock across the quarantine probe, the
//! carve, and the store of the capsule's last token — a concurrent string
//! scan must never find the far end of a live capsule unpoisoned. `release`
//! poisons the object's interior without the lock (the capsule is not
//! discoverable until it is inserted) and locks only around the insert.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

use crate::UNIT_BYTES;
use crate::arena::{Arena, ArenaError, GLOBAL_ARENA_BASE};
use crate::check;
use crate::config::{RuntimeOptions, TokenMode};
use crate::nonce::{self, NonceError};
use crate::quarantine::{Quarantine, QuarantineError};
use crate::report::{self, Violation};
use crate::token;

/// Startup failure. Always fatal for the global runtime.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    #[error(transparent)]
    Nonce(#[from] NonceError),
    #[error(transparent)]
    Arena(#[from] ArenaError),
    #[error(transparent)]
    Quarantine(#[from] QuarantineError),
}

struct Heap {
    arena: Arena,
    quarantine: Quarantine,
}

/// Allocation-lifecycle counters, readable without the lock.
pub struct Counters {
    /// Successful allocations.
    pub allocations: AtomicU64,
    /// Successful releases.
    pub releases: AtomicU64,
    /// Bytes ever carved fresh from the arena.
    pub carved_bytes: AtomicU64,
}

/// The sanitizer runtime: options plus the locked heap.
pub struct Runtime {
    options: RuntimeOptions,
    /// Copies of the arena bounds; fixed at creation, so reads need no lock.
    base: usize,
    pool_bytes: usize,
    heap: Mutex<Heap>,
    stats: Counters,
}

impl Runtime {
    /// Build a runtime. The global instance passes the fixed arena base;
    /// tests pass `None` and take a kernel-chosen base.
    pub fn create(options: RuntimeOptions, base_hint: Option<usize>) -> Result<Self, InitError> {
        if options.disabled {
            // Pure passthrough: nothing to reserve, nothing ever matches
            // `is_arena_ptr`.
            return Ok(Self {
                options,
                base: 0,
                pool_bytes: 0,
                heap: Mutex::new(Heap {
                    arena: Arena::empty(),
                    quarantine: Quarantine::new()?,
                }),
                stats: Counters::new(),
            });
        }

        nonce::init(options.mode)?;
        let mut arena = Arena::reserve(base_hint, options.pool_size, options.populate)?;
        let quarantine = Quarantine::new()?;

        // Unit 0 is a permanent sentinel capsule: both words stay poisoned
        // forever, so underflow from the first real object is detected.
        let sentinel = arena.carve(1)?;
        debug_assert_eq!(sentinel, 0);
        let addr = arena.addr_of(sentinel);
        // SAFETY: the sentinel unit was just carved and committed.
        unsafe {
            token::write_poison(addr as *mut u64, 0, options.mode);
            token::write_poison((addr + 8) as *mut u64, 0, options.mode);
        }

        let base = arena.base();
        let pool_bytes = arena.pool_units() as usize * UNIT_BYTES;
        Ok(Self {
            options,
            base,
            pool_bytes,
            heap: Mutex::new(Heap { arena, quarantine }),
            stats: Counters::new(),
        })
    }

    #[inline]
    #[must_use]
    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    #[inline]
    #[must_use]
    pub fn mode(&self) -> TokenMode {
        self.options.mode
    }

    #[inline]
    #[must_use]
    pub fn counters(&self) -> &Counters {
        &self.stats
    }

    /// Does `addr` fall inside the arena? Lock-free; the bounds are fixed.
    #[inline]
    #[must_use]
    pub fn is_arena_ptr(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.pool_bytes
    }

    /// Parked bytes currently in quarantine.
    #[must_use]
    pub fn quarantined_bytes(&self) -> u64 {
        self.heap.lock().quarantine.usage_units() * UNIT_BYTES as u64
    }

    /// Trap unless `[base, base + len)` is clean.
    #[inline]
    pub fn check_access(&self, base: usize, len: usize) {
        check::check_range(base, len, self.mode());
    }

    /// Trap when the word containing `addr` is already poison.
    #[inline]
    pub fn check_first_word(&self, addr: usize) {
        check::check_word_of(addr, self.mode());
    }

    /// Allocate `n` payload bytes. Fatal on arena exhaustion.
    pub fn allocate(&self, n: usize) -> *mut u8 {
        let n = n.max(1);
        let unit_count = capsule_units(n);
        let mode = self.mode();

        let (offset, recycled) = {
            let mut heap = self.heap.lock();
            let over_threshold = heap.quarantine.usage_units() * UNIT_BYTES as u64
                > self.options.quarantine_size as u64;
            let mut recycled = false;
            let offset = if over_threshold {
                match heap.quarantine.try_allocate(unit_count) {
                    Some(offset) => {
                        recycled = true;
                        offset
                    }
                    None => carve_or_die(&mut heap, unit_count),
                }
            } else {
                carve_or_die(&mut heap, unit_count)
            };
            // The far sentinel must exist before anyone can walk the object:
            // written before the lock drops.
            let last = self.addr_of(offset) + unit_count as usize * UNIT_BYTES - 8;
            // SAFETY: inside the capsule just obtained.
            unsafe { token::write_poison(last as *mut u64, 0, mode) };
            (offset, recycled)
        };

        let base = self.addr_of(offset);
        let payload_words = n.div_ceil(8);
        if recycled {
            // A quarantined capsule is poison throughout; hand back zeroes.
            for w in 0..payload_words {
                // SAFETY: payload words of our capsule.
                unsafe { token::zero_token((base + w * 8) as *mut u64) };
            }
        } else {
            self.stats
                .carved_bytes
                .fetch_add(u64::from(unit_count) * UNIT_BYTES as u64, Ordering::Relaxed);
        }

        // Redzone: every word after the payload, walking back from the
        // capsule end. The lowest one records how many payload bytes live in
        // the preceding partial word.
        let capsule_words = unit_count as usize * 2;
        for w in (payload_words..capsule_words).rev() {
            let boundary = if w == payload_words { (n % 8) as u8 } else { 0 };
            // SAFETY: redzone words of our capsule.
            unsafe { token::write_poison((base + w * 8) as *mut u64, boundary, mode) };
        }

        self.stats.allocations.fetch_add(1, Ordering::Relaxed);
        if self.options.checks {
            self.self_check(base, n, unit_count);
        }
        if self.options.debug {
            report::trace_alloc("allocate", n, base);
        }
        base as *mut u8
    }

    /// Release, with the violation surfaced instead of trapped. The public
    /// [`Runtime::release`] wrapper traps; tests assert on the classification.
    pub fn try_release(&self, p: *mut u8) -> Result<(), Violation> {
        if p.is_null() {
            return Ok(());
        }
        let addr = p as usize;
        debug_assert!(self.is_arena_ptr(addr), "foreign pointers are the adapter's job");
        if !addr.is_multiple_of(UNIT_BYTES) {
            return Err(Violation::BadFree { addr });
        }
        let mode = self.mode();
        // SAFETY: aligned words inside the arena.
        unsafe {
            if token::is_poisoned(addr as *const u64, mode) {
                return Err(Violation::DoubleFree { addr });
            }
            if !token::is_poisoned((addr - 8) as *const u64, mode) {
                return Err(Violation::NotObjectBase { addr });
            }
        }

        // Poison the interior without the lock: the capsule stays ours until
        // it is inserted, so no other thread can observe the walk.
        let mut words = 0usize;
        // SAFETY: the walk stays inside the capsule — it stops at the
        // trailing sentinel established at allocation.
        unsafe {
            while !token::is_poisoned((addr + words * 8) as *const u64, mode) {
                token::write_poison((addr + words * 8) as *mut u64, 0, mode);
                words += 1;
            }
        }
        // The sentinel word itself belongs to this capsule; capsules are
        // whole units.
        words += 1;
        if !words.is_multiple_of(2) {
            words += 1;
        }
        let unit_count = (words / 2) as u32;
        let offset = self.unit_of(addr);

        self.heap.lock().quarantine.insert(offset, unit_count);
        self.stats.releases.fetch_add(1, Ordering::Relaxed);
        if self.options.debug {
            report::trace_release(addr);
        }
        Ok(())
    }

    /// Release `p` back into quarantine. Traps on double/bad free.
    pub fn release(&self, p: *mut u8) {
        if let Err(violation) = self.try_release(p) {
            report::fatal(violation);
        }
    }

    /// Grow or shrink an allocation by moving it.
    ///
    /// The old payload size is recovered by scanning for the first poisoned
    /// word, so it may over-estimate the original request up to the next
    /// 8-byte boundary; the copy is clamped by the new size either way.
    pub fn resize(&self, p: *mut u8, n: usize) -> *mut u8 {
        if p.is_null() {
            return self.allocate(n);
        }
        let addr = p as usize;
        let mode = self.mode();
        let mut old_words = 0usize;
        // SAFETY: bounded by the capsule's trailing sentinel.
        unsafe {
            while !token::is_poisoned((addr + old_words * 8) as *const u64, mode) {
                old_words += 1;
            }
        }
        let old_bytes = old_words * 8;

        let fresh = self.allocate(n);
        let copy = old_bytes.min(n);
        // SAFETY: `fresh` is a distinct capsule (the old one is still live),
        // both sides are valid for `copy` bytes.
        unsafe { std::ptr::copy_nonoverlapping(p.cast_const(), fresh, copy) };
        self.release(p);
        if self.options.debug {
            report::trace_resize(addr, n, fresh as usize);
        }
        fresh
    }

    /// `calloc` semantics: the product is deliberately unchecked, matching
    /// the behavior this sanitizer replaces. Zeroing is structural — fresh
    /// carves are demand-zero pages and recycled capsules are zeroed in
    /// [`Runtime::allocate`].
    pub fn zeroed_allocate(&self, count: usize, size: usize) -> *mut u8 {
        self.allocate(count.wrapping_mul(size))
    }

    /// Usable bytes of a live arena object: whole words up to the redzone.
    #[must_use]
    pub fn usable_size(&self, p: *const u8) -> usize {
        let addr = p as usize;
        let mode = self.mode();
        let mut words = 0usize;
        // SAFETY: bounded by the capsule's trailing sentinel.
        unsafe {
            while !token::is_poisoned((addr + words * 8) as *const u64, mode) {
                words += 1;
            }
        }
        words * 8
    }

    #[inline]
    fn addr_of(&self, unit: u32) -> usize {
        self.base + unit as usize * UNIT_BYTES
    }

    #[inline]
    fn unit_of(&self, addr: usize) -> u32 {
        ((addr - self.base) / UNIT_BYTES) as u32
    }

    /// Expensive post-allocation validation (`REZZAN_CHECKS`). A failure
    /// here is a sanitizer bug, reported like any other violation.
    fn self_check(&self, base: usize, n: usize, unit_count: u32) {
        let mode = self.mode();
        if !base.is_multiple_of(UNIT_BYTES) {
            report::fatal(Violation::SelfCheck {
                addr: base,
                detail: "capsule base not 16-byte aligned",
            });
        }
        if n >= unit_count as usize * UNIT_BYTES {
            report::fatal(Violation::SelfCheck {
                addr: base,
                detail: "payload does not fit its capsule",
            });
        }
        let payload_words = n.div_ceil(8);
        let capsule_words = unit_count as usize * 2;
        // SAFETY: aligned words in and immediately before our capsule.
        unsafe {
            if !token::is_poisoned((base - 8) as *const u64, mode) {
                report::fatal(Violation::SelfCheck {
                    addr: base - 8,
                    detail: "base sentinel missing",
                });
            }
            for w in 0..payload_words {
                if token::is_poisoned((base + w * 8) as *const u64, mode) {
                    report::fatal(Violation::SelfCheck {
                        addr: base + w * 8,
                        detail: "payload word reads as poison",
                    });
                }
            }
            for w in payload_words..capsule_words {
                if !token::is_poisoned((base + w * 8) as *const u64, mode) {
                    report::fatal(Violation::SelfCheck {
                        addr: base + w * 8,
                        detail: "redzone word not poisoned",
                    });
                }
            }
        }
    }

    /// High-water of arena units ever handed out.
    #[must_use]
    pub fn arena_bump_units(&self) -> u32 {
        self.heap.lock().arena.bump()
    }

    /// Base address of the arena reservation.
    #[inline]
    #[must_use]
    pub fn arena_base(&self) -> usize {
        self.base
    }
}

impl Counters {
    fn new() -> Self {
        Self {
            allocations: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            carved_bytes: AtomicU64::new(0),
        }
    }
}

/// Capsule size in units: payload plus at least one trailing token word,
/// rounded up to a whole unit.
#[inline]
#[must_use]
pub fn capsule_units(n: usize) -> u32 {
    let bytes = n.checked_add(8).unwrap_or_else(|| {
        report::fatal_init(&ArenaError::Exhausted);
    });
    let units = bytes.div_ceil(UNIT_BYTES);
    u32::try_from(units).unwrap_or_else(|_| {
        report::fatal_init(&ArenaError::Exhausted);
    })
}

fn carve_or_die(heap: &mut Heap, unit_count: u32) -> u32 {
    match heap.arena.carve(unit_count) {
        Ok(offset) => offset,
        Err(error) => report::fatal_init(&error),
    }
}

// ---------------------------------------------------------------------------
// Global runtime
// ---------------------------------------------------------------------------

const STATE_UNINIT: u8 = 0;
const STATE_BUSY: u8 = 1;
const STATE_READY: u8 = 2;

static RUNTIME_STATE: AtomicU8 = AtomicU8::new(STATE_UNINIT);

struct RuntimeSlot(UnsafeCell<MaybeUninit<Runtime>>);

// SAFETY: the slot is written once while the state is BUSY and only read
// after the READY store that releases it.
unsafe impl Sync for RuntimeSlot {}

static RUNTIME_SLOT: RuntimeSlot = RuntimeSlot(UnsafeCell::new(MaybeUninit::uninit()));

/// The global runtime, initializing it from the environment on first call.
///
/// Non-blocking on purpose: reading the environment allocates, which
/// re-enters the interposed `malloc` on the same thread. A caller that
/// arrives while initialization is in flight gets `None` and passes the
/// operation through unchecked once, instead of deadlocking.
pub fn try_runtime() -> Option<&'static Runtime> {
    match RUNTIME_STATE.load(Ordering::Acquire) {
        // SAFETY: READY implies the slot was initialized and published.
        STATE_READY => Some(unsafe { (*RUNTIME_SLOT.0.get()).assume_init_ref() }),
        STATE_BUSY => None,
        _ => init_global(),
    }
}

/// The global runtime if it has already been initialized.
pub fn installed_runtime() -> Option<&'static Runtime> {
    if RUNTIME_STATE.load(Ordering::Acquire) == STATE_READY {
        // SAFETY: READY implies the slot was initialized and published.
        Some(unsafe { (*RUNTIME_SLOT.0.get()).assume_init_ref() })
    } else {
        None
    }
}

#[cold]
fn init_global() -> Option<&'static Runtime> {
    if RUNTIME_STATE
        .compare_exchange(
            STATE_UNINIT,
            STATE_BUSY,
            Ordering::Acquire,
            Ordering::Acquire,
        )
        .is_err()
    {
        return installed_runtime();
    }

    let options = match RuntimeOptions::from_env() {
        Ok(options) => options,
        Err(error) => report::fatal_init(&error),
    };
    let runtime = match Runtime::create(options, Some(GLOBAL_ARENA_BASE)) {
        Ok(runtime) => runtime,
        Err(error) => report::fatal_init(&error),
    };
    let stats = options.stats;
    // SAFETY: we own the BUSY state; no reader touches the slot before the
    // READY store below.
    unsafe { (*RUNTIME_SLOT.0.get()).write(runtime) };
    RUNTIME_STATE.store(STATE_READY, Ordering::Release);
    if stats {
        crate::stats::register_exit_dump();
    }
    installed_runtime()
}
