//! The arena: one contiguous virtual reservation all instrumented
//! allocations are carved from.
//!
//! The whole pool is reserved `PROT_NONE` up front, so its bounds are fixed
//! for the life of the process and "is this an arena pointer" is plain
//! arithmetic with no lock. Backing memory is committed on demand in
//! page-multiple chunks as the bump pointer advances. Carving never recycles;
//! reuse of freed capsules is the quarantine's business.

use thiserror::Error;

use crate::{PAGE_SIZE, UNIT_BYTES};

/// Minimum number of bytes committed per growth step.
pub const GROWTH_CHUNK: usize = 32 * 1024;

/// Fixed base of the global arena. Unit tests pass no hint and take a
/// kernel-chosen base so many arenas can coexist in one process.
pub const GLOBAL_ARENA_BASE: usize = 0x5a00_0000_0000;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ArenaError {
    #[error("failed to reserve the arena pool")]
    Reserve,
    #[error("out of arena memory")]
    Exhausted,
    #[error("failed to grow the arena mapping")]
    Commit,
}

/// The pool. All offsets are in 16-byte units.
pub struct Arena {
    base: usize,
    pool_units: u32,
    /// High-water of units ever handed out. Monotone.
    bump: u32,
    /// High-water of committed backing bytes.
    mapped_bytes: usize,
    populate: bool,
}

impl Arena {
    /// Reserve `pool_size` bytes of address space, committed lazily.
    ///
    /// With a base hint the reservation is placed exactly there
    /// (`MAP_FIXED_NOREPLACE`); without one the kernel chooses.
    pub fn reserve(
        base_hint: Option<usize>,
        pool_size: usize,
        populate: bool,
    ) -> Result<Self, ArenaError> {
        debug_assert!(pool_size.is_multiple_of(PAGE_SIZE));
        let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
        if base_hint.is_some() {
            flags |= libc::MAP_FIXED_NOREPLACE;
        }
        // SAFETY: anonymous PROT_NONE reservation; never touches existing
        // mappings (NOREPLACE when a fixed base is requested).
        let base = unsafe {
            libc::mmap(
                base_hint.unwrap_or(0) as *mut libc::c_void,
                pool_size,
                libc::PROT_NONE,
                flags,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(ArenaError::Reserve);
        }
        Ok(Self {
            base: base as usize,
            pool_units: (pool_size / UNIT_BYTES) as u32,
            bump: 0,
            mapped_bytes: 0,
            populate,
        })
    }

    /// A zero-size arena for the disabled runtime: contains nothing, carves
    /// nothing.
    pub fn empty() -> Self {
        Self {
            base: 0,
            pool_units: 0,
            bump: 0,
            mapped_bytes: 0,
            populate: false,
        }
    }

    /// Hand out `unit_count` fresh units, committing backing pages as
    /// needed. Returns the unit offset of the new capsule.
    pub fn carve(&mut self, unit_count: u32) -> Result<u32, ArenaError> {
        let offset = self.bump;
        let next = offset
            .checked_add(unit_count)
            .ok_or(ArenaError::Exhausted)?;
        if next > self.pool_units {
            return Err(ArenaError::Exhausted);
        }
        let needed_bytes = next as usize * UNIT_BYTES;
        if needed_bytes > self.mapped_bytes {
            self.commit_through(needed_bytes)?;
        }
        self.bump = next;
        Ok(offset)
    }

    fn commit_through(&mut self, needed_bytes: usize) -> Result<(), ArenaError> {
        let grow = (needed_bytes - self.mapped_bytes).max(GROWTH_CHUNK);
        let grow = grow
            .next_multiple_of(PAGE_SIZE)
            .min(self.pool_units as usize * UNIT_BYTES - self.mapped_bytes);
        let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED;
        if self.populate {
            flags |= libc::MAP_POPULATE;
        }
        // SAFETY: re-maps a window inside our own PROT_NONE reservation as
        // readable/writable, demand-zero.
        let mapped = unsafe {
            libc::mmap(
                (self.base + self.mapped_bytes) as *mut libc::c_void,
                grow,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if mapped == libc::MAP_FAILED {
            return Err(ArenaError::Commit);
        }
        self.mapped_bytes += grow;
        Ok(())
    }

    #[inline]
    #[must_use]
    pub fn base(&self) -> usize {
        self.base
    }

    #[inline]
    #[must_use]
    pub fn pool_units(&self) -> u32 {
        self.pool_units
    }

    /// Units ever handed out.
    #[inline]
    #[must_use]
    pub fn bump(&self) -> u32 {
        self.bump
    }

    /// Committed backing bytes.
    #[inline]
    #[must_use]
    pub fn mapped_bytes(&self) -> usize {
        self.mapped_bytes
    }

    /// Address of a unit offset.
    #[inline]
    #[must_use]
    pub fn addr_of(&self, unit: u32) -> usize {
        self.base + unit as usize * UNIT_BYTES
    }

    /// Unit offset of an address inside the pool.
    #[inline]
    #[must_use]
    pub fn unit_of(&self, addr: usize) -> u32 {
        debug_assert!(addr >= self.base);
        ((addr - self.base) / UNIT_BYTES) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_arena() -> Arena {
        Arena::reserve(None, 1024 * 1024, false).expect("reserve")
    }

    #[test]
    fn carve_advances_monotonically() {
        let mut arena = small_arena();
        let a = arena.carve(4).expect("carve a");
        let b = arena.carve(2).expect("carve b");
        assert_eq!(a, 0);
        assert_eq!(b, 4);
        assert_eq!(arena.bump(), 6);
        assert_eq!(arena.addr_of(b), arena.base() + 4 * UNIT_BYTES);
    }

    #[test]
    fn carved_memory_is_writable_and_zero() {
        let mut arena = small_arena();
        let off = arena.carve(8).expect("carve");
        let p = arena.addr_of(off) as *mut u64;
        for i in 0..16 {
            // SAFETY: 8 units = 16 words just carved and committed.
            unsafe {
                assert_eq!(*p.add(i), 0, "demand-zero word {i}");
                *p.add(i) = 0xDEAD_BEEF;
            }
        }
    }

    #[test]
    fn growth_is_chunked_and_page_aligned() {
        let mut arena = small_arena();
        arena.carve(1).expect("carve");
        assert_eq!(arena.mapped_bytes(), GROWTH_CHUNK);
        // Everything inside the first chunk carves without further mapping.
        arena
            .carve((GROWTH_CHUNK / UNIT_BYTES) as u32 - 2)
            .expect("fill chunk");
        assert_eq!(arena.mapped_bytes(), GROWTH_CHUNK);
        // One more unit forces the next chunk.
        arena.carve(2).expect("cross chunk");
        assert_eq!(arena.mapped_bytes(), 2 * GROWTH_CHUNK);
        assert!(arena.mapped_bytes().is_multiple_of(PAGE_SIZE));
    }

    #[test]
    fn exhaustion_is_reported_not_mapped() {
        let mut arena = Arena::reserve(None, PAGE_SIZE * 2, false).expect("reserve");
        let units = arena.pool_units();
        arena.carve(units).expect("fill pool");
        assert_eq!(arena.carve(1), Err(ArenaError::Exhausted));
    }

    #[test]
    fn large_carve_commits_more_than_one_chunk_at_once() {
        let mut arena = small_arena();
        let units = (3 * GROWTH_CHUNK / UNIT_BYTES) as u32;
        arena.carve(units).expect("large carve");
        assert!(arena.mapped_bytes() >= 3 * GROWTH_CHUNK);
    }

    #[test]
    fn empty_arena_contains_nothing() {
        let arena = Arena::empty();
        assert_eq!(arena.pool_units(), 0);
    }
}
