//! Delayed-reuse pool of freed capsules, organized by size class.
//!
//! Twenty FIFO buckets hold [`FreeNode`] entries describing freed capsules;
//! bucket `i` holds capsules whose unit count has `floor(log2) + 1 == i`
//! (bucket 19 is the catch-all). FIFO insertion maximizes residency time
//! before reuse, so a stale access has the longest possible window to hit
//! poison. The quarantine works purely on unit offsets; poisoning the bytes
//! of a capsule is the caller's job.
//!
//! Nodes come from a recycle list first, then from a dedicated node pool
//! committed in two-page steps. When the node pool runs dry the released
//! capsule leaks silently: leaking is preferable to corrupting the lists.

use thiserror::Error;

use crate::PAGE_SIZE;

/// Number of size-class buckets.
pub const BUCKETS: usize = 20;

/// How many entries of the home bucket are examined per allocation.
const SCAN_LIMIT: usize = 8;

/// Reservation for the node pool: 8 MiB, half a million nodes.
const NODE_POOL_BYTES: usize = 8 * 1024 * 1024;

/// Node-pool commit step.
const NODE_POOL_CHUNK: usize = 2 * PAGE_SIZE;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QuarantineError {
    #[error("failed to reserve the quarantine node pool")]
    Reserve,
}

/// One parked capsule: offset and length in units, plus the intrusive link.
#[repr(C)]
struct FreeNode {
    unit_offset: u32,
    unit_count: u32,
    next: *mut FreeNode,
}

#[derive(Clone, Copy)]
struct Bucket {
    front: *mut FreeNode,
    back: *mut FreeNode,
}

impl Bucket {
    const EMPTY: Self = Self {
        front: std::ptr::null_mut(),
        back: std::ptr::null_mut(),
    };
}

struct NodePool {
    base: usize,
    committed: usize,
    used: usize,
}

pub struct Quarantine {
    buckets: [Bucket; BUCKETS],
    /// Sum of `unit_count` over all parked capsules.
    usage_units: u64,
    pool: NodePool,
    recycled: *mut FreeNode,
}

// SAFETY: all nodes are owned exclusively by this structure and only
// reachable through it; access is serialized by the allocator lock.
unsafe impl Send for Quarantine {}

/// Size class of a capsule: `min(19, floor(log2(unit_count)) + 1)`.
#[inline]
#[must_use]
pub fn size_class(unit_count: u32) -> usize {
    if unit_count == 0 {
        0
    } else {
        (32 - unit_count.leading_zeros() as usize).min(BUCKETS - 1)
    }
}

impl Quarantine {
    /// Reserve the node pool; nothing is committed until the first insert.
    pub fn new() -> Result<Self, QuarantineError> {
        // SAFETY: anonymous PROT_NONE reservation at a kernel-chosen base.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                NODE_POOL_BYTES,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(QuarantineError::Reserve);
        }
        Ok(Self {
            buckets: [Bucket::EMPTY; BUCKETS],
            usage_units: 0,
            pool: NodePool {
                base: base as usize,
                committed: 0,
                used: 0,
            },
            recycled: std::ptr::null_mut(),
        })
    }

    /// Parked units across all buckets.
    #[inline]
    #[must_use]
    pub fn usage_units(&self) -> u64 {
        self.usage_units
    }

    /// Park a freed capsule at the back of its class bucket.
    ///
    /// On node-pool exhaustion the capsule is dropped on the floor (it stays
    /// poisoned forever, which is safe, just wasteful).
    pub fn insert(&mut self, unit_offset: u32, unit_count: u32) {
        debug_assert!(unit_count > 0);
        let Some(node) = self.take_node() else {
            return;
        };
        // SAFETY: take_node returns a live, exclusively-owned node.
        unsafe {
            (*node).unit_offset = unit_offset;
            (*node).unit_count = unit_count;
            (*node).next = std::ptr::null_mut();
        }
        let bucket = &mut self.buckets[size_class(unit_count)];
        if bucket.back.is_null() {
            bucket.front = node;
        } else {
            // SAFETY: a non-null back is a live node owned by this bucket.
            unsafe { (*bucket.back).next = node };
        }
        bucket.back = node;
        self.usage_units += u64::from(unit_count);
    }

    /// Take `unit_count` units out of quarantine, if a large-enough capsule
    /// is parked. Returns the unit offset of the reclaimed region.
    ///
    /// The home bucket is scanned a few entries deep; for larger buckets
    /// only the front entry is considered (their entries are usually, but
    /// not provably, large enough — hence the explicit size check).
    pub fn try_allocate(&mut self, unit_count: u32) -> Option<u32> {
        let home = size_class(unit_count);
        let mut found: Option<(usize, *mut FreeNode, *mut FreeNode)> = None;

        let mut prev: *mut FreeNode = std::ptr::null_mut();
        let mut node = self.buckets[home].front;
        for _ in 0..SCAN_LIMIT {
            if node.is_null() {
                break;
            }
            // SAFETY: list nodes are live while linked.
            if unsafe { (*node).unit_count } >= unit_count {
                found = Some((home, prev, node));
                break;
            }
            prev = node;
            // SAFETY: as above.
            node = unsafe { (*node).next };
        }

        if found.is_none() {
            for class in home + 1..BUCKETS {
                let front = self.buckets[class].front;
                if front.is_null() {
                    continue;
                }
                // SAFETY: as above.
                if unsafe { (*front).unit_count } >= unit_count {
                    found = Some((class, std::ptr::null_mut(), front));
                    break;
                }
            }
        }

        let (class, prev, node) = found?;
        self.unlink(class, prev, node);
        // The caller receives only what it asked for; a residual stays
        // parked, so usage drops by the request alone.
        self.usage_units -= u64::from(unit_count);

        // SAFETY: unlinked node is exclusively ours.
        let (node_offset, node_count) = unsafe { ((*node).unit_offset, (*node).unit_count) };
        if node_count == unit_count {
            self.recycle_node(node);
            return Some(node_offset);
        }

        // Oversized: slice the high end off for the caller and park the low
        // residual at the front of its class, reusing the node. Returning
        // the high end leaves the low capsule boundary untouched; front
        // insertion gives residuals LIFO reuse.
        let residual = node_count - unit_count;
        let bucket = &mut self.buckets[size_class(residual)];
        // SAFETY: as above.
        unsafe {
            (*node).unit_count = residual;
            (*node).next = bucket.front;
        }
        bucket.front = node;
        if bucket.back.is_null() {
            bucket.back = node;
        }
        Some(node_offset + residual)
    }

    fn unlink(&mut self, class: usize, prev: *mut FreeNode, node: *mut FreeNode) {
        let bucket = &mut self.buckets[class];
        // SAFETY: node is live while linked.
        let next = unsafe { (*node).next };
        if bucket.front == node && bucket.back == node {
            bucket.front = std::ptr::null_mut();
            bucket.back = std::ptr::null_mut();
        } else if bucket.front == node {
            bucket.front = next;
        } else {
            debug_assert!(!prev.is_null());
            // SAFETY: prev is the tracked predecessor of node.
            unsafe { (*prev).next = next };
            if bucket.back == node {
                bucket.back = prev;
            }
        }
    }

    fn take_node(&mut self) -> Option<*mut FreeNode> {
        if !self.recycled.is_null() {
            let node = self.recycled;
            // SAFETY: recycle-list nodes are live and exclusively ours.
            self.recycled = unsafe { (*node).next };
            return Some(node);
        }
        let size = std::mem::size_of::<FreeNode>();
        if self.pool.used + size > self.pool.committed {
            if self.pool.committed + NODE_POOL_CHUNK > NODE_POOL_BYTES {
                return None;
            }
            // SAFETY: commits the next chunk inside our own reservation.
            let mapped = unsafe {
                libc::mmap(
                    (self.pool.base + self.pool.committed) as *mut libc::c_void,
                    NODE_POOL_CHUNK,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
                    -1,
                    0,
                )
            };
            if mapped == libc::MAP_FAILED {
                return None;
            }
            self.pool.committed += NODE_POOL_CHUNK;
        }
        let node = (self.pool.base + self.pool.used) as *mut FreeNode;
        self.pool.used += size;
        Some(node)
    }

    fn recycle_node(&mut self, node: *mut FreeNode) {
        // SAFETY: unlinked node is exclusively ours.
        unsafe { (*node).next = self.recycled };
        self.recycled = node;
    }

    #[cfg(test)]
    fn bucket_entries(&self, class: usize) -> Vec<(u32, u32)> {
        let mut out = Vec::new();
        let mut node = self.buckets[class].front;
        while !node.is_null() {
            // SAFETY: list nodes are live while linked.
            unsafe {
                out.push(((*node).unit_offset, (*node).unit_count));
                node = (*node).next;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_class_matches_log2_plus_one() {
        assert_eq!(size_class(0), 0);
        assert_eq!(size_class(1), 1);
        assert_eq!(size_class(2), 2);
        assert_eq!(size_class(3), 2);
        assert_eq!(size_class(4), 3);
        assert_eq!(size_class(1023), 10);
        assert_eq!(size_class(1024), 11);
        assert_eq!(size_class(u32::MAX), 19);
    }

    #[test]
    fn insert_then_allocate_is_fifo_within_a_bucket() {
        let mut q = Quarantine::new().expect("quarantine");
        q.insert(10, 4);
        q.insert(20, 4);
        q.insert(30, 4);
        assert_eq!(q.usage_units(), 12);
        assert_eq!(q.try_allocate(4), Some(10));
        assert_eq!(q.try_allocate(4), Some(20));
        assert_eq!(q.try_allocate(4), Some(30));
        assert_eq!(q.try_allocate(4), None);
        assert_eq!(q.usage_units(), 0);
    }

    #[test]
    fn too_small_entries_are_skipped_within_the_scan_window() {
        let mut q = Quarantine::new().expect("quarantine");
        // Class 3 holds counts 4..=7; a request for 6 must skip the 4s.
        q.insert(0, 4);
        q.insert(4, 4);
        q.insert(8, 6);
        assert_eq!(q.try_allocate(6), Some(8));
        // The skipped entries are still parked.
        assert_eq!(q.usage_units(), 8);
    }

    #[test]
    fn deep_entries_beyond_the_scan_window_are_not_found() {
        let mut q = Quarantine::new().expect("quarantine");
        for i in 0..SCAN_LIMIT as u32 {
            q.insert(i * 4, 4);
        }
        q.insert(100, 7); // ninth entry of class 3
        assert_eq!(q.try_allocate(7), None);
    }

    #[test]
    fn empty_home_bucket_falls_through_to_a_larger_bucket() {
        let mut q = Quarantine::new().expect("quarantine");
        q.insert(0, 64); // class 7
        // Home bucket of 8 (class 4) is empty; class 7's front serves the
        // request, sliced from the high end.
        assert_eq!(q.try_allocate(8), Some(56));
        assert_eq!(q.bucket_entries(size_class(56)), vec![(0, 56)]);
    }

    #[test]
    fn catch_all_front_is_size_checked() {
        let mut q = Quarantine::new().expect("quarantine");
        // Both land in the clamped catch-all bucket despite differing sizes,
        // so the front really can be too small there.
        q.insert(0, 1 << 19);
        assert_eq!(size_class(1 << 19), BUCKETS - 1);
        assert_eq!(size_class(1 << 20), BUCKETS - 1);
        assert_eq!(q.try_allocate(1 << 20), None);
    }

    #[test]
    fn oversized_match_returns_the_high_end_and_parks_the_residual() {
        let mut q = Quarantine::new().expect("quarantine");
        q.insert(100, 16);
        let got = q.try_allocate(6).expect("split allocate");
        // High end: offset 100 + (16 - 6).
        assert_eq!(got, 110);
        assert_eq!(q.usage_units(), 10);
        // Residual of 10 units sits at the front of class 4.
        assert_eq!(q.bucket_entries(size_class(10)), vec![(100, 10)]);
        // And the residual itself is immediately allocatable: split
        // halves never overlap.
        let rest = q.try_allocate(10).expect("residual allocate");
        assert_eq!(rest, 100);
        assert!(got >= rest + 10, "split halves must not overlap");
    }

    #[test]
    fn residuals_are_reused_lifo() {
        let mut q = Quarantine::new().expect("quarantine");
        q.insert(0, 12);
        q.insert(50, 12);
        // Both inserts land in class 4 (8..=15). Splitting the first leaves
        // a residual that must sit in FRONT of the second entry's class
        // when classes collide.
        let first = q.try_allocate(3).expect("first");
        assert_eq!(first, 9);
        // Residual (0, 9) is class 4, in front of (50, 12).
        assert_eq!(q.bucket_entries(4), vec![(0, 9), (50, 12)]);
    }

    #[test]
    fn unlinking_the_back_entry_keeps_the_list_consistent() {
        let mut q = Quarantine::new().expect("quarantine");
        q.insert(0, 4);
        q.insert(10, 6);
        // 6 is findable only as the second (back) entry of class 3.
        assert_eq!(q.try_allocate(6), Some(10));
        // The bucket must still accept appends after losing its back.
        q.insert(20, 4);
        assert_eq!(q.bucket_entries(3), vec![(0, 4), (20, 4)]);
    }

    #[test]
    fn nodes_are_recycled_after_exact_matches() {
        let mut q = Quarantine::new().expect("quarantine");
        let before_nodes = q.pool.used;
        q.insert(0, 4);
        assert!(q.pool.used > before_nodes);
        let after_insert = q.pool.used;
        q.try_allocate(4).expect("exact");
        // The next insert reuses the recycled node, not pool space.
        q.insert(8, 4);
        assert_eq!(q.pool.used, after_insert);
    }

    #[test]
    fn usage_accounting_survives_a_mixed_sequence() {
        let mut q = Quarantine::new().expect("quarantine");
        let mut expected = 0u64;
        for i in 0..100u32 {
            let count = 1 + (i % 17);
            q.insert(i * 32, count);
            expected += u64::from(count);
        }
        assert_eq!(q.usage_units(), expected);
        for _ in 0..50 {
            if q.try_allocate(3).is_some() {
                expected -= 3;
            }
            assert_eq!(q.usage_units(), expected);
        }
    }
}
