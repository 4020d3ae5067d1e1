// SPDX-License-Identifier: MPL-2.0

//! Packet identifier allocation for outgoing QoS 1 and QoS 2 publishes.
//!
//! Implements requirements from MQTT 5.0:
//! - [MQTT-2.2.1-3] Each time a Client sends a new PUBLISH packet it MUST assign
//!   a currently unused non-zero Packet Identifier.
//! - The number of concurrently used identifiers is bounded by the broker's
//!   Receive Maximum, which may change on every reconnect.

use tracing::{debug, error};

/// Outcome of [`PacketIdPool::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// The identifier is free again.
    Released,
    /// The identifier was the last one owned above a lowered ceiling; the pool
    /// capacity now matches the ceiling.
    ShrinkCompleted,
    /// The identifier was not owned. Nothing changed.
    NotOwned,
}

/// A pool of identifiers in `[1, max]`, handed out lowest first.
///
/// Free identifiers are kept as sorted, disjoint, non-adjacent inclusive
/// ranges so acquiring is O(1) and the common "everything free" case is a
/// single range.
///
/// Lowering the ceiling with [`resize`](Self::resize) cannot take back
/// identifiers still owned above the new ceiling. Those stay owned until they
/// are released; the pool only shrinks once the last of them comes back.
///
/// Not synchronized: the pool belongs to one execution context.
#[derive(Debug)]
pub struct PacketIdPool {
    /// Current ceiling, no identifier above it is handed out.
    max: u16,
    /// Highest identifier tracked. Above `max` only while a shrink is pending.
    high: u16,
    free: Vec<(u16, u16)>,
    in_use: usize,
    pending_shrink: usize,
}

impl PacketIdPool {
    /// Creates a pool of identifiers `1..=max`. A `max` of 0 is raised to 1.
    pub fn new(max: u16) -> Self {
        let max = max.max(1);
        Self {
            max,
            high: max,
            free: vec![(1, max)],
            in_use: 0,
            pending_shrink: 0,
        }
    }

    /// Hands out the lowest free identifier not above the ceiling.
    pub fn acquire(&mut self) -> Option<u16> {
        let first = self.free.first_mut()?;
        if first.0 > self.max {
            return None;
        }
        let id = first.0;
        if first.0 == first.1 {
            self.free.remove(0);
        } else {
            first.0 += 1;
        }
        self.in_use += 1;
        Some(id)
    }

    /// Returns `id` to the pool.
    pub fn release(&mut self, id: u16) -> Release {
        if id == 0 || id > self.high || self.is_free(id) {
            error!(packet_id = id, "released a packet identifier that is not owned, this is a bug");
            return Release::NotOwned;
        }
        self.insert_free(id);
        self.in_use -= 1;

        if id > self.max && self.pending_shrink > 0 {
            self.pending_shrink -= 1;
            if self.pending_shrink == 0 {
                self.finish_shrink();
                return Release::ShrinkCompleted;
            }
        }
        Release::Released
    }

    /// Moves the ceiling to `new_max` and returns how many identifiers above
    /// the new ceiling are still owned.
    ///
    /// Growing takes effect immediately. Shrinking completes immediately when
    /// the returned count is 0, otherwise when the last of those identifiers
    /// is released.
    pub fn resize(&mut self, new_max: u16) -> usize {
        let new_max = new_max.max(1);
        if new_max > self.high {
            self.insert_free_range(self.high + 1, new_max);
            self.high = new_max;
        }
        self.max = new_max;

        let above = usize::from(self.high - self.max);
        self.pending_shrink = above - self.free_between(self.max + 1, self.high);
        if self.pending_shrink == 0 {
            self.finish_shrink();
        }
        debug!(
            max = self.max,
            pending_shrink = self.pending_shrink,
            "packet identifier pool resized"
        );
        self.pending_shrink
    }

    pub fn max(&self) -> u16 {
        self.max
    }

    /// Capacity actually tracked; above `max` only while a shrink is pending.
    pub fn capacity(&self) -> u16 {
        self.high
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Number of identifiers that [`acquire`](Self::acquire) can still hand out.
    pub fn available(&self) -> usize {
        self.free_between(1, self.max)
    }

    pub fn pending_shrink(&self) -> usize {
        self.pending_shrink
    }

    pub fn is_in_use(&self, id: u16) -> bool {
        id != 0 && id <= self.high && !self.is_free(id)
    }

    fn is_free(&self, id: u16) -> bool {
        let idx = self.free.partition_point(|r| r.1 < id);
        self.free.get(idx).is_some_and(|r| r.0 <= id)
    }

    fn free_between(&self, lo: u16, hi: u16) -> usize {
        if lo > hi {
            return 0;
        }
        self.free
            .iter()
            .filter(|r| r.1 >= lo && r.0 <= hi)
            .map(|r| usize::from(r.1.min(hi) - r.0.max(lo)) + 1)
            .sum()
    }

    fn finish_shrink(&mut self) {
        let max = self.max;
        self.free.retain(|r| r.0 <= max);
        if let Some(last) = self.free.last_mut() {
            last.1 = last.1.min(max);
        }
        self.high = max;
    }

    fn insert_free(&mut self, id: u16) {
        self.insert_free_range(id, id);
    }

    /// Inserts `[lo, hi]`, which must not overlap any free range.
    fn insert_free_range(&mut self, lo: u16, hi: u16) {
        let idx = self.free.partition_point(|r| r.0 < lo);
        let joins_prev = idx > 0 && self.free[idx - 1].1.checked_add(1) == Some(lo);
        let joins_next = idx < self.free.len() && hi.checked_add(1) == Some(self.free[idx].0);

        match (joins_prev, joins_next) {
            (true, true) => {
                self.free[idx - 1].1 = self.free[idx].1;
                self.free.remove(idx);
            }
            (true, false) => self.free[idx - 1].1 = hi,
            (false, true) => self.free[idx].0 = lo,
            (false, false) => self.free.insert(idx, (lo, hi)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_sequential_allocation() {
        let mut pool = PacketIdPool::new(3);
        assert_eq!(pool.acquire(), Some(1));
        assert_eq!(pool.acquire(), Some(2));
        assert_eq!(pool.acquire(), Some(3));
        assert_eq!(pool.acquire(), None);
        assert_eq!(pool.in_use(), 3);
    }

    #[test]
    fn test_release_and_reuse_lowest() {
        let mut pool = PacketIdPool::new(5);
        let ids: Vec<u16> = (0..5).filter_map(|_| pool.acquire()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);

        assert_eq!(pool.release(4), Release::Released);
        assert_eq!(pool.release(2), Release::Released);
        assert!(!pool.is_in_use(2));
        assert!(pool.is_in_use(3));

        assert_eq!(pool.acquire(), Some(2));
        assert_eq!(pool.acquire(), Some(4));
        assert_eq!(pool.acquire(), None);
    }

    #[test]
    fn test_double_release_is_rejected() {
        let mut pool = PacketIdPool::new(4);
        let id = pool.acquire().unwrap();
        assert_eq!(pool.release(id), Release::Released);
        assert_eq!(pool.release(id), Release::NotOwned);
        assert_eq!(pool.release(0), Release::NotOwned);
        assert_eq!(pool.release(9), Release::NotOwned);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_no_identifier_handed_out_twice() {
        let mut pool = PacketIdPool::new(64);
        let mut owned = HashSet::new();

        // interleave acquisitions and releases in a fixed pseudo-random pattern
        let mut seed: u32 = 7;
        for _ in 0..2000 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            if seed % 3 != 0 {
                if let Some(id) = pool.acquire() {
                    assert!(owned.insert(id), "identifier {} handed out twice", id);
                }
            } else if let Some(&id) = owned.iter().next() {
                owned.remove(&id);
                assert_eq!(pool.release(id), Release::Released);
            }
            assert_eq!(pool.in_use(), owned.len());
        }

        for id in owned.drain() {
            pool.release(id);
        }
        assert_eq!(pool.available(), 64);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_grow_is_immediate() {
        let mut pool = PacketIdPool::new(2);
        pool.acquire();
        pool.acquire();
        assert_eq!(pool.acquire(), None);

        assert_eq!(pool.resize(4), 0);
        assert_eq!(pool.acquire(), Some(3));
        assert_eq!(pool.acquire(), Some(4));
        assert_eq!(pool.acquire(), None);
    }

    #[test]
    fn test_shrink_without_owned_ids_above_is_immediate() {
        let mut pool = PacketIdPool::new(10);
        pool.acquire();
        pool.acquire();

        assert_eq!(pool.resize(4), 0);
        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_shrink_is_deferred_until_ids_above_are_released() {
        let mut pool = PacketIdPool::new(6);
        for _ in 0..6 {
            pool.acquire();
        }

        // 5 and 6 are still owned above the new ceiling
        assert_eq!(pool.resize(4), 2);
        assert_eq!(pool.capacity(), 6);
        assert_eq!(pool.pending_shrink(), 2);

        assert_eq!(pool.release(2), Release::Released);
        assert_eq!(pool.release(6), Release::Released);
        assert_eq!(pool.pending_shrink(), 1);
        assert_eq!(pool.capacity(), 6);

        // released ids above the ceiling are never handed out again
        assert_eq!(pool.acquire(), Some(2));
        assert_eq!(pool.acquire(), None);

        assert_eq!(pool.release(5), Release::ShrinkCompleted);
        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.pending_shrink(), 0);
        assert_eq!(pool.acquire(), None);
    }

    #[test]
    fn test_grow_while_shrink_pending() {
        let mut pool = PacketIdPool::new(10);
        for _ in 0..10 {
            pool.acquire();
        }
        pool.release(9);

        // 6, 7, 8 and 10 remain owned above 5
        assert_eq!(pool.resize(5), 4);

        // raising to 8 leaves only 10 pending
        assert_eq!(pool.resize(8), 1);
        assert_eq!(pool.acquire(), None);
        pool.release(7);
        assert_eq!(pool.acquire(), Some(7));

        assert_eq!(pool.release(10), Release::ShrinkCompleted);
        assert_eq!(pool.capacity(), 8);

        // and raising beyond the old capacity re-exposes everything
        assert_eq!(pool.resize(12), 0);
        assert_eq!(pool.available(), 4);
        assert_eq!(pool.acquire(), Some(9));
    }
}
