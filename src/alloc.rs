//! Region-based payload slot allocator.
//!
//! Payload slots are carved out of the store in regions of 512
//! consecutive slots (eight occupancy words). A worker claims a whole
//! region by CAS on the region-owner plane and then allocates from it
//! with plain loads and ORs; region ownership makes it the only writer
//! of those eight words until the next clear, so no CAS loop is needed
//! on the hot path.
//!
//! The current region of each worker is thread-local, keyed by a
//! per-table id and stamped with the table's clear epoch. Clearing
//! bumps the epoch, so every worker's cached region turns stale at
//! once without any cross-thread signalling, and one process can run
//! any number of tables.

use std::{
    cell::RefCell,
    collections::HashMap,
    io,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::bitmap::BitPlane;

/// Slots per allocation region: eight 64-bit occupancy words.
pub(crate) const REGION_SLOTS: u64 = 512;

const REGION_WORDS: u64 = REGION_SLOTS / 64;

/// Indices 0 and 1 are never handed out; 0 doubles as the "not found"
/// sentinel in directory slots.
pub(crate) const RESERVED_SLOTS: u64 = 2;

const RESERVED_MASK: u64 = 0xC000_0000_0000_0000;

const NO_REGION: u64 = u64::MAX;

static NEXT_TABLE_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// table id -> (clear epoch, owned region)
    static MY_REGION: RefCell<HashMap<u64, (u64, u64)>> = RefCell::new(HashMap::new());
}

pub(crate) struct SlotAllocator {
    region_owner: BitPlane,
    occupied: BitPlane,
    epoch: AtomicU64,
    id: u64,
}

impl SlotAllocator {
    pub(crate) fn with_capacity(max_slots: u64) -> io::Result<Self> {
        let alloc = Self {
            region_owner: BitPlane::with_bits(max_slots / REGION_SLOTS)?,
            occupied: BitPlane::with_bits(max_slots)?,
            epoch: AtomicU64::new(0),
            id: NEXT_TABLE_ID.fetch_add(1, Ordering::Relaxed),
        };
        alloc.reserve_low_slots();
        Ok(alloc)
    }

    /// The occupancy plane: one set bit per filled or reserved slot.
    pub(crate) fn occupied(&self) -> &BitPlane {
        &self.occupied
    }

    /// Claims a free payload slot for the calling worker, preferring
    /// its current region. Returns `None` when a full pass over the
    /// region directory finds nothing left to claim.
    pub(crate) fn claim(&self, table_size: u64) -> Option<u64> {
        let num_regions = table_size / REGION_SLOTS;
        let mut region = self.current_region();
        loop {
            if region == NO_REGION {
                // Fresh worker: spread first claims across the space.
                // The scan below advances before testing, so start one
                // region short of the bias target.
                region = first_region_for_worker(num_regions).wrapping_sub(1);
            } else if let Some(slot) = self.claim_in_region(region) {
                return Some(slot);
            }

            // Current region exhausted (or none); hunt for an
            // unclaimed one, wrapping at most once around.
            let mut remaining = num_regions;
            loop {
                if remaining == 0 {
                    return None;
                }
                remaining -= 1;
                region = region.wrapping_add(1);
                if region >= num_regions {
                    region = 0;
                }
                if self.region_owner.set(region) {
                    break;
                }
            }
            self.set_current_region(region);
        }
    }

    /// Returns a reserved slot that lost its directory CAS to an equal
    /// concurrent insert. Only the worker that claimed the slot calls
    /// this.
    pub(crate) fn release(&self, slot: u64) {
        self.occupied.clear(slot);
    }

    /// Re-occupies a dead slot kept alive by the notify sweep.
    pub(crate) fn resurrect(&self, slot: u64) {
        self.occupied.set(slot);
    }

    /// Rebuilds occupancy from the survivor plane, abandons all region
    /// ownership, and invalidates every worker's cached region.
    /// Callers must have quiesced the table.
    pub(crate) fn rebuild(&self, survivors: &BitPlane) {
        self.region_owner.discard();
        self.occupied.copy_from(survivors);
        self.reserve_low_slots();
        self.epoch.fetch_add(1, Ordering::Release);
    }

    fn reserve_low_slots(&self) {
        self.occupied.words()[0].fetch_or(RESERVED_MASK, Ordering::Relaxed);
    }

    /// Scans the eight occupancy words of an owned region for a clear
    /// bit, MSB first.
    fn claim_in_region(&self, region: u64) -> Option<u64> {
        let words = self.occupied.words();
        let base = (region * REGION_WORDS) as usize;
        for offset in 0..REGION_WORDS as usize {
            let word = &words[base + offset];
            let v = word.load(Ordering::Relaxed);
            if v != u64::MAX {
                let k = (!v).leading_zeros() as u64;
                word.fetch_or(0x8000_0000_0000_0000 >> k, Ordering::Relaxed);
                return Some((base + offset) as u64 * 64 + k);
            }
        }
        None
    }

    fn current_region(&self) -> u64 {
        let epoch = self.epoch.load(Ordering::Acquire);
        MY_REGION.with(|map| match map.borrow().get(&self.id) {
            Some(&(stamp, region)) if stamp == epoch => region,
            _ => NO_REGION,
        })
    }

    fn set_current_region(&self, region: u64) {
        let epoch = self.epoch.load(Ordering::Acquire);
        MY_REGION.with(|map| {
            map.borrow_mut().insert(self.id, (epoch, region));
        });
    }
}

fn first_region_for_worker(num_regions: u64) -> u64 {
    let worker = rayon::current_thread_index().unwrap_or(0) as u64;
    let workers = rayon::current_num_threads().max(1) as u64;
    worker * num_regions / workers
}

#[cfg(test)]
mod tests {
    use super::{SlotAllocator, REGION_SLOTS, RESERVED_SLOTS};
    use crate::bitmap::BitPlane;

    #[test]
    fn never_hands_out_reserved_slots() {
        let alloc = SlotAllocator::with_capacity(REGION_SLOTS).unwrap();
        let first = alloc.claim(REGION_SLOTS).unwrap();
        assert_eq!(first, RESERVED_SLOTS);
    }

    #[test]
    fn claims_are_distinct_until_full() {
        let alloc = SlotAllocator::with_capacity(REGION_SLOTS).unwrap();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..REGION_SLOTS - RESERVED_SLOTS {
            let slot = alloc.claim(REGION_SLOTS).unwrap();
            assert!(slot >= RESERVED_SLOTS);
            assert!(seen.insert(slot), "slot {slot} handed out twice");
        }
        assert_eq!(alloc.claim(REGION_SLOTS), None);
    }

    #[test]
    fn release_makes_the_slot_claimable_again() {
        let alloc = SlotAllocator::with_capacity(REGION_SLOTS).unwrap();
        for _ in 0..REGION_SLOTS - RESERVED_SLOTS {
            alloc.claim(REGION_SLOTS).unwrap();
        }
        alloc.release(100);
        assert_eq!(alloc.claim(REGION_SLOTS), Some(100));
    }

    #[test]
    fn spills_into_the_next_region() {
        let alloc = SlotAllocator::with_capacity(2 * REGION_SLOTS).unwrap();
        let mut last = 0;
        for _ in 0..2 * REGION_SLOTS - RESERVED_SLOTS {
            last = alloc.claim(2 * REGION_SLOTS).unwrap();
        }
        assert!(last >= REGION_SLOTS);
        assert_eq!(alloc.claim(2 * REGION_SLOTS), None);
    }

    #[test]
    fn rebuild_keeps_survivors_and_reserved_bits() {
        let alloc = SlotAllocator::with_capacity(REGION_SLOTS).unwrap();
        for _ in 0..100 {
            alloc.claim(REGION_SLOTS).unwrap();
        }
        let survivors = BitPlane::with_bits(REGION_SLOTS).unwrap();
        survivors.set(5);
        survivors.set(90);

        alloc.rebuild(&survivors);

        assert!(alloc.occupied().get(0));
        assert!(alloc.occupied().get(1));
        assert!(alloc.occupied().get(5));
        assert!(alloc.occupied().get(90));
        assert_eq!(alloc.occupied().count_range(0, REGION_SLOTS), 4);

        // The stale region cache is invalidated, and freshly claimed
        // slots avoid the survivors.
        let mut seen = std::collections::HashSet::new();
        while let Some(slot) = alloc.claim(REGION_SLOTS) {
            assert!(slot >= RESERVED_SLOTS);
            assert!(slot != 5 && slot != 90);
            seen.insert(slot);
        }
        assert_eq!(seen.len() as u64, REGION_SLOTS - RESERVED_SLOTS - 2);
    }
}
