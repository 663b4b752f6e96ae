//! The unique table: a hash directory over a payload store.
//!
//! The directory is an array of 64-bit slots, each either empty (`0`)
//! or `tag20 | index44`: a 20-bit hash tag for fast reject plus the
//! index of a two-word payload. Insertion probes linearly inside one
//! cache line, re-mixing the hash to jump to a new line when the
//! current one is exhausted, and publishes with a single CAS from `0`.
//! A filled slot never changes until the whole directory is cleared,
//! so readers that observe a non-zero slot may read the payload it
//! points at without further synchronization.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::{
    alloc::{SlotAllocator, REGION_SLOTS, RESERVED_SLOTS},
    bitmap::BitPlane,
    error::TableError,
    hash,
    mem::AnonRegion,
    sweep,
};

/// Smallest permitted table size: one allocation region.
pub(crate) const MIN_TABLE_SIZE: usize = REGION_SLOTS as usize;

const INDEX_MASK: u64 = 0x0000_0FFF_FFFF_FFFF;
const TAG_MASK: u64 = 0xFFFF_F000_0000_0000;

/// Directory slots per 64-byte cache line.
const SLOTS_PER_LINE: u64 = 8;
const LINE_MASK: u64 = !(SLOTS_PER_LINE - 1);
const LINE_MASK_R: u64 = SLOTS_PER_LINE - 1;

/// Replacement mixer for the custom insertion path: `(a, b, seed)` to
/// a 64-bit hash. Chained for each probe restart like the default
/// mixer.
pub type HashFn = dyn Fn(u64, u64, u64) -> u64 + Send + Sync;

/// Replacement equality for the custom insertion path:
/// `(a, b, stored_a, stored_b)`.
pub type EqualsFn = dyn Fn(u64, u64, u64, u64) -> bool + Send + Sync;

/// Death notification: receives the dying slot index during
/// [`notify_all`][UniqueTable::notify_all]; returning `true` keeps the
/// slot alive.
pub type DeadFn = dyn Fn(u64) -> bool + Send + Sync;

/// A lock-free, fixed-capacity unique table for two-word payloads.
///
/// `lookup` maps a payload to a stable index, inserting it on first
/// sight; equal payloads always map to the same index. Any number of
/// threads may call the lookup operations concurrently. Liveness is
/// managed by a client-driven mark/sweep cycle:
///
/// 1. quiesce all lookups;
/// 2. [`mark`][Self::mark] every payload to keep;
/// 3. [`clear`][Self::clear] the directory;
/// 4. [`notify_all`][Self::notify_all] to fire death notifications
///    (optional);
/// 5. [`rehash`][Self::rehash] to re-publish the survivors.
///
/// The GC entry points themselves must not run concurrently with
/// lookups; that exclusion is the caller's responsibility.
pub struct UniqueTable {
    directory: AnonRegion,
    payload: AnonRegion,
    alloc: SlotAllocator,
    marks: BitPlane,
    notify: BitPlane,
    custom: BitPlane,
    max_size: usize,
    table_size: AtomicUsize,
    /// `table_size - 1` when the size is a power of two, else `0` and
    /// the start index is taken modulo `table_size`.
    mask: AtomicU64,
    /// Probe budget, in cache lines.
    threshold: AtomicUsize,
    hash_cb: Option<Box<HashFn>>,
    equals_cb: Option<Box<EqualsFn>>,
    dead_cb: Option<Box<DeadFn>>,
}

impl UniqueTable {
    /// Creates a table with `initial_size` live slots out of a
    /// reserved maximum of `max_size`.
    ///
    /// Virtual address space for the directory, the payload store, and
    /// the bit planes is reserved for `max_size` up front, so
    /// [`resize`][Self::resize] never remaps. Both sizes must be
    /// multiples of the 512-slot region, `initial_size` at least 512
    /// and at most `max_size`, and `max_size` within the 44-bit index
    /// space of a directory slot.
    pub fn with_capacity(initial_size: usize, max_size: usize) -> Result<Self, TableError> {
        validate_size(initial_size, max_size)?;
        if max_size as u64 > INDEX_MASK + 1 {
            return Err(TableError::CapacityTooLarge(max_size));
        }

        let directory = AnonRegion::new(max_size)?;
        directory.advise_random();

        let table = Self {
            directory,
            payload: AnonRegion::new(max_size * 2)?,
            alloc: SlotAllocator::with_capacity(max_size as u64)?,
            marks: BitPlane::with_bits(max_size as u64)?,
            notify: BitPlane::with_bits(max_size as u64)?,
            custom: BitPlane::with_bits(max_size as u64)?,
            max_size,
            table_size: AtomicUsize::new(0),
            mask: AtomicU64::new(0),
            threshold: AtomicUsize::new(0),
            hash_cb: None,
            equals_cb: None,
            dead_cb: None,
        };
        table.apply_size(initial_size);
        Ok(table)
    }

    /// The current logical size of the directory, in slots.
    pub fn table_size(&self) -> usize {
        self.table_size.load(Ordering::Relaxed)
    }

    /// The reserved maximum size, in slots.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Grows (or shrinks) the logical directory size. No memory moves;
    /// the space was reserved at construction. Requires quiescence,
    /// and an already-populated table needs a `clear` + `rehash` cycle
    /// afterwards for existing entries to be found under the new
    /// geometry.
    ///
    /// Re-derives the default probe budget for the new size.
    pub fn resize(&self, table_size: usize) -> Result<(), TableError> {
        validate_size(table_size, self.max_size)?;
        self.apply_size(table_size);
        Ok(())
    }

    /// The probe budget: how many cache lines a lookup may scan before
    /// reporting the table too full.
    pub fn probe_budget(&self) -> usize {
        self.threshold.load(Ordering::Relaxed)
    }

    /// Overrides the probe budget. The default is `2·log2(table_size)`
    /// lines; raise it to push the achievable fill ratio closer to
    /// capacity at the cost of longer worst-case probes.
    pub fn set_probe_budget(&self, lines: usize) {
        self.threshold.store(lines.max(1), Ordering::Relaxed);
    }

    /// Finds the index of `(a, b)`, inserting it if absent. The flag
    /// is `true` when this call created the entry.
    ///
    /// Returns `None` when the probe budget is exhausted or no payload
    /// slot can be claimed; the table should be grown and rehashed.
    pub fn lookup(&self, a: u64, b: u64) -> Option<(u64, bool)> {
        self.lookup_inner(a, b, false)
    }

    /// [`lookup`][Self::lookup] under the callbacks installed with
    /// [`set_custom`][Self::set_custom]; entries created this way are
    /// tagged so the rehash sweep re-hashes them with the same
    /// callback.
    pub fn lookup_custom(&self, a: u64, b: u64) -> Option<(u64, bool)> {
        self.lookup_inner(a, b, true)
    }

    /// The payload stored at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is outside the reserved maximum.
    pub fn payload(&self, index: u64) -> (u64, u64) {
        self.read_payload(index)
    }

    /// Whether `index` holds a filled or reserved payload slot.
    pub fn is_occupied(&self, index: u64) -> bool {
        self.alloc.occupied().get(index)
    }

    /// Marks `index` live for the current GC epoch. Returns `true`
    /// exactly once per slot per epoch: only the first caller sees it.
    pub fn mark(&self, index: u64) -> bool {
        self.marks.set(index)
    }

    /// Whether `index` has been marked in the current GC epoch.
    pub fn is_marked(&self, index: u64) -> bool {
        self.marks.get(index)
    }

    /// Number of marked slots, counted with a parallel sweep.
    pub fn count_marked(&self) -> u64 {
        sweep::divide(
            0,
            self.table_size() as u64,
            &|first, count| self.marks.count_range(first, count),
            &|left, right| left + right,
        )
    }

    /// Requests a death notification for `index`: if the slot is not
    /// occupied when [`notify_all`][Self::notify_all] runs, the
    /// registered callback is invoked for it.
    pub fn notify_ondead(&self, index: u64) {
        self.notify.set(index);
    }

    /// Installs the death-notification callback.
    pub fn set_ondead(&mut self, dead_cb: impl Fn(u64) -> bool + Send + Sync + 'static) {
        self.dead_cb = Some(Box::new(dead_cb));
    }

    /// Installs the custom hash and equality callbacks used by
    /// [`lookup_custom`][Self::lookup_custom].
    pub fn set_custom(
        &mut self,
        hash_cb: impl Fn(u64, u64, u64) -> u64 + Send + Sync + 'static,
        equals_cb: impl Fn(u64, u64, u64, u64) -> bool + Send + Sync + 'static,
    ) {
        self.hash_cb = Some(Box::new(hash_cb));
        self.equals_cb = Some(Box::new(equals_cb));
    }

    /// Empties the directory and starts a new GC epoch: occupancy is
    /// rebuilt from the mark plane (survivors only, plus the two
    /// reserved slots), the marks are consumed, and every worker's
    /// region affinity is reset. Payloads and their indices are
    /// untouched; run [`rehash`][Self::rehash] to make the survivors
    /// discoverable again. Requires quiescence.
    pub fn clear(&self) {
        self.directory.discard();
        self.directory.advise_random();
        self.alloc.rebuild(&self.marks);
        self.marks.discard();
    }

    /// Re-inserts every occupied payload into the (cleared) directory
    /// with a parallel sweep. Requires quiescence.
    ///
    /// Fails with [`TableError::DirectoryFull`] when any entry runs
    /// out of probe budget. To recover, grow the table, re-mark the
    /// live set, and run the clear/rehash cycle again; rehashing into
    /// the partially filled directory would publish duplicate slots.
    pub fn rehash(&self) -> Result<(), TableError> {
        let unplaced = sweep::divide(
            0,
            self.table_size() as u64,
            &|first, count| {
                let mut failed = 0;
                for index in self.alloc.occupied().iter_set(first, count) {
                    if index < RESERVED_SLOTS {
                        continue;
                    }
                    if !self.rehash_slot(index) {
                        failed += 1;
                    }
                }
                failed
            },
            &|left, right| left + right,
        );
        if unplaced == 0 {
            Ok(())
        } else {
            Err(TableError::DirectoryFull { unplaced })
        }
    }

    /// Fires the death-notification callback for every slot that has a
    /// pending request but did not survive the last `clear`. A `true`
    /// return resurrects the slot (it becomes occupied again and a
    /// following [`rehash`][Self::rehash] re-publishes it); `false`
    /// consumes the request. Requires quiescence; run between `clear`
    /// and `rehash`.
    pub fn notify_all(&self) {
        let Some(dead_cb) = self.dead_cb.as_deref() else {
            return;
        };
        sweep::divide(
            0,
            self.table_size() as u64,
            &|first, count| {
                for index in self.notify.iter_set(first, count) {
                    if self.alloc.occupied().get(index) {
                        continue;
                    }
                    if dead_cb(index) {
                        self.alloc.resurrect(index);
                    } else {
                        self.notify.clear(index);
                    }
                }
            },
            &|(), ()| (),
        );
    }

    fn apply_size(&self, table_size: usize) {
        self.table_size.store(table_size, Ordering::Relaxed);
        let mask = if table_size.is_power_of_two() {
            table_size as u64 - 1
        } else {
            0
        };
        self.mask.store(mask, Ordering::Relaxed);
        self.threshold
            .store(default_probe_budget(table_size), Ordering::Relaxed);
    }

    fn slots(&self) -> &[AtomicU64] {
        self.directory.words()
    }

    fn start_index(&self, h: u64) -> u64 {
        let mask = self.mask.load(Ordering::Relaxed);
        if mask != 0 {
            h & mask
        } else {
            h % self.table_size.load(Ordering::Relaxed) as u64
        }
    }

    fn next_hash(&self, custom: bool, a: u64, b: u64, seed: u64) -> u64 {
        match &self.hash_cb {
            Some(hash_cb) if custom => hash_cb(a, b, seed),
            _ => hash::mix(a, b, seed),
        }
    }

    fn payload_equals(&self, custom: bool, a: u64, b: u64, stored_a: u64, stored_b: u64) -> bool {
        match &self.equals_cb {
            Some(equals_cb) if custom => equals_cb(a, b, stored_a, stored_b),
            _ => a == stored_a && b == stored_b,
        }
    }

    fn write_payload(&self, index: u64, a: u64, b: u64) {
        let words = self.payload.words();
        // Relaxed is enough: the publishing CAS releases these stores.
        words[2 * index as usize].store(a, Ordering::Relaxed);
        words[2 * index as usize + 1].store(b, Ordering::Relaxed);
    }

    fn read_payload(&self, index: u64) -> (u64, u64) {
        let words = self.payload.words();
        (
            words[2 * index as usize].load(Ordering::Relaxed),
            words[2 * index as usize + 1].load(Ordering::Relaxed),
        )
    }

    fn lookup_inner(&self, a: u64, b: u64, custom: bool) -> Option<(u64, bool)> {
        let mut h = self.next_hash(custom, a, b, hash::SEED);
        let tag = h & TAG_MASK;
        let slots = self.slots();
        let table_size = self.table_size() as u64;
        let budget = self.threshold.load(Ordering::Relaxed);

        let mut idx = self.start_index(h);
        let mut line_start = idx;
        let mut lines = 0;
        // Claimed payload slot, written but not yet published; 0 while
        // none (index 0 is reserved).
        let mut claimed = 0u64;

        loop {
            let slot = &slots[idx as usize];
            let mut v = slot.load(Ordering::Acquire);

            if v == 0 {
                if claimed == 0 {
                    claimed = self.alloc.claim(table_size)?;
                    self.write_payload(claimed, a, b);
                }
                match slot.compare_exchange(0, tag | claimed, Ordering::Release, Ordering::Acquire)
                {
                    Ok(_) => {
                        if custom {
                            self.custom.set(claimed);
                        } else if self.hash_cb.is_some() {
                            // A recycled slot may carry a stale flag.
                            self.custom.clear(claimed);
                        }
                        return Some((claimed, true));
                    }
                    // Lost the race; fall through to the match check
                    // against the winner.
                    Err(current) => v = current,
                }
            }

            if (v & TAG_MASK) == tag {
                let index = v & INDEX_MASK;
                let (stored_a, stored_b) = self.read_payload(index);
                if self.payload_equals(custom, a, b, stored_a, stored_b) {
                    if claimed != 0 {
                        self.alloc.release(claimed);
                    }
                    return Some((index, false));
                }
            }

            idx = (idx & LINE_MASK) | ((idx + 1) & LINE_MASK_R);
            if idx == line_start {
                lines += 1;
                if lines == budget {
                    // Probe exhausted. A claimed slot stays reserved
                    // until the next GC clear.
                    return None;
                }
                h = self.next_hash(custom, a, b, h);
                idx = self.start_index(h);
                line_start = idx;
            }
        }
    }

    /// Re-inserts one live payload during the rehash sweep. The
    /// payload slot is already owned; only the directory CAS can
    /// contend, against sibling sweep tasks, so a failed CAS just
    /// moves to the next slot.
    fn rehash_slot(&self, index: u64) -> bool {
        let (a, b) = self.read_payload(index);
        let custom = self.hash_cb.is_some() && self.custom.get(index);

        let mut h = self.next_hash(custom, a, b, hash::SEED);
        let value = (h & TAG_MASK) | index;
        let slots = self.slots();
        let budget = self.threshold.load(Ordering::Relaxed);

        let mut idx = self.start_index(h);
        let mut line_start = idx;
        let mut lines = 0;

        loop {
            let slot = &slots[idx as usize];
            if slot.load(Ordering::Relaxed) == 0
                && slot
                    .compare_exchange(0, value, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
            {
                return true;
            }

            idx = (idx & LINE_MASK) | ((idx + 1) & LINE_MASK_R);
            if idx == line_start {
                lines += 1;
                if lines == budget {
                    return false;
                }
                h = self.next_hash(custom, a, b, h);
                idx = self.start_index(h);
                line_start = idx;
            }
        }
    }
}

fn validate_size(table_size: usize, max_size: usize) -> Result<(), TableError> {
    if table_size < MIN_TABLE_SIZE {
        return Err(TableError::CapacityTooSmall(table_size));
    }
    if table_size % MIN_TABLE_SIZE != 0 {
        return Err(TableError::CapacityUnaligned(table_size));
    }
    if max_size % MIN_TABLE_SIZE != 0 {
        return Err(TableError::CapacityUnaligned(max_size));
    }
    if table_size > max_size {
        return Err(TableError::CapacityOverflow {
            requested: table_size,
            max: max_size,
        });
    }
    Ok(())
}

fn default_probe_budget(table_size: usize) -> usize {
    2 * table_size.ilog2() as usize
}
