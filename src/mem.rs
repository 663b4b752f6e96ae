//! Anonymous virtual mappings backing the directory, the payload
//! store, and the bit planes.
//!
//! The full `max_size` extent of every region is reserved up front, so
//! growing the logical table size never remaps anything; the kernel
//! only backs the pages that are actually touched. Clearing hands the
//! pages back with `MADV_DONTNEED`, which makes an anonymous private
//! mapping read as zero again without touching it, and falls back to
//! storing zeroes when the advise is unavailable.

use std::{
    io, slice,
    sync::atomic::{AtomicU64, Ordering},
};

use memmap2::MmapMut;

pub(crate) struct AnonRegion {
    map: MmapMut,
    words: usize,
}

impl AnonRegion {
    pub(crate) fn new(words: usize) -> io::Result<Self> {
        let map = MmapMut::map_anon(words * 8)?;
        Ok(Self { map, words })
    }

    /// The mapping viewed as atomic words. Anonymous mappings are
    /// page-aligned, which satisfies the `AtomicU64` alignment
    /// requirement.
    pub(crate) fn words(&self) -> &[AtomicU64] {
        unsafe { slice::from_raw_parts(self.map.as_ptr().cast::<AtomicU64>(), self.words) }
    }

    /// Tells the kernel the region will be accessed randomly.
    pub(crate) fn advise_random(&self) {
        #[cfg(unix)]
        let _ = self.map.advise(memmap2::Advice::Random);
    }

    /// Returns the backing pages so the region reads as zero again.
    pub(crate) fn discard(&self) {
        #[cfg(unix)]
        {
            // Safe here: nothing holds a reference into the old page
            // contents, and an anonymous private mapping is defined to
            // read back as zero after MADV_DONTNEED.
            if unsafe { self.map.unchecked_advise(memmap2::UncheckedAdvice::DontNeed) }.is_ok() {
                return;
            }
        }
        for word in self.words() {
            word.store(0, Ordering::Relaxed);
        }
    }
}
