use thiserror::Error;

/// The error type for table construction, resizing, and the rehash
/// sweep.
///
/// The hot-path operations ([`lookup`][crate::UniqueTable::lookup] and
/// [`lookup_custom`][crate::UniqueTable::lookup_custom]) do not use
/// this type; they report "table full or probe exhausted" as `None`.
#[derive(Debug, Error)]
pub enum TableError {
    /// The requested size is below the 512-slot allocation region.
    #[error("table size {0} is below the 512 slot minimum")]
    CapacityTooSmall(usize),

    /// The requested size is not a whole number of 512-slot regions.
    #[error("table size {0} is not a multiple of the 512 slot region")]
    CapacityUnaligned(usize),

    /// The requested size exceeds the reserved maximum.
    #[error("requested size {requested} exceeds the reserved maximum {max}")]
    CapacityOverflow { requested: usize, max: usize },

    /// The maximum size does not fit the 44-bit index field of a
    /// directory slot.
    #[error("maximum size {0} exceeds the 44-bit index space")]
    CapacityTooLarge(usize),

    /// Mapping the directory, payload store, or a bit plane failed.
    #[error("failed to map table memory: {0}")]
    Map(#[from] std::io::Error),

    /// The rehash sweep could not re-insert every live entry within
    /// the probe budget. Grow the table and run the collection cycle
    /// again.
    #[error("{unplaced} live entries could not be re-inserted; the table needs to grow")]
    DirectoryFull { unplaced: u64 },
}
