#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

//! A lock-free, fixed-capacity unique table for concurrent
//! hash-consing.
//!
//! A [`UniqueTable`] stores two-word payloads at most once each and
//! identifies every payload by a stable integer index: inserting an
//! equal payload from any thread always yields the same index. It is
//! built as the backing store for interned data (the node store of a
//! decision-diagram package is the motivating shape) where many worker
//! threads insert concurrently and liveness is managed by an
//! epoch-style mark/rehash garbage collection cycle instead of
//! individual deletion.
//!
//! The table is two flat arrays over reserved virtual memory: a hash
//! directory of tagged slots and a payload store, plus a set of atomic
//! bit planes (occupancy, region ownership, GC marks, death
//! notification, custom-hash). All hot-path operations are lock-free
//! and rely on single-word CAS only.
//!
//! # Example
//!
//! ```
//! use unitable::UniqueTable;
//!
//! let table = UniqueTable::with_capacity(512, 4096)?;
//!
//! let (index, created) = table.lookup(7, 11).expect("table has room");
//! assert!(created);
//!
//! // The same payload maps to the same index, from any thread.
//! assert_eq!(table.lookup(7, 11), Some((index, false)));
//! # Ok::<(), unitable::TableError>(())
//! ```
//!
//! # Garbage collection
//!
//! The client drives the collection cycle while all lookups are
//! quiesced: [`mark`](UniqueTable::mark) the live indices,
//! [`clear`](UniqueTable::clear) the directory (which consumes the
//! marks), optionally [`notify_all`](UniqueTable::notify_all) to fire
//! death notifications, and [`rehash`](UniqueTable::rehash) to
//! re-publish the survivors under their old indices.

mod alloc;
mod bitmap;
mod error;
mod hash;
mod mem;
mod sweep;
mod table;

pub use error::TableError;
pub use table::{DeadFn, EqualsFn, HashFn, UniqueTable};
