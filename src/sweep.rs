//! Divide-and-conquer skeleton shared by the GC sweeps.
//!
//! Rehash, count-marked, and notify-dead all walk a contiguous index
//! range: ranges above the split threshold fork in half on the rayon
//! pool and combine at the join, shorter ranges run serially. The
//! halves write disjoint regions by construction, which is what makes
//! the sweeps internally safe.

/// Ranges at most this long run serially.
const SPLIT_THRESHOLD: u64 = 1024;

pub(crate) fn divide<T, Leaf, Join>(first: u64, count: u64, leaf: &Leaf, join: &Join) -> T
where
    T: Send,
    Leaf: Fn(u64, u64) -> T + Sync,
    Join: Fn(T, T) -> T + Sync,
{
    if count > SPLIT_THRESHOLD {
        let split = count / 2;
        let (left, right) = rayon::join(
            || divide(first, split, leaf, join),
            || divide(first + split, count - split, leaf, join),
        );
        join(left, right)
    } else {
        leaf(first, count)
    }
}
