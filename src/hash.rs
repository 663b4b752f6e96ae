//! The default two-word mixer.
//!
//! Probing restarts on a new cache line by feeding the previous output
//! back in as the seed, so the mixer doubles as the re-hash step.

/// FNV-1a offset basis; the seed for the first round.
pub(crate) const SEED: u64 = 14_695_981_039_346_656_037;

const PRIME: u64 = 1_099_511_628_211;

/// Mixes `(a, b)` into a 64-bit hash. Two rotate-multiply rounds, one
/// per word, folded with the upper half at the end.
pub(crate) fn mix(a: u64, b: u64, seed: u64) -> u64 {
    let mut h = seed ^ a;
    h = h.rotate_left(47);
    h = h.wrapping_mul(PRIME);
    h ^= b;
    h = h.rotate_left(31);
    h = h.wrapping_mul(PRIME);
    h ^ (h >> 32)
}
