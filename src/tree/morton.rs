//! Morton (Z-order) encoding and decoding of integerized coordinates.
//!
//! Keys interleave the bits of the three axis indices, x in the least
//! significant position, so that two points at depth `d` share a depth-`d`
//! ancestor cube exactly when their keys agree after discarding the trailing
//! `3 * (max_level - d)` bits.
use crate::traits::general::RealScalar;
use crate::tree::constants::{DEEPEST_LEVEL, DIGIT_MASK, LEVEL_DISPLACEMENT};
use crate::tree::types::Bounds;

/// Spread the low 21 bits of `x` so that bit `i` lands at bit `3 * i`.
fn spread_bits(mut x: u64) -> u64 {
    x &= 0x1fffff;
    x = (x | x << 32) & 0x1f00000000ffff;
    x = (x | x << 16) & 0x1f0000ff0000ff;
    x = (x | x << 8) & 0x100f00f00f00f00f;
    x = (x | x << 4) & 0x10c30c30c30c30c3;
    x = (x | x << 2) & 0x1249249249249249;
    x
}

/// Inverse of [`spread_bits`]: gather every third bit back into the low 21.
fn gather_bits(mut x: u64) -> u64 {
    x &= 0x1249249249249249;
    x = (x | x >> 2) & 0x10c30c30c30c30c3;
    x = (x | x >> 4) & 0x100f00f00f00f00f;
    x = (x | x >> 8) & 0x1f0000ff0000ff;
    x = (x | x >> 16) & 0x1f00000000ffff;
    x = (x | x >> 32) & 0x1fffff;
    x
}

/// Interleave integer cell coordinates at `level` into a Morton key.
pub fn encode_index(ix: &[u64; 3], level: u32) -> u64 {
    debug_assert!(level <= DEEPEST_LEVEL);
    debug_assert!(ix.iter().all(|&i| i < (1 << level)));
    spread_bits(ix[0]) | spread_bits(ix[1]) << 1 | spread_bits(ix[2]) << 2
}

/// Recover the integer cell coordinates of a key at `level`.
pub fn decode(key: u64, level: u32) -> [u64; 3] {
    debug_assert!(level <= DEEPEST_LEVEL);
    [gather_bits(key), gather_bits(key >> 1), gather_bits(key >> 2)]
}

/// Integerize a point against `bounds` and interleave at `max_level`.
///
/// Coordinates are scaled by the cube diameter; the upper face of the cube
/// maps into the last cell (clamp, not wrap), so points sitting exactly on
/// the boundary remain inside the tree.
pub fn encode<T>(x: &[T; 3], bounds: &Bounds<T>, max_level: u32) -> u64
where
    T: RealScalar,
{
    let side = T::from(1u64 << max_level).unwrap();
    let diameter = bounds.diameter();
    let mut ix = [0u64; 3];
    for d in 0..3 {
        let scaled = (x[d] - bounds.xmin[d]) / diameter * side;
        let i = scaled.floor().to_i64().unwrap_or(0);
        ix[d] = i.clamp(0, (1i64 << max_level) - 1) as u64;
    }
    encode_index(&ix, max_level)
}

/// Truncate a key at `from_level` to its ancestor at `to_level`.
pub fn coarsen(key: u64, from_level: u32, to_level: u32) -> u64 {
    debug_assert!(to_level <= from_level);
    key >> (LEVEL_DISPLACEMENT * (from_level - to_level))
}

/// The child digit selecting the subdivision of a depth `level` key at depth
/// `child_level`, i.e. the octant a descendant falls into.
pub fn child_digit(key: u64, level: u32, child_level: u32) -> usize {
    debug_assert!(child_level <= level);
    debug_assert!(child_level >= 1);
    (coarsen(key, level, child_level) & DIGIT_MASK) as usize
}
