//! Helper functions for the evaluation driver.
use std::time::{Duration, Instant};

use itertools::Itertools;

use crate::traits::general::{FmmScalar, RealScalar};
use crate::tree::types::Octree;

/// Optionally time a function call
pub fn optionally_time<T, F>(timed: bool, f: F) -> (T, Option<Duration>)
where
    F: FnOnce() -> T,
{
    if timed {
        let s = Instant::now();
        let result = f();
        (result, Some(s.elapsed()))
    } else {
        let result = f();
        (result, None)
    }
}

/// Relative l2 norm of the difference between `found` and `expected`.
pub fn l2_error<T, V>(found: &[V], expected: &[V]) -> T
where
    T: RealScalar,
    V: FmmScalar<T>,
{
    let mut num = T::zero();
    let mut den = T::zero();
    for (f, e) in found.iter().zip(expected) {
        let d = *f - *e;
        num += d.abs() * d.abs();
        den += e.abs() * e.abs();
    }
    (num / den).sqrt()
}

/// Split `data`, aligned with the tree's leaf ordered body array, into one
/// disjoint mutable chunk per leaf, paired with the leaf's cell index and
/// ordered by body offset. The chunks cover the whole array because leaf
/// ranges partition it.
pub fn leaf_chunks<'a, T, X>(tree: &Octree<T>, data: &'a mut [X]) -> Vec<(usize, &'a mut [X])>
where
    T: RealScalar,
{
    let mut leaf_ids = tree.leaves().collect_vec();
    leaf_ids.sort_by_key(|&i| tree.cells[i].body);

    let mut chunks = Vec::with_capacity(leaf_ids.len());
    let mut rest = data;
    for &i in &leaf_ids {
        let (chunk, tail) = rest.split_at_mut(tree.cells[i].nbody);
        chunks.push((i, chunk));
        rest = tail;
    }
    chunks
}

/// Two disjoint mutable element ranges of one slice.
///
/// # Panics
/// Panics if the ranges overlap or are out of bounds.
pub fn disjoint_ranges_mut<X>(
    data: &mut [X],
    a: std::ops::Range<usize>,
    b: std::ops::Range<usize>,
) -> (&mut [X], &mut [X]) {
    if a.start < b.start {
        assert!(a.end <= b.start, "ranges overlap");
        let (head, tail) = data.split_at_mut(b.start);
        (&mut head[a.start..a.end], &mut tail[..b.end - b.start])
    } else {
        assert!(b.end <= a.start, "ranges overlap");
        let (head, tail) = data.split_at_mut(a.start);
        (&mut tail[..a.end - a.start], &mut head[b.start..b.end])
    }
}
