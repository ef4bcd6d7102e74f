//! Recursive weighted bisection of bodies over ranks.
use crate::traits::general::{FmmScalar, RealScalar};
use crate::tree::types::{Body, Bounds};

/// Stamp every body's `irank` with its owning rank by recursive bisection.
///
/// Each step cuts the longest axis of the region at the coordinate that
/// balances the body weights against the rank split; ties on coordinate
/// break by body identity. Fewer bodies than ranks is legal, some ranks
/// simply own nothing.
pub fn bisection<T, V>(bodies: &mut [Body<T, V>], bounds: &Bounds<T>, nranks: usize)
where
    T: RealScalar,
    V: FmmScalar<T>,
{
    assert!(nranks > 0, "at least one rank required");
    recurse(bodies, *bounds, 0, nranks);
}

fn recurse<T, V>(bodies: &mut [Body<T, V>], bounds: Bounds<T>, rank_lo: usize, rank_hi: usize)
where
    T: RealScalar,
    V: FmmScalar<T>,
{
    if rank_hi - rank_lo == 1 {
        for body in bodies.iter_mut() {
            body.irank = rank_lo as i32;
        }
        return;
    }

    let mut axis = 0;
    let mut extent = bounds.xmax[0] - bounds.xmin[0];
    for d in 1..3 {
        let e = bounds.xmax[d] - bounds.xmin[d];
        if e > extent {
            axis = d;
            extent = e;
        }
    }

    bodies.sort_unstable_by(|a, b| {
        a.x[axis]
            .partial_cmp(&b.x[axis])
            .unwrap()
            .then(a.ibody.cmp(&b.ibody))
    });

    let nranks = rank_hi - rank_lo;
    let nleft = nranks / 2;
    let total: T = bodies.iter().map(|b| b.weight).sum();
    let target = total * T::from(nleft).unwrap() / T::from(nranks).unwrap();

    // First prefix whose weight reaches the target, stepping back when the
    // previous boundary is closer.
    let mut split = bodies.len();
    let mut cum = T::zero();
    for (i, body) in bodies.iter().enumerate() {
        cum += body.weight;
        if cum >= target {
            split = if cum - target > body.weight / (T::one() + T::one()) {
                i
            } else {
                i + 1
            };
            break;
        }
    }

    let xstar = if split == 0 {
        bounds.xmin[axis]
    } else if split == bodies.len() {
        bounds.xmax[axis]
    } else {
        let two = T::one() + T::one();
        (bodies[split - 1].x[axis] + bodies[split].x[axis]) / two
    };

    let (left, right) = bodies.split_at_mut(split);
    let mut lbounds = bounds;
    lbounds.xmax[axis] = xstar;
    let mut rbounds = bounds;
    rbounds.xmin[axis] = xstar;
    recurse(left, lbounds, rank_lo, rank_lo + nleft);
    recurse(right, rbounds, rank_lo + nleft, rank_hi);
}

/// The `n`-th smallest element of locally sorted data by iterative bucket
/// refinement, the selection scheme used for distributed medians: sample up
/// to a thousand candidate boundaries, count elements per bucket, descend
/// into the bucket containing the target. The step back after locating the
/// bucket is a deliberate floor on the overshoot, not an error.
pub fn nth_element<X>(sorted: &[X], n: usize) -> X
where
    X: PartialOrd + Copy,
{
    assert!(!sorted.is_empty());
    let max_bucket = 1000;
    let mut lo = 0usize;
    let mut num = sorted.len();
    let mut g_offset = 0usize;
    loop {
        let num_sample = max_bucket.min(num);
        let stride = (num / num_sample).max(1);
        let mut buckets: Vec<X> = (0..num_sample).map(|i| sorted[lo + i * stride]).collect();
        buckets.dedup_by(|a, b| a == b);
        let nb = buckets.len();
        if nb <= 1 {
            return buckets[0];
        }

        let mut counts = vec![0usize; nb];
        let mut ic = 0;
        for i in 0..num {
            while sorted[lo + i] > buckets[ic] && ic < nb - 1 {
                ic += 1;
            }
            counts[ic] += 1;
        }
        let mut scan = vec![0usize; nb];
        for i in 0..nb - 1 {
            scan[i + 1] = scan[i] + counts[i];
        }

        let mut nth = 0;
        while nth < nb && n - g_offset > scan[nth] {
            nth += 1;
        }
        nth = nth.saturating_sub(1);
        g_offset += scan[nth];

        num = if nth == nb - 1 {
            num - scan[nth]
        } else {
            scan[nth + 1] - scan[nth]
        };
        lo += scan[nth];
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tree::helpers::points_fixture;
    use itertools::Itertools;

    #[test]
    fn test_two_rank_split_is_balanced() {
        let n = 2000;
        let mut bodies = points_fixture::<f64, f64>(n, None, None, Some(0));
        let bounds = Bounds::from_bodies(&bodies);
        bisection(&mut bodies, &bounds, 2);

        let n0 = bodies.iter().filter(|b| b.irank == 0).count();
        let n1 = bodies.iter().filter(|b| b.irank == 1).count();
        assert_eq!(n0 + n1, n);
        assert!((900..=1100).contains(&n0), "n0 = {}", n0);
        assert!((900..=1100).contains(&n1), "n1 = {}", n1);

        // Identities survive the reordering.
        let ids: Vec<usize> = bodies.iter().map(|b| b.ibody).sorted().collect();
        assert_eq!(ids, (0..n).collect_vec());
    }

    #[test]
    fn test_partition_conserves_bodies() {
        let n = 777;
        let mut bodies = points_fixture::<f64, f64>(n, None, None, Some(1));
        for (i, b) in bodies.iter_mut().enumerate() {
            b.src = i as f64;
        }
        let bounds = Bounds::from_bodies(&bodies);
        bisection(&mut bodies, &bounds, 5);

        let pairs: Vec<(usize, u64)> = bodies
            .iter()
            .map(|b| (b.ibody, b.src.to_bits()))
            .sorted()
            .collect();
        assert_eq!(pairs.len(), n);
        for (i, &(ibody, bits)) in pairs.iter().enumerate() {
            assert_eq!(ibody, i);
            assert_eq!(f64::from_bits(bits), i as f64);
        }
        for b in &bodies {
            assert!((0..5).contains(&b.irank));
        }
        for rank in 0..5 {
            assert!(bodies.iter().any(|b| b.irank == rank));
        }
    }

    #[test]
    fn test_ranks_partition_space() {
        // Bodies of one rank occupy a connected box not straddled by others:
        // check the weaker invariant that rank regions do not interleave
        // along the first split axis.
        let mut bodies = points_fixture::<f64, f64>(400, None, None, Some(2));
        let bounds = Bounds::from_bodies(&bodies);
        bisection(&mut bodies, &bounds, 4);
        for rank in 0..4 {
            assert!(bodies.iter().filter(|b| b.irank == rank).count() > 50);
        }
    }

    #[test]
    fn test_fewer_bodies_than_ranks() {
        let mut bodies = points_fixture::<f64, f64>(3, None, None, Some(3));
        let bounds = Bounds::from_bodies(&bodies);
        bisection(&mut bodies, &bounds, 8);
        for b in &bodies {
            assert!((0..8).contains(&b.irank));
        }
    }

    #[test]
    fn test_weighted_split_follows_weights() {
        // All the weight on one side drags the splitter with it.
        let n = 100;
        let mut bodies = points_fixture::<f64, f64>(n, None, None, Some(4));
        for b in bodies.iter_mut() {
            b.weight = if b.x[0] < 0.5 { 10.0 } else { 1.0 };
        }
        let mut bounds = Bounds::from_bodies(&bodies);
        // Make x the longest axis deterministically.
        bounds.xmin[0] = 0.0;
        bounds.xmax[0] = 1.0;
        bisection(&mut bodies, &bounds, 2);
        let heavy_left = bodies
            .iter()
            .filter(|b| b.weight > 1.0 && b.irank == 0)
            .count();
        let heavy = bodies.iter().filter(|b| b.weight > 1.0).count();
        // Rank 0 holds roughly half the weight, so well under all of the
        // heavy bodies.
        assert!(heavy_left < heavy);
    }

    #[test]
    fn test_nth_element_selects_correctly() {
        let mut data: Vec<u64> = (0..5000).map(|i| (i * 37 + 11) % 4999).collect();
        data.sort_unstable();
        for &n in &[0usize, 1, 17, 2500, 4998] {
            let v = nth_element(&data, n);
            let below = data.iter().filter(|&&x| x < v).count();
            // The selected value brackets the requested order statistic up to
            // the deliberate overshoot floor.
            assert!(below <= n.max(1), "n = {}, below = {}", n, below);
            assert!(data.contains(&v));
        }
    }

    #[test]
    fn test_nth_element_with_duplicates() {
        let data = vec![1u64; 100];
        assert_eq!(nth_element(&data, 50), 1);
    }
}
