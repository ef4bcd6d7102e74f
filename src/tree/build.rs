//! Octree construction over Morton sorted bodies.
use itertools::Itertools;

use crate::traits::general::{FmmScalar, RealScalar};
use crate::tree::morton::{child_digit, encode};
use crate::tree::types::{Body, Bounds, Cell, Octree, TreeKind};

/// Build an octree over `bodies`, permuting them so that every leaf owns a
/// contiguous range of the body array.
///
/// Bodies are keyed at the encoding depth, bucket sorted by key, and cells
/// are materialized top down: whenever the leading bits of the sorted keys
/// change at a depth, a sibling boundary exists there. Cells come out root
/// first and level by level with sibling blocks contiguous, so every
/// descendant index exceeds its ancestor's and each level occupies one
/// contiguous range.
///
/// Duplicate positions collide onto one key and coexist in the deepest leaf
/// reached; an empty body set produces an empty tree.
pub fn build_tree<T, V>(bodies: &mut Vec<Body<T, V>>, bounds: Bounds<T>, kind: TreeKind) -> Octree<T>
where
    T: RealScalar,
    V: FmmScalar<T>,
{
    let (max_level, ncrit, uniform) = match kind {
        TreeKind::Adaptive { ncrit, max_level } => (max_level, ncrit, false),
        TreeKind::Uniform { depth } => (depth, 1, true),
    };

    if bodies.is_empty() && !uniform {
        return Octree {
            bounds,
            max_level,
            ..Default::default()
        };
    }

    // Key every body at the encoding depth and sort bodies by key, index as
    // the tie break so that colliding points keep a deterministic order.
    let keys = sort_by_key(bodies, &bounds, max_level);

    let mut cells: Vec<Cell<T>> = Vec::new();
    cells.push(Cell {
        x: bounds.cube_center(),
        r: bounds.cube_radius(),
        scale: bounds.diameter(),
        key: 0,
        level: 0,
        body: 0,
        nbody: bodies.len(),
        ichild: 0,
        nchild: 0,
        iparent: 0,
        weight: T::zero(),
    });

    // Top-down breadth first subdivision. Appending children while scanning
    // keeps levels contiguous and siblings adjacent.
    let mut i = 0;
    while i < cells.len() {
        let cell = cells[i];
        let split = if uniform {
            cell.level < max_level
        } else {
            cell.nbody > ncrit && cell.level < max_level
        };
        if !split {
            i += 1;
            continue;
        }

        let child_level = cell.level + 1;
        let ichild = cells.len();
        let mut nchild = 0;
        let two = T::one() + T::one();
        let rc = cell.r / two;

        let mut begin = cell.body;
        let end = cell.body + cell.nbody;
        for digit in 0..8usize {
            // Sorted keys make each octant a contiguous sub-range.
            let mut stop = begin;
            while stop < end && child_digit(keys[stop], max_level, child_level) == digit {
                stop += 1;
            }
            if stop == begin && !uniform {
                continue;
            }
            let mut x = cell.x;
            for (d, xd) in x.iter_mut().enumerate() {
                if digit >> d & 1 == 1 {
                    *xd += rc;
                } else {
                    *xd -= rc;
                }
            }
            cells.push(Cell {
                x,
                r: rc,
                scale: rc * two,
                key: cell.key << 3 | digit as u64,
                level: child_level,
                body: begin,
                nbody: stop - begin,
                ichild: 0,
                nchild: 0,
                iparent: i,
                weight: T::zero(),
            });
            nchild += 1;
            begin = stop;
        }
        cells[i].ichild = ichild;
        cells[i].nchild = nchild;
        i += 1;
    }

    let depth = cells.iter().map(|c| c.level).max().unwrap_or(0);

    // Levels are already contiguous; record their ranges.
    let mut levels = Vec::with_capacity(depth as usize + 1);
    let mut begin = 0;
    for level in 0..=depth {
        let end = begin
            + cells[begin..]
                .iter()
                .take_while(|c| c.level == level)
                .count();
        levels.push(begin..end);
        begin = end;
    }

    Octree {
        cells,
        levels,
        depth,
        max_level,
        bounds,
    }
}

/// Key bodies at `max_level` and reorder them (and the returned keys) into
/// ascending key order with a bucket-sort style permutation pass.
fn sort_by_key<T, V>(bodies: &mut Vec<Body<T, V>>, bounds: &Bounds<T>, max_level: u32) -> Vec<u64>
where
    T: RealScalar,
    V: FmmScalar<T>,
{
    let keys = bodies
        .iter()
        .map(|b| encode(&b.x, bounds, max_level))
        .collect_vec();
    let mut order = (0..bodies.len()).collect_vec();
    order.sort_unstable_by_key(|&i| (keys[i], bodies[i].ibody));

    let sorted = order.iter().map(|&i| bodies[i]).collect_vec();
    *bodies = sorted;
    order.iter().map(|&i| keys[i]).collect_vec()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tree::helpers::points_fixture;
    use crate::tree::morton::coarsen;

    fn fixture_tree(n: usize, ncrit: usize) -> (Vec<Body<f64, f64>>, Octree<f64>) {
        let mut bodies = points_fixture::<f64, f64>(n, None, None, Some(0));
        let bounds = Bounds::from_bodies(&bodies);
        let tree = build_tree(
            &mut bodies,
            bounds,
            TreeKind::Adaptive {
                ncrit,
                max_level: 10,
            },
        );
        (bodies, tree)
    }

    #[test]
    fn test_leaf_coverage() {
        let n = 1000;
        let (_, tree) = fixture_tree(n, 32);
        let mut seen = vec![false; n];
        let mut total = 0;
        for i in tree.leaves() {
            let cell = &tree.cells[i];
            total += cell.nbody;
            for b in cell.bodies() {
                assert!(!seen[b], "leaf ranges overlap");
                seen[b] = true;
            }
        }
        assert_eq!(total, n);
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_containment_and_topology() {
        let (_, tree) = fixture_tree(2000, 64);
        for (i, cell) in tree.cells.iter().enumerate().skip(1) {
            let parent = &tree.cells[cell.iparent];
            assert!(cell.r < parent.r);
            for d in 0..3 {
                assert!((cell.x[d] - parent.x[d]).abs() <= parent.r);
                assert!(cell.x[d] - cell.r >= parent.x[d] - parent.r - 1e-12);
                assert!(cell.x[d] + cell.r <= parent.x[d] + parent.r + 1e-12);
            }
            assert!(cell.iparent < i, "descendants follow their ancestors");
        }
        for cell in &tree.cells {
            assert!(cell.nchild <= 8);
            if cell.nchild > 0 {
                let nbody: usize = cell.children().map(|c| tree.cells[c].nbody).sum();
                assert_eq!(nbody, cell.nbody);
                for c in cell.children() {
                    assert_eq!(tree.cells[c].level, cell.level + 1);
                }
            }
        }
    }

    #[test]
    fn test_leaf_key_prefixes_agree() {
        let (bodies, tree) = fixture_tree(500, 16);
        for i in tree.leaves() {
            let cell = &tree.cells[i];
            for b in cell.bodies() {
                let key = encode(&bodies[b].x, &tree.bounds, tree.max_level);
                assert_eq!(coarsen(key, tree.max_level, cell.level), cell.key);
            }
        }
    }

    #[test]
    fn test_ncrit_respected() {
        let (_, tree) = fixture_tree(1000, 32);
        for i in tree.leaves() {
            let cell = &tree.cells[i];
            assert!(cell.nbody <= 32 || cell.level == tree.max_level);
        }
    }

    #[test]
    fn test_levels_table() {
        let (_, tree) = fixture_tree(1500, 48);
        let mut n = 0;
        for (level, range) in tree.levels.iter().enumerate() {
            for c in range.clone() {
                assert_eq!(tree.cells[c].level as usize, level);
            }
            n += range.len();
        }
        assert_eq!(n, tree.n_cells());
    }

    #[test]
    fn test_empty_tree() {
        let mut bodies: Vec<Body<f64, f64>> = Vec::new();
        let tree = build_tree(
            &mut bodies,
            Bounds::default(),
            TreeKind::Adaptive {
                ncrit: 10,
                max_level: 5,
            },
        );
        assert_eq!(tree.n_cells(), 0);
    }

    #[test]
    fn test_duplicates_share_deepest_leaf() {
        let mut bodies = vec![
            Body::<f64, f64>::new([0.25, 0.25, 0.25], 1.0, 0),
            Body::new([0.25, 0.25, 0.25], 1.0, 1),
            Body::new([0.75, 0.75, 0.75], 1.0, 2),
        ];
        let bounds = Bounds::new(&[0.0; 3], &[1.0; 3]);
        let tree = build_tree(
            &mut bodies,
            bounds,
            TreeKind::Adaptive {
                ncrit: 1,
                max_level: 4,
            },
        );
        // The two co-located bodies cannot be separated; they end up together
        // in a deepest-level leaf.
        let leaf = tree
            .leaves()
            .map(|i| tree.cells[i])
            .find(|c| c.nbody == 2)
            .unwrap();
        assert_eq!(leaf.level, 4);
    }

    #[test]
    fn test_uniform_complete() {
        let mut bodies = points_fixture::<f64, f64>(100, None, None, Some(1));
        let bounds = Bounds::from_bodies(&bodies);
        let tree = build_tree(&mut bodies, bounds, TreeKind::Uniform { depth: 3 });
        // Complete octree: 1 + 8 + 64 + 512 cells.
        assert_eq!(tree.n_cells(), 585);
        assert_eq!(tree.levels[3].len(), 512);
        for cell in &tree.cells[1..] {
            assert!(cell.level <= 3);
        }
    }
}
