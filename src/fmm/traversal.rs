//! Dual tree traversal: the acceptance-criterion driven walk that turns a
//! pair of cell trees into M2L and P2P interaction lists.
//!
//! Lists are grouped per target cell so their evaluation parallelizes over
//! disjoint accumulators; the walk itself forks below the `nspawn` grain and
//! merges per-task pair buffers afterwards.
use num_complex::Complex;

use crate::traits::general::RealScalar;
use crate::traits::kernel::Kernel;
use crate::tree::types::Cell;

/// Interaction lists produced by one or more traversals.
#[derive(Debug, Clone, Default)]
pub struct InteractionLists<T>
where
    T: RealScalar,
{
    /// Per target cell: source cells whose multipoles translate into the
    /// target's local expansion, with the periodic shift of each.
    pub m2l: Vec<Vec<(usize, [T; 3])>>,

    /// Per target leaf: source leaves evaluated directly, one sided.
    pub p2p: Vec<Vec<(usize, [T; 3])>>,

    /// Near pairs evaluated with the symmetric optimization; target and
    /// source equal means within-cell. Evaluated on a single task.
    pub mutual_p2p: Vec<(usize, usize, [T; 3])>,
}

impl<T> InteractionLists<T>
where
    T: RealScalar,
{
    /// Empty lists for `n_cells` target cells.
    pub fn new(n_cells: usize) -> Self {
        Self {
            m2l: vec![Vec::new(); n_cells],
            p2p: vec![Vec::new(); n_cells],
            mutual_p2p: Vec::new(),
        }
    }

    /// Total number of interactions recorded.
    pub fn len(&self) -> usize {
        self.m2l.iter().map(Vec::len).sum::<usize>()
            + self.p2p.iter().map(Vec::len).sum::<usize>()
            + self.mutual_p2p.len()
    }

    /// Whether any interaction was recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Which side of a pair to subdivide: the larger cell, then the one with
/// more children, then the source.
fn split_source<T>(ct: &Cell<T>, cs: &Cell<T>) -> bool
where
    T: RealScalar,
{
    if ct.is_leaf() {
        true
    } else if cs.is_leaf() {
        false
    } else if cs.r > ct.r {
        true
    } else if ct.r > cs.r {
        false
    } else if cs.nchild != ct.nchild {
        cs.nchild > ct.nchild
    } else {
        true
    }
}

#[allow(clippy::too_many_arguments)]
fn walk<T>(
    tcells: &[Cell<T>],
    scells: &[Cell<T>],
    it: usize,
    is: usize,
    shift: [T; 3],
    mutual: bool,
    nspawn: usize,
    m2l: &mut Vec<(u32, u32)>,
    p2p: &mut Vec<(u32, u32)>,
) where
    T: RealScalar,
{
    let ct = &tcells[it];
    let cs = &scells[is];
    if ct.nbody == 0 || cs.nbody == 0 {
        return;
    }
    let dx = [
        ct.x[0] - cs.x[0] - shift[0],
        ct.x[1] - cs.x[1] - shift[1],
        ct.x[2] - cs.x[2] - shift[2],
    ];
    let d2 = dx[0] * dx[0] + dx[1] * dx[1] + dx[2] * dx[2];
    let r = ct.r + cs.r;
    if d2 >= r * r {
        m2l.push((it as u32, is as u32));
        if mutual && it != is {
            m2l.push((is as u32, it as u32));
        }
        return;
    }
    if ct.is_leaf() && cs.is_leaf() {
        p2p.push((it as u32, is as u32));
        return;
    }

    let pairs: Vec<(usize, usize)> = if mutual && it == is {
        // One visit per unordered pair of children.
        ct.children()
            .flat_map(|i| ct.children().filter(move |&j| j >= i).map(move |j| (i, j)))
            .collect()
    } else if split_source(ct, cs) {
        cs.children().map(|j| (it, j)).collect()
    } else {
        ct.children().map(|i| (i, is)).collect()
    };

    if ct.nbody + cs.nbody > nspawn && pairs.len() > 1 {
        // Independent pair subtrees, worth forking.
        let mid = pairs.len() / 2;
        let (lo, hi) = pairs.split_at(mid);
        let (mut left, mut right) = rayon::join(
            || {
                let mut m = Vec::new();
                let mut p = Vec::new();
                for &(i, j) in lo {
                    walk(tcells, scells, i, j, shift, mutual, nspawn, &mut m, &mut p);
                }
                (m, p)
            },
            || {
                let mut m = Vec::new();
                let mut p = Vec::new();
                for &(i, j) in hi {
                    walk(tcells, scells, i, j, shift, mutual, nspawn, &mut m, &mut p);
                }
                (m, p)
            },
        );
        m2l.append(&mut left.0);
        p2p.append(&mut left.1);
        m2l.append(&mut right.0);
        p2p.append(&mut right.1);
    } else {
        for &(i, j) in &pairs {
            walk(tcells, scells, i, j, shift, mutual, nspawn, m2l, p2p);
        }
    }
}

/// Walk target tree against source tree under one periodic shift and append
/// the resulting interactions to `lists`.
///
/// `mutual` is only legal when both trees are the same local tree and the
/// shift is zero; it makes the walk visit each unordered near pair once and
/// route it to the symmetric evaluator.
pub fn dual_traversal<T>(
    tcells: &[Cell<T>],
    scells: &[Cell<T>],
    shift: [T; 3],
    mutual: bool,
    nspawn: usize,
    lists: &mut InteractionLists<T>,
) where
    T: RealScalar,
{
    if tcells.is_empty() || scells.is_empty() {
        return;
    }
    let mut m2l = Vec::new();
    let mut p2p = Vec::new();
    walk(
        tcells, scells, 0, 0, shift, mutual, nspawn, &mut m2l, &mut p2p,
    );
    for (t, s) in m2l {
        lists.m2l[t as usize].push((s as usize, shift));
    }
    for (t, s) in p2p {
        if mutual {
            lists.mutual_p2p.push((t as usize, s as usize, shift));
        } else {
            lists.p2p[t as usize].push((s as usize, shift));
        }
    }
}

/// Far-field contribution of periodic image shells beyond the first.
///
/// Keeps an aggregated multipole of the growing image block: at each shell,
/// translate the 189 well separated image copies of the block into the local
/// root's expansion, then merge the block and its 26 neighbors into a block
/// three times the size and move one shell out.
pub fn periodic_far_field<T, K>(
    kernel: &K,
    root: &Cell<T>,
    root_m: &[Complex<T>],
    root_l: &mut [Complex<T>],
    cycle: [T; 3],
    images: usize,
) where
    T: RealScalar,
    K: Kernel<T>,
{
    if images < 2 {
        return;
    }
    let nterm = kernel.nterm();
    let three = T::from(3.0).unwrap();
    let target = *root;
    let mut source = *root;
    let mut m = root_m.to_vec();
    let mut cycle = cycle;
    for _ in 0..images - 1 {
        for ix in -1i64..=1 {
            for iy in -1i64..=1 {
                for iz in -1i64..=1 {
                    if ix == 0 && iy == 0 && iz == 0 {
                        continue;
                    }
                    for cx in -1i64..=1 {
                        for cy in -1i64..=1 {
                            for cz in -1i64..=1 {
                                let shift = [
                                    T::from(ix * 3 + cx).unwrap() * cycle[0],
                                    T::from(iy * 3 + cy).unwrap() * cycle[1],
                                    T::from(iz * 3 + cz).unwrap() * cycle[2],
                                ];
                                kernel.m2l(&target, &source, shift, &m, root_l);
                            }
                        }
                    }
                }
            }
        }
        let mut parent = source;
        parent.r = source.r * three;
        parent.scale = source.scale * three;
        let mut pm = vec![Complex::default(); nterm];
        for ix in -1i64..=1 {
            for iy in -1i64..=1 {
                for iz in -1i64..=1 {
                    if ix == 0 && iy == 0 && iz == 0 {
                        continue;
                    }
                    let mut child = source;
                    child.x = [
                        source.x[0] + T::from(ix).unwrap() * cycle[0],
                        source.x[1] + T::from(iy).unwrap() * cycle[1],
                        source.x[2] + T::from(iz).unwrap() * cycle[2],
                    ];
                    kernel.m2m(&parent, &child, &m, &mut pm);
                }
            }
        }
        source = parent;
        m = pm;
        for c in cycle.iter_mut() {
            *c *= three;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tree::build::build_tree;
    use crate::tree::helpers::points_fixture;
    use crate::tree::types::{Bounds, TreeKind};

    fn tree_of(n: usize, ncrit: usize, theta: f64) -> crate::tree::types::Octree<f64> {
        let mut bodies = points_fixture::<f64, f64>(n, None, None, Some(0));
        let bounds = Bounds::from_bodies(&bodies);
        let mut tree = build_tree(
            &mut bodies,
            bounds,
            TreeKind::Adaptive {
                ncrit,
                max_level: 8,
            },
        );
        // MAC radii are pre-divided by theta during the upward pass.
        for c in tree.cells.iter_mut() {
            c.r /= theta;
        }
        tree
    }

    #[test]
    fn test_every_leaf_pair_is_covered_once() {
        // Union of M2L and P2P interactions covers each (target leaf, source
        // leaf) pair exactly once, counting an M2L at an ancestor as covering
        // all pairs below it.
        let tree = tree_of(300, 16, 0.5);
        let mut lists = InteractionLists::new(tree.n_cells());
        dual_traversal(&tree.cells, &tree.cells, [0.0; 3], false, 1 << 30, &mut lists);

        // descendants[c] = set of leaves under c (inclusive).
        let n = tree.n_cells();
        let mut desc: Vec<Vec<usize>> = vec![Vec::new(); n];
        for i in (0..n).rev() {
            if tree.cells[i].is_leaf() {
                desc[i].push(i);
            } else {
                let children: Vec<usize> = tree.cells[i].children().collect();
                for c in children {
                    let d = desc[c].clone();
                    desc[i].extend(d);
                }
            }
        }

        let leaves: Vec<usize> = tree.leaves().collect();
        let mut covered = std::collections::HashMap::new();
        for t in 0..n {
            for &(s, _) in &lists.m2l[t] {
                for &lt in &desc[t] {
                    for &ls in &desc[s] {
                        *covered.entry((lt, ls)).or_insert(0) += 1;
                    }
                }
            }
            for &(s, _) in &lists.p2p[t] {
                *covered.entry((t, s)).or_insert(0) += 1;
            }
        }
        for &lt in &leaves {
            for &ls in &leaves {
                assert_eq!(
                    covered.get(&(lt, ls)).copied().unwrap_or(0),
                    1,
                    "pair ({}, {})",
                    lt,
                    ls
                );
            }
        }
    }

    #[test]
    fn test_mac_separation_of_m2l_pairs() {
        let tree = tree_of(500, 32, 0.4);
        let mut lists = InteractionLists::new(tree.n_cells());
        dual_traversal(&tree.cells, &tree.cells, [0.0; 3], false, 1 << 30, &mut lists);
        assert!(!lists.is_empty());
        for (t, l) in lists.m2l.iter().enumerate() {
            for &(s, _) in l {
                let ct = &tree.cells[t];
                let cs = &tree.cells[s];
                let d2: f64 = (0..3).map(|d| (ct.x[d] - cs.x[d]).powi(2)).sum();
                assert!(d2.sqrt() >= ct.r + cs.r);
            }
        }
    }

    #[test]
    fn test_mutual_walk_covers_same_interactions() {
        let tree = tree_of(400, 24, 0.5);
        let mut one_sided = InteractionLists::new(tree.n_cells());
        dual_traversal(
            &tree.cells,
            &tree.cells,
            [0.0; 3],
            false,
            1 << 30,
            &mut one_sided,
        );
        let mut mutual = InteractionLists::new(tree.n_cells());
        dual_traversal(&tree.cells, &tree.cells, [0.0; 3], true, 1 << 30, &mut mutual);

        // Same M2L interactions in both modes.
        let collect = |l: &InteractionLists<f64>| {
            let mut v: Vec<(usize, usize)> = l
                .m2l
                .iter()
                .enumerate()
                .flat_map(|(t, list)| list.iter().map(move |&(s, _)| (t, s)))
                .collect();
            v.sort_unstable();
            v
        };
        assert_eq!(collect(&one_sided), collect(&mutual));

        // Each unordered near pair appears once mutually, twice one sided.
        let n_one: usize = one_sided.p2p.iter().map(Vec::len).sum();
        let n_mut_off_diag = mutual.mutual_p2p.iter().filter(|(t, s, _)| t != s).count();
        let n_mut_diag = mutual.mutual_p2p.iter().filter(|(t, s, _)| t == s).count();
        assert_eq!(n_one, 2 * n_mut_off_diag + n_mut_diag);
    }

    #[test]
    fn test_single_leaf_periodic_stencil_visits_26_neighbors() {
        // One leaf tree under one image shell: every nonzero shift produces
        // exactly one near pair with the root.
        let mut bodies = points_fixture::<f64, f64>(512, None, None, Some(0));
        let bounds = Bounds::new(&[0.0; 3], &[1.0; 3]);
        let mut tree = build_tree(
            &mut bodies,
            bounds,
            TreeKind::Adaptive {
                ncrit: 1000,
                max_level: 8,
            },
        );
        assert_eq!(tree.n_cells(), 1);
        tree.cells[0].r /= 0.4;
        let cycle = bounds.cycle();
        let mut lists = InteractionLists::new(1);
        for ix in -1i64..=1 {
            for iy in -1i64..=1 {
                for iz in -1i64..=1 {
                    let shift = [
                        ix as f64 * cycle[0],
                        iy as f64 * cycle[1],
                        iz as f64 * cycle[2],
                    ];
                    dual_traversal(&tree.cells, &tree.cells, shift, false, 1 << 30, &mut lists);
                }
            }
        }
        let nonzero = lists.p2p[0]
            .iter()
            .filter(|(_, s)| s.iter().any(|&v| v != 0.0))
            .count();
        assert_eq!(nonzero, 26);
        assert_eq!(lists.p2p[0].len(), 27);
    }
}
