//! Upward (P2M, M2M) and downward (L2L, L2P) expansion passes.
//!
//! Both passes walk the tree level by level; cells of one level occupy a
//! contiguous block of the coefficient arrays, so the parent/child accesses
//! split cleanly at the level boundary and every cell's coefficients are
//! written from exactly one task.
use num_complex::Complex;
use rayon::prelude::*;

use crate::fmm::helpers::leaf_chunks;
use crate::traits::general::{FmmScalar, RealScalar};
use crate::traits::kernel::Kernel;
use crate::tree::types::{Body, Octree};

/// P2M at the leaves, M2M up to the root, then bake the acceptance radius
/// into every cell by dividing R by theta so traversal compares plain
/// distances against plain radii.
pub fn upward_pass<T, K>(
    kernel: &K,
    tree: &mut Octree<T>,
    bodies: &[Body<T, K::Value>],
    multipoles: &mut [Complex<T>],
    theta: T,
) where
    T: RealScalar,
    K: Kernel<T>,
{
    if tree.cells.is_empty() {
        return;
    }
    let nterm = kernel.nterm();
    for level in (0..=tree.depth).rev() {
        let range = tree.levels[level as usize].clone();
        let (head, tail) = multipoles.split_at_mut(range.end * nterm);
        let child_ms: &[Complex<T>] = tail;
        let level_ms = &mut head[range.start * nterm..];
        let cells = &tree.cells;
        level_ms
            .par_chunks_exact_mut(nterm)
            .zip(cells[range.clone()].par_iter())
            .for_each(|(m, cell)| {
                if cell.is_leaf() {
                    kernel.p2m(cell, &bodies[cell.bodies()], m);
                } else {
                    for c in cell.children() {
                        let mj = &child_ms[(c - range.end) * nterm..][..nterm];
                        kernel.m2m(cell, &cells[c], mj, m);
                    }
                }
            });
    }
    for cell in tree.cells.iter_mut() {
        cell.r = cell.r / theta;
    }
}

/// L2L from the root's children down, L2P at the leaves, and weight
/// propagation parent to child and leaf to body for load accounting.
pub fn downward_pass<T, K>(
    kernel: &K,
    tree: &mut Octree<T>,
    bodies: &mut [Body<T, K::Value>],
    locals: &mut [Complex<T>],
    potentials: &mut [[K::Value; 4]],
) where
    T: RealScalar,
    K: Kernel<T>,
{
    if tree.cells.is_empty() {
        return;
    }
    let nterm = kernel.nterm();

    for level in 1..=tree.depth {
        let range = tree.levels[level as usize].clone();
        let (head, tail) = locals.split_at_mut(range.start * nterm);
        let parent_ls: &[Complex<T>] = head;
        let level_ls = &mut tail[..range.len() * nterm];
        let cells = &tree.cells;
        level_ls
            .par_chunks_exact_mut(nterm)
            .zip(cells[range.clone()].par_iter())
            .for_each(|(l, cell)| {
                let lj = &parent_ls[cell.iparent * nterm..][..nterm];
                kernel.l2l(cell, &cells[cell.iparent], lj, l);
            });
    }

    // Weight accumulates down the tree before it is handed to the bodies.
    for i in 1..tree.cells.len() {
        let w = tree.cells[tree.cells[i].iparent].weight;
        tree.cells[i].weight += w;
    }

    {
        let cells = &tree.cells;
        let locals: &[Complex<T>] = locals;
        let bodies: &[Body<T, K::Value>] = bodies;
        let chunks = leaf_chunks(tree, potentials);
        chunks.into_par_iter().for_each(|(i, chunk)| {
            let cell = &cells[i];
            kernel.l2p(cell, &locals[i * nterm..][..nterm], &bodies[cell.bodies()], chunk);
        });
    }

    for i in tree.leaves().collect::<Vec<_>>() {
        let cell = tree.cells[i];
        for b in cell.bodies() {
            bodies[b].weight += cell.weight;
        }
    }
}

/// Dipole moment of the whole system about `x0`.
pub fn get_dipole<T, V>(bodies: &[Body<T, V>], x0: [T; 3]) -> [T; 3]
where
    T: RealScalar,
    V: FmmScalar<T>,
{
    let mut dipole = [T::zero(); 3];
    for body in bodies {
        for d in 0..3 {
            dipole[d] += (body.x[d] - x0[d]) * body.src.re();
        }
    }
    dipole
}

/// Subtract the uniform-background dipole term from every target, the
/// correction that makes periodic lattice sums of a neutral system
/// conditionally convergent.
pub fn dipole_correction<T, V>(bodies: &mut [Body<T, V>], dipole: [T; 3], cycle: [T; 3])
where
    T: RealScalar,
    V: FmmScalar<T>,
{
    let n = T::from(bodies.len()).unwrap();
    let four = T::from(4.0).unwrap();
    let three = T::from(3.0).unwrap();
    let coef = four * T::PI() / (three * cycle[0] * cycle[1] * cycle[2]);
    let norm = dipole[0] * dipole[0] + dipole[1] * dipole[1] + dipole[2] * dipole[2];
    for body in bodies.iter_mut() {
        body.trg[0] -= V::from_re_im(coef * norm / n, T::zero()) / body.src;
        for d in 0..3 {
            body.trg[d + 1] -= V::from_re_im(coef * dipole[d], T::zero());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::kernel::laplace::LaplaceKernel;
    use crate::tree::build::build_tree;
    use crate::tree::helpers::{points_fixture, zero_mean_charges};
    use crate::tree::types::{Bounds, Cell, TreeKind};

    #[test]
    fn test_upward_consistency() {
        // After the upward pass the root multipole reproduces the potential
        // of all bodies at a well separated target.
        let kernel = LaplaceKernel::<f64>::new(10, 0.0);
        let mut bodies = points_fixture::<f64, f64>(200, None, None, Some(0));
        zero_mean_charges(&mut bodies, 1);
        let bounds = Bounds::from_bodies(&bodies);
        let mut tree = build_tree(
            &mut bodies,
            bounds,
            TreeKind::Adaptive {
                ncrit: 16,
                max_level: 8,
            },
        );
        let nterm = kernel.nterm();
        let mut multipoles = vec![Complex::default(); tree.n_cells() * nterm];
        upward_pass(&kernel, &mut tree, &bodies, &mut multipoles, 1.0);

        let target = points_fixture::<f64, f64>(1, Some(20.0), Some(21.0), Some(3));
        let tcell = Cell::<f64> {
            x: target[0].x,
            r: 0.1,
            scale: 0.2,
            nbody: 1,
            ..Default::default()
        };
        let mut l = vec![Complex::default(); nterm];
        kernel.m2l(&tcell, &tree.cells[0], [0.0; 3], &multipoles[..nterm], &mut l);
        let mut far = vec![[0.0; 4]; 1];
        kernel.l2p(&tcell, &l, &target, &mut far);

        let mut direct = vec![[0.0; 4]; 1];
        kernel.p2p(&mut direct, &target, &bodies, [0.0; 3]);

        assert!(
            (far[0][0] - direct[0][0]).abs() < 1e-10 * direct[0][0].abs().max(1e-3),
            "{} vs {}",
            far[0][0],
            direct[0][0]
        );
    }

    #[test]
    fn test_upward_divides_radius_by_theta() {
        let kernel = LaplaceKernel::<f64>::new(4, 0.0);
        let mut bodies = points_fixture::<f64, f64>(50, None, None, Some(0));
        let bounds = Bounds::from_bodies(&bodies);
        let mut tree = build_tree(
            &mut bodies,
            bounds,
            TreeKind::Adaptive {
                ncrit: 8,
                max_level: 6,
            },
        );
        let r0 = tree.cells[0].r;
        let nterm = kernel.nterm();
        let mut multipoles = vec![Complex::default(); tree.n_cells() * nterm];
        upward_pass(&kernel, &mut tree, &bodies, &mut multipoles, 0.5);
        assert!((tree.cells[0].r - r0 / 0.5).abs() < 1e-15);
    }

    #[test]
    fn test_dipole_correction_energy_shift() {
        // The correction removes exactly coef * |D|^2 from the total energy
        // sum(q_i phi_i).
        let mut bodies = points_fixture::<f64, f64>(100, None, None, Some(0));
        for b in bodies.iter_mut() {
            b.src = b.x[2] - 0.5;
            b.trg = [1.0; 4];
        }
        let cycle = [1.0; 3];
        let dipole = get_dipole(&bodies, [0.5; 3]);
        let before: f64 = bodies.iter().map(|b| b.trg[0] * b.src).sum();
        dipole_correction(&mut bodies, dipole, cycle);
        let after: f64 = bodies.iter().map(|b| b.trg[0] * b.src).sum();
        let coef = 4.0 * std::f64::consts::PI / 3.0;
        let norm = dipole.iter().map(|d| d * d).sum::<f64>();
        assert!((before - after - coef * norm).abs() < 1e-12);
    }
}
