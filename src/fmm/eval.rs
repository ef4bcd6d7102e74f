//! Orchestration of the FMM phases and the reference direct evaluator.
use num_complex::Complex;
use rayon::prelude::*;

use crate::fmm::exchange::{route_bodies, LetPacket};
use crate::fmm::helpers::{disjoint_ranges_mut, leaf_chunks, optionally_time};
use crate::fmm::partition::bisection;
use crate::fmm::passes::{downward_pass, upward_pass};
use crate::fmm::traversal::{dual_traversal, periodic_far_field, InteractionLists};
use crate::fmm::types::Fmm;
use crate::traits::general::RealScalar;
use crate::traits::kernel::Kernel;
use crate::traits::types::{FmmError, FmmOperatorTime, FmmOperatorType};
use crate::tree::build::build_tree;
use crate::tree::types::{Body, Bounds, Cell, Octree, TreeKind};

/// Translate every far field list entry into the target's local expansion.
/// Targets parallelize over disjoint coefficient chunks; source multipoles
/// are read-only.
pub fn evaluate_m2l<T, K>(
    kernel: &K,
    tcells: &[Cell<T>],
    scells: &[Cell<T>],
    smultipoles: &[Complex<T>],
    lists: &InteractionLists<T>,
    locals: &mut [Complex<T>],
) where
    T: RealScalar,
    K: Kernel<T>,
{
    let nterm = kernel.nterm();
    locals
        .par_chunks_exact_mut(nterm)
        .enumerate()
        .for_each(|(i, l)| {
            for &(j, shift) in &lists.m2l[i] {
                let mj = &smultipoles[j * nterm..(j + 1) * nterm];
                kernel.m2l(&tcells[i], &scells[j], shift, mj, l);
            }
        });
}

/// Evaluate every near field list entry directly. Target leaves parallelize
/// over disjoint accumulator chunks; sources are read-only. Source cells
/// whose bodies did not travel (truncated remote cells) are skipped.
pub fn evaluate_p2p<T, K>(
    kernel: &K,
    tree: &Octree<T>,
    tbodies: &[Body<T, K::Value>],
    scells: &[Cell<T>],
    sbodies: &[Body<T, K::Value>],
    lists: &InteractionLists<T>,
    potentials: &mut [[K::Value; 4]],
) where
    T: RealScalar,
    K: Kernel<T>,
{
    let chunks = leaf_chunks(tree, potentials);
    chunks.into_par_iter().for_each(|(i, chunk)| {
        let ti = &tbodies[tree.cells[i].bodies()];
        for &(j, shift) in &lists.p2p[i] {
            let cs = &scells[j];
            if cs.body <= sbodies.len() && sbodies.len() - cs.body >= cs.nbody {
                kernel.p2p(chunk, ti, &sbodies[cs.bodies()], shift);
            }
        }
    });
}

/// Evaluate the symmetric near field tasks on one task, both sides of each
/// pair at once.
pub fn evaluate_p2p_mutual<T, K>(
    kernel: &K,
    cells: &[Cell<T>],
    bodies: &[Body<T, K::Value>],
    tasks: &[(usize, usize, [T; 3])],
    potentials: &mut [[K::Value; 4]],
) where
    T: RealScalar,
    K: Kernel<T>,
{
    for &(t, s, shift) in tasks {
        if t == s {
            let range = cells[t].bodies();
            kernel.p2p_within(&mut potentials[range.clone()], &bodies[range]);
        } else {
            let (ti, tj) = (cells[t].bodies(), cells[s].bodies());
            let (pi, pj) = disjoint_ranges_mut(potentials, ti.clone(), tj.clone());
            kernel.p2p_mutual(pi, pj, &bodies[ti], &bodies[tj], shift);
        }
    }
}

/// Reference O(N^2) evaluation of `sources` onto `targets`, with periodic
/// image shifts when `images > 0`. Writes straight into the targets.
pub fn direct<T, K>(
    kernel: &K,
    targets: &mut [Body<T, K::Value>],
    sources: &[Body<T, K::Value>],
    cycle: [T; 3],
    images: usize,
) where
    T: RealScalar,
    K: Kernel<T>,
{
    let range = (3i64.pow(images as u32) - 1) / 2;
    let mut out = vec![[K::Value::default(); 4]; targets.len()];
    for jx in -range..=range {
        for jy in -range..=range {
            for jz in -range..=range {
                let shift = [
                    T::from(jx).unwrap() * cycle[0],
                    T::from(jy).unwrap() * cycle[1],
                    T::from(jz).unwrap() * cycle[2],
                ];
                kernel.p2p(&mut out, targets, sources, shift);
            }
        }
    }
    for (body, acc) in targets.iter_mut().zip(&out) {
        for d in 0..4 {
            body.trg[d] += acc[d];
        }
    }
}

impl<T, K> Fmm<T, K>
where
    T: RealScalar,
    K: Kernel<T>,
{
    fn record(&mut self, op: FmmOperatorType, duration: Option<std::time::Duration>) {
        if let Some(d) = duration {
            self.operator_times
                .push(FmmOperatorTime::from_duration(op, d));
        }
    }

    /// The bounds this solve encodes against: the global box when one was
    /// installed by the distributed layer, the local box otherwise.
    pub fn bounds(&self) -> Bounds<T> {
        self.global_bounds
            .unwrap_or_else(|| Bounds::from_bodies(&self.bodies))
    }

    /// Replace the body set, preserving caller-assigned identities.
    pub fn set_bodies(&mut self, bodies: Vec<Body<T, K::Value>>) {
        self.bodies = bodies;
    }

    /// The bodies in their current (tree) order.
    pub fn get_bodies(&self) -> &[Body<T, K::Value>] {
        &self.bodies
    }

    /// Zero the target accumulators ahead of a fresh solve.
    pub fn clear_targets(&mut self) {
        for body in self.bodies.iter_mut() {
            body.trg = [K::Value::default(); 4];
        }
    }

    /// Stamp destination ranks by recursive bisection and group the bodies
    /// by owner. The transport layer (or an in-process harness) delivers the
    /// buckets; ingest the local one with [`Fmm::set_bodies`].
    pub fn partition(&mut self, nranks: usize) -> Vec<Vec<Body<T, K::Value>>> {
        let bounds = self.bounds();
        let mut bodies = std::mem::take(&mut self.bodies);
        bisection(&mut bodies, &bounds, nranks);
        route_bodies(bodies, nranks)
    }

    /// Build the local tree and size the per-solve state.
    pub fn prepare(&mut self) {
        let bounds = Bounds::from_bodies(&self.bodies);
        let kind = if self.params.uniform {
            TreeKind::Uniform {
                depth: self.params.max_level,
            }
        } else {
            TreeKind::Adaptive {
                ncrit: self.params.ncrit,
                max_level: self.params.max_level,
            }
        };
        self.tree = build_tree(&mut self.bodies, bounds, kind);
        let nterm = self.kernel.nterm();
        self.multipoles = vec![Complex::default(); self.tree.n_cells() * nterm];
        self.locals = vec![Complex::default(); self.tree.n_cells() * nterm];
        self.potentials = vec![[K::Value::default(); 4]; self.bodies.len()];
        self.operator_times.clear();
    }

    /// P2M and M2M, leaves to root.
    pub fn upward(&mut self) {
        let timed = self.params.timed;
        let theta = self.params.theta;
        let (kernel, tree, bodies, multipoles) = (
            &self.kernel,
            &mut self.tree,
            &self.bodies,
            &mut self.multipoles,
        );
        let (_, d) = optionally_time(timed, || {
            upward_pass(kernel, tree, bodies, multipoles, theta);
        });
        self.record(FmmOperatorType::UpwardPass, d);
    }

    /// Walk the local tree against itself (under all periodic shifts) and
    /// evaluate the resulting lists.
    pub fn traverse_local(&mut self) {
        let n_cells = self.tree.n_cells();
        if n_cells == 0 {
            return;
        }
        let timed = self.params.timed;
        let nspawn = self.params.nspawn;
        let images = self.params.images;
        let mutual = self.params.mutual;
        let cycle = self.bounds().cycle();

        let mut lists = InteractionLists::new(n_cells);
        let cells = &self.tree.cells;
        let (_, d) = optionally_time(timed, || {
            if images == 0 {
                dual_traversal(cells, cells, [T::zero(); 3], mutual, nspawn, &mut lists);
            } else {
                for ix in -1i64..=1 {
                    for iy in -1i64..=1 {
                        for iz in -1i64..=1 {
                            let shift = [
                                T::from(ix).unwrap() * cycle[0],
                                T::from(iy).unwrap() * cycle[1],
                                T::from(iz).unwrap() * cycle[2],
                            ];
                            let zero = ix == 0 && iy == 0 && iz == 0;
                            dual_traversal(cells, cells, shift, mutual && zero, nspawn, &mut lists);
                        }
                    }
                }
            }
        });
        self.record(FmmOperatorType::Traversal, d);

        for (i, l) in lists.m2l.iter().enumerate() {
            self.tree.cells[i].weight += T::from(l.len()).unwrap();
        }
        for (i, l) in lists.p2p.iter().enumerate() {
            let work: usize = l.iter().map(|&(j, _)| self.tree.cells[j].nbody).sum();
            self.tree.cells[i].weight += T::from(work).unwrap();
        }

        self.evaluate_lists_on_self(&lists);

        if images > 1 {
            let nterm = self.kernel.nterm();
            let (kernel, tree, multipoles, locals) = (
                &self.kernel,
                &self.tree,
                &self.multipoles,
                &mut self.locals,
            );
            let (_, d) = optionally_time(timed, || {
                periodic_far_field(
                    kernel,
                    &tree.cells[0],
                    &multipoles[..nterm],
                    &mut locals[..nterm],
                    cycle,
                    images,
                );
            });
            self.record(FmmOperatorType::PeriodicFarField, d);
        }
    }

    fn evaluate_lists_on_self(&mut self, lists: &InteractionLists<T>) {
        let timed = self.params.timed;
        {
            let (kernel, tree, multipoles, locals) = (
                &self.kernel,
                &self.tree,
                &self.multipoles,
                &mut self.locals,
            );
            let (_, d) = optionally_time(timed, || {
                evaluate_m2l(kernel, &tree.cells, &tree.cells, multipoles, lists, locals);
            });
            self.record(FmmOperatorType::M2L, d);
        }
        {
            let (kernel, tree, bodies, potentials) = (
                &self.kernel,
                &self.tree,
                &self.bodies,
                &mut self.potentials,
            );
            let (_, d) = optionally_time(timed, || {
                evaluate_p2p(kernel, tree, bodies, &tree.cells, bodies, lists, potentials);
                evaluate_p2p_mutual(kernel, &tree.cells, bodies, &lists.mutual_p2p, potentials);
            });
            self.record(FmmOperatorType::P2P, d);
        }
    }

    /// Walk the local tree against a received locally essential tree and
    /// evaluate the resulting lists against the packet's multipoles and
    /// bodies. Symmetric evaluation never crosses the rank boundary.
    pub fn traverse_remote(&mut self, packet: &LetPacket<T, K::Value>) {
        if packet.cells.is_empty() || self.tree.n_cells() == 0 {
            return;
        }
        let nspawn = self.params.nspawn;
        let images = self.params.images;
        let cycle = self.bounds().cycle();

        let mut lists = InteractionLists::new(self.tree.n_cells());
        if images == 0 {
            dual_traversal(
                &self.tree.cells,
                &packet.cells,
                [T::zero(); 3],
                false,
                nspawn,
                &mut lists,
            );
        } else {
            for ix in -1i64..=1 {
                for iy in -1i64..=1 {
                    for iz in -1i64..=1 {
                        let shift = [
                            T::from(ix).unwrap() * cycle[0],
                            T::from(iy).unwrap() * cycle[1],
                            T::from(iz).unwrap() * cycle[2],
                        ];
                        dual_traversal(
                            &self.tree.cells,
                            &packet.cells,
                            shift,
                            false,
                            nspawn,
                            &mut lists,
                        );
                    }
                }
            }
        }
        evaluate_m2l(
            &self.kernel,
            &self.tree.cells,
            &packet.cells,
            &packet.multipoles,
            &lists,
            &mut self.locals,
        );
        evaluate_p2p(
            &self.kernel,
            &self.tree,
            &self.bodies,
            &packet.cells,
            &packet.bodies,
            &lists,
            &mut self.potentials,
        );
    }

    /// L2L and L2P, root to bodies.
    pub fn downward(&mut self) {
        let timed = self.params.timed;
        let (kernel, tree, bodies, locals, potentials) = (
            &self.kernel,
            &mut self.tree,
            &mut self.bodies,
            &mut self.locals,
            &mut self.potentials,
        );
        let (_, d) = optionally_time(timed, || {
            downward_pass(kernel, tree, bodies, locals, potentials);
        });
        self.record(FmmOperatorType::DownwardPass, d);
    }

    /// Merge the per-solve accumulators into the bodies.
    pub fn write_back(&mut self) {
        for (body, acc) in self.bodies.iter_mut().zip(&self.potentials) {
            for d in 0..4 {
                body.trg[d] += acc[d];
            }
        }
    }

    /// One full single-rank evaluation over the loaded bodies.
    pub fn solve(&mut self) -> Result<(), FmmError> {
        self.prepare();
        self.upward();
        self.traverse_local();
        self.downward();
        self.write_back();
        Ok(())
    }

    /// Reference all-pairs evaluation of `sources` onto the loaded bodies.
    pub fn direct(&mut self, sources: &[Body<T, K::Value>]) {
        let timed = self.params.timed;
        let images = self.params.images;
        let cycle = self.bounds().cycle();
        let (kernel, bodies) = (&self.kernel, &mut self.bodies);
        let (_, d) = optionally_time(timed, || {
            direct(kernel, bodies, sources, cycle, images);
        });
        self.record(FmmOperatorType::Direct, d);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fmm::builder::FmmBuilder;
    use crate::fmm::helpers::l2_error;
    use crate::fmm::types::FmmParameters;
    use crate::kernel::laplace::LaplaceKernel;
    use crate::tree::helpers::{points_fixture, zero_mean_charges};

    fn laplace_fmm(
        n: usize,
        params: FmmParameters<f64>,
        p: usize,
        seed: u64,
    ) -> Fmm<f64, LaplaceKernel<f64>> {
        let mut bodies = points_fixture::<f64, f64>(n, None, None, Some(seed));
        zero_mean_charges(&mut bodies, seed + 1);
        FmmBuilder::new()
            .kernel(LaplaceKernel::new(p, 0.0))
            .bodies(bodies)
            .parameters(params)
            .unwrap()
            .build()
            .unwrap()
    }

    #[test]
    fn test_solve_matches_direct_laplace() {
        let params = FmmParameters {
            theta: 0.4,
            ncrit: 64,
            ..Default::default()
        };
        let mut fmm = laplace_fmm(1000, params, 7, 0);
        fmm.solve().unwrap();

        let sources = fmm.get_bodies().to_vec();
        let mut reference = sources.clone();
        for b in reference.iter_mut() {
            b.trg = [0.0; 4];
        }
        direct(&fmm.kernel, &mut reference, &sources, [1.0; 3], 0);

        let found: Vec<f64> = fmm.get_bodies().iter().map(|b| b.trg[0]).collect();
        let expected: Vec<f64> = reference.iter().map(|b| b.trg[0]).collect();
        let err = l2_error::<f64, f64>(&found, &expected);
        assert!(err < 1e-4, "relative potential error {}", err);
    }

    #[test]
    fn test_mutual_matches_one_sided() {
        let params = FmmParameters {
            theta: 0.5,
            ncrit: 32,
            ..Default::default()
        };
        let mut one = laplace_fmm(600, params, 6, 3);
        one.solve().unwrap();

        let mutual_params = FmmParameters {
            mutual: true,
            ..params
        };
        let mut two = laplace_fmm(600, mutual_params, 6, 3);
        two.solve().unwrap();

        let a: Vec<f64> = one.get_bodies().iter().map(|b| b.trg[0]).collect();
        let b: Vec<f64> = two.get_bodies().iter().map(|b| b.trg[0]).collect();
        assert!(l2_error::<f64, f64>(&a, &b) < 1e-12);
    }

    #[test]
    fn test_partition_routes_all_bodies() {
        let mut fmm = laplace_fmm(400, FmmParameters::default(), 4, 9);
        let buckets = fmm.partition(4);
        assert_eq!(buckets.len(), 4);
        assert_eq!(buckets.iter().map(Vec::len).sum::<usize>(), 400);
        fmm.set_bodies(buckets.into_iter().next().unwrap());
        fmm.solve().unwrap();
    }

    #[test]
    fn test_empty_body_set() {
        let mut fmm = laplace_fmm(0, FmmParameters::default(), 4, 0);
        fmm.solve().unwrap();
        assert_eq!(fmm.tree.n_cells(), 0);
    }

    #[test]
    fn test_timed_solve_records_phases() {
        let params = FmmParameters {
            timed: true,
            ..Default::default()
        };
        let mut fmm = laplace_fmm(300, params, 4, 5);
        fmm.solve().unwrap();
        assert!(fmm.operator_times.len() >= 4);
    }

    #[test]
    fn test_uniform_variant_matches_adaptive() {
        let adaptive = FmmParameters {
            theta: 0.5,
            ncrit: 16,
            ..Default::default()
        };
        let mut a = laplace_fmm(500, adaptive, 6, 7);
        a.solve().unwrap();

        let uniform = FmmParameters {
            theta: 0.5,
            uniform: true,
            max_level: 3,
            ..Default::default()
        };
        let mut u = laplace_fmm(500, uniform, 6, 7);
        u.solve().unwrap();

        // The two trees order bodies differently; align on identity.
        let mut av = vec![0.0; 500];
        for b in a.get_bodies() {
            av[b.ibody] = b.trg[0];
        }
        let mut uv = vec![0.0; 500];
        for b in u.get_bodies() {
            uv[b.ibody] = b.trg[0];
        }
        assert!(l2_error::<f64, f64>(&uv, &av) < 1e-4);
    }
}
