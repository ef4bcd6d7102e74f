//! Multi-rank semantics exercised in one process: the partition, body
//! routing and locally essential tree logic are pure, so two FMM instances
//! can play both sides of the exchange.
use itertools::Itertools;
use sphfmm::fmm::eval::direct;
use sphfmm::fmm::exchange::{graft, rank_bounds, route_bodies, set_let, LetPacket};
use sphfmm::fmm::helpers::l2_error;
use sphfmm::fmm::partition::bisection;
use sphfmm::traits::kernel::Kernel;
use sphfmm::tree::helpers::{points_fixture, zero_mean_charges};
use sphfmm::{Body, Bounds, Fmm, FmmBuilder, FmmParameters, LaplaceKernel};

fn fixture(n: usize) -> Vec<Body<f64, f64>> {
    let mut bodies = points_fixture::<f64, f64>(n, None, None, Some(0));
    zero_mean_charges(&mut bodies, 1);
    bodies
}

fn rank_fmm(bodies: Vec<Body<f64, f64>>, params: FmmParameters<f64>) -> Fmm<f64, LaplaceKernel<f64>> {
    FmmBuilder::new()
        .kernel(LaplaceKernel::new(7, 0.0))
        .bodies(bodies)
        .parameters(params)
        .unwrap()
        .build()
        .unwrap()
}

/// Run `nranks` FMM instances to completion with in-process LET routing and
/// return the potentials indexed by body identity.
fn solve_partitioned(n: usize, nranks: usize, use_graft: bool) -> Vec<f64> {
    let params = FmmParameters {
        theta: 0.4,
        ncrit: 48,
        ..Default::default()
    };

    let mut bodies = fixture(n);
    let global = Bounds::from_bodies(&bodies);
    bisection(&mut bodies, &global, nranks);
    let buckets = route_bodies(bodies.clone(), nranks);

    let regions = rank_bounds(&bodies, nranks);
    let mut fmms = buckets
        .into_iter()
        .map(|bucket| rank_fmm(bucket, params))
        .collect_vec();

    for fmm in fmms.iter_mut() {
        fmm.prepare();
        fmm.upward();
    }

    // Every ordered (source, target) pair of distinct ranks gets a packet.
    let nterm = fmms[0].kernel.nterm();
    let cycle = global.cycle();
    let mut packets: Vec<Vec<LetPacket<f64, f64>>> = Vec::new();
    for source in 0..nranks {
        let fmm = &fmms[source];
        packets.push(
            (0..nranks)
                .map(|target| {
                    if target == source {
                        LetPacket::default()
                    } else {
                        set_let(
                            &fmm.tree.cells,
                            &fmm.multipoles,
                            nterm,
                            fmm.get_bodies(),
                            &regions[target],
                            cycle,
                            0,
                            nranks,
                        )
                    }
                })
                .collect_vec(),
        );
    }

    for (rank, fmm) in fmms.iter_mut().enumerate() {
        fmm.traverse_local();
        if use_graft {
            let inbound = (0..nranks)
                .filter(|&source| source != rank)
                .map(|source| packets[source][rank].clone())
                .collect_vec();
            let grafted = graft(&fmm.kernel, &inbound, &global, params.theta);
            fmm.traverse_remote(&grafted);
        } else {
            for source in 0..nranks {
                if source != rank {
                    fmm.traverse_remote(&packets[source][rank]);
                }
            }
        }
        fmm.downward();
        fmm.write_back();
    }

    let mut out = vec![0.0; n];
    for fmm in &fmms {
        for b in fmm.get_bodies() {
            out[b.ibody] = b.trg[0];
        }
    }
    out
}

fn reference_potentials(n: usize) -> Vec<f64> {
    let bodies = fixture(n);
    let kernel = LaplaceKernel::new(7, 0.0);
    let sources = bodies.clone();
    let mut targets = bodies;
    direct(&kernel, &mut targets, &sources, [1.0; 3], 0);
    let mut out = vec![0.0; n];
    for b in &targets {
        out[b.ibody] = b.trg[0];
    }
    out
}

#[test]
fn let_exchange_closes_the_traversal() {
    let n = 800;
    let expected = reference_potentials(n);
    let found = solve_partitioned(n, 2, false);
    let err = l2_error::<f64, f64>(&found, &expected);
    assert!(err < 1e-4, "two-rank LET error {}", err);
}

#[test]
fn let_exchange_matches_across_rank_counts() {
    let n = 600;
    let expected = reference_potentials(n);
    for nranks in [3, 4] {
        let found = solve_partitioned(n, nranks, false);
        let err = l2_error::<f64, f64>(&found, &expected);
        assert!(err < 1e-4, "{}-rank LET error {}", nranks, err);
    }
}

#[test]
fn grafted_global_tree_matches_pairwise_lets() {
    let n = 800;
    let expected = reference_potentials(n);
    let found = solve_partitioned(n, 2, true);
    let err = l2_error::<f64, f64>(&found, &expected);
    assert!(err < 1e-4, "grafted error {}", err);
}

#[test]
fn partition_preserves_identity_and_strength() {
    let n = 2000;
    let mut bodies = fixture(n);
    let sources: Vec<(usize, f64)> = bodies.iter().map(|b| (b.ibody, b.src)).sorted_by(|a, b| a.0.cmp(&b.0)).collect();
    let bounds = Bounds::from_bodies(&bodies);
    bisection(&mut bodies, &bounds, 2);
    let buckets = route_bodies(bodies, 2);

    // S4: both ranks own 900..=1100 bodies and identities tile [0, 2000).
    for bucket in &buckets {
        assert!((900..=1100).contains(&bucket.len()), "{}", bucket.len());
    }
    let routed: Vec<(usize, f64)> = buckets
        .iter()
        .flat_map(|b| b.iter().map(|x| (x.ibody, x.src)))
        .sorted_by(|a, b| a.0.cmp(&b.0))
        .collect();
    assert_eq!(routed, sources);
}
