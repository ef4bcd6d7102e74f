//! Distributed memory layer over MPI: bounds reduction, Morton key
//! multisection partitioning, body exchange and the locally essential tree
//! exchange. Requires the `mpi` feature and a system MPI installation.
//!
//! All selection and serialization logic lives in the pure modules; this
//! layer only moves buffers with collective operations. Complex payloads
//! travel as interleaved real pairs so only the real scalar needs an MPI
//! datatype.
use itertools::Itertools;
use mpi::collective::SystemOperation;
use mpi::datatype::{Partition, PartitionMut};
use mpi::traits::{Communicator, CommunicatorCollectives, Equivalence, Root};
use mpi::Count;
use num_complex::{Complex, ComplexFloat};

use crate::fmm::exchange::{set_let, LetPacket};
use crate::fmm::types::Fmm;
use crate::traits::general::{FmmScalar, RealScalar};
use crate::traits::kernel::Kernel;
use crate::traits::types::FmmError;
use crate::tree::morton::encode;
use crate::tree::types::{Body, Bounds, Cell};

/// Reals per serialized body: position, strength (re, im), quadrature
/// weight, load weight.
const BODY_REALS: usize = 7;
/// Integers per serialized body: identity and destination rank.
const BODY_INTS: usize = 2;
/// Reals per serialized cell: center, radius, scale, weight.
const CELL_REALS: usize = 6;
/// Integers per serialized cell: key, level, body, nbody, ichild, nchild,
/// iparent.
const CELL_INTS: usize = 7;

fn displacements(counts: &[Count]) -> Vec<Count> {
    counts
        .iter()
        .scan(0, |acc, &x| {
            let tmp = *acc;
            *acc += x;
            Some(tmp)
        })
        .collect_vec()
}

/// Elementwise min/max reduction of local bounds across all ranks.
pub fn all_reduce_bounds<T, C>(local: &Bounds<T>, comm: &C) -> Bounds<T>
where
    T: RealScalar + Equivalence,
    C: Communicator,
{
    let size = comm.size() as usize;
    let corners = [
        local.xmin[0],
        local.xmin[1],
        local.xmin[2],
        local.xmax[0],
        local.xmax[1],
        local.xmax[2],
    ];
    let mut buffer = vec![T::default(); 6 * size];
    comm.all_gather_into(&corners[..], &mut buffer[..]);
    let mut global = *local;
    for chunk in buffer.chunks_exact(6) {
        let other = Bounds::new(
            &[chunk[0], chunk[1], chunk[2]],
            &[chunk[3], chunk[4], chunk[5]],
        );
        global = global.union(&other);
    }
    global
}

/// Gather the local bounds of every rank, the regions LET selection runs
/// against.
pub fn all_gather_bounds<T, C>(local: &Bounds<T>, comm: &C) -> Vec<Bounds<T>>
where
    T: RealScalar + Equivalence,
    C: Communicator,
{
    let size = comm.size() as usize;
    let corners = [
        local.xmin[0],
        local.xmin[1],
        local.xmin[2],
        local.xmax[0],
        local.xmax[1],
        local.xmax[2],
    ];
    let mut buffer = vec![T::default(); 6 * size];
    comm.all_gather_into(&corners[..], &mut buffer[..]);
    buffer
        .chunks_exact(6)
        .map(|c| Bounds::new(&[c[0], c[1], c[2]], &[c[3], c[4], c[5]]))
        .collect_vec()
}

/// Sampled candidate boundaries of the current selection region, gathered,
/// deduplicated on the nominated rank and rebroadcast.
fn get_bucket<C>(region: &[u64], comm: &C, max_bucket: usize) -> Vec<u64>
where
    C: Communicator,
{
    let size = comm.size() as usize;
    let num_sample = (max_bucket / size).max(1).min(region.len());
    let stride = if num_sample > 0 {
        (region.len() / num_sample).max(1)
    } else {
        1
    };
    let samples = (0..num_sample).map(|i| region[i * stride]).collect_vec();

    let mut counts = vec![0 as Count; size];
    comm.all_gather_into(&(samples.len() as Count), &mut counts[..]);
    let displs = displacements(&counts);
    let total: Count = counts.iter().sum();

    let mut gathered = vec![0u64; total as usize];
    {
        let mut partition = PartitionMut::new(&mut gathered[..], counts, displs);
        comm.all_gather_varcount_into(&samples[..], &mut partition);
    }
    gathered.sort_unstable();
    gathered.dedup();
    gathered
}

/// The globally `n`-th smallest key across all ranks, each rank holding a
/// locally sorted slice. Iterative bucket refinement with the deliberate
/// overshoot floor.
pub fn nth_element_distributed<C>(sorted: &[u64], n: u64, comm: &C) -> u64
where
    C: Communicator,
{
    let max_bucket = 1000;
    let root = comm.process_at_rank(0);
    let rank = comm.rank();

    let mut lo = 0usize;
    let mut num = sorted.len();
    let mut g_offset = 0u64;
    loop {
        let buckets = get_bucket(&sorted[lo..lo + num], comm, max_bucket);
        let nb = buckets.len();
        if nb <= 1 {
            // Everyone already agrees on the remaining candidate.
            return buckets.first().copied().unwrap_or(0);
        }

        let mut local_counts = vec![0u64; nb];
        let mut ic = 0;
        for i in 0..num {
            while sorted[lo + i] > buckets[ic] && ic < nb - 1 {
                ic += 1;
            }
            local_counts[ic] += 1;
        }

        let mut global_counts = vec![0u64; nb];
        if rank == 0 {
            root.reduce_into_root(
                &local_counts[..],
                &mut global_counts[..],
                SystemOperation::sum(),
            );
        } else {
            root.reduce_into(&local_counts[..], SystemOperation::sum());
        }

        let mut nth = 0u64;
        if rank == 0 {
            let mut scan = vec![0u64; nb];
            for i in 0..nb - 1 {
                scan[i + 1] = scan[i] + global_counts[i];
            }
            let mut k = 0usize;
            while k < nb && n - g_offset > scan[k] {
                k += 1;
            }
            // Step back over the overshoot; the floor is deliberate.
            let k = k.saturating_sub(1);
            nth = k as u64;
            g_offset += scan[k];
        }
        root.broadcast_into(&mut nth);
        root.broadcast_into(&mut g_offset);

        let nth = nth as usize;
        let mut local_scan = vec![0u64; nb];
        for i in 0..nb - 1 {
            local_scan[i + 1] = local_scan[i] + local_counts[i];
        }
        num = if nth == nb - 1 {
            num - local_scan[nth] as usize
        } else {
            (local_scan[nth + 1] - local_scan[nth]) as usize
        };
        lo += local_scan[nth] as usize;
    }
}

/// Stamp destination ranks by Morton key multisection: sort local bodies by
/// key, find the global key splitters with the distributed selection, and
/// assign each body the rank of its key interval.
pub fn partition_by_keys<T, V, C>(
    bodies: &mut [Body<T, V>],
    global: &Bounds<T>,
    max_level: u32,
    comm: &C,
) where
    T: RealScalar + Equivalence,
    V: FmmScalar<T>,
    C: Communicator,
{
    let size = comm.size() as usize;
    let mut keyed = bodies
        .iter()
        .map(|b| encode(&b.x, global, max_level))
        .collect_vec();
    keyed.sort_unstable();

    let mut total = 0u64;
    comm.all_reduce_into(
        &(bodies.len() as u64),
        &mut total,
        SystemOperation::sum(),
    );

    let splitters = (1..size)
        .map(|r| nth_element_distributed(&keyed, total * r as u64 / size as u64, comm))
        .collect_vec();

    for body in bodies.iter_mut() {
        let key = encode(&body.x, global, max_level);
        let rank = splitters.partition_point(|&s| s < key);
        body.irank = rank as i32;
    }
}

fn pack_bodies<T, V>(bodies: &[Body<T, V>], reals: &mut Vec<T>, ints: &mut Vec<i64>)
where
    T: RealScalar,
    V: FmmScalar<T>,
{
    for b in bodies {
        reals.extend_from_slice(&[
            b.x[0],
            b.x[1],
            b.x[2],
            b.src.re(),
            b.src.im(),
            b.qweight,
            b.weight,
        ]);
        ints.extend_from_slice(&[b.ibody as i64, b.irank as i64]);
    }
}

fn unpack_bodies<T, V>(reals: &[T], ints: &[i64]) -> Vec<Body<T, V>>
where
    T: RealScalar,
    V: FmmScalar<T>,
{
    reals
        .chunks_exact(BODY_REALS)
        .zip(ints.chunks_exact(BODY_INTS))
        .map(|(r, i)| Body {
            x: [r[0], r[1], r[2]],
            src: V::from_re_im(r[3], r[4]),
            qweight: r[5],
            trg: [V::default(); 4],
            ibody: i[0] as usize,
            irank: i[1] as i32,
            weight: r[6],
        })
        .collect_vec()
}

fn all_to_all_varcount<X, C>(send: &[X], counts: &[Count], comm: &C) -> (Vec<X>, Vec<Count>)
where
    X: Equivalence + Default + Clone,
    C: Communicator,
{
    let size = comm.size() as usize;
    let mut recv_counts = vec![0 as Count; size];
    comm.all_to_all_into(counts, &mut recv_counts[..]);

    let send_displs = displacements(counts);
    let recv_displs = displacements(&recv_counts);
    let total: Count = recv_counts.iter().sum();
    let mut recv = vec![X::default(); total as usize];
    {
        let partition = Partition::new(send, counts.to_vec(), send_displs);
        let mut partition_mut =
            PartitionMut::new(&mut recv[..], recv_counts.clone(), recv_displs);
        comm.all_to_all_varcount_into(&partition, &mut partition_mut);
    }
    (recv, recv_counts)
}

/// Deliver every body to the rank stamped in its `irank` with one count
/// exchange followed by one variable count payload exchange.
pub fn exchange_bodies<T, V, C>(buckets: Vec<Vec<Body<T, V>>>, comm: &C) -> Vec<Body<T, V>>
where
    T: RealScalar + Equivalence,
    V: FmmScalar<T>,
    C: Communicator,
{
    let mut reals = Vec::new();
    let mut ints = Vec::new();
    let mut real_counts = Vec::new();
    let mut int_counts = Vec::new();
    for bucket in &buckets {
        pack_bodies(bucket, &mut reals, &mut ints);
        real_counts.push((bucket.len() * BODY_REALS) as Count);
        int_counts.push((bucket.len() * BODY_INTS) as Count);
    }
    let (recv_reals, _) = all_to_all_varcount(&reals, &real_counts, comm);
    let (recv_ints, _) = all_to_all_varcount(&ints, &int_counts, comm);
    unpack_bodies(&recv_reals, &recv_ints)
}

fn pack_cells<T>(cells: &[Cell<T>], reals: &mut Vec<T>, ints: &mut Vec<i64>)
where
    T: RealScalar,
{
    for c in cells {
        reals.extend_from_slice(&[c.x[0], c.x[1], c.x[2], c.r, c.scale, c.weight]);
        ints.extend_from_slice(&[
            c.key as i64,
            c.level as i64,
            if c.body == usize::MAX { -1 } else { c.body as i64 },
            c.nbody as i64,
            c.ichild as i64,
            c.nchild as i64,
            c.iparent as i64,
        ]);
    }
}

fn unpack_cells<T>(reals: &[T], ints: &[i64]) -> Vec<Cell<T>>
where
    T: RealScalar,
{
    reals
        .chunks_exact(CELL_REALS)
        .zip(ints.chunks_exact(CELL_INTS))
        .map(|(r, i)| Cell {
            x: [r[0], r[1], r[2]],
            r: r[3],
            scale: r[4],
            weight: r[5],
            key: i[0] as u64,
            level: i[1] as u32,
            body: if i[2] < 0 { usize::MAX } else { i[2] as usize },
            nbody: i[3] as usize,
            ichild: i[4] as usize,
            nchild: i[5] as usize,
            iparent: i[6] as usize,
        })
        .collect_vec()
}

/// Exchange locally essential trees: each rank sends to every peer the
/// packet selected for it, and receives the peers' packets in rank order.
pub fn exchange_lets<T, V, C>(
    outbound: Vec<LetPacket<T, V>>,
    nterm: usize,
    comm: &C,
) -> Vec<LetPacket<T, V>>
where
    T: RealScalar + Equivalence,
    V: FmmScalar<T>,
    C: Communicator,
{
    let size = comm.size() as usize;
    let mut cell_reals = Vec::new();
    let mut cell_ints = Vec::new();
    let mut coeff_reals = Vec::new();
    let mut body_reals = Vec::new();
    let mut body_ints = Vec::new();
    let (mut crc, mut cic, mut mrc, mut brc, mut bic) = (
        Vec::with_capacity(size),
        Vec::with_capacity(size),
        Vec::with_capacity(size),
        Vec::with_capacity(size),
        Vec::with_capacity(size),
    );
    for packet in &outbound {
        pack_cells(&packet.cells, &mut cell_reals, &mut cell_ints);
        for m in &packet.multipoles {
            coeff_reals.push(m.re);
            coeff_reals.push(m.im);
        }
        pack_bodies(&packet.bodies, &mut body_reals, &mut body_ints);
        crc.push((packet.cells.len() * CELL_REALS) as Count);
        cic.push((packet.cells.len() * CELL_INTS) as Count);
        mrc.push((packet.multipoles.len() * 2) as Count);
        brc.push((packet.bodies.len() * BODY_REALS) as Count);
        bic.push((packet.bodies.len() * BODY_INTS) as Count);
    }

    let (r_cell_reals, r_crc) = all_to_all_varcount(&cell_reals, &crc, comm);
    let (r_cell_ints, _) = all_to_all_varcount(&cell_ints, &cic, comm);
    let (r_coeffs, _) = all_to_all_varcount(&coeff_reals, &mrc, comm);
    let (r_body_reals, r_brc) = all_to_all_varcount(&body_reals, &brc, comm);
    let (r_body_ints, _) = all_to_all_varcount(&body_ints, &bic, comm);

    // Slice the receive buffers back into per-peer packets.
    let mut packets = Vec::with_capacity(size);
    let mut cr = 0usize;
    let mut br = 0usize;
    for peer in 0..size {
        let n_cells = r_crc[peer] as usize / CELL_REALS;
        let n_bodies = r_brc[peer] as usize / BODY_REALS;
        let cells = unpack_cells(
            &r_cell_reals[cr * CELL_REALS..(cr + n_cells) * CELL_REALS],
            &r_cell_ints[cr * CELL_INTS..(cr + n_cells) * CELL_INTS],
        );
        let multipoles = r_coeffs[cr * 2 * nterm..(cr + n_cells) * 2 * nterm]
            .chunks_exact(2)
            .map(|c| Complex::new(c[0], c[1]))
            .collect_vec();
        let bodies = unpack_bodies(
            &r_body_reals[br * BODY_REALS..(br + n_bodies) * BODY_REALS],
            &r_body_ints[br * BODY_INTS..(br + n_bodies) * BODY_INTS],
        );
        packets.push(LetPacket {
            cells,
            multipoles,
            bodies,
        });
        cr += n_cells;
        br += n_bodies;
    }
    packets
}

/// One full distributed evaluation: reduce bounds, partition and exchange
/// bodies, build and traverse the local tree while the essential trees are
/// exchanged, close the traversal against each peer, then descend.
pub fn solve_distributed<T, K, C>(fmm: &mut Fmm<T, K>, comm: &C) -> Result<(), FmmError>
where
    T: RealScalar + Equivalence,
    K: Kernel<T>,
    C: Communicator,
{
    let rank = comm.rank() as usize;
    let size = comm.size() as usize;

    let local = Bounds::from_bodies(&fmm.bodies);
    let global = all_reduce_bounds(&local, comm);
    fmm.global_bounds = Some(global);

    let max_level = fmm.params.max_level;
    let mut bodies = std::mem::take(&mut fmm.bodies);
    partition_by_keys(&mut bodies, &global, max_level, comm);
    let mut buckets: Vec<Vec<Body<T, K::Value>>> = vec![Vec::new(); size];
    for body in bodies {
        buckets[body.irank as usize].push(body);
    }
    fmm.bodies = exchange_bodies(buckets, comm);

    fmm.prepare();
    fmm.upward();

    let rank_bounds = all_gather_bounds(&Bounds::from_bodies(&fmm.bodies), comm);
    let cycle = global.cycle();
    let nterm = fmm.kernel.nterm();
    let outbound = (0..size)
        .map(|peer| {
            if peer == rank {
                LetPacket::default()
            } else {
                set_let(
                    &fmm.tree.cells,
                    &fmm.multipoles,
                    nterm,
                    &fmm.bodies,
                    &rank_bounds[peer],
                    cycle,
                    fmm.params.images,
                    size,
                )
            }
        })
        .collect_vec();
    let packets = exchange_lets(outbound, nterm, comm);

    fmm.traverse_local();
    if fmm.params.graft {
        let grafted = crate::fmm::exchange::graft(
            &fmm.kernel,
            &packets
                .iter()
                .enumerate()
                .filter(|&(peer, _)| peer != rank)
                .map(|(_, p)| p.clone())
                .collect_vec(),
            &global,
            fmm.params.theta,
        );
        fmm.traverse_remote(&grafted);
    } else {
        for peer in 0..size {
            let packet = &packets[(rank + peer) % size];
            if peer != 0 {
                fmm.traverse_remote(packet);
            }
        }
    }

    fmm.downward();
    fmm.write_back();
    Ok(())
}
