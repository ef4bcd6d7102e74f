//! Locally essential trees: the subset of one rank's cells, multipoles and
//! bodies that a peer needs to close its traversal, serialized with
//! receiver-local indices.
//!
//! Selection walks the local tree against the peer's region with the same
//! acceptance test as traversal: a cell close enough to the peer's box that
//! the peer may need to open it ships its children; a leaf reached this way
//! ships its bodies; everything else is truncated to a multipole. The
//! logic is pure so the collective layer only moves buffers.
use num_complex::Complex;

use crate::traits::general::{FmmScalar, RealScalar};
use crate::traits::kernel::Kernel;
use crate::tree::build::build_tree;
use crate::tree::types::{Body, Bounds, Cell, TreeKind};

/// A flattened subtree bound for one peer: cells in breadth first order with
/// rewritten indices, their multipoles, and the bodies of shipped leaves.
#[derive(Debug, Clone, Default)]
pub struct LetPacket<T, V>
where
    T: RealScalar,
    V: FmmScalar<T>,
{
    /// Cell records with receiver-local `ichild`/`body` offsets.
    pub cells: Vec<Cell<T>>,

    /// `nterm` coefficients per shipped cell.
    pub multipoles: Vec<Complex<T>>,

    /// Bodies of the shipped leaves, grouped per leaf.
    pub bodies: Vec<Body<T, V>>,
}

/// Whether the peer may need to open `cell`: it overlaps the acceptance
/// sphere of some possible target in the peer's region, under any active
/// periodic shift. Cells much larger than the rank regions always divide so
/// every peer sees the coarse structure.
fn divides<T>(
    cell: &Cell<T>,
    remote: &Bounds<T>,
    cycle: [T; 3],
    images: usize,
    coarse_radius: T,
) -> bool
where
    T: RealScalar,
{
    let four = T::from(4.0).unwrap();
    let mut divide = false;
    if images == 0 {
        let r2 = remote.distance2(&cell.x, &[T::zero(); 3]);
        divide |= four * cell.r * cell.r > r2;
    } else {
        for ix in -1i64..=1 {
            for iy in -1i64..=1 {
                for iz in -1i64..=1 {
                    let shift = [
                        T::from(ix).unwrap() * cycle[0],
                        T::from(iy).unwrap() * cycle[1],
                        T::from(iz).unwrap() * cycle[2],
                    ];
                    let r2 = remote.distance2(&cell.x, &shift);
                    divide |= four * cell.r * cell.r > r2;
                }
            }
        }
    }
    divide | (cell.r > coarse_radius)
}

/// Select and serialize the subtree a peer with region `remote` needs.
///
/// Runs after the upward pass: cell radii already carry the acceptance
/// parameter and multipoles are final.
#[allow(clippy::too_many_arguments)]
pub fn set_let<T, V>(
    cells: &[Cell<T>],
    multipoles: &[Complex<T>],
    nterm: usize,
    bodies: &[Body<T, V>],
    remote: &Bounds<T>,
    cycle: [T; 3],
    images: usize,
    nranks: usize,
) -> LetPacket<T, V>
where
    T: RealScalar,
    V: FmmScalar<T>,
{
    let mut packet = LetPacket::default();
    if cells.is_empty() {
        return packet;
    }
    // Cells coarser than the rank subdivision always open up.
    let level_split = if nranks > 1 {
        (((nranks - 1) as f64).log2() / 3.0 + 1.0) as u32
    } else {
        1
    };
    let max_cycle = cycle[0].max(cycle[1]).max(cycle[2]);
    let coarse_radius = max_cycle / T::from(1u64 << (level_split + 1)).unwrap();

    packet.cells.push(cells[0]);
    packet.multipoles.extend_from_slice(&multipoles[..nterm]);

    // Breadth first over shipped cells keeps siblings contiguous.
    let mut queue = std::collections::VecDeque::new();
    queue.push_back((0usize, 0usize));
    while let Some((li, oi)) = queue.pop_front() {
        let cell = cells[li];
        if cell.is_leaf() {
            // A leaf reached through the walk fails the acceptance test for
            // some possible remote target; its bodies must travel.
            packet.cells[oi].body = packet.bodies.len();
            packet.bodies.extend_from_slice(&bodies[cell.bodies()]);
        } else if divides(&cell, remote, cycle, images, coarse_radius) {
            let first = packet.cells.len();
            packet.cells[oi].ichild = first;
            packet.cells[oi].nchild = cell.nchild;
            for (k, c) in cell.children().enumerate() {
                let mut record = cells[c];
                record.iparent = oi;
                packet.cells.push(record);
                packet
                    .multipoles
                    .extend_from_slice(&multipoles[c * nterm..(c + 1) * nterm]);
                queue.push_back((c, first + k));
            }
        } else {
            // Far from the peer everywhere: the multipole alone suffices.
            // The body count stays so the receiver's walk still translates
            // this cell; no bodies travel for it.
            packet.cells[oi].nchild = 0;
            packet.cells[oi].ichild = 0;
            packet.cells[oi].body = usize::MAX;
        }
    }
    // Body ranges of internal shipped cells are sender-local leftovers.
    for oi in 0..packet.cells.len() {
        if !packet.cells[oi].is_leaf() {
            packet.cells[oi].body = 0;
        }
    }
    packet
}

/// Per-rank bounding boxes of a partitioned body set, the regions LET
/// selection runs against.
pub fn rank_bounds<T, V>(bodies: &[Body<T, V>], nranks: usize) -> Vec<Bounds<T>>
where
    T: RealScalar,
    V: FmmScalar<T>,
{
    (0..nranks)
        .map(|rank| {
            let owned: Vec<Body<T, V>> = bodies
                .iter()
                .filter(|b| b.irank == rank as i32)
                .copied()
                .collect();
            Bounds::from_bodies(&owned)
        })
        .collect()
}

/// Group bodies by destination rank, the routing step of the body exchange.
/// Collective transports move the returned buckets; in-process callers hand
/// them straight to the receiving side.
pub fn route_bodies<T, V>(bodies: Vec<Body<T, V>>, nranks: usize) -> Vec<Vec<Body<T, V>>>
where
    T: RealScalar,
    V: FmmScalar<T>,
{
    let mut buckets: Vec<Vec<Body<T, V>>> = vec![Vec::new(); nranks];
    for body in bodies {
        let rank = body.irank as usize;
        assert!(rank < nranks, "body routed to nonexistent rank");
        buckets[rank].push(body);
    }
    buckets
}

/// Stitch received packets into one source tree under a coarse global tree:
/// every packet root becomes a super-body, a tree with unit leaves is built
/// over them, each of its leaves is replaced by the matching packet root,
/// and the coarse multipoles are filled by an M2M sweep.
pub fn graft<T, V, K>(
    kernel: &K,
    packets: &[LetPacket<T, V>],
    global_bounds: &Bounds<T>,
    theta: T,
) -> LetPacket<T, V>
where
    T: RealScalar,
    V: FmmScalar<T>,
    K: Kernel<T, Value = V>,
{
    let nterm = kernel.nterm();
    let live: Vec<usize> = (0..packets.len())
        .filter(|&k| !packets[k].cells.is_empty())
        .collect();

    let mut supers: Vec<Body<T, V>> = live
        .iter()
        .map(|&k| Body::new(packets[k].cells[0].x, V::default(), k))
        .collect();
    let mut out = LetPacket::default();
    if supers.is_empty() {
        return out;
    }

    let gtree = build_tree(
        &mut supers,
        *global_bounds,
        TreeKind::Adaptive {
            ncrit: 1,
            max_level: 10,
        },
    );
    let n_global = gtree.n_cells();
    out.cells = gtree.cells.clone();
    out.multipoles = vec![Complex::default(); n_global * nterm];

    // The coarse radii must be comparable with the receiver's own, which
    // already carry the acceptance parameter.
    for cell in out.cells.iter_mut() {
        cell.r = cell.r / theta;
        cell.nbody = 0;
        cell.body = 0;
    }

    // Splice each packet behind the global tree, rebasing its indices.
    let mut cell_offset = n_global;
    let mut body_offset = 0usize;
    let mut packet_base = vec![0usize; packets.len()];
    for &k in &live {
        let packet = &packets[k];
        packet_base[k] = cell_offset;
        for (i, cell) in packet.cells.iter().enumerate() {
            let mut record = *cell;
            if !record.is_leaf() {
                record.ichild += cell_offset;
            } else if record.body != usize::MAX {
                record.body += body_offset;
            }
            record.iparent = if i == 0 { 0 } else { record.iparent + cell_offset };
            out.cells.push(record);
        }
        out.multipoles.extend_from_slice(&packet.multipoles);
        out.bodies.extend_from_slice(&packet.bodies);
        cell_offset += packet.cells.len();
        body_offset += packet.bodies.len();
    }

    // Replace unit leaves of the global tree by the packet roots they hold.
    for gi in 0..n_global {
        if !gtree.cells[gi].is_leaf() {
            continue;
        }
        let k = supers[gtree.cells[gi].body].ibody;
        let base = packet_base[k];
        let root = &packets[k].cells[0];
        out.cells[gi].x = root.x;
        out.cells[gi].r = root.r;
        out.cells[gi].scale = root.scale;
        out.cells[gi].nchild = root.nchild;
        out.cells[gi].ichild = if root.is_leaf() { 0 } else { base + root.ichild };
        out.cells[gi].nbody = root.nbody;
        out.cells[gi].body = if root.is_leaf() {
            out.cells[base].body
        } else {
            0
        };
        let src = out.multipoles[base * nterm..(base + 1) * nterm].to_vec();
        out.multipoles[gi * nterm..(gi + 1) * nterm].copy_from_slice(&src);
    }

    // Count bodies up the coarse tree so traversal does not skip it, then
    // fill coarse multipoles bottom up.
    for gi in (0..n_global).rev() {
        if gtree.cells[gi].is_leaf() {
            continue;
        }
        let mut nbody = 0;
        for c in out.cells[gi].children() {
            nbody += out.cells[c].nbody.max(1);
        }
        out.cells[gi].nbody = nbody;
    }
    for gi in (0..n_global).rev() {
        if gtree.cells[gi].is_leaf() {
            continue;
        }
        let parent = out.cells[gi];
        let mut pm = vec![Complex::default(); nterm];
        for c in parent.children() {
            let child = out.cells[c];
            let mj = out.multipoles[c * nterm..(c + 1) * nterm].to_vec();
            kernel.m2m(&parent, &child, &mj, &mut pm);
        }
        out.multipoles[gi * nterm..(gi + 1) * nterm].copy_from_slice(&pm);
    }
    out
}
