//! Data structures for the FMM evaluation driver.
use num_complex::Complex;

use crate::traits::general::RealScalar;
use crate::traits::kernel::Kernel;
use crate::traits::types::{CommunicationTime, FmmOperatorTime};
use crate::tree::types::{Body, Bounds, Octree};

/// Runtime parameters of one FMM instance.
#[derive(Debug, Clone, Copy)]
pub struct FmmParameters<T>
where
    T: RealScalar,
{
    /// Multipole acceptance parameter in (0, 1]; smaller is more accurate
    /// and more expensive.
    pub theta: T,

    /// Leaf population threshold for the adaptive tree.
    pub ncrit: usize,

    /// Work grain below which traversal recursion stays on one task.
    pub nspawn: usize,

    /// Number of periodic image shells; zero for free space.
    pub images: usize,

    /// Depth cap for the adaptive tree, and the depth of the uniform
    /// variant.
    pub max_level: u32,

    /// Build the complete octree to `max_level` instead of subdividing
    /// adaptively.
    pub uniform: bool,

    /// Accumulate symmetrical P2P contributions on both sides of each pair.
    /// Forces the near-field sweep onto a single task.
    pub mutual: bool,

    /// Replace pairwise remote traversals with a single traversal of a
    /// grafted global tree.
    pub graft: bool,

    /// Record per-operator wall times.
    pub timed: bool,
}

impl<T> Default for FmmParameters<T>
where
    T: RealScalar,
{
    fn default() -> Self {
        Self {
            theta: T::from(0.4).unwrap(),
            ncrit: 64,
            nspawn: 1000,
            images: 0,
            max_level: 10,
            uniform: false,
            mutual: false,
            graft: false,
            timed: false,
        }
    }
}

/// A configured FMM over one rank-local body set.
///
/// The tree, expansion coefficients and target accumulators are rebuilt by
/// every solve; bodies persist across solves and are reordered in place.
pub struct Fmm<T, K>
where
    T: RealScalar,
    K: Kernel<T>,
{
    /// The equation kernel, owning its precomputed tables.
    pub kernel: K,

    /// Runtime parameters.
    pub params: FmmParameters<T>,

    /// Rank-local bodies, in tree order after a solve.
    pub bodies: Vec<Body<T, K::Value>>,

    /// Octree over `bodies`, rebuilt per solve.
    pub tree: Octree<T>,

    /// Multipole coefficients, `nterm` per cell; read-only after the upward
    /// pass.
    pub multipoles: Vec<Complex<T>>,

    /// Local coefficients, `nterm` per cell; a reduction target during
    /// traversal.
    pub locals: Vec<Complex<T>>,

    /// Per-body accumulators aligned with the tree ordered body array,
    /// merged into `Body::trg` at the end of a solve.
    pub potentials: Vec<[K::Value; 4]>,

    /// Global bounds when they differ from the local ones (distributed
    /// runs); local bounds are recomputed per solve otherwise.
    pub global_bounds: Option<Bounds<T>>,

    /// Wall times of kernel phases, populated when `params.timed` is set.
    pub operator_times: Vec<FmmOperatorTime>,

    /// Wall times of collective phases, populated when `params.timed` is set.
    pub communication_times: Vec<CommunicationTime>,
}
