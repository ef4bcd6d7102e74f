//! Trait interface for equation kernels.
use num_complex::Complex;

use crate::traits::general::{FmmScalar, RealScalar};
use crate::tree::types::{Body, Cell};

/// The capability set of one equation: direct pairwise evaluation plus the
/// six expansion operators, monomorphized per equation so that dispatch
/// happens once per phase and never per cell.
///
/// All operators accumulate; callers zero the expansion and target arrays at
/// phase boundaries. Expansion coefficients are complex regardless of the
/// equation, with `nterm` of them per cell. Geometric preconditions (nonzero
/// translation distance for M2L, well separated cell pairs) are enforced by
/// the traversal, not re-checked here.
pub trait Kernel<T>: Send + Sync
where
    T: RealScalar,
{
    /// Scalar type of source strengths and target values.
    type Value: FmmScalar<T>;

    /// Expansion order.
    fn order(&self) -> usize;

    /// Number of expansion coefficients per cell.
    fn nterm(&self) -> usize;

    /// Softening parameter added to every squared pairwise distance.
    fn eps2(&self) -> T;

    /// Direct evaluation of sources `sj` (shifted by `shift`) onto targets
    /// `ti`, accumulating into `trg`, one 4-vector per target body. The two
    /// slices may refer to the same bodies; the self term is annihilated by
    /// the singularity guard.
    fn p2p(
        &self,
        trg: &mut [[Self::Value; 4]],
        ti: &[Body<T, Self::Value>],
        sj: &[Body<T, Self::Value>],
        shift: [T; 3],
    );

    /// Direct evaluation of a disjoint cell pair, accumulating symmetrical
    /// contributions on both sides in one pass. Only valid off the rank
    /// boundary and for disjoint body ranges.
    fn p2p_mutual(
        &self,
        trg_i: &mut [[Self::Value; 4]],
        trg_j: &mut [[Self::Value; 4]],
        ti: &[Body<T, Self::Value>],
        sj: &[Body<T, Self::Value>],
        shift: [T; 3],
    );

    /// Direct evaluation within a single cell using the symmetric `j > i`
    /// pair loop, accumulating both sides.
    fn p2p_within(&self, trg: &mut [[Self::Value; 4]], bodies: &[Body<T, Self::Value>]);

    /// Convert the sources of leaf `cell` into a multipole expansion about
    /// its center.
    fn p2m(&self, cell: &Cell<T>, bodies: &[Body<T, Self::Value>], m: &mut [Complex<T>]);

    /// Translate the multipole expansion `mj` of child `cj` to the center of
    /// its parent `ci`, accumulating into `mi`.
    fn m2m(&self, ci: &Cell<T>, cj: &Cell<T>, mj: &[Complex<T>], mi: &mut [Complex<T>]);

    /// Translate the multipole expansion `mj` of well separated source cell
    /// `cj` (shifted by `shift`) into a local expansion contribution on
    /// target cell `ci`.
    fn m2l(
        &self,
        ci: &Cell<T>,
        cj: &Cell<T>,
        shift: [T; 3],
        mj: &[Complex<T>],
        li: &mut [Complex<T>],
    );

    /// Translate the local expansion `lj` of parent `cj` down to child `ci`.
    fn l2l(&self, ci: &Cell<T>, cj: &Cell<T>, lj: &[Complex<T>], li: &mut [Complex<T>]);

    /// Evaluate the local expansion of leaf `cell` at each of its bodies,
    /// accumulating potential and gradient into `trg`.
    fn l2p(
        &self,
        cell: &Cell<T>,
        l: &[Complex<T>],
        bodies: &[Body<T, Self::Value>],
        trg: &mut [[Self::Value; 4]],
    );
}
