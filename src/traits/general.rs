//! Scalar abstractions shared by the tree, kernel and evaluation layers.
use std::fmt::Debug;
use std::iter::Sum;
use std::ops::{AddAssign, DivAssign, MulAssign, RemAssign, SubAssign};

use num::traits::FloatConst;
use num::Float;
use num_complex::{Complex, ComplexFloat};

/// Real scalar type for coordinates, radii and quadrature data.
///
/// Implemented for `f32` and `f64`; selects the floating point width used
/// throughout a simulation.
pub trait RealScalar:
    Float
    + FloatConst
    + AddAssign
    + SubAssign
    + MulAssign
    + DivAssign
    + RemAssign
    + Sum<Self>
    + Send
    + Sync
    + Default
    + Debug
    + 'static
{
}

impl RealScalar for f32 {}
impl RealScalar for f64 {}

/// Scalar type of source strengths and target accumulators.
///
/// The Laplace kernel carries real charges and potentials, the Helmholtz
/// kernel complex ones; generic driver code only ever needs to zero,
/// accumulate and rescale these values, plus split them into real and
/// imaginary parts for wire exchange.
pub trait FmmScalar<T>:
    ComplexFloat<Real = T> + AddAssign + SubAssign + DivAssign + Send + Sync + Default + Debug + 'static
where
    T: RealScalar,
{
    /// Reassemble a value from its real and imaginary parts.
    fn from_re_im(re: T, im: T) -> Self;
}

impl FmmScalar<f32> for f32 {
    fn from_re_im(re: f32, _im: f32) -> Self {
        re
    }
}

impl FmmScalar<f64> for f64 {
    fn from_re_im(re: f64, _im: f64) -> Self {
        re
    }
}

impl<T> FmmScalar<T> for Complex<T>
where
    T: RealScalar,
{
    fn from_re_im(re: T, im: T) -> Self {
        Complex::new(re, im)
    }
}
