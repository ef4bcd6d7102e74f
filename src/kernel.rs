//! Equation kernels: direct evaluation and expansion operators for the
//! Laplace and Helmholtz equations in three dimensions.
pub mod helmholtz;
pub mod laplace;
pub mod spherical;

use crate::traits::general::RealScalar;

/// (-1)^n
#[inline]
pub(crate) fn odd_even<T: RealScalar>(n: i64) -> T {
    if n & 1 == 1 {
        -T::one()
    } else {
        T::one()
    }
}

/// 1 for non-negative `n`, (-1)^n otherwise.
#[inline]
pub(crate) fn ipow2n<T: RealScalar>(n: i64) -> T {
    if n >= 0 {
        T::one()
    } else {
        odd_even(n)
    }
}

/// Cartesian displacement to spherical (r, theta, phi).
#[inline]
pub(crate) fn cart2sph<T: RealScalar>(dx: [T; 3]) -> (T, T, T) {
    let r = (dx[0] * dx[0] + dx[1] * dx[1] + dx[2] * dx[2]).sqrt();
    let theta = if r == T::zero() {
        T::zero()
    } else {
        (dx[2] / r).max(-T::one()).min(T::one()).acos()
    };
    let phi = dx[1].atan2(dx[0]);
    (r, theta, phi)
}

/// Spherical gradient components (d/dr, d/dtheta, d/dphi) to Cartesian.
#[inline]
pub(crate) fn sph2cart<T: RealScalar>(r: T, theta: T, phi: T, spherical: [T; 3]) -> [T; 3] {
    let (st, ct) = (theta.sin(), theta.cos());
    let (sp, cp) = (phi.sin(), phi.cos());
    let inv_r = T::one() / r;
    let inv_rs = if st == T::zero() {
        T::zero()
    } else {
        inv_r / st
    };
    [
        st * cp * spherical[0] + ct * cp * inv_r * spherical[1] - sp * inv_rs * spherical[2],
        st * sp * spherical[0] + ct * sp * inv_r * spherical[1] + cp * inv_rs * spherical[2],
        ct * spherical[0] - st * inv_r * spherical[1],
    ]
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_cart2sph_axes() {
        let (r, theta, phi) = cart2sph([0.0, 0.0, 2.0f64]);
        assert!((r - 2.0).abs() < 1e-15);
        assert!(theta.abs() < 1e-15);
        assert!(phi.abs() < 1e-15);

        let (r, theta, _) = cart2sph([3.0, 0.0, 0.0f64]);
        assert!((r - 3.0).abs() < 1e-15);
        assert!((theta - std::f64::consts::FRAC_PI_2).abs() < 1e-15);
    }

    #[test]
    fn test_sph2cart_radial() {
        // A purely radial derivative maps onto the unit direction vector.
        let dx = [1.0, 1.0, 1.0f64];
        let (r, theta, phi) = cart2sph(dx);
        let g = sph2cart(r, theta, phi, [1.0, 0.0, 0.0]);
        for d in 0..3 {
            assert!((g[d] - dx[d] / r).abs() < 1e-14);
        }
    }
}
