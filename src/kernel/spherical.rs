//! Numerical support for the Helmholtz expansion operators: normalized
//! associated Legendre recurrences, spherical Bessel/Hankel functions,
//! Gauss-Legendre quadrature and the z-axis rotation used to reduce
//! translations to one dimension.
use num_complex::Complex;

use crate::traits::general::RealScalar;

/// Precomputed coefficient and quadrature tables for one expansion order.
///
/// Built once per kernel and shared read-only by the expansion operators;
/// the handle is owned by the kernel value rather than stored globally.
#[derive(Debug, Clone)]
pub struct SphericalTables<T>
where
    T: RealScalar,
{
    /// Expansion order.
    pub p: usize,

    /// First normalized Legendre recurrence table, (P+1)(P+2)/2 entries.
    pub anm1: Vec<T>,

    /// Second normalized Legendre recurrence table, (P+1)(P+2)/2 entries.
    pub anm2: Vec<T>,

    /// Gauss-Legendre nodes of order max(6, P), used by M2L.
    pub xquad: Vec<T>,

    /// Weights paired with `xquad`.
    pub wquad: Vec<T>,

    /// Gauss-Legendre nodes of order max(6, 2P), used by M2M/L2L.
    pub xquad2: Vec<T>,

    /// Weights paired with `xquad2`.
    pub wquad2: Vec<T>,
}

/// Legendre polynomial value, derivative, and the weight normalization sum
/// at `x`, by upward recurrence.
fn polynomial<T: RealScalar>(x: T, n: usize) -> (T, T, T) {
    let half = T::from(0.5).unwrap();
    let three_halves = T::from(1.5).unwrap();
    let mut sum = half + x * x * three_halves;
    let mut pk = T::one();
    let mut pkp1 = x;
    if n < 2 {
        let mut der = T::zero();
        let mut sum = half;
        if n == 0 {
            return (T::zero(), der, sum);
        }
        der = T::one();
        sum += x * x * three_halves;
        return (T::zero(), der, sum);
    }
    for k in 1..n {
        let kr = T::from(k).unwrap();
        let pkm1 = pk;
        pk = pkp1;
        pkp1 = ((kr + kr + T::one()) * x * pk - kr * pkm1) / (kr + T::one());
        sum += pkp1 * pkp1 * (kr + T::one() + half);
    }
    let pol = pkp1;
    let nr = T::from(n).unwrap();
    let der = nr * (x * pkp1 - pk) / (x * x - T::one());
    (pol, der, sum)
}

/// Gauss-Legendre nodes and weights of order `nq` by Newton iteration on the
/// Chebyshev initial guess.
pub fn legendre<T: RealScalar>(nq: usize) -> (Vec<T>, Vec<T>) {
    let mut xq = vec![T::zero(); nq];
    let mut wq = vec![T::zero(); nq];
    let h = T::PI() / T::from(2 * nq).unwrap();
    for i in 1..=nq {
        xq[nq - i] = (T::from(2 * i - 1).unwrap() * h).cos();
    }
    xq[nq / 2] = T::zero();
    for i in 0..nq / 2 {
        let mut xk = xq[i];
        let mut ifout = 0;
        for _ in 0..10 {
            let (pol, der, _) = polynomial(xk, nq);
            let delta = -pol / der;
            xk += delta;
            if delta.abs() < T::epsilon() {
                ifout += 1;
            }
            if ifout == 3 {
                break;
            }
        }
        xq[i] = xk;
        xq[nq - i - 1] = -xk;
    }
    for i in 0..nq.div_ceil(2) {
        let (_, _, sum) = polynomial(xq[i], nq);
        wq[i] = T::one() / sum;
        wq[nq - i - 1] = wq[i];
    }
    (xq, wq)
}

impl<T> SphericalTables<T>
where
    T: RealScalar,
{
    /// Precompute all tables for expansion order `p`.
    pub fn new(p: usize) -> Self {
        let nquad = 6.max(p);
        let nquad2 = 6.max(2 * p);
        let (xquad, wquad) = legendre(nquad);
        let (xquad2, wquad2) = legendre(nquad2);

        let nanm = (p + 1) * (p + 2) / 2;
        let mut anm1 = vec![T::zero(); nanm];
        let mut anm2 = vec![T::zero(); nanm];
        anm1[0] = T::one();
        anm2[0] = T::one();
        for m in 0..=p {
            let ms = m * (m + 1) / 2 + m;
            let mps = (m + 1) * (m + 2) / 2 + m;
            if m > 0 {
                anm1[ms] = (T::from(2 * m - 1).unwrap() / T::from(2 * m).unwrap()).sqrt();
            }
            if m < p {
                anm1[mps] = T::from(2 * m + 1).unwrap().sqrt();
            }
            for n in m + 2..=p {
                let nms = n * (n + 1) / 2 + m;
                let norm = (T::from(n - m).unwrap() * T::from(n + m).unwrap()).sqrt();
                anm1[nms] = T::from(2 * n - 1).unwrap() / norm;
                anm2[nms] = (T::from(n + m - 1).unwrap() * T::from(n - m - 1).unwrap()).sqrt() / norm;
            }
        }

        Self {
            p,
            anm1,
            anm2,
            xquad,
            wquad,
            xquad2,
            wquad2,
        }
    }

    /// Normalized associated Legendre values at `x = cos(theta)` up to degree
    /// `nterms - 1`, packed triangularly at `n(n+1)/2 + m`.
    pub fn ynm(&self, nterms: usize, x: T, ynm: &mut [T]) {
        let y = -((T::one() - x) * (T::one() + x)).sqrt();
        ynm[0] = T::one();
        for m in 0..nterms {
            let ms = m * (m + 1) / 2 + m;
            let mps = (m + 1) * (m + 2) / 2 + m;
            if m > 0 {
                let mms = m * (m - 1) / 2 + m - 1;
                ynm[ms] = ynm[mms] * y * self.anm1[ms];
            }
            if m < nterms - 1 {
                ynm[mps] = x * ynm[ms] * self.anm1[mps];
            }
            for n in m + 2..nterms {
                let nms = n * (n + 1) / 2 + m;
                let nm1 = n * (n - 1) / 2 + m;
                let nm2 = (n - 1) * (n - 2) / 2 + m;
                ynm[nms] = self.anm1[nms] * x * ynm[nm1] - self.anm2[nms] * ynm[nm2];
            }
        }
        for n in 0..nterms {
            for m in 0..=n {
                let nms = n * (n + 1) / 2 + m;
                ynm[nms] *= T::from(2 * n + 1).unwrap().sqrt();
            }
        }
    }

    /// As [`Self::ynm`], additionally producing theta derivatives.
    pub fn ynm_deriv(&self, nterms: usize, x: T, ynm: &mut [T], ynmd: &mut [T]) {
        let y = -((T::one() - x) * (T::one() + x)).sqrt();
        let y2 = y * y;
        ynm[0] = T::one();
        ynmd[0] = T::zero();
        ynm[1] = x * ynm[0] * self.anm1[1];
        ynmd[1] = (x * ynmd[0] + ynm[0]) * self.anm1[1];
        for n in 2..nterms {
            let ns = n * (n + 1) / 2;
            let nm1 = n * (n - 1) / 2;
            let nm2 = (n - 1) * (n - 2) / 2;
            ynm[ns] = self.anm1[ns] * x * ynm[nm1] - self.anm2[ns] * ynm[nm2];
            ynmd[ns] = self.anm1[ns] * (x * ynmd[nm1] + ynm[nm1]) - self.anm2[ns] * ynmd[nm2];
        }
        for m in 1..nterms {
            let ms = m * (m + 1) / 2 + m;
            let mms = m * (m - 1) / 2 + m - 1;
            let mps = (m + 1) * (m + 2) / 2 + m;
            if m == 1 {
                ynm[ms] = -ynm[mms] * self.anm1[ms];
            }
            if m > 1 {
                ynm[ms] = ynm[mms] * y * self.anm1[ms];
            }
            if m > 0 {
                ynmd[ms] = -ynm[ms] * T::from(m).unwrap() * x;
            }
            if m < nterms - 1 {
                ynm[mps] = x * ynm[ms] * self.anm1[mps];
                ynmd[mps] = (x * ynmd[ms] + y2 * ynm[ms]) * self.anm1[mps];
            }
            for n in m + 2..nterms {
                let nms = n * (n + 1) / 2 + m;
                let nm1 = n * (n - 1) / 2 + m;
                let nm2 = (n - 1) * (n - 2) / 2 + m;
                ynm[nms] = self.anm1[nms] * x * ynm[nm1] - self.anm2[nms] * ynm[nm2];
                ynmd[nms] =
                    self.anm1[nms] * (x * ynmd[nm1] + y2 * ynm[nm1]) - self.anm2[nms] * ynmd[nm2];
            }
        }
        for n in 0..nterms {
            for m in 0..=n {
                let nms = n * (n + 1) / 2 + m;
                let scale = T::from(2 * n + 1).unwrap().sqrt();
                ynm[nms] *= scale;
                ynmd[nms] *= scale;
            }
        }
    }
}

/// Scaled spherical Hankel functions of the first kind up to `nterms - 1`.
pub fn hankel<T: RealScalar>(nterms: usize, z: Complex<T>, scale: T, hn: &mut [Complex<T>]) {
    if z.norm() < T::epsilon() {
        for h in hn.iter_mut().take(nterms) {
            *h = Complex::default();
        }
        return;
    }
    let i = Complex::new(T::zero(), T::one());
    let zi = i * z;
    let zinv = Complex::new(scale, T::zero()) / z;
    hn[0] = zi.exp() / zi;
    hn[1] = hn[0] * (zinv - i * scale);
    let scale2 = scale * scale;
    for n in 2..nterms {
        hn[n] = zinv * T::from(2 * n - 1).unwrap() * hn[n - 1] - hn[n - 2] * scale2;
    }
}

/// Scaled spherical Hankel functions and their derivatives.
pub fn hankel_deriv<T: RealScalar>(
    nterms: usize,
    z: Complex<T>,
    scale: T,
    hn: &mut [Complex<T>],
    hnd: &mut [Complex<T>],
) {
    if z.norm() < T::epsilon() {
        for n in 0..nterms {
            hn[n] = Complex::default();
            hnd[n] = Complex::default();
        }
        return;
    }
    let i = Complex::new(T::zero(), T::one());
    let zi = i * z;
    let zinv = Complex::new(T::one(), T::zero()) / z;
    hn[0] = zi.exp() / zi;
    hn[1] = hn[0] * (zinv - i) * scale;
    hnd[0] = -hn[1] / scale;
    hnd[1] = -zinv * T::from(2.0).unwrap() * hn[1] + hn[0] * scale;
    for n in 2..nterms {
        hn[n] = (zinv * T::from(2 * n - 1).unwrap() * hn[n - 1] - hn[n - 2] * scale) * scale;
        hnd[n] = -zinv * T::from(n + 1).unwrap() * hn[n] + hn[n - 1] * scale;
    }
}

/// Scaled spherical Bessel functions of the first kind up to `nterms - 1` by
/// downward recurrence, with dynamic rescaling to dodge overflow, plus
/// derivatives when `ifder` is set. `jn` and `jnd` carry `nterms + 1` slots.
pub fn bessel<T: RealScalar>(
    nterms: usize,
    z: Complex<T>,
    scale: T,
    jn: &mut [Complex<T>],
    ifder: bool,
    jnd: &mut [Complex<T>],
) {
    let eps = T::epsilon();
    if z.norm() < eps {
        jn[0] = Complex::new(T::one(), T::zero());
        for v in jn.iter_mut().take(nterms).skip(1) {
            *v = Complex::default();
        }
        if ifder {
            for v in jnd.iter_mut().take(nterms) {
                *v = Complex::default();
            }
            jnd[1] = Complex::new(T::one() / (T::from(3.0).unwrap() * scale), T::zero());
        }
        return;
    }
    let zinv = Complex::new(T::one(), T::zero()) / z;
    let ntop = nterms;
    let mut iscale = vec![false; ntop + 1];
    jn[ntop] = Complex::default();
    jn[ntop - 1] = Complex::new(T::one(), T::zero());
    for i in (1..ntop).rev() {
        let coef = T::from(2 * i + 1).unwrap();
        let ztmp = zinv * coef * jn[i] - jn[i + 1];
        jn[i - 1] = ztmp;
        if ztmp.norm() > T::one() / eps {
            jn[i] = jn[i] * eps;
            jn[i - 1] = jn[i - 1] * eps;
            iscale[i] = true;
        }
    }
    let scalinv = T::one() / scale;
    let mut coef = T::one();
    for i in 1..ntop {
        coef *= scalinv;
        if iscale[i - 1] {
            coef *= eps;
        }
        jn[i] = jn[i] * coef;
    }
    let fj0 = z.sin() * zinv;
    let fj1 = fj0 * zinv - z.cos() * zinv;
    let ztmp = if fj1.norm() > fj0.norm() {
        fj1 / (jn[1] * scale)
    } else {
        fj0 / jn[0]
    };
    for v in jn.iter_mut().take(nterms) {
        *v = *v * ztmp;
    }
    if ifder {
        jn[nterms] = jn[nterms] * ztmp;
        jnd[0] = -jn[1] * scale;
        for i in 1..nterms {
            let coef = T::from(i).unwrap() / T::from(2 * i + 1).unwrap();
            jnd[i] = jn[i - 1] * coef * scalinv - jn[i + 1] * (T::one() - coef) * scale;
        }
    }
}

/// Rotate an expansion about the y axis by `theta`, mapping coefficients
/// `mnm` (full `p * p` square storage) into `mrot`, so that a subsequent
/// translation can run along z. Recurrence-based rotation matrix assembly.
pub fn rotate<T: RealScalar>(
    theta: T,
    nterms: usize,
    p: usize,
    mnm: &[Complex<T>],
    mrot: &mut [Complex<T>],
) {
    let width = 2 * p;
    let mut rnm1 = vec![T::zero(); p * width];
    let mut rnm2 = vec![T::zero(); p * width];
    // sqrt_c0[m] = sqrt(m), sqrt_c1[m] = sqrt(m (m - 1) / 2)
    let mut sqrt_c0 = vec![T::zero(); 2 * p];
    let mut sqrt_c1 = vec![T::zero(); 2 * p];
    for m in 0..2 * nterms {
        sqrt_c0[m] = T::from(m).unwrap().sqrt();
    }
    for m in 2..2 * nterms {
        sqrt_c1[m] = (T::from(m * (m - 1)).unwrap() / T::from(2.0).unwrap()).sqrt();
    }

    let eps = T::epsilon();
    let mut ctheta = theta.cos();
    if ctheta.abs() < eps {
        ctheta = T::zero();
    }
    let mut stheta = (-theta).sin();
    if stheta.abs() < eps {
        stheta = T::zero();
    }
    let sqrt2 = T::from(2.0).unwrap().sqrt();
    let half = T::from(0.5).unwrap();
    let hsthta = stheta / sqrt2;
    let cthtap = sqrt2 * (theta * half).cos() * (theta * half).cos();
    let cthtan = -sqrt2 * (theta * half).sin() * (theta * half).sin();

    // Index of column p + m for row mp.
    let at = |mp: usize, m: i64| -> usize { mp * width + (p as i64 + m) as usize };

    rnm1[at(0, 0)] = T::one();
    mrot[0] = mnm[0] * rnm1[at(0, 0)];
    for n in 1..nterms {
        let nr = T::from(n).unwrap();
        for m in -(n as i64)..0 {
            let mut v = -sqrt_c1[(n as i64 - m) as usize] * rnm1[at(0, m + 1)];
            if m > 1 - n as i64 {
                v += sqrt_c1[(n as i64 + m) as usize] * rnm1[at(0, m - 1)];
            }
            v *= hsthta;
            if m > -(n as i64) {
                v += rnm1[at(0, m)]
                    * ctheta
                    * sqrt_c0[(n as i64 + m) as usize]
                    * sqrt_c0[(n as i64 - m) as usize];
            }
            rnm2[at(0, m)] = v / nr;
        }
        rnm2[at(0, 0)] = rnm1[at(0, 0)] * ctheta;
        if n > 1 {
            rnm2[at(0, 0)] += hsthta * sqrt_c1[n] * (rnm1[at(0, -1)] + rnm1[at(0, -1)]) / nr;
        }
        for m in 1..=n as i64 {
            rnm2[at(0, m)] = rnm2[at(0, -m)];
            if m % 2 == 0 {
                rnm2[at(m as usize, 0)] = rnm2[at(0, m)];
            } else {
                rnm2[at(m as usize, 0)] = -rnm2[at(0, m)];
            }
        }
        for mp in 1..=n {
            let scale = T::one() / (sqrt2 * sqrt_c1[n + mp]);
            for m in mp as i64..=n as i64 {
                let nm_pm = (n as i64 + m) as usize;
                let nm_mm = (n as i64 - m) as usize;
                let mut vp = rnm1[at(mp - 1, m - 1)] * cthtap * sqrt_c1[nm_pm];
                let mut vm = rnm1[at(mp - 1, -m + 1)] * cthtan * sqrt_c1[nm_pm];
                if m < n as i64 - 1 {
                    vp -= rnm1[at(mp - 1, m + 1)] * cthtan * sqrt_c1[nm_mm];
                    vm -= rnm1[at(mp - 1, -m - 1)] * cthtap * sqrt_c1[nm_mm];
                }
                if m < n as i64 {
                    let d = stheta * sqrt_c0[nm_pm] * sqrt_c0[nm_mm];
                    vp += rnm1[at(mp - 1, m)] * d;
                    vm += rnm1[at(mp - 1, -m)] * d;
                }
                vp *= scale;
                vm *= scale;
                rnm2[at(mp, m)] = vp;
                rnm2[at(mp, -m)] = vm;
                if m > mp as i64 {
                    if (mp as i64 + m) % 2 == 0 {
                        rnm2[at(m as usize, mp as i64)] = vp;
                        rnm2[at(m as usize, -(mp as i64))] = vm;
                    } else {
                        rnm2[at(m as usize, mp as i64)] = -vp;
                        rnm2[at(m as usize, -(mp as i64))] = -vm;
                    }
                }
            }
        }
        for m in -(n as i64)..=n as i64 {
            let nn = n * n + n;
            let nm = (nn as i64 + m) as usize;
            let mut v = mnm[nn] * rnm2[at(0, m)];
            for mp in 1..=n {
                let npm = nn + mp;
                let nmm = nn - mp;
                v += mnm[npm] * rnm2[at(mp, m)] + mnm[nmm] * rnm2[at(mp, -m)];
            }
            mrot[nm] = v;
        }
        for m in -(n as i64)..=n as i64 {
            for mp in 0..=n {
                rnm1[at(mp, m)] = rnm2[at(mp, m)];
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_legendre_weights_sum_to_two() {
        // Integral of 1 over [-1, 1].
        for nq in [6, 7, 10, 14] {
            let (xq, wq) = legendre::<f64>(nq);
            let total: f64 = wq.iter().sum();
            assert!((total - 2.0).abs() < 1e-12, "nq = {}", nq);
            // Nodes are symmetric and strictly inside (-1, 1).
            for i in 0..nq {
                assert!(xq[i].abs() < 1.0);
                assert!((xq[i] + xq[nq - i - 1]).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_legendre_integrates_polynomials() {
        // Order nq is exact for degree <= 2 nq - 1; x^4 over [-1, 1] = 2/5.
        let (xq, wq) = legendre::<f64>(6);
        let quad: f64 = xq.iter().zip(&wq).map(|(x, w)| w * x.powi(4)).sum();
        assert!((quad - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_bessel_small_order_values() {
        // j0(z) = sin(z)/z against the downward recurrence, scale 1.
        let p = 8;
        let z = Complex::new(1.3, 0.0);
        let mut jn = vec![Complex::default(); p + 1];
        let mut jnd = vec![Complex::default(); p + 1];
        bessel(p, z, 1.0, &mut jn, true, &mut jnd);
        let j0 = (1.3f64).sin() / 1.3;
        let j1 = (1.3f64).sin() / (1.3 * 1.3) - (1.3f64).cos() / 1.3;
        assert!((jn[0].re - j0).abs() < 1e-12);
        assert!((jn[1].re - j1).abs() < 1e-12);
        // j0' = -j1
        assert!((jnd[0].re + j1).abs() < 1e-12);
    }

    #[test]
    fn test_hankel_wronskian() {
        // h0(z) = -i e^{iz} / z for real z, scale 1.
        let p = 6;
        let z = Complex::new(2.0, 0.0);
        let mut hn = vec![Complex::default(); p];
        hankel(p, z, 1.0, &mut hn);
        let expected = Complex::new(0.0, -1.0) * Complex::new(0.0, 2.0).exp() / 2.0;
        assert!((hn[0] - expected).norm() < 1e-12);
    }

    #[test]
    fn test_rotate_identity() {
        // A zero angle rotation is the identity on the coefficients.
        let p = 5;
        let tables = SphericalTables::<f64>::new(p);
        assert_eq!(tables.p, p);
        let mnm: Vec<Complex<f64>> = (0..p * p)
            .map(|i| Complex::new(i as f64 + 1.0, -(i as f64)))
            .collect();
        let mut mrot = vec![Complex::default(); p * p];
        rotate(0.0, p, p, &mnm, &mut mrot);
        for n in 0..p {
            for m in -(n as i64)..=n as i64 {
                let nm = (n * n + n) as i64 + m;
                assert!(
                    (mnm[nm as usize] - mrot[nm as usize]).norm() < 1e-12,
                    "n={} m={}",
                    n,
                    m
                );
            }
        }
    }
}
