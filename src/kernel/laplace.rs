//! Laplace kernel: direct evaluation and spherical harmonic expansions.
//!
//! Expansions carry `P (P + 1) / 2` complex coefficients per cell, the
//! non-negative orders of a degree `P - 1` spherical harmonic series; the
//! negative orders follow from conjugate symmetry. Target values hold the
//! potential and its gradient.
use num_complex::Complex;

use crate::kernel::{cart2sph, ipow2n, odd_even, sph2cart};
use crate::traits::general::{FmmScalar, RealScalar};
use crate::traits::kernel::Kernel;
use crate::tree::types::{Body, Cell};

/// Laplace equation kernel of expansion order `p` with softened pairwise
/// distances.
#[derive(Debug, Clone)]
pub struct LaplaceKernel<T>
where
    T: RealScalar,
{
    p: usize,
    eps2: T,
}

impl<T> LaplaceKernel<T>
where
    T: RealScalar,
{
    /// Kernel of expansion order `p`, softening `eps2`.
    pub fn new(p: usize, eps2: T) -> Self {
        assert!(p >= 2, "expansion order must be at least 2");
        Self { p, eps2 }
    }

    /// Multipole-side regular solid harmonics rho^n Ynm / (n + m)! and their
    /// theta derivatives, in full square storage `n * n + n + m`.
    fn eval_multipole(&self, rho: T, alpha: T, beta: T, ynm: &mut [Complex<T>], ynm_theta: &mut [Complex<T>]) {
        let p = self.p;
        let x = alpha.cos();
        let y = alpha.sin();
        let inv_y = if y == T::zero() { T::zero() } else { T::one() / y };
        let mut fact = T::one();
        let mut pn = T::one();
        let mut rhom = T::one();
        let ei = Complex::new(T::zero(), T::one()) * beta;
        let ei = ei.exp();
        let mut eim = Complex::new(T::one(), T::zero());
        for m in 0..p {
            let mut pl = pn;
            let npn = m * m + 2 * m;
            let nmn = m * m;
            ynm[npn] = eim * rhom * pl;
            ynm[nmn] = ynm[npn].conj();
            let mut p1 = pl;
            pl = x * T::from(2 * m + 1).unwrap() * p1;
            ynm_theta[npn] = eim * rhom * (pl - T::from(m + 1).unwrap() * x * p1) * inv_y;
            rhom *= rho;
            let mut rhon = rhom;
            for n in m + 1..p {
                let npm = n * n + n + m;
                let nmm = n * n + n - m;
                rhon /= -T::from(n + m).unwrap();
                ynm[npm] = eim * rhon * pl;
                ynm[nmm] = ynm[npm].conj();
                let p2 = p1;
                p1 = pl;
                pl = (x * T::from(2 * n + 1).unwrap() * p1 - T::from(n + m).unwrap() * p2)
                    / T::from(n - m + 1).unwrap();
                ynm_theta[npm] = eim
                    * rhon
                    * (T::from(n - m + 1).unwrap() * pl - T::from(n + 1).unwrap() * x * p1)
                    * inv_y;
                rhon *= rho;
            }
            rhom /= -T::from((2 * m + 2) * (2 * m + 1)).unwrap();
            pn = -pn * fact * y;
            fact += T::one() + T::one();
            eim = eim * ei;
        }
    }

    /// Local-side singular solid harmonics Ynm (n - m)! / rho^(n+1), in full
    /// square storage.
    fn eval_local(&self, rho: T, alpha: T, beta: T, ynm: &mut [Complex<T>]) {
        let p = self.p;
        let x = alpha.cos();
        let y = alpha.sin();
        let mut fact = T::one();
        let mut pn = T::one();
        let inv_r = -T::one() / rho;
        let mut rhom = -inv_r;
        let ei = (Complex::new(T::zero(), T::one()) * beta).exp();
        let mut eim = Complex::new(T::one(), T::zero());
        for m in 0..p {
            let mut pl = pn;
            let npn = m * m + 2 * m;
            let nmn = m * m;
            ynm[npn] = eim * rhom * pl;
            ynm[nmn] = ynm[npn].conj();
            let mut p1 = pl;
            pl = x * T::from(2 * m + 1).unwrap() * p1;
            rhom *= inv_r;
            let mut rhon = rhom;
            for n in m + 1..p {
                let npm = n * n + n + m;
                let nmm = n * n + n - m;
                ynm[npm] = eim * rhon * pl;
                ynm[nmm] = ynm[npm].conj();
                let p2 = p1;
                p1 = pl;
                pl = (x * T::from(2 * n + 1).unwrap() * p1 - T::from(n + m).unwrap() * p2)
                    / T::from(n - m + 1).unwrap();
                rhon *= inv_r * T::from(n - m + 1).unwrap();
            }
            pn = -pn * fact * y;
            fact += T::one() + T::one();
            eim = eim * ei;
        }
    }
}

impl<T> Kernel<T> for LaplaceKernel<T>
where
    T: RealScalar + FmmScalar<T>,
{
    type Value = T;

    fn order(&self) -> usize {
        self.p
    }

    fn nterm(&self) -> usize {
        self.p * (self.p + 1) / 2
    }

    fn eps2(&self) -> T {
        self.eps2
    }

    fn p2p(&self, trg: &mut [[T; 4]], ti: &[Body<T, T>], sj: &[Body<T, T>], shift: [T; 3]) {
        for (out, bi) in trg.iter_mut().zip(ti) {
            let mut pot = T::zero();
            let mut ax = T::zero();
            let mut ay = T::zero();
            let mut az = T::zero();
            for bj in sj {
                let dx = [
                    bi.x[0] - bj.x[0] - shift[0],
                    bi.x[1] - bj.x[1] - shift[1],
                    bi.x[2] - bj.x[2] - shift[2],
                ];
                let r2 = dx[0] * dx[0] + dx[1] * dx[1] + dx[2] * dx[2] + self.eps2;
                if r2 != T::zero() {
                    let inv_r2 = T::one() / r2;
                    let inv_r = bj.src * num::Float::sqrt(inv_r2);
                    let f = inv_r2 * inv_r;
                    pot += inv_r;
                    ax += dx[0] * f;
                    ay += dx[1] * f;
                    az += dx[2] * f;
                }
            }
            out[0] += pot;
            out[1] -= ax;
            out[2] -= ay;
            out[3] -= az;
        }
    }

    fn p2p_mutual(
        &self,
        trg_i: &mut [[T; 4]],
        trg_j: &mut [[T; 4]],
        ti: &[Body<T, T>],
        sj: &[Body<T, T>],
        shift: [T; 3],
    ) {
        for (out_i, bi) in trg_i.iter_mut().zip(ti) {
            let mut pot = T::zero();
            let mut ax = T::zero();
            let mut ay = T::zero();
            let mut az = T::zero();
            for (out_j, bj) in trg_j.iter_mut().zip(sj) {
                let dx = [
                    bi.x[0] - bj.x[0] - shift[0],
                    bi.x[1] - bj.x[1] - shift[1],
                    bi.x[2] - bj.x[2] - shift[2],
                ];
                let r2 = dx[0] * dx[0] + dx[1] * dx[1] + dx[2] * dx[2] + self.eps2;
                if r2 != T::zero() {
                    let inv_r2 = T::one() / r2;
                    let s = num::Float::sqrt(inv_r2);
                    let inv_r = bj.src * s;
                    let f = inv_r2 * inv_r;
                    pot += inv_r;
                    ax += dx[0] * f;
                    ay += dx[1] * f;
                    az += dx[2] * f;
                    let inv_ri = bi.src * s;
                    let fi = inv_r2 * inv_ri;
                    out_j[0] += inv_ri;
                    out_j[1] += dx[0] * fi;
                    out_j[2] += dx[1] * fi;
                    out_j[3] += dx[2] * fi;
                }
            }
            out_i[0] += pot;
            out_i[1] -= ax;
            out_i[2] -= ay;
            out_i[3] -= az;
        }
    }

    fn p2p_within(&self, trg: &mut [[T; 4]], bodies: &[Body<T, T>]) {
        let n = bodies.len();
        for i in 0..n {
            let mut pot = T::zero();
            let mut ax = T::zero();
            let mut ay = T::zero();
            let mut az = T::zero();
            for j in i + 1..n {
                let dx = [
                    bodies[j].x[0] - bodies[i].x[0],
                    bodies[j].x[1] - bodies[i].x[1],
                    bodies[j].x[2] - bodies[i].x[2],
                ];
                let r2 = dx[0] * dx[0] + dx[1] * dx[1] + dx[2] * dx[2] + self.eps2;
                if r2 != T::zero() {
                    let inv_r2 = T::one() / r2;
                    let s = num::Float::sqrt(inv_r2);
                    let inv_rj = bodies[j].src * s;
                    let fj = inv_r2 * inv_rj;
                    pot += inv_rj;
                    ax += dx[0] * fj;
                    ay += dx[1] * fj;
                    az += dx[2] * fj;
                    let inv_ri = bodies[i].src * s;
                    let fi = inv_r2 * inv_ri;
                    trg[j][0] += inv_ri;
                    trg[j][1] -= dx[0] * fi;
                    trg[j][2] -= dx[1] * fi;
                    trg[j][3] -= dx[2] * fi;
                }
            }
            trg[i][0] += pot;
            trg[i][1] += ax;
            trg[i][2] += ay;
            trg[i][3] += az;
        }
    }

    fn p2m(&self, cell: &Cell<T>, bodies: &[Body<T, T>], m: &mut [Complex<T>]) {
        let p = self.p;
        let mut ynm = vec![Complex::default(); p * p];
        let mut ynm_theta = vec![Complex::default(); p * p];
        for body in bodies {
            let dx = [
                body.x[0] - cell.x[0],
                body.x[1] - cell.x[1],
                body.x[2] - cell.x[2],
            ];
            let (rho, alpha, beta) = cart2sph(dx);
            self.eval_multipole(rho, alpha, beta, &mut ynm, &mut ynm_theta);
            for n in 0..p {
                for k in 0..=n {
                    let nm = n * n + n - k;
                    let nms = n * (n + 1) / 2 + k;
                    m[nms] += ynm[nm] * body.src;
                }
            }
        }
    }

    fn m2m(&self, ci: &Cell<T>, cj: &Cell<T>, mj: &[Complex<T>], mi: &mut [Complex<T>]) {
        let p = self.p as i64;
        let mut ynm = vec![Complex::default(); self.p * self.p];
        let mut ynm_theta = vec![Complex::default(); self.p * self.p];
        let dx = [ci.x[0] - cj.x[0], ci.x[1] - cj.x[1], ci.x[2] - cj.x[2]];
        let (rho, alpha, beta) = cart2sph(dx);
        self.eval_multipole(rho, alpha, beta, &mut ynm, &mut ynm_theta);
        for j in 0..p {
            for k in 0..=j {
                let jks = (j * (j + 1) / 2 + k) as usize;
                let mut acc = Complex::default();
                for n in 0..=j {
                    for m in (-n).max(-j + k + n)..=(k - 1).min(n) {
                        let jnkms = ((j - n) * (j - n + 1) / 2 + k - m) as usize;
                        let nm = (n * n + n - m) as usize;
                        acc += mj[jnkms] * ynm[nm] * (ipow2n::<T>(m) * odd_even::<T>(n));
                    }
                    for m in k..=n.min(j + k - n) {
                        let jnkms = ((j - n) * (j - n + 1) / 2 - k + m) as usize;
                        let nm = (n * n + n - m) as usize;
                        acc += mj[jnkms].conj() * ynm[nm] * odd_even::<T>(k + n + m);
                    }
                }
                mi[jks] += acc;
            }
        }
    }

    fn m2l(
        &self,
        ci: &Cell<T>,
        cj: &Cell<T>,
        shift: [T; 3],
        mj: &[Complex<T>],
        li: &mut [Complex<T>],
    ) {
        let p = self.p as i64;
        let mut ynm = vec![Complex::default(); self.p * self.p];
        let dx = [
            ci.x[0] - cj.x[0] - shift[0],
            ci.x[1] - cj.x[1] - shift[1],
            ci.x[2] - cj.x[2] - shift[2],
        ];
        let (rho, alpha, beta) = cart2sph(dx);
        self.eval_local(rho, alpha, beta, &mut ynm);
        for j in 0..p {
            let cnm = odd_even::<T>(j);
            for k in 0..=j {
                let jks = (j * (j + 1) / 2 + k) as usize;
                let mut acc = Complex::default();
                for n in 0..p - j {
                    for m in -n..0 {
                        let nms = (n * (n + 1) / 2 - m) as usize;
                        let jnkm = ((j + n) * (j + n) + j + n + m - k) as usize;
                        acc += mj[nms].conj() * ynm[jnkm] * cnm;
                    }
                    for m in 0..=n {
                        let nms = (n * (n + 1) / 2 + m) as usize;
                        let jnkm = ((j + n) * (j + n) + j + n + m - k) as usize;
                        let cnm2 = cnm * odd_even::<T>((k - m) * i64::from(k < m) + m);
                        acc += mj[nms] * ynm[jnkm] * cnm2;
                    }
                }
                li[jks] += acc;
            }
        }
    }

    fn l2l(&self, ci: &Cell<T>, cj: &Cell<T>, lj: &[Complex<T>], li: &mut [Complex<T>]) {
        let p = self.p as i64;
        let mut ynm = vec![Complex::default(); self.p * self.p];
        let mut ynm_theta = vec![Complex::default(); self.p * self.p];
        let dx = [ci.x[0] - cj.x[0], ci.x[1] - cj.x[1], ci.x[2] - cj.x[2]];
        let (rho, alpha, beta) = cart2sph(dx);
        self.eval_multipole(rho, alpha, beta, &mut ynm, &mut ynm_theta);
        for j in 0..p {
            for k in 0..=j {
                let jks = (j * (j + 1) / 2 + k) as usize;
                let mut acc = Complex::default();
                for n in j..p {
                    for m in j + k - n..0 {
                        let jnkm = ((n - j) * (n - j) + n - j + m - k) as usize;
                        let nms = (n * (n + 1) / 2 - m) as usize;
                        acc += lj[nms].conj() * ynm[jnkm] * odd_even::<T>(k);
                    }
                    for m in 0..=n {
                        if n - j >= (m - k).abs() {
                            let jnkm = ((n - j) * (n - j) + n - j + m - k) as usize;
                            let nms = (n * (n + 1) / 2 + m) as usize;
                            acc += lj[nms] * ynm[jnkm] * odd_even::<T>((m - k) * i64::from(m < k));
                        }
                    }
                }
                li[jks] += acc;
            }
        }
    }

    fn l2p(&self, cell: &Cell<T>, l: &[Complex<T>], bodies: &[Body<T, T>], trg: &mut [[T; 4]]) {
        let p = self.p;
        let mut ynm = vec![Complex::default(); p * p];
        let mut ynm_theta = vec![Complex::default(); p * p];
        let two = T::one() + T::one();
        for (out, body) in trg.iter_mut().zip(bodies) {
            // Nudge off the cell center so the spherical frame is defined.
            let dx = [
                body.x[0] - cell.x[0] + T::epsilon(),
                body.x[1] - cell.x[1] + T::epsilon(),
                body.x[2] - cell.x[2] + T::epsilon(),
            ];
            let (r, theta, phi) = cart2sph(dx);
            self.eval_multipole(r, theta, phi, &mut ynm, &mut ynm_theta);
            let mut spherical = [T::zero(); 3];
            for n in 0..p {
                let nm = n * n + n;
                let nms = n * (n + 1) / 2;
                out[0] += (l[nms] * ynm[nm]).re;
                spherical[0] += (l[nms] * ynm[nm]).re / r * T::from(n).unwrap();
                spherical[1] += (l[nms] * ynm_theta[nm]).re;
                for m in 1..=n {
                    let nm = n * n + n + m;
                    let nms = n * (n + 1) / 2 + m;
                    out[0] += two * (l[nms] * ynm[nm]).re;
                    spherical[0] += two * (l[nms] * ynm[nm]).re / r * T::from(n).unwrap();
                    spherical[1] += two * (l[nms] * ynm_theta[nm]).re;
                    spherical[2] -= two * (l[nms] * ynm[nm]).im * T::from(m).unwrap();
                }
            }
            let cartesian = sph2cart(r, theta, phi, spherical);
            out[1] += cartesian[0];
            out[2] += cartesian[1];
            out[3] += cartesian[2];
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tree::helpers::points_fixture;

    fn leaf_for(bodies: &[Body<f64, f64>], x: [f64; 3], r: f64) -> Cell<f64> {
        Cell {
            x,
            r,
            scale: 2.0 * r,
            nbody: bodies.len(),
            ..Default::default()
        }
    }

    #[test]
    fn test_p2p_matches_pairwise_sum() {
        let sources = points_fixture::<f64, f64>(10, None, None, Some(0));
        let targets = points_fixture::<f64, f64>(5, Some(2.0), Some(3.0), Some(1));
        let kernel = LaplaceKernel::new(4, 0.0);
        let mut trg = vec![[0.0; 4]; targets.len()];
        kernel.p2p(&mut trg, &targets, &sources, [0.0; 3]);
        for (out, bi) in trg.iter().zip(&targets) {
            let mut pot = 0.0;
            for bj in &sources {
                let dx: Vec<f64> = (0..3).map(|d| bi.x[d] - bj.x[d]).collect();
                let r = (dx[0] * dx[0] + dx[1] * dx[1] + dx[2] * dx[2]).sqrt();
                pot += bj.src / r;
            }
            assert!((out[0] - pot).abs() < 1e-12);
        }
    }

    #[test]
    fn test_p2p_mutual_matches_two_one_sided_calls() {
        let a = points_fixture::<f64, f64>(7, None, None, Some(2));
        let b = points_fixture::<f64, f64>(9, Some(1.5), Some(2.5), Some(3));
        let kernel = LaplaceKernel::new(4, 0.0);

        let mut ta = vec![[0.0; 4]; a.len()];
        let mut tb = vec![[0.0; 4]; b.len()];
        kernel.p2p_mutual(&mut ta, &mut tb, &a, &b, [0.0; 3]);

        let mut ta2 = vec![[0.0; 4]; a.len()];
        let mut tb2 = vec![[0.0; 4]; b.len()];
        kernel.p2p(&mut ta2, &a, &b, [0.0; 3]);
        kernel.p2p(&mut tb2, &b, &a, [0.0; 3]);

        for (u, v) in ta.iter().zip(&ta2).chain(tb.iter().zip(&tb2)) {
            for d in 0..4 {
                assert!((u[d] - v[d]).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_p2p_within_matches_one_sided() {
        let bodies = points_fixture::<f64, f64>(12, None, None, Some(4));
        let kernel = LaplaceKernel::new(4, 0.0);

        let mut a = vec![[0.0; 4]; bodies.len()];
        kernel.p2p_within(&mut a, &bodies);

        // One-sided self evaluation relies on the singularity guard for i == j.
        let mut b = vec![[0.0; 4]; bodies.len()];
        kernel.p2p(&mut b, &bodies, &bodies, [0.0; 3]);

        for (u, v) in a.iter().zip(&b) {
            for d in 0..4 {
                assert!((u[d] - v[d]).abs() < 1e-11);
            }
        }
    }

    #[test]
    fn test_colocated_bodies_stay_finite() {
        let bodies = vec![
            Body::<f64, f64>::new([0.5; 3], 1.0, 0),
            Body::new([0.5; 3], 1.0, 1),
        ];
        let kernel = LaplaceKernel::new(3, 0.0);
        let mut trg = vec![[0.0; 4]; 2];
        kernel.p2p(&mut trg, &bodies, &bodies, [0.0; 3]);
        kernel.p2p_within(&mut trg, &bodies);
        for out in &trg {
            for d in 0..4 {
                assert!(out[d].is_finite());
            }
        }
    }

    #[test]
    fn test_far_field_chain_matches_direct() {
        // P2M -> M2M -> M2L -> L2L -> L2P against direct summation for a well
        // separated source/target pair.
        let p = 10;
        let kernel = LaplaceKernel::new(p, 0.0);
        let nterm = kernel.nterm();

        let sources = points_fixture::<f64, f64>(40, Some(0.0), Some(1.0), Some(5));
        let targets = points_fixture::<f64, f64>(10, Some(5.0), Some(6.0), Some(6));

        let child = leaf_for(&sources, [0.4, 0.4, 0.4], 0.6);
        let parent = leaf_for(&sources, [0.5, 0.5, 0.5], 1.0);
        let tchild = leaf_for(&targets, [5.4, 5.4, 5.4], 0.6);
        let tparent = leaf_for(&targets, [5.5, 5.5, 5.5], 1.0);

        let mut m_child = vec![Complex::default(); nterm];
        let mut m_parent = vec![Complex::default(); nterm];
        let mut l_parent = vec![Complex::default(); nterm];
        let mut l_child = vec![Complex::default(); nterm];

        kernel.p2m(&child, &sources, &mut m_child);
        kernel.m2m(&parent, &child, &m_child, &mut m_parent);
        kernel.m2l(&tparent, &parent, [0.0; 3], &m_parent, &mut l_parent);
        kernel.l2l(&tchild, &tparent, &l_parent, &mut l_child);

        let mut fmm = vec![[0.0; 4]; targets.len()];
        kernel.l2p(&tchild, &l_child, &targets, &mut fmm);

        let mut direct = vec![[0.0; 4]; targets.len()];
        kernel.p2p(&mut direct, &targets, &sources, [0.0; 3]);

        for (f, d) in fmm.iter().zip(&direct) {
            assert!((f[0] - d[0]).abs() / d[0].abs() < 1e-5, "{} vs {}", f[0], d[0]);
            for c in 1..4 {
                assert!((f[c] - d[c]).abs() < 1e-5 * d[0].abs());
            }
        }
    }
}
