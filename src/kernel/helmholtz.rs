//! Helmholtz kernel: direct evaluation and rotation-accelerated spherical
//! expansions.
//!
//! Expansions carry `P * P` complex coefficients per cell in full square
//! storage `n * n + n + m`. Translations rotate the expansion so the shift
//! runs along the z axis, project through Gauss-Legendre quadrature on the
//! translated sphere, and rotate back. The effective order of each M2L is
//! reduced adaptively with the separation distance.
use num_complex::Complex;

use crate::kernel::cart2sph;
use crate::kernel::spherical::{bessel, hankel, hankel_deriv, rotate, SphericalTables};
use crate::traits::general::RealScalar;
use crate::traits::kernel::Kernel;
use crate::tree::types::{Body, Cell};

/// Helmholtz equation kernel of expansion order `p` at complex wavenumber
/// `wavek`, with softened pairwise distances.
#[derive(Debug, Clone)]
pub struct HelmholtzKernel<T>
where
    T: RealScalar,
{
    p: usize,
    eps2: T,
    wavek: Complex<T>,
    tables: SphericalTables<T>,
}

impl<T> HelmholtzKernel<T>
where
    T: RealScalar,
{
    /// Kernel of expansion order `p` at wavenumber `wavek`; precomputes the
    /// Legendre and quadrature tables for this order.
    pub fn new(p: usize, eps2: T, wavek: Complex<T>) -> Self {
        assert!(p >= 2, "expansion order must be at least 2");
        Self {
            p,
            eps2,
            wavek,
            tables: SphericalTables::new(p),
        }
    }

    /// The wavenumber this kernel was configured with.
    pub fn wavek(&self) -> Complex<T> {
        self.wavek
    }

    /// e^{i m phi} phase table, centered so that `ephi[p + m]` serves
    /// m in (-p, p).
    fn phases(&self, phi: T) -> Vec<Complex<T>> {
        let p = self.p;
        let mut ephi = vec![Complex::default(); 2 * p];
        ephi[p] = Complex::new(T::one(), T::zero());
        ephi[p + 1] = (Complex::new(T::zero(), T::one()) * phi).exp();
        ephi[p - 1] = ephi[p + 1].conj();
        for n in 2..p {
            ephi[p + n] = ephi[p + n - 1] * ephi[p + 1];
            ephi[p - n] = ephi[p + n].conj();
        }
        ephi
    }

    /// Geometry of one quadrature node on the translated sphere: the radial
    /// coordinate and polar cosine seen from the far center, plus the radial
    /// and polar direction cosines used by derivative projections.
    #[allow(clippy::type_complexity)]
    fn node_geometry(&self, r: T, radius: T, ctheta: T) -> (T, T, T, T, T) {
        let stheta = (T::one() - ctheta * ctheta).sqrt();
        let a = r + radius * ctheta;
        let b = radius * stheta;
        let rj = (a * a + b * b).sqrt();
        let cthetaj = a / rj;
        let sthetaj = (T::one() - cthetaj * cthetaj).sqrt();
        let rn = sthetaj * stheta + cthetaj * ctheta;
        let thetan = (cthetaj * stheta - ctheta * sthetaj) / rj;
        (rj, cthetaj, sthetaj, rn, thetan)
    }

    /// Adaptive M2L order: well separated pairs need fewer terms. The
    /// constants are empirical; the shape is (1.65 P - 15.5) / r^2 + 0.25 P
    /// + 3, clamped to [1, P].
    fn optimal_order(&self, dx: [T; 3], scale: T) -> usize {
        let eps = T::epsilon();
        let half = T::from(0.5).unwrap();
        let mut rr2 = T::zero();
        for d in 0..3 {
            let mut v = dx[d] / scale;
            if v.abs() > eps {
                v = v.abs() - half;
            } else {
                v = T::zero();
            }
            rr2 += v * v;
        }
        let pt = T::from(self.p).unwrap();
        let coef1 = pt * T::from(1.65).unwrap() - T::from(15.5).unwrap();
        let coef2 = pt * T::from(0.25).unwrap() + T::from(3.0).unwrap();
        let popt = (coef1 / rr2 + coef2)
            .floor()
            .to_i64()
            .unwrap_or(self.p as i64);
        popt.clamp(1, self.p as i64) as usize
    }
}

impl<T> Kernel<T> for HelmholtzKernel<T>
where
    T: RealScalar,
{
    type Value = Complex<T>;

    fn order(&self) -> usize {
        self.p
    }

    fn nterm(&self) -> usize {
        self.p * self.p
    }

    fn eps2(&self) -> T {
        self.eps2
    }

    fn p2p(
        &self,
        trg: &mut [[Complex<T>; 4]],
        ti: &[Body<T, Complex<T>>],
        sj: &[Body<T, Complex<T>>],
        shift: [T; 3],
    ) {
        let wave_r = self.wavek.re;
        let wave_i = self.wavek.im;
        for (out, bi) in trg.iter_mut().zip(ti) {
            let mut acc = [Complex::<T>::default(); 4];
            for bj in sj {
                let dx = [
                    bi.x[0] - bj.x[0] - shift[0],
                    bi.x[1] - bj.x[1] - shift[1],
                    bi.x[2] - bj.x[2] - shift[2],
                ];
                let r2 = dx[0] * dx[0] + dx[1] * dx[1] + dx[2] * dx[2] + self.eps2;
                if r2 != T::zero() {
                    let r = r2.sqrt();
                    let expikr = (wave_i * r).exp() * r;
                    let expikr = Complex::new((wave_r * r).cos() / expikr, (wave_r * r).sin() / expikr);
                    let coef1 = bj.src * expikr;
                    let kr = Complex::new((T::one() + wave_i * r) / r2, -wave_r / r);
                    let coef2 = kr * coef1;
                    acc[0] += coef1;
                    acc[1] += coef2 * dx[0];
                    acc[2] += coef2 * dx[1];
                    acc[3] += coef2 * dx[2];
                }
            }
            for d in 0..4 {
                out[d] += acc[d];
            }
        }
    }

    fn p2p_mutual(
        &self,
        trg_i: &mut [[Complex<T>; 4]],
        trg_j: &mut [[Complex<T>; 4]],
        ti: &[Body<T, Complex<T>>],
        sj: &[Body<T, Complex<T>>],
        shift: [T; 3],
    ) {
        let wave_r = self.wavek.re;
        let wave_i = self.wavek.im;
        for (out_i, bi) in trg_i.iter_mut().zip(ti) {
            let mut acc = [Complex::<T>::default(); 4];
            for (out_j, bj) in trg_j.iter_mut().zip(sj) {
                let dx = [
                    bi.x[0] - bj.x[0] - shift[0],
                    bi.x[1] - bj.x[1] - shift[1],
                    bi.x[2] - bj.x[2] - shift[2],
                ];
                let r2 = dx[0] * dx[0] + dx[1] * dx[1] + dx[2] * dx[2] + self.eps2;
                if r2 != T::zero() {
                    let r = r2.sqrt();
                    let den = (wave_i * r).exp() * r;
                    let expikr = Complex::new((wave_r * r).cos() / den, (wave_r * r).sin() / den);
                    let kr = Complex::new((T::one() + wave_i * r) / r2, -wave_r / r);
                    let coef1 = bj.src * expikr;
                    let coef2 = kr * coef1;
                    acc[0] += coef1;
                    acc[1] += coef2 * dx[0];
                    acc[2] += coef2 * dx[1];
                    acc[3] += coef2 * dx[2];
                    // The displacement seen from the j side is -dx.
                    let coef1j = bi.src * expikr;
                    let coef2j = kr * coef1j;
                    out_j[0] += coef1j;
                    out_j[1] -= coef2j * dx[0];
                    out_j[2] -= coef2j * dx[1];
                    out_j[3] -= coef2j * dx[2];
                }
            }
            for d in 0..4 {
                out_i[d] += acc[d];
            }
        }
    }

    fn p2p_within(&self, trg: &mut [[Complex<T>; 4]], bodies: &[Body<T, Complex<T>>]) {
        let wave_r = self.wavek.re;
        let wave_i = self.wavek.im;
        let n = bodies.len();
        for i in 0..n {
            let mut acc = [Complex::<T>::default(); 4];
            for j in i + 1..n {
                let dx = [
                    bodies[j].x[0] - bodies[i].x[0],
                    bodies[j].x[1] - bodies[i].x[1],
                    bodies[j].x[2] - bodies[i].x[2],
                ];
                let r2 = dx[0] * dx[0] + dx[1] * dx[1] + dx[2] * dx[2] + self.eps2;
                if r2 != T::zero() {
                    let r = r2.sqrt();
                    let den = (wave_i * r).exp() * r;
                    let expikr = Complex::new((wave_r * r).cos() / den, (wave_r * r).sin() / den);
                    let kr = Complex::new((T::one() + wave_i * r) / r2, -wave_r / r);
                    let coef1 = bodies[j].src * expikr;
                    let coef2 = kr * coef1;
                    acc[0] += coef1;
                    acc[1] += coef2 * dx[0];
                    acc[2] += coef2 * dx[1];
                    acc[3] += coef2 * dx[2];
                    let coef1i = bodies[i].src * expikr;
                    let coef2i = kr * coef1i;
                    trg[j][0] += coef1i;
                    trg[j][1] += coef2i * dx[0];
                    trg[j][2] += coef2i * dx[1];
                    trg[j][3] += coef2i * dx[2];
                }
            }
            trg[i][0] += acc[0];
            trg[i][1] -= acc[1];
            trg[i][2] -= acc[2];
            trg[i][3] -= acc[3];
        }
    }

    fn p2m(&self, cell: &Cell<T>, bodies: &[Body<T, Complex<T>>], m: &mut [Complex<T>]) {
        let p = self.p;
        let kscale = cell.scale * self.wavek.norm();
        let mut ynm = vec![T::zero(); p * (p + 1) / 2];
        let mut jn = vec![Complex::default(); p + 1];
        let mut jnd = vec![Complex::default(); p + 1];
        let mut ephi = vec![Complex::default(); p.max(2)];
        let mut mnm = vec![Complex::<T>::default(); p * p];
        for body in bodies {
            let dx = [
                body.x[0] - cell.x[0],
                body.x[1] - cell.x[1],
                body.x[2] - cell.x[2],
            ];
            let (r, theta, phi) = cart2sph(dx);
            let ctheta = theta.cos();
            ephi[1] = (Complex::new(T::zero(), T::one()) * phi).exp();
            for n in 2..p {
                ephi[n] = ephi[n - 1] * ephi[1];
            }
            self.tables.ynm(p, ctheta, &mut ynm);
            let z = self.wavek * r;
            bessel(p, z, kscale, &mut jn, false, &mut jnd);
            for v in jn.iter_mut().take(p) {
                *v = *v * body.src;
            }
            for n in 0..p {
                let nm = n * n + n;
                let nms = n * (n + 1) / 2;
                mnm[nm] += jn[n] * ynm[nms];
                for k in 1..=n {
                    let nms = n * (n + 1) / 2 + k;
                    let npm = n * n + n + k;
                    let nmm = n * n + n - k;
                    let ynmjn = jn[n] * ynm[nms];
                    mnm[npm] += ynmjn * ephi[k].conj();
                    mnm[nmm] += ynmjn * ephi[k];
                }
            }
        }
        let ik = Complex::new(T::zero(), T::one()) * self.wavek;
        for (out, v) in m.iter_mut().zip(&mnm) {
            *out += v * ik;
        }
    }

    fn m2m(&self, ci: &Cell<T>, cj: &Cell<T>, mj: &[Complex<T>], mi: &mut [Complex<T>]) {
        let p = self.p;
        let half = T::from(0.5).unwrap();
        let sqrt3 = T::from(3.0).unwrap().sqrt();
        let kscalei = ci.scale * self.wavek.norm();
        let kscalej = cj.scale * self.wavek.norm();
        let radius = cj.scale * sqrt3;
        let dx = [ci.x[0] - cj.x[0], ci.x[1] - cj.x[1], ci.x[2] - cj.x[2]];
        let (r, theta, phi) = cart2sph(dx);
        let ephi = self.phases(phi);

        let mut mnm = vec![Complex::<T>::default(); p * p];
        let mut mrot = vec![Complex::<T>::default(); p * p];
        for n in 0..p {
            for m in -(n as i64)..=n as i64 {
                let nm = ((n * n + n) as i64 + m) as usize;
                mnm[nm] = mj[nm] * ephi[(p as i64 + m) as usize];
            }
        }
        rotate(theta, p, p, &mnm, &mut mrot);
        for v in mnm.iter_mut() {
            *v = Complex::default();
        }

        let mut ynm = vec![T::zero(); p * (p + 1) / 2];
        let mut hn = vec![Complex::default(); p];
        let mut phitemp = vec![Complex::<T>::default(); 2 * p];
        let nquad2 = self.tables.xquad2.len();
        for l in 0..nquad2 {
            let ctheta = self.tables.xquad2[l];
            let stheta = (T::one() - ctheta * ctheta).sqrt();
            let a = r + radius * ctheta;
            let b = radius * stheta;
            let rj = (a * a + b * b).sqrt();
            let cthetaj = a / rj;
            let z = self.wavek * rj;
            self.tables.ynm(p, cthetaj, &mut ynm);
            hankel(p, z, kscalej, &mut hn);
            for m in -(p as i64 - 1)..p as i64 {
                let mabs = m.unsigned_abs() as usize;
                let mut acc = Complex::default();
                for n in mabs..p {
                    let nm = ((n * n + n) as i64 + m) as usize;
                    let nms = n * (n + 1) / 2 + mabs;
                    acc += mrot[nm] * hn[n] * ynm[nms];
                }
                phitemp[(p as i64 + m) as usize] = acc;
            }
            self.tables.ynm(p, self.tables.xquad2[l], &mut ynm);
            for m in -(p as i64 - 1)..p as i64 {
                let mabs = m.unsigned_abs() as usize;
                let z = phitemp[(p as i64 + m) as usize] * self.tables.wquad2[l] * half;
                for n in mabs..p {
                    let nm = ((n * n + n) as i64 + m) as usize;
                    let nms = n * (n + 1) / 2 + mabs;
                    mnm[nm] += z * ynm[nms];
                }
            }
        }

        let z = self.wavek * radius;
        hankel(p, z, kscalei, &mut hn);
        for n in 0..p {
            for m in -(n as i64)..=n as i64 {
                let nm = ((n * n + n) as i64 + m) as usize;
                mnm[nm] = mnm[nm] / hn[n];
            }
        }
        rotate(-theta, p, p, &mnm, &mut mrot);
        for n in 0..p {
            for m in -(n as i64)..=n as i64 {
                let nm = ((n * n + n) as i64 + m) as usize;
                mi[nm] += ephi[(p as i64 - m) as usize] * mrot[nm];
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
        let p = self.p;
        let half = T::from(0.5).unwrap();
        let sqrt3 = T::from(3.0).unwrap().sqrt();
        let kscalej = cj.scale * self.wavek.norm();
        let kscalei = ci.scale * self.wavek.norm();
        let radius = cj.scale * sqrt3 * half;
        let dx = [
            ci.x[0] - cj.x[0] - shift[0],
            ci.x[1] - cj.x[1] - shift[1],
            ci.x[2] - cj.x[2] - shift[2],
        ];
        let (r, theta, phi) = cart2sph(dx);
        let popt = self.optimal_order(dx, cj.scale);
        let ephi = self.phases(phi);

        let mut mnm = vec![Complex::<T>::default(); p * p];
        let mut mrot = vec![Complex::<T>::default(); p * p];
        for n in 0..popt {
            for m in -(n as i64)..=n as i64 {
                let nm = ((n * n + n) as i64 + m) as usize;
                mnm[nm] = mj[nm] * ephi[(p as i64 + m) as usize];
            }
        }
        rotate(theta, popt, p, &mnm, &mut mrot);

        let mut lnm = vec![Complex::<T>::default(); p * p];
        let mut lnmd = vec![Complex::<T>::default(); p * p];
        let mut ynm = vec![T::zero(); p * (p + 1) / 2];
        let mut ynmd = vec![T::zero(); p * (p + 1) / 2];
        let mut hn = vec![Complex::default(); p];
        let mut hnd = vec![Complex::default(); p];
        let mut phitemp = vec![Complex::<T>::default(); 2 * p];
        let mut phitempn = vec![Complex::<T>::default(); 2 * p];

        let nquad = self.tables.xquad.len();
        for l in 0..nquad {
            let ctheta = self.tables.xquad[l];
            let (rj, cthetaj, sthetaj, rn, thetan) = self.node_geometry(r, radius, ctheta);
            let z = self.wavek * rj;
            self.tables.ynm_deriv(popt, cthetaj, &mut ynm, &mut ynmd);
            hankel_deriv(popt, z, kscalej, &mut hn, &mut hnd);
            for v in hnd.iter_mut().take(popt) {
                *v = *v * self.wavek;
            }
            for n in 1..popt {
                for m in 1..=n {
                    let nms = n * (n + 1) / 2 + m;
                    ynm[nms] *= sthetaj;
                }
            }
            for m in -(popt as i64 - 1)..popt as i64 {
                phitemp[(popt as i64 + m) as usize] = Complex::default();
                phitempn[(popt as i64 + m) as usize] = Complex::default();
            }
            phitemp[popt] = mrot[0] * hn[0];
            phitempn[popt] = mrot[0] * hnd[0] * rn;
            for n in 1..popt {
                let nm = n * n + n;
                let nms = n * (n + 1) / 2;
                phitemp[popt] += mrot[nm] * hn[n] * ynm[nms];
                let ut1 = hnd[n] * rn;
                let ut2 = hn[n] * thetan;
                let ut3 = ut1 * ynm[nms] - ut2 * ynmd[nms] * sthetaj;
                phitempn[popt] += ut3 * mrot[nm];
                for m in 1..=n {
                    let nms = n * (n + 1) / 2 + m;
                    let npm = n * n + n + m;
                    let nmm = n * n + n - m;
                    let z = hn[n] * ynm[nms];
                    phitemp[popt + m] += mrot[npm] * z;
                    phitemp[popt - m] += mrot[nmm] * z;
                    let ut3 = ut1 * ynm[nms] - ut2 * ynmd[nms];
                    phitempn[popt + m] += ut3 * mrot[npm];
                    phitempn[popt - m] += ut3 * mrot[nmm];
                }
            }
            self.tables.ynm(popt, self.tables.xquad[l], &mut ynm);
            for m in -(popt as i64 - 1)..popt as i64 {
                let mabs = m.unsigned_abs() as usize;
                let z = phitemp[(popt as i64 + m) as usize] * self.tables.wquad[l] * half;
                for n in mabs..popt {
                    let nm = ((n * n + n) as i64 + m) as usize;
                    let nms = n * (n + 1) / 2 + mabs;
                    lnm[nm] += z * ynm[nms];
                }
                let z = phitempn[(popt as i64 + m) as usize] * self.tables.wquad[l] * half;
                for n in mabs..popt {
                    let nm = ((n * n + n) as i64 + m) as usize;
                    let nms = n * (n + 1) / 2 + mabs;
                    lnmd[nm] += z * ynm[nms];
                }
            }
        }

        let z = self.wavek * radius;
        let mut jn = vec![Complex::default(); p + 1];
        let mut jnd = vec![Complex::default(); p + 1];
        bessel(popt, z, kscalei, &mut jn, true, &mut jnd);
        for n in 0..popt {
            for m in -(n as i64)..=n as i64 {
                let nm = ((n * n + n) as i64 + m) as usize;
                let zh = jn[n];
                let zhn = jnd[n] * self.wavek;
                let denom = zh * zh + zhn * zhn;
                lnm[nm] = (zh * lnm[nm] + zhn * lnmd[nm]) / denom;
            }
        }
        let mut lrot = vec![Complex::<T>::default(); p * p];
        rotate(-theta, popt, p, &lnm, &mut lrot);
        for n in 0..popt {
            for m in -(n as i64)..=n as i64 {
                let nm = ((n * n + n) as i64 + m) as usize;
                li[nm] += ephi[(p as i64 - m) as usize] * lrot[nm];
            }
        }
    }

    fn l2l(&self, ci: &Cell<T>, cj: &Cell<T>, lj: &[Complex<T>], li: &mut [Complex<T>]) {
        let p = self.p;
        let half = T::from(0.5).unwrap();
        let sqrt3 = T::from(3.0).unwrap().sqrt();
        let kscalei = ci.scale * self.wavek.norm();
        let kscalej = cj.scale * self.wavek.norm();
        let radius = cj.scale * sqrt3 * half;
        let dx = [ci.x[0] - cj.x[0], ci.x[1] - cj.x[1], ci.x[2] - cj.x[2]];
        let (r, theta, phi) = cart2sph(dx);
        let ephi = self.phases(phi);

        let mut lnm = vec![Complex::<T>::default(); p * p];
        let mut lrot = vec![Complex::<T>::default(); p * p];
        for n in 0..p {
            for m in -(n as i64)..=n as i64 {
                let nm = ((n * n + n) as i64 + m) as usize;
                lnm[nm] = lj[nm] * ephi[(p as i64 + m) as usize];
            }
        }
        rotate(theta, p, p, &lnm, &mut lrot);
        let mut lnmd = vec![Complex::<T>::default(); p * p];
        for v in lnm.iter_mut() {
            *v = Complex::default();
        }

        let mut ynm = vec![T::zero(); p * (p + 1) / 2];
        let mut ynmd = vec![T::zero(); p * (p + 1) / 2];
        let mut jn = vec![Complex::default(); p + 1];
        let mut jnd = vec![Complex::default(); p + 1];
        let mut phitemp = vec![Complex::<T>::default(); 2 * p];
        let mut phitempn = vec![Complex::<T>::default(); 2 * p];

        let nquad2 = self.tables.xquad2.len();
        for l in 0..nquad2 {
            let ctheta = self.tables.xquad2[l];
            let (rj, cthetaj, sthetaj, rn, thetan) = self.node_geometry(r, radius, ctheta);
            let z = self.wavek * rj;
            self.tables.ynm_deriv(p, cthetaj, &mut ynm, &mut ynmd);
            bessel(p, z, kscalej, &mut jn, true, &mut jnd);
            for v in jnd.iter_mut().take(p) {
                *v = *v * self.wavek;
            }
            for n in 1..p {
                for m in 1..=n {
                    let nms = n * (n + 1) / 2 + m;
                    ynm[nms] *= sthetaj;
                }
            }
            for m in -(p as i64 - 1)..p as i64 {
                phitemp[(p as i64 + m) as usize] = Complex::default();
                phitempn[(p as i64 + m) as usize] = Complex::default();
            }
            phitemp[p] = lrot[0] * jn[0];
            phitempn[p] = lrot[0] * jnd[0] * rn;
            for n in 1..p {
                let nm = n * n + n;
                let nms = n * (n + 1) / 2;
                phitemp[p] += lrot[nm] * jn[n] * ynm[nms];
                let ut1 = jnd[n] * rn;
                let ut2 = jn[n] * thetan;
                let ut3 = ut1 * ynm[nms] - ut2 * ynmd[nms] * sthetaj;
                phitempn[p] += ut3 * lrot[nm];
                for m in 1..=n {
                    let nms = n * (n + 1) / 2 + m;
                    let npm = n * n + n + m;
                    let nmm = n * n + n - m;
                    let z = jn[n] * ynm[nms];
                    phitemp[p + m] += lrot[npm] * z;
                    phitemp[p - m] += lrot[nmm] * z;
                    let ut3 = ut1 * ynm[nms] - ut2 * ynmd[nms];
                    phitempn[p + m] += ut3 * lrot[npm];
                    phitempn[p - m] += ut3 * lrot[nmm];
                }
            }
            self.tables.ynm(p, self.tables.xquad2[l], &mut ynm);
            for m in -(p as i64 - 1)..p as i64 {
                let mabs = m.unsigned_abs() as usize;
                let z = phitemp[(p as i64 + m) as usize] * self.tables.wquad2[l] * half;
                for n in mabs..p {
                    let nm = ((n * n + n) as i64 + m) as usize;
                    let nms = n * (n + 1) / 2 + mabs;
                    lnm[nm] += z * ynm[nms];
                }
                let z = phitempn[(p as i64 + m) as usize] * self.tables.wquad2[l] * half;
                for n in mabs..p {
                    let nm = ((n * n + n) as i64 + m) as usize;
                    let nms = n * (n + 1) / 2 + mabs;
                    lnmd[nm] += z * ynm[nms];
                }
            }
        }

        let z = self.wavek * radius;
        bessel(p, z, kscalei, &mut jn, true, &mut jnd);
        for n in 0..p {
            for m in -(n as i64)..=n as i64 {
                let nm = ((n * n + n) as i64 + m) as usize;
                let zh = jn[n];
                let zhn = jnd[n] * self.wavek;
                let denom = zh * zh + zhn * zhn;
                lnm[nm] = (zh * lnm[nm] + zhn * lnmd[nm]) / denom;
            }
        }
        rotate(-theta, p, p, &lnm, &mut lrot);
        for n in 0..p {
            for m in -(n as i64)..=n as i64 {
                let nm = ((n * n + n) as i64 + m) as usize;
                li[nm] += ephi[(p as i64 - m) as usize] * lrot[nm];
            }
        }
    }

    fn l2p(
        &self,
        cell: &Cell<T>,
        l: &[Complex<T>],
        bodies: &[Body<T, Complex<T>>],
        trg: &mut [[Complex<T>; 4]],
    ) {
        let p = self.p;
        let kscale = cell.scale * self.wavek.norm();
        let mut ynm = vec![T::zero(); p * (p + 1) / 2];
        let mut ynmd = vec![T::zero(); p * (p + 1) / 2];
        let mut jn = vec![Complex::default(); p + 1];
        let mut jnd = vec![Complex::default(); p + 1];
        let mut ephi = vec![Complex::<T>::default(); p.max(2)];
        for (out, body) in trg.iter_mut().zip(bodies) {
            let dx = [
                body.x[0] - cell.x[0],
                body.x[1] - cell.x[1],
                body.x[2] - cell.x[2],
            ];
            let (r, theta, phi) = cart2sph(dx);
            let (ctheta, stheta) = (theta.cos(), theta.sin());
            let (cphi, sphi) = (phi.cos(), phi.sin());
            ephi[1] = (Complex::new(T::zero(), T::one()) * phi).exp();
            for n in 2..p {
                ephi[n] = ephi[n - 1] * ephi[1];
            }
            let rx = stheta * cphi;
            let thetax = ctheta * cphi;
            let phix = -sphi;
            let ry = stheta * sphi;
            let thetay = ctheta * sphi;
            let phiy = cphi;
            let rz = ctheta;
            let thetaz = -stheta;
            self.tables.ynm_deriv(p, ctheta, &mut ynm, &mut ynmd);
            let z = self.wavek * r;
            bessel(p, z, kscale, &mut jn, true, &mut jnd);
            out[0] += l[0] * jn[0];
            for v in jnd.iter_mut().take(p) {
                *v = *v * self.wavek;
            }
            let mut ur = l[0] * jnd[0];
            let mut utheta = Complex::<T>::default();
            let mut uphi = Complex::<T>::default();
            for n in 1..p {
                let nm = n * n + n;
                let nms = n * (n + 1) / 2;
                out[0] += l[nm] * jn[n] * ynm[nms];
                ur += jnd[n] * ynm[nms] * l[nm];
                let jnuse = jn[n + 1] * kscale + jn[n - 1] / kscale;
                let jnuse = self.wavek * jnuse / T::from(2 * n + 1).unwrap();
                utheta -= l[nm] * jnuse * ynmd[nms] * stheta;
                for m in 1..=n {
                    let npm = n * n + n + m;
                    let nmm = n * n + n - m;
                    let nms = n * (n + 1) / 2 + m;
                    let ztmp1 = jn[n] * ynm[nms] * stheta;
                    let ztmp2 = l[npm] * ephi[m];
                    let ztmp3 = l[nmm] * ephi[m].conj();
                    let ztmpsum = ztmp2 + ztmp3;
                    out[0] += ztmp1 * ztmpsum;
                    ur += jnd[n] * ynm[nms] * stheta * ztmpsum;
                    utheta -= ztmpsum * jnuse * ynmd[nms];
                    let ztmpsum = (ztmp2 - ztmp3) * Complex::new(T::zero(), T::from(m).unwrap());
                    uphi += jnuse * ynm[nms] * ztmpsum;
                }
            }
            let ux = ur * rx + utheta * thetax + uphi * phix;
            let uy = ur * ry + utheta * thetay + uphi * phiy;
            let uz = ur * rz + utheta * thetaz;
            out[1] -= ux;
            out[2] -= uy;
            out[3] -= uz;
        }
    }
}

/// Divide every accumulated target value by the body's own strength, the
/// convention expected by boundary-integral callers that fold quadrature
/// weights into the strengths.
pub fn normalize<T>(bodies: &mut [Body<T, Complex<T>>])
where
    T: RealScalar,
{
    for body in bodies.iter_mut() {
        for d in 0..4 {
            body.trg[d] /= body.src;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tree::helpers::points_fixture;

    fn wavek() -> Complex<f64> {
        Complex::new(1.0, 0.0)
    }

    #[test]
    fn test_p2p_matches_analytic_kernel() {
        let sources = points_fixture::<f64, Complex<f64>>(8, None, None, Some(0));
        let targets = points_fixture::<f64, Complex<f64>>(4, Some(2.0), Some(3.0), Some(1));
        let kernel = HelmholtzKernel::new(4, 0.0, wavek());
        let mut trg = vec![[Complex::default(); 4]; targets.len()];
        kernel.p2p(&mut trg, &targets, &sources, [0.0; 3]);
        for (out, bi) in trg.iter().zip(&targets) {
            let mut pot = Complex::<f64>::default();
            for bj in &sources {
                let dx: Vec<f64> = (0..3).map(|d| bi.x[d] - bj.x[d]).collect();
                let r = (dx[0] * dx[0] + dx[1] * dx[1] + dx[2] * dx[2]).sqrt();
                pot += bj.src * (Complex::new(0.0, 1.0) * wavek() * r).exp() / r;
            }
            assert!((out[0] - pot).norm() < 1e-12);
        }
    }

    #[test]
    fn test_p2p_variants_agree() {
        let a = points_fixture::<f64, Complex<f64>>(6, None, None, Some(2));
        let b = points_fixture::<f64, Complex<f64>>(5, Some(1.5), Some(2.5), Some(3));
        let kernel = HelmholtzKernel::new(3, 0.0, wavek());

        let mut ta = vec![[Complex::default(); 4]; a.len()];
        let mut tb = vec![[Complex::default(); 4]; b.len()];
        kernel.p2p_mutual(&mut ta, &mut tb, &a, &b, [0.0; 3]);

        let mut ta2 = vec![[Complex::default(); 4]; a.len()];
        let mut tb2 = vec![[Complex::default(); 4]; b.len()];
        kernel.p2p(&mut ta2, &a, &b, [0.0; 3]);
        kernel.p2p(&mut tb2, &b, &a, [0.0; 3]);

        for (u, v) in ta.iter().zip(&ta2).chain(tb.iter().zip(&tb2)) {
            for d in 0..4 {
                assert!((u[d] - v[d]).norm() < 1e-12);
            }
        }
    }

    #[test]
    fn test_colocated_bodies_stay_finite() {
        let bodies = vec![
            Body::<f64, Complex<f64>>::new([0.5; 3], Complex::new(1.0, 0.0), 0),
            Body::new([0.5; 3], Complex::new(1.0, 0.0), 1),
        ];
        let kernel = HelmholtzKernel::new(3, 0.0, wavek());
        let mut trg = vec![[Complex::default(); 4]; 2];
        kernel.p2p(&mut trg, &bodies, &bodies, [0.0; 3]);
        kernel.p2p_within(&mut trg, &bodies);
        for out in &trg {
            for v in out {
                assert!(v.re.is_finite() && v.im.is_finite());
            }
        }
    }

    #[test]
    fn test_far_field_chain_matches_direct() {
        let p = 14;
        let kernel = HelmholtzKernel::new(p, 0.0, wavek());
        let nterm = kernel.nterm();

        let sources = points_fixture::<f64, Complex<f64>>(30, Some(0.0), Some(1.0), Some(5));
        let targets = points_fixture::<f64, Complex<f64>>(8, Some(5.0), Some(6.0), Some(6));

        let scell = Cell::<f64> {
            x: [0.5; 3],
            r: 0.5,
            scale: 1.0,
            nbody: sources.len(),
            ..Default::default()
        };
        let tcell = Cell::<f64> {
            x: [5.5; 3],
            r: 0.5,
            scale: 1.0,
            nbody: targets.len(),
            ..Default::default()
        };

        let mut m = vec![Complex::default(); nterm];
        let mut l = vec![Complex::default(); nterm];
        kernel.p2m(&scell, &sources, &mut m);
        kernel.m2l(&tcell, &scell, [0.0; 3], &m, &mut l);

        let mut fmm = vec![[Complex::default(); 4]; targets.len()];
        kernel.l2p(&tcell, &l, &targets, &mut fmm);

        let mut direct = vec![[Complex::default(); 4]; targets.len()];
        kernel.p2p(&mut direct, &targets, &sources, [0.0; 3]);

        for (f, d) in fmm.iter().zip(&direct) {
            let rel = (f[0] - d[0]).norm() / d[0].norm();
            assert!(rel < 1e-3, "relative potential error {}", rel);
        }
    }

    #[test]
    fn test_m2m_preserves_far_field() {
        let p = 14;
        let kernel = HelmholtzKernel::new(p, 0.0, wavek());
        let nterm = kernel.nterm();

        let sources = points_fixture::<f64, Complex<f64>>(20, Some(0.0), Some(0.5), Some(7));
        let targets = points_fixture::<f64, Complex<f64>>(4, Some(6.0), Some(6.5), Some(8));

        let child = Cell::<f64> {
            x: [0.25; 3],
            r: 0.25,
            scale: 0.5,
            ..Default::default()
        };
        let parent = Cell::<f64> {
            x: [0.5; 3],
            r: 0.5,
            scale: 1.0,
            ..Default::default()
        };
        let tcell = Cell::<f64> {
            x: [6.25; 3],
            r: 0.25,
            scale: 0.5,
            ..Default::default()
        };

        let mut m_child = vec![Complex::default(); nterm];
        let mut m_parent = vec![Complex::default(); nterm];
        kernel.p2m(&child, &sources, &mut m_child);
        kernel.m2m(&parent, &child, &m_child, &mut m_parent);

        let mut l = vec![Complex::default(); nterm];
        kernel.m2l(&tcell, &parent, [0.0; 3], &m_parent, &mut l);

        let mut fmm = vec![[Complex::default(); 4]; targets.len()];
        kernel.l2p(&tcell, &l, &targets, &mut fmm);

        let mut direct = vec![[Complex::default(); 4]; targets.len()];
        kernel.p2p(&mut direct, &targets, &sources, [0.0; 3]);

        for (f, d) in fmm.iter().zip(&direct) {
            let rel = (f[0] - d[0]).norm() / d[0].norm();
            assert!(rel < 1e-3, "relative potential error {}", rel);
        }
    }

    #[test]
    fn test_normalize_divides_by_strength() {
        let mut bodies = vec![Body::<f64, Complex<f64>>::new(
            [0.0; 3],
            Complex::new(2.0, 0.0),
            0,
        )];
        bodies[0].trg = [Complex::new(4.0, 2.0); 4];
        normalize(&mut bodies);
        for d in 0..4 {
            assert!((bodies[0].trg[d] - Complex::new(2.0, 1.0)).norm() < 1e-15);
        }
    }
}
