//! Real even-degree spherical harmonics on antipodally-symmetric functions.
//!
//! The basis is the real symmetric SH convention used throughout diffusion
//! MRI: only even degrees `l` contribute, coefficients are indexed by
//! `l(l+1)/2 + m` with `m ∈ [-l, l]`, and the `m ≠ 0` basis functions carry
//! a √2 factor so the basis is orthonormal over the sphere. Under this
//! convention the integral of a function over the sphere is `√(4π) · c₀₀`.
//!
//! Associated Legendre values use the fully-normalised recurrences, which
//! are stable to high degree; a [`PrecomputedAl`] table trades a dense
//! `cos θ` grid with linear interpolation for the per-sample recurrence,
//! which is the access pattern of peak refinement.

use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector, Vector3};

/// Number of coefficients of an even-degree series truncated at `lmax`.
#[must_use]
pub fn n_coefs(lmax: usize) -> usize {
    (lmax + 1) * (lmax + 2) / 2
}

/// Harmonic order of a coefficient vector length, or an error if the length
/// does not correspond to any even `lmax`.
pub fn lmax_for_ncoefs(n: usize) -> Result<usize> {
    let mut lmax = 0;
    loop {
        match n_coefs(lmax).cmp(&n) {
            std::cmp::Ordering::Equal => return Ok(lmax),
            std::cmp::Ordering::Greater => {
                bail!("{n} is not a valid even-degree SH coefficient count")
            }
            std::cmp::Ordering::Less => lmax += 2,
        }
    }
}

/// Index of the `(l, m)` coefficient (`l` even, `m ∈ [-l, l]`).
#[inline]
#[must_use]
pub fn coef_index(l: usize, m: i64) -> usize {
    ((l * (l + 1) / 2) as i64 + m) as usize
}

/// Fully-normalised associated Legendre values `P̃_l^m(cos θ)` for all even
/// `l ≤ lmax` and `0 ≤ m ≤ l`, written into `out[row_index(l, m)]`.
///
/// Normalisation is chosen so that `Ỹ_l0 = P̃_l0` and
/// `Ỹ_l±m = √2 · P̃_lm · {cos, sin}(mφ)` form an orthonormal basis.
pub fn legendre_row(lmax: usize, cos_theta: f64, out: &mut [f64]) {
    debug_assert_eq!(out.len(), legendre_row_len(lmax));
    let x = cos_theta.clamp(-1.0, 1.0);
    let sin_theta = (1.0 - x * x).max(0.0).sqrt();
    let inv_4pi = 1.0 / (4.0 * std::f64::consts::PI);

    // Diagonal terms P̃_m^m, then the first off-diagonal, then the upward
    // three-term recurrence in l.
    let mut pmm = inv_4pi.sqrt();
    for m in 0..=lmax {
        if m > 0 {
            pmm *= -((2 * m + 1) as f64 / (2 * m) as f64).sqrt() * sin_theta;
        }
        let mut prev2 = pmm;
        if m % 2 == 0 {
            out[row_index(m, m)] = prev2;
        }
        if m == lmax {
            break;
        }
        let mut prev1 = x * ((2 * m + 3) as f64).sqrt() * pmm;
        if (m + 1) % 2 == 0 {
            out[row_index(m + 1, m)] = prev1;
        }
        for l in (m + 2)..=lmax {
            let lf = l as f64;
            let mf = m as f64;
            let a = ((4.0 * lf * lf - 1.0) / (lf * lf - mf * mf)).sqrt();
            let b = (((lf - 1.0) * (lf - 1.0) - mf * mf) / (4.0 * (lf - 1.0) * (lf - 1.0) - 1.0))
                .sqrt();
            let current = a * (x * prev1 - b * prev2);
            prev2 = prev1;
            prev1 = current;
            if l % 2 == 0 {
                out[row_index(l, m)] = current;
            }
        }
    }
}

/// Number of `(l, m)` rows stored by [`legendre_row`] (`l` even, `m ≤ l`).
#[must_use]
pub fn legendre_row_len(lmax: usize) -> usize {
    // Σ over even l ≤ lmax of (l + 1) = (lmax/2)² + lmax + 1
    let half = lmax / 2;
    half * half + lmax + 1
}

/// Storage index of the `(l, m ≥ 0)` associated Legendre value.
#[inline]
#[must_use]
pub fn row_index(l: usize, m: usize) -> usize {
    // Rows for even degrees 0, 2, …, l-2 occupy Σ (l' + 1) slots.
    let k = l / 2;
    k * k + m
}

/// Evaluate the SH series at a unit direction.
#[must_use]
pub fn value(coefs: &[f64], dir: &Vector3<f64>, lmax: usize) -> f64 {
    let cos_theta = dir[2].clamp(-1.0, 1.0);
    let phi = dir[1].atan2(dir[0]);
    let mut plm = vec![0.0; row_index(lmax, lmax) + 1];
    legendre_row(lmax, cos_theta, &mut plm);
    value_from_rows(coefs, &plm, phi, lmax)
}

/// Evaluate the series from precomputed Legendre rows and azimuth.
#[must_use]
fn value_from_rows(coefs: &[f64], plm: &[f64], phi: f64, lmax: usize) -> f64 {
    let sqrt2 = std::f64::consts::SQRT_2;
    let mut sum = 0.0;
    for l in (0..=lmax).step_by(2) {
        sum += coefs[coef_index(l, 0)] * plm[row_index(l, 0)];
        for m in 1..=l {
            let basis = sqrt2 * plm[row_index(l, m)];
            let (sin_m, cos_m) = (m as f64 * phi).sin_cos();
            sum += basis
                * (coefs[coef_index(l, m as i64)] * cos_m
                    + coefs[coef_index(l, -(m as i64))] * sin_m);
        }
    }
    sum
}

/// SH coefficients of a unit-integral (antipodally symmetric) delta function
/// centred on `dir`.
#[must_use]
pub fn delta(dir: &Vector3<f64>, lmax: usize) -> Vec<f64> {
    let cos_theta = dir[2].clamp(-1.0, 1.0);
    let phi = dir[1].atan2(dir[0]);
    let sqrt2 = std::f64::consts::SQRT_2;
    let mut plm = vec![0.0; row_index(lmax, lmax) + 1];
    legendre_row(lmax, cos_theta, &mut plm);

    let mut coefs = vec![0.0; n_coefs(lmax)];
    for l in (0..=lmax).step_by(2) {
        coefs[coef_index(l, 0)] = plm[row_index(l, 0)];
        for m in 1..=l {
            let basis = sqrt2 * plm[row_index(l, m)];
            let (sin_m, cos_m) = (m as f64 * phi).sin_cos();
            coefs[coef_index(l, m as i64)] = basis * cos_m;
            coefs[coef_index(l, -(m as i64))] = basis * sin_m;
        }
    }
    // Normalise so the function integrates to one over the sphere.
    let scale = 1.0 / ((4.0 * std::f64::consts::PI).sqrt() * coefs[0]);
    for c in &mut coefs {
        *c *= scale;
    }
    coefs
}

/// Integral of the series over the sphere.
#[must_use]
pub fn integral(coefs: &[f64]) -> f64 {
    (4.0 * std::f64::consts::PI).sqrt() * coefs[0]
}

/// Dense SH → amplitude transform onto a fixed direction set.
///
/// The basis matrix is precomputed once; evaluating a voxel is then a
/// single matrix-vector product.
pub struct ShTransform {
    lmax: usize,
    basis: DMatrix<f64>,
}

impl ShTransform {
    /// Build the transform for the given directions and order.
    #[must_use]
    pub fn new(dirs: &[Vector3<f64>], lmax: usize) -> Self {
        let n = n_coefs(lmax);
        let mut basis = DMatrix::zeros(dirs.len(), n);
        let sqrt2 = std::f64::consts::SQRT_2;
        let mut plm = vec![0.0; row_index(lmax, lmax) + 1];
        for (row, dir) in dirs.iter().enumerate() {
            let cos_theta = dir[2].clamp(-1.0, 1.0);
            let phi = dir[1].atan2(dir[0]);
            legendre_row(lmax, cos_theta, &mut plm);
            for l in (0..=lmax).step_by(2) {
                basis[(row, coef_index(l, 0))] = plm[row_index(l, 0)];
                for m in 1..=l {
                    let b = sqrt2 * plm[row_index(l, m)];
                    let (sin_m, cos_m) = (m as f64 * phi).sin_cos();
                    basis[(row, coef_index(l, m as i64))] = b * cos_m;
                    basis[(row, coef_index(l, -(m as i64)))] = b * sin_m;
                }
            }
        }
        Self { lmax, basis }
    }

    /// Harmonic order of the transform.
    #[must_use]
    pub fn lmax(&self) -> usize {
        self.lmax
    }

    /// Amplitudes of an SH series on every direction of the set.
    #[must_use]
    pub fn sh2amp(&self, coefs: &[f64]) -> DVector<f64> {
        debug_assert_eq!(coefs.len(), n_coefs(self.lmax));
        &self.basis * DVector::from_column_slice(coefs)
    }
}

/// Precomputed associated-Legendre table over a dense `cos θ` grid.
///
/// Linear interpolation between rows replaces the recurrence for repeated
/// evaluations, as performed during Newton peak refinement.
pub struct PrecomputedAl {
    lmax: usize,
    nsteps: usize,
    inv_step: f64,
    rows: Vec<f64>,
    row_len: usize,
}

impl PrecomputedAl {
    /// Tabulate for the given order with `nsteps` samples of `cos θ ∈ [-1, 1]`.
    #[must_use]
    pub fn new(lmax: usize, nsteps: usize) -> Self {
        let row_len = row_index(lmax, lmax) + 1;
        let mut rows = vec![0.0; row_len * nsteps];
        for step in 0..nsteps {
            let cos_theta = -1.0 + 2.0 * step as f64 / (nsteps - 1) as f64;
            legendre_row(lmax, cos_theta, &mut rows[step * row_len..(step + 1) * row_len]);
        }
        Self {
            lmax,
            nsteps,
            inv_step: (nsteps - 1) as f64 / 2.0,
            rows,
            row_len,
        }
    }

    /// Interpolated Legendre row at `cos θ`, written into `out`.
    pub fn row(&self, cos_theta: f64, out: &mut [f64]) {
        let x = cos_theta.clamp(-1.0, 1.0);
        let pos = (x + 1.0) * self.inv_step;
        let lo = (pos.floor() as usize).min(self.nsteps - 2);
        let t = pos - lo as f64;
        let a = &self.rows[lo * self.row_len..(lo + 1) * self.row_len];
        let b = &self.rows[(lo + 1) * self.row_len..(lo + 2) * self.row_len];
        for (o, (&va, &vb)) in out.iter_mut().zip(a.iter().zip(b.iter())) {
            *o = va * (1.0 - t) + vb * t;
        }
    }

    /// Evaluate an SH series at a unit direction using the table.
    #[must_use]
    pub fn value(&self, coefs: &[f64], dir: &Vector3<f64>) -> f64 {
        let mut plm = vec![0.0; self.row_len];
        self.row(dir[2], &mut plm);
        value_from_rows(coefs, &plm, dir[1].atan2(dir[0]), self.lmax)
    }
}

/// Refine a peak of an SH series by damped Newton iteration on the local
/// tangent plane.
///
/// Returns the refined unit direction and its amplitude, or an infinite /
/// NaN amplitude when the iteration fails to converge; callers are expected
/// to check finiteness before accepting the result.
#[must_use]
pub fn get_peak(
    coefs: &[f64],
    lmax: usize,
    seed: &Vector3<f64>,
    precomputer: &PrecomputedAl,
) -> (Vector3<f64>, f64) {
    const MAX_ITERS: usize = 100;
    const STEP_TOL: f64 = 1e-5;
    const GRADIENT_TOL: f64 = 1e-6;
    // Wider than the interpolation table's grid, so the second differences
    // average over segments instead of sampling their kinks.
    const FD_STEP: f64 = 2e-3;

    let eval = |d: &Vector3<f64>| precomputer.value(coefs, d);
    let mut dir = seed.normalize();

    for _ in 0..MAX_ITERS {
        let base = dir;
        let (tx, ty) = tangent_axes(&base);
        let reproject = move |u: f64, v: f64| (base + tx * u + ty * v).normalize();

        let f0 = eval(&dir);
        let fpx = eval(&reproject(FD_STEP, 0.0));
        let fmx = eval(&reproject(-FD_STEP, 0.0));
        let fpy = eval(&reproject(0.0, FD_STEP));
        let fmy = eval(&reproject(0.0, -FD_STEP));
        let fpxpy = eval(&reproject(FD_STEP, FD_STEP));
        let fpxmy = eval(&reproject(FD_STEP, -FD_STEP));
        let fmxpy = eval(&reproject(-FD_STEP, FD_STEP));
        let fmxmy = eval(&reproject(-FD_STEP, -FD_STEP));

        let gx = (fpx - fmx) / (2.0 * FD_STEP);
        let gy = (fpy - fmy) / (2.0 * FD_STEP);
        if (gx * gx + gy * gy).sqrt() < GRADIENT_TOL {
            return (dir, f0);
        }
        let hxx = (fpx - 2.0 * f0 + fmx) / (FD_STEP * FD_STEP);
        let hyy = (fpy - 2.0 * f0 + fmy) / (FD_STEP * FD_STEP);
        let hxy = (fpxpy - fpxmy - fmxpy + fmxmy) / (4.0 * FD_STEP * FD_STEP);

        let det = hxx * hyy - hxy * hxy;
        let (mut du, mut dv);
        if det > 0.0 && hxx < 0.0 {
            // Newton step towards the stationary point of the local model.
            du = -(hyy * gx - hxy * gy) / det;
            dv = -(hxx * gy - hxy * gx) / det;
        } else {
            // Indefinite curvature: fall back to a short ascent step.
            du = 0.1 * gx;
            dv = 0.1 * gy;
        }
        let norm = (du * du + dv * dv).sqrt();
        if norm > 0.5 {
            du *= 0.5 / norm;
            dv *= 0.5 / norm;
        }

        let candidate = reproject(du, dv);
        if eval(&candidate) < f0 {
            // Overshoot: halve until the step improves or vanishes.
            let mut scale = 0.5;
            let mut improved = false;
            while scale > 1e-4 {
                let c = reproject(du * scale, dv * scale);
                if eval(&c) >= f0 {
                    dir = c;
                    improved = true;
                    break;
                }
                scale *= 0.5;
            }
            if !improved {
                return (dir, f0);
            }
        } else {
            dir = candidate;
        }

        if norm < STEP_TOL {
            return (dir, eval(&dir));
        }
    }
    (dir, f64::NAN)
}

/// Orthonormal axes spanning the tangent plane at a unit direction.
#[must_use]
pub fn tangent_axes(dir: &Vector3<f64>) -> (Vector3<f64>, Vector3<f64>) {
    let mut tx = Vector3::new(0.0, 0.0, 1.0).cross(dir);
    if tx.norm_squared() < 1e-12 {
        tx = Vector3::new(0.0, 1.0, 0.0).cross(dir);
    }
    let tx = tx.normalize();
    let ty = dir.cross(&tx).normalize();
    (tx, ty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn coefficient_counts() {
        assert_eq!(n_coefs(0), 1);
        assert_eq!(n_coefs(2), 6);
        assert_eq!(n_coefs(4), 15);
        assert_eq!(n_coefs(8), 45);
        assert_eq!(lmax_for_ncoefs(45).unwrap(), 8);
        assert!(lmax_for_ncoefs(44).is_err());
    }

    #[test]
    fn row_indexing_is_dense() {
        // Rows (l, m): (0,0) (2,0..2) (4,0..4) …
        assert_eq!(row_index(0, 0), 0);
        assert_eq!(row_index(2, 0), 1);
        assert_eq!(row_index(2, 2), 3);
        assert_eq!(row_index(4, 0), 4);
        assert_eq!(row_index(8, 8), row_index(8, 0) + 8);
    }

    #[test]
    fn delta_has_unit_integral_and_positive_peak() {
        let dir = Vector3::new(0.3, -0.4, 0.866_025).normalize();
        let coefs = delta(&dir, 8);
        assert_relative_eq!(integral(&coefs), 1.0, epsilon = 1e-12);
        let peak = value(&coefs, &dir, 8);
        assert!(peak > 0.0);
        // The delta is antipodally symmetric.
        assert_relative_eq!(value(&coefs, &(-dir), 8), peak, epsilon = 1e-9);
        // And maximal at its own centre.
        let other = Vector3::new(1.0, 0.0, 0.0);
        assert!(value(&coefs, &other, 8) < peak);
    }

    #[test]
    fn transform_matches_direct_evaluation() {
        let dirs = vec![
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.577_350, 0.577_350, 0.577_350),
        ];
        let coefs = delta(&Vector3::new(0.0, 0.0, 1.0), 6);
        let transform = ShTransform::new(&dirs, 6);
        let amps = transform.sh2amp(&coefs);
        for (i, d) in dirs.iter().enumerate() {
            assert_relative_eq!(amps[i], value(&coefs, d, 6), epsilon = 1e-10);
        }
    }

    #[test]
    fn precomputed_table_is_close_to_recurrence() {
        let precomp = PrecomputedAl::new(8, 4096);
        let coefs = delta(&Vector3::new(0.6, 0.0, 0.8), 8);
        for &z in &[-0.95, -0.3, 0.0, 0.42, 0.97] {
            let dir = Vector3::new((1.0f64 - z * z).sqrt(), 0.0, z);
            assert_relative_eq!(
                precomp.value(&coefs, &dir),
                value(&coefs, &dir, 8),
                epsilon = 1e-4
            );
        }
    }

    #[test]
    fn peak_refinement_recovers_delta_direction() {
        let target = Vector3::new(0.2, 0.3, 0.932_737).normalize();
        let coefs = delta(&target, 8);
        let precomp = PrecomputedAl::new(8, 4096);
        // Seed a few degrees away from the true peak.
        let seed = (target + Vector3::new(0.05, -0.04, 0.0)).normalize();
        let (refined, amp) = get_peak(&coefs, 8, &seed, &precomp);
        assert!(amp.is_finite());
        let angle = refined.dot(&target).abs().clamp(-1.0, 1.0).acos();
        assert!(
            angle < 2.0_f64.to_radians(),
            "refined peak {angle} rad from target"
        );
    }
}
