//! Dense kernels behind the tabulation cache: the mapping-gradient solve, the
//! minimum-volume ellipsoid cover update and the Broyden gradient correction.

use nalgebra::linalg::{Cholesky, SVD};
use nalgebra::{DMatrix, DVector, Dyn};

/// Growth is rejected when the triangular factor degenerates below this.
pub const SINGULARITY_FLOOR: f64 = 1e-30;

/// out = r0 + A * dphi
pub fn linear_map(out: &mut DVector<f64>, r0: &DVector<f64>, a: &DMatrix<f64>, dphi: &DVector<f64>) {
    out.copy_from(r0);
    out.gemv(1.0, a, dphi, 1.0);
}

/// First-order mapping gradient A = (I - dt J)^-1 of an implicitly advanced
/// step, from the row-major n x n rate Jacobian. `None` when the linearized
/// system is singular.
pub fn mapping_gradient(jacobian: &[f64], n: usize, dt: f64) -> Option<DMatrix<f64>> {
    let mut m = DMatrix::identity(n, n);
    for i in 0..n {
        for j in 0..n {
            m[(i, j)] -= dt * jacobian[i * n + j];
        }
    }
    m.lu().try_inverse()
}

/// Central-difference Jacobian of `f` at `x`, written row-major into `out`
/// (one row per output component). `x` is perturbed in place and restored.
pub fn finite_difference_jacobian<F>(
    mut f: F,
    x: &mut [f64],
    fp: &mut [f64],
    fm: &mut [f64],
    out: &mut [f64],
) where
    F: FnMut(&[f64], &mut [f64]),
{
    let n = x.len();
    let rows = fp.len();
    for j in 0..n {
        let x0 = x[j];
        let h = f64::EPSILON.cbrt() * x0.abs().max(1e-6);
        x[j] = x0 + h;
        f(x, fp);
        x[j] = x0 - h;
        f(x, fm);
        x[j] = x0;
        for i in 0..rows {
            out[i * n + j] = (fp[i] - fm[i]) / (2.0 * h);
        }
    }
}

/// Broyden rank-one correction making `a` satisfy the secant condition
/// a * dphi = dr while changing it as little as possible.
pub fn broyden_update(
    a: &mut DMatrix<f64>,
    dphi: &DVector<f64>,
    dr: &DVector<f64>,
    resid: &mut DVector<f64>,
) {
    let denom = dphi.norm_squared();
    if denom < f64::EPSILON {
        return;
    }
    resid.copy_from(dr);
    resid.gemv(-1.0, a, dphi, 1.0);
    a.ger(1.0 / denom, resid, dphi, 1.0);
}

/// Cholesky factor of the ellipsoid metric G = M^T M with singular values of
/// M clamped from below, so directions the mapping barely senses still get a
/// bounded semi-axis. The ellipsoid is {x : x^T G x <= 1}.
pub fn ellipsoid_factor(m: DMatrix<f64>, sigma_min: f64) -> Option<Cholesky<f64, Dyn>> {
    let n = m.nrows();
    let svd = SVD::new(m, false, true);
    let mut scaled = svd.v_t?;
    for k in 0..n {
        let sigma = svd.singular_values[k].max(sigma_min);
        for j in 0..n {
            scaled[(k, j)] *= sigma;
        }
    }
    let g = scaled.tr_mul(&scaled);
    Cholesky::new(g)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverOutcome {
    /// The point already lies inside the ellipsoid.
    Unchanged,
    /// The ellipsoid was enlarged to the minimum-volume cover of itself and
    /// the point.
    Grown,
    /// The update would have degenerated the factor; the ellipsoid is
    /// untouched.
    Rejected,
}

/// Enlarge the ellipsoid G = L L^T to cover `dpsi` while still containing its
/// previous extent, via a rank-one update of the factor.
///
/// `l` must be the clean lower factor matching `chol`; `z` and `u` are
/// caller-provided scratch of the same dimension.
pub fn cover_point(
    chol: &mut Cholesky<f64, Dyn>,
    l: &DMatrix<f64>,
    dpsi: &DVector<f64>,
    z: &mut DVector<f64>,
    u: &mut DVector<f64>,
) -> CoverOutcome {
    z.gemv_tr(1.0, l, dpsi, 0.0);
    let r2 = z.norm_squared();
    if r2 <= 1.0 {
        return CoverOutcome::Unchanged;
    }
    // In L^T coordinates the old ellipsoid is the unit ball and the point sits
    // at radius r; stretching the ball along that direction to radius r is the
    // minimum-volume cover and maps back to G + sigma (Lz)(Lz)^T. The stretch
    // carries a relative slack so the covered point tests strictly inside.
    u.gemv(1.0, l, z, 0.0);
    let s2 = r2 * (1.0 + 1e-9);
    let sigma = (1.0 / s2 - 1.0) / r2;
    let backup = chol.clone();
    chol.rank_one_update(&*u, sigma);

    let mut min_diag = f64::INFINITY;
    let factor = chol.l_dirty();
    for i in 0..factor.nrows() {
        min_diag = min_diag.min(factor[(i, i)].abs());
    }
    if !(min_diag > SINGULARITY_FLOOR) {
        *chol = backup;
        return CoverOutcome::Rejected;
    }
    CoverOutcome::Grown
}
