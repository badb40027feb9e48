use crate::linalg::{self, CoverOutcome};
use anyhow::{anyhow, Result};
use nalgebra::linalg::Cholesky;
use nalgebra::{DMatrix, DVector, Dyn};

/// Directions the mapping barely senses get their semi-axis capped at half a
/// characteristic magnitude instead of extending to infinity.
const SIGMA_MIN: f64 = 2.0;

/// A tabulated chemistry record: the query point, its integrated result, the
/// local mapping gradient and a growing ellipsoid of accuracy.
///
/// The ellipsoid lives in scaled coordinates psi = weights o phi and is
/// {d_psi : ||L^T d_psi|| <= 1} with G = L L^T the metric produced from the
/// scaled gradient at creation time.
#[derive(Debug, Clone)]
pub struct ChemPoint {
    phi: DVector<f64>,
    r_phi: DVector<f64>,
    a: DMatrix<f64>,
    chol: Cholesky<f64, Dyn>,
    l: DMatrix<f64>,
    tau: f64,
    pub n_used: u64,
    pub n_grown: u64,
    pub last_used: u64,
    /// Index of the parent node in the tree arena; `None` for a root leaf.
    pub node: Option<usize>,
    /// Leaf depth below the root (a root leaf has depth 1).
    pub depth: usize,
}

impl ChemPoint {
    pub fn new(
        phi: &[f64],
        r_phi: &[f64],
        a: DMatrix<f64>,
        weights: &DVector<f64>,
        tolerance: f64,
        tau: f64,
        tick: u64,
    ) -> Result<Self> {
        let dim = phi.len();
        // scaled sensitivity M = W A W^-1 / tol; the initial EOA is the region
        // where the linearly propagated state change stays below tolerance
        let mut m = DMatrix::zeros(dim, dim);
        for i in 0..dim {
            for j in 0..dim {
                m[(i, j)] = weights[i] * a[(i, j)] / (weights[j] * tolerance);
            }
        }
        let chol = linalg::ellipsoid_factor(m, SIGMA_MIN)
            .ok_or_else(|| anyhow!("accuracy ellipsoid factorization failed"))?;
        let l = chol.l();
        Ok(Self {
            phi: DVector::from_column_slice(phi),
            r_phi: DVector::from_column_slice(r_phi),
            a,
            chol,
            l,
            tau,
            n_used: 0,
            n_grown: 0,
            last_used: tick,
            node: None,
            depth: 1,
        })
    }

    pub fn phi(&self) -> &DVector<f64> {
        &self.phi
    }

    pub fn r_phi(&self) -> &DVector<f64> {
        &self.r_phi
    }

    pub fn gradient(&self) -> &DMatrix<f64> {
        &self.a
    }

    pub fn tau(&self) -> f64 {
        self.tau
    }

    fn scaled_delta(&self, phi_q: &[f64], weights: &DVector<f64>, dpsi: &mut DVector<f64>) {
        for i in 0..dpsi.len() {
            dpsi[i] = weights[i] * (phi_q[i] - self.phi[i]);
        }
    }

    /// Ellipsoid-of-accuracy test for a query point.
    pub fn in_eoa(
        &self,
        phi_q: &[f64],
        weights: &DVector<f64>,
        dpsi: &mut DVector<f64>,
        z: &mut DVector<f64>,
    ) -> bool {
        self.scaled_delta(phi_q, weights, dpsi);
        z.gemv_tr(1.0, &self.l, dpsi, 0.0);
        z.norm_squared() <= 1.0
    }

    /// Linear approximation R(phi0) + A (phi_q - phi0), written into `out`.
    pub fn approximate(&self, phi_q: &[f64], dphi: &mut DVector<f64>, out: &mut DVector<f64>) {
        for i in 0..dphi.len() {
            dphi[i] = phi_q[i] - self.phi[i];
        }
        linalg::linear_map(out, &self.r_phi, &self.a, dphi);
    }

    /// Scaled norm of the difference between the true result and an
    /// approximation previously produced by [`Self::approximate`].
    pub fn scaled_error(&self, r_true: &[f64], approx: &DVector<f64>, weights: &DVector<f64>) -> f64 {
        let mut sum = 0.0;
        for i in 0..approx.len() {
            let e = weights[i] * (r_true[i] - approx[i]);
            sum += e * e;
        }
        sum.sqrt()
    }

    /// Enlarge the EOA to cover `phi_q`.
    pub fn grow(
        &mut self,
        phi_q: &[f64],
        weights: &DVector<f64>,
        dpsi: &mut DVector<f64>,
        z: &mut DVector<f64>,
        u: &mut DVector<f64>,
    ) -> CoverOutcome {
        self.scaled_delta(phi_q, weights, dpsi);
        let outcome = linalg::cover_point(&mut self.chol, &self.l, dpsi, z, u);
        if outcome == CoverOutcome::Grown {
            self.l = self.chol.l();
            self.n_grown += 1;
        }
        outcome
    }

    /// Broyden correction moving the gradient towards the secant of the newly
    /// covered point.
    pub fn correct_gradient(
        &mut self,
        phi_q: &[f64],
        r_true: &[f64],
        dphi: &mut DVector<f64>,
        dr: &mut DVector<f64>,
        resid: &mut DVector<f64>,
    ) {
        for i in 0..dphi.len() {
            dphi[i] = phi_q[i] - self.phi[i];
            dr[i] = r_true[i] - self.r_phi[i];
        }
        linalg::broyden_update(&mut self.a, dphi, dr, resid);
    }
}
