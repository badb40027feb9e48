//! Dynamic adaptive mechanism reduction.

pub mod dac;

use serde::{Deserialize, Serialize};

/// Which reduction scheme the solver runs, chosen once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReductionMethod {
    /// Integrate the full mechanism in every cell.
    None,
    /// Dynamic adaptive chemistry: per-cell active-species selection from the
    /// direct interaction graph.
    Dac,
}

/// The per-query reduced view of the mechanism: which species are active,
/// which reactions are disabled, and the index maps between the simplified
/// and the complete state.
#[derive(Debug, Clone)]
pub struct ReducedMechanism {
    pub n_active: usize,
    /// Per-species activity for this query.
    pub active: Vec<bool>,
    /// A reaction is disabled iff it contains at least one inactive species.
    pub reactions_disabled: Vec<bool>,
    /// simplified -> complete species index, length `n_active`.
    pub s2c: Vec<usize>,
    /// complete -> simplified species index, -1 for inactive species.
    pub c2s: Vec<i32>,
    /// Active concentrations with T and p appended, length `n_active` + 2.
    pub simplified_c: Vec<f64>,
}

impl ReducedMechanism {
    /// A view with every species active and every reaction enabled.
    pub fn identity(n_species: usize, n_reactions: usize) -> Self {
        Self {
            n_active: n_species,
            active: vec![true; n_species],
            reactions_disabled: vec![false; n_reactions],
            s2c: (0..n_species).collect(),
            c2s: (0..n_species as i32).collect(),
            simplified_c: vec![0.0; n_species + 2],
        }
    }

    /// Refresh the simplified state of an identity view for a new query.
    pub fn refresh_identity(&mut self, c: &[f64], t: f64, p: f64) {
        let n = c.len();
        self.simplified_c[..n].copy_from_slice(c);
        self.simplified_c[n] = t;
        self.simplified_c[n + 1] = p;
    }

    pub fn is_active(&self, i: usize) -> bool {
        self.active[i]
    }
}
