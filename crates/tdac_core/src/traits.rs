use crate::mechanism::{ElementCount, Reaction, ReactionRate};
use crate::reduction::ReducedMechanism;
use anyhow::Result;

/// Per-species thermodynamic data exposed by the kinetics adapter.
pub trait SpecieThermo {
    /// Molar mass in kg/kmol.
    fn molar_mass(&self) -> f64;
}

/// Narrow interface to the external thermodynamics/kinetics library.
///
/// The core never evaluates Arrhenius expressions itself; it asks the adapter
/// for per-reaction rates and per-species metadata. Adapters are read-only
/// from the core's perspective and may be shared by many solver instances.
pub trait Kinetics {
    type Thermo: SpecieThermo;

    /// Number of species in the full mechanism.
    fn n_species(&self) -> usize;

    /// All elementary reactions of the full mechanism.
    fn reactions(&self) -> &[Reaction];

    /// Net rate of a single reaction at (c, T, p), with the forward/reverse
    /// split and the limiting species on each side.
    fn omega(&self, reaction: &Reaction, c: &[f64], t: f64, p: f64) -> ReactionRate;

    /// Elemental composition of species `i` as (element, atom count) pairs.
    fn specie_composition(&self, i: usize) -> &[ElementCount];

    fn specie_thermo(&self, i: usize) -> &Self::Thermo;

    fn specie_name(&self, i: usize) -> &str;

    /// Index of a species by name, `None` when absent from the mechanism.
    fn specie_index(&self, name: &str) -> Option<usize>;

    /// Net production rate of every species, summed over the reactions not
    /// flagged in `disabled`. A reaction containing an inactive species is
    /// always flagged, so inactive species receive a zero rate.
    fn net_rates(&self, c: &[f64], t: f64, p: f64, disabled: Option<&[bool]>, out: &mut [f64]) {
        for v in out.iter_mut() {
            *v = 0.0;
        }
        for (j, reaction) in self.reactions().iter().enumerate() {
            if disabled.is_some_and(|d| d[j]) {
                continue;
            }
            let rate = self.omega(reaction, c, t, p);
            for term in &reaction.lhs {
                out[term.index] -= term.coeff * rate.net;
            }
            for term in &reaction.rhs {
                out[term.index] += term.coeff * rate.net;
            }
        }
    }

    /// Analytic Jacobian d(net rate)/dc, row-major into `out`, restricted to
    /// the reactions not flagged in `disabled`. Returns `false` when the
    /// adapter has no analytic form; the caller then falls back to finite
    /// differences.
    fn jacobian(
        &self,
        _c: &[f64],
        _t: f64,
        _p: f64,
        _disabled: Option<&[bool]>,
        _out: &mut [f64],
    ) -> bool {
        false
    }
}

/// The external stiff ODE integrator, treated as a black box.
///
/// Advances the species concentrations in place over [t0, t0 + dt] at frozen
/// temperature and pressure, touching only the species active in `reduced`.
/// Implementations must be reentrant on their own state buffers.
pub trait Integrator<K: Kinetics> {
    fn integrate(
        &mut self,
        kinetics: &K,
        reduced: &ReducedMechanism,
        c: &mut [f64],
        t: f64,
        p: f64,
        t0: f64,
        dt: f64,
    ) -> Result<()>;
}

/// Diagnostic hook for quantities the reducer computes along the way.
///
/// The default implementations discard everything; callers that want the
/// equivalence-ratio history or the NO-ignition timestamp install their own
/// observer and decide where the data goes.
pub trait Observer {
    /// Progress and large-molecule equivalence ratios for one reduction call.
    fn equivalence_ratios(&mut self, _time: f64, _phi_progress: f64, _phi_large: f64) {}

    /// NO entered the active set for the first time.
    fn no_activated(&mut self, _time: f64) {}
}

/// Observer that ignores every callback.
pub struct NullObserver;

impl Observer for NullObserver {}
