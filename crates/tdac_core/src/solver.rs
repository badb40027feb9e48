use crate::config::TdacConfig;
use crate::error::ChemError;
use crate::linalg;
use crate::reduction::dac::Dac;
use crate::reduction::{ReducedMechanism, ReductionMethod};
use crate::tabulation::{Isat, Retrieve, Statistics};
use crate::traits::{Integrator, Kinetics, NullObserver, Observer};
use log::warn;
use nalgebra::{DMatrix, DVector};
use std::io;

/// Per-cell chemistry facade: tabulation retrieve, mechanism reduction,
/// integration and tabulation update behind one `solve` call.
///
/// One instance owns one reducer/cache pair and serves one stream of queries;
/// deployments run one instance per worker thread over disjoint cells. The
/// kinetics adapter is borrowed read-only and may be shared between
/// instances.
pub struct ChemistrySolver<'a, K: Kinetics, I: Integrator<K>> {
    kinetics: &'a K,
    integrator: I,
    config: TdacConfig,
    reducer: Option<Dac>,
    cache: Option<Isat>,
    observer: Box<dyn Observer>,
    reduced: ReducedMechanism,
    // scratch, reused across cells
    phi: Vec<f64>,
    rphi: Vec<f64>,
    c_new: Vec<f64>,
    rates: Vec<f64>,
    approx: Vec<f64>,
}

impl<'a, K: Kinetics, I: Integrator<K>> ChemistrySolver<'a, K, I> {
    pub fn new(kinetics: &'a K, integrator: I, config: TdacConfig) -> Result<Self, ChemError> {
        let n = kinetics.n_species();
        config.validate(n)?;

        let reducer = match config.reduction {
            ReductionMethod::Dac => Some(Dac::new(kinetics, &config)?),
            ReductionMethod::None => None,
        };
        let cache = if config.tabulation {
            let weights = DVector::from_vec(config.weights(n));
            Some(Isat::new(n + 2, config.isat.clone(), weights))
        } else {
            None
        };

        Ok(Self {
            kinetics,
            integrator,
            reducer,
            cache,
            observer: Box::new(NullObserver),
            reduced: ReducedMechanism::identity(n, kinetics.reactions().len()),
            phi: vec![0.0; n + 2],
            rphi: vec![0.0; n + 2],
            c_new: vec![0.0; n],
            rates: vec![0.0; n],
            approx: vec![0.0; n + 2],
            config,
        })
    }

    /// Install a diagnostic observer (equivalence ratios, NO activation).
    pub fn set_observer(&mut self, observer: Box<dyn Observer>) {
        self.observer = observer;
    }

    pub fn config(&self) -> &TdacConfig {
        &self.config
    }

    pub fn integrator(&self) -> &I {
        &self.integrator
    }

    pub fn tabulation(&self) -> Option<&Isat> {
        self.cache.as_ref()
    }

    pub fn reducer(&self) -> Option<&Dac> {
        self.reducer.as_ref()
    }

    pub fn statistics(&self) -> Statistics {
        self.cache
            .as_ref()
            .map(Isat::statistics)
            .unwrap_or_default()
    }

    /// Drop all cached records, counters and cumulative reducer state.
    pub fn reset(&mut self) {
        if let Some(cache) = self.cache.as_mut() {
            cache.clear();
        }
        if let Some(reducer) = self.reducer.as_mut() {
            reducer.reset();
        }
    }

    /// Write a short summary of the cache and reducer state.
    pub fn report<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
        let stats = self.statistics();
        writeln!(
            out,
            "tabulation: {} retrieves, {} hits, {} adds, {} grows, {} evictions",
            stats.n_retrieve, stats.n_hit, stats.n_add, stats.n_grown, stats.n_evict
        )?;
        if stats.size > 0 {
            writeln!(
                out,
                "tree: {} leaves, depth {}, mean leaf depth {:.2}",
                stats.size, stats.depth, stats.avg_depth
            )?;
        }
        if let Some(reducer) = &self.reducer {
            let ever = reducer.ever_active().iter().filter(|a| **a).count();
            writeln!(
                out,
                "reduction: {ever} of {} species ever active",
                reducer.n_species()
            )?;
        }
        Ok(())
    }

    /// Advance the chemistry of one cell over [t0, t0 + dt] at frozen T and
    /// p. `c` is updated in place; the returned value is the chemical
    /// timescale of the cell.
    pub fn solve(
        &mut self,
        c: &mut [f64],
        t: f64,
        p: f64,
        t0: f64,
        dt: f64,
    ) -> Result<f64, ChemError> {
        let n = self.kinetics.n_species();
        if c.len() != n {
            return Err(ChemError::Config(format!(
                "state length {} does not match the {n}-species mechanism",
                c.len()
            )));
        }
        if !(dt > 0.0) {
            return Err(ChemError::Config(format!("dt must be positive, got {dt}")));
        }
        if !t.is_finite() || !p.is_finite() || c.iter().any(|v| !v.is_finite()) {
            return Err(ChemError::Kinetics(
                "non-finite temperature, pressure or concentration".to_string(),
            ));
        }

        self.phi[..n].copy_from_slice(c);
        self.phi[n] = t;
        self.phi[n + 1] = p;

        let mut candidate = None;
        if let Some(cache) = self.cache.as_mut() {
            match cache.retrieve(&self.phi, &mut self.approx) {
                Retrieve::Hit { leaf } => {
                    for (i, value) in c.iter_mut().enumerate() {
                        *value = self.approx[i].max(0.0);
                    }
                    return Ok(cache.leaf(leaf).tau());
                }
                Retrieve::Miss { candidate: cand } => candidate = cand,
            }
        }

        if let Some(reducer) = self.reducer.as_mut() {
            reducer.reduce(
                self.kinetics,
                c,
                t,
                p,
                t0,
                self.observer.as_mut(),
                &mut self.reduced,
            )?;
        } else {
            self.reduced.refresh_identity(c, t, p);
        }

        // chemical timescale from the rates at the query point
        self.kinetics.net_rates(
            c,
            t,
            p,
            Some(&self.reduced.reactions_disabled),
            &mut self.rates,
        );
        if self.rates.iter().any(|v| !v.is_finite()) {
            return Err(ChemError::Kinetics(
                "non-finite net production rate".to_string(),
            ));
        }
        let mut tau = f64::INFINITY;
        for &i in &self.reduced.s2c {
            let rate = self.rates[i].abs();
            if c[i] > 0.0 && rate > 1e-30 {
                tau = tau.min(c[i] / rate);
            }
        }
        if !tau.is_finite() {
            tau = dt;
        }

        self.c_new.copy_from_slice(c);
        self.integrator
            .integrate(
                self.kinetics,
                &self.reduced,
                &mut self.c_new,
                t,
                p,
                t0,
                dt,
            )
            .map_err(ChemError::Integration)?;
        if self.c_new.iter().any(|v| !v.is_finite()) {
            return Err(ChemError::Integration(anyhow::anyhow!(
                "integrator returned a non-finite state"
            )));
        }
        // inactive species stay frozen across the step
        for i in 0..n {
            if !self.reduced.is_active(i) {
                self.c_new[i] = c[i];
            }
        }

        self.rphi[..n].copy_from_slice(&self.c_new);
        self.rphi[n] = t;
        self.rphi[n + 1] = p;

        let mut grown = false;
        if let (Some(cache), Some(cand)) = (self.cache.as_mut(), candidate) {
            grown = cache.grow(cand, &self.phi, &self.rphi);
        }
        if self.cache.is_some() && !grown {
            match self.full_gradient(c, t, p, dt) {
                Some(a) => {
                    let cache = self.cache.as_mut().expect("cache present");
                    cache.add(candidate, &self.phi, &self.rphi, a, tau);
                }
                None => warn!("singular mapping gradient; record not tabulated"),
            }
        }

        c.copy_from_slice(&self.c_new);
        Ok(tau)
    }

    /// Mapping gradient A = dR/dphi at the query point, expanded to the full
    /// N + 2 state: the reduced species block is (I - dt J)^-1, inactive
    /// species and T, p map to themselves, and the T/p columns carry the
    /// first-order rate sensitivities.
    fn full_gradient(&self, c: &[f64], t: f64, p: f64, dt: f64) -> Option<DMatrix<f64>> {
        let kinetics = self.kinetics;
        let n = kinetics.n_species();
        let m = self.reduced.n_active;
        let map = &self.reduced.s2c;
        let disabled = &self.reduced.reactions_disabled;

        let mut jac_red = vec![0.0; m * m];
        let mut jac_full = vec![0.0; n * n];
        if kinetics.jacobian(c, t, p, Some(disabled), &mut jac_full) {
            for (si, &i) in map.iter().enumerate() {
                for (sj, &j) in map.iter().enumerate() {
                    jac_red[si * m + sj] = jac_full[i * n + j];
                }
            }
        } else {
            let mut c_full = c.to_vec();
            let mut rates_full = vec![0.0; n];
            let mut x: Vec<f64> = map.iter().map(|&i| c[i]).collect();
            let mut fp = vec![0.0; m];
            let mut fm = vec![0.0; m];
            linalg::finite_difference_jacobian(
                |x, out| {
                    for (si, &i) in map.iter().enumerate() {
                        c_full[i] = x[si];
                    }
                    kinetics.net_rates(&c_full, t, p, Some(disabled), &mut rates_full);
                    for (si, &i) in map.iter().enumerate() {
                        out[si] = rates_full[i];
                    }
                },
                &mut x,
                &mut fp,
                &mut fm,
                &mut jac_red,
            );
        }

        let a_red = linalg::mapping_gradient(&jac_red, m, dt)?;

        // first-order T and p sensitivities: dc'/dT = A dt dw/dT
        let mut fp = vec![0.0; n];
        let mut fm = vec![0.0; n];
        let mut column = DVector::zeros(m);

        let h_t = f64::EPSILON.cbrt() * t.abs().max(1.0);
        kinetics.net_rates(c, t + h_t, p, Some(disabled), &mut fp);
        kinetics.net_rates(c, t - h_t, p, Some(disabled), &mut fm);
        for (si, &i) in map.iter().enumerate() {
            column[si] = (fp[i] - fm[i]) / (2.0 * h_t);
        }
        let col_t = &a_red * (&column * dt);

        let h_p = f64::EPSILON.cbrt() * p.abs().max(1.0);
        kinetics.net_rates(c, t, p + h_p, Some(disabled), &mut fp);
        kinetics.net_rates(c, t, p - h_p, Some(disabled), &mut fm);
        for (si, &i) in map.iter().enumerate() {
            column[si] = (fp[i] - fm[i]) / (2.0 * h_p);
        }
        let col_p = &a_red * (&column * dt);

        let dim = n + 2;
        let mut a = DMatrix::identity(dim, dim);
        for (si, &i) in map.iter().enumerate() {
            for (sj, &j) in map.iter().enumerate() {
                a[(i, j)] = a_red[(si, sj)];
            }
            a[(i, n)] = col_t[si];
            a[(i, n + 1)] = col_p[si];
        }
        Some(a)
    }
}

#[cfg(test)]
mod tests {
    use super::ChemistrySolver;
    use crate::config::{IsatSettings, TdacConfig};
    use crate::error::ChemError;
    use crate::mechanism::{Arrhenius, Mechanism};
    use crate::reduction::{ReducedMechanism, ReductionMethod};
    use crate::solvers::Rk4;
    use crate::traits::{Integrator, Kinetics};
    use anyhow::bail;
    use nalgebra::DVector;

    const T: f64 = 1000.0;
    const P: f64 = 101_325.0;
    const DT: f64 = 1e-5;

    /// A <=> B isomerization. Both species share one composition, so every
    /// trajectory and every tangent conserves elements.
    fn isomerization() -> Mechanism {
        let mut mech = Mechanism::new();
        mech.add_specie("A", 30.03, &[("C", 1), ("H", 2), ("O", 1)])
            .unwrap();
        mech.add_specie("B", 30.03, &[("C", 1), ("H", 2), ("O", 1)])
            .unwrap();
        mech.add_reaction(
            &[("A", 1.0)],
            &[("B", 1.0)],
            Arrhenius {
                a: 1e5,
                beta: 0.0,
                e_a: 3e4,
            },
            Some(Arrhenius {
                a: 5e4,
                beta: 0.0,
                e_a: 3e4,
            }),
        )
        .unwrap();
        mech
    }

    fn explicit_config() -> TdacConfig {
        TdacConfig {
            automatic_sis: false,
            search_init_set: vec!["A".to_string()],
            ..TdacConfig::default()
        }
    }

    struct Counting {
        inner: Rk4,
        calls: usize,
    }

    impl Counting {
        fn new() -> Self {
            Self {
                inner: Rk4::new(2, 20),
                calls: 0,
            }
        }
    }

    impl<K: Kinetics> Integrator<K> for Counting {
        fn integrate(
            &mut self,
            kinetics: &K,
            reduced: &ReducedMechanism,
            c: &mut [f64],
            t: f64,
            p: f64,
            t0: f64,
            dt: f64,
        ) -> anyhow::Result<()> {
            self.calls += 1;
            self.inner.integrate(kinetics, reduced, c, t, p, t0, dt)
        }
    }

    #[test]
    fn first_query_misses_and_tabulates() {
        let mech = isomerization();
        let mut solver = ChemistrySolver::new(&mech, Counting::new(), explicit_config()).unwrap();

        let mut c = [1.0, 0.0];
        let tau = solver.solve(&mut c, T, P, 0.0, DT).unwrap();

        assert!(c[0] < 1.0 && c[1] > 0.0, "chemistry advanced: {c:?}");
        assert!(tau > 0.0 && tau.is_finite());
        assert_eq!(solver.integrator().calls, 1);
        let stats = solver.statistics();
        assert_eq!(stats.n_retrieve, 1);
        assert_eq!(stats.n_hit, 0);
        assert_eq!(stats.n_add, 1);
        assert_eq!(stats.size, 1);
    }

    #[test]
    fn exact_repeat_hits_bit_for_bit() {
        let mech = isomerization();
        let mut solver = ChemistrySolver::new(&mech, Counting::new(), explicit_config()).unwrap();

        let mut first = [1.0, 0.0];
        let tau_first = solver.solve(&mut first, T, P, 0.0, DT).unwrap();
        let mut second = [1.0, 0.0];
        let tau_second = solver.solve(&mut second, T, P, 0.0, DT).unwrap();

        assert_eq!(first.map(f64::to_bits), second.map(f64::to_bits));
        assert_eq!(tau_first.to_bits(), tau_second.to_bits());
        let stats = solver.statistics();
        assert_eq!(stats.n_retrieve, 2);
        assert_eq!(stats.n_hit, 1);
        assert_eq!(stats.n_add, 1);
        assert_eq!(solver.integrator().calls, 1);
    }

    #[test]
    fn tiny_perturbation_skips_integration() {
        let mech = isomerization();
        let mut solver = ChemistrySolver::new(&mech, Counting::new(), explicit_config()).unwrap();

        let mut c = [1.0, 0.0];
        solver.solve(&mut c, T, P, 0.0, DT).unwrap();

        let mut c = [1.0 + 1e-12, 1e-12];
        solver.solve(&mut c, T, P, 0.0, DT).unwrap();

        assert_eq!(solver.integrator().calls, 1, "hit answers without integrating");
        assert_eq!(solver.statistics().n_hit, 1);
    }

    #[test]
    fn nearby_state_grows_the_record() {
        let mech = isomerization();
        let mut solver = ChemistrySolver::new(&mech, Counting::new(), explicit_config()).unwrap();

        let mut c = [1.0, 0.0];
        solver.solve(&mut c, T, P, 0.0, DT).unwrap();

        // outside the fresh ellipsoid, but the mapping is linear in c at
        // fixed temperature, so the extrapolation stays within tolerance
        let query = [1.0 - 1e-3, 1e-3];
        let mut c = query;
        solver.solve(&mut c, T, P, 0.0, DT).unwrap();

        let stats = solver.statistics();
        assert_eq!(stats.n_grown, 1);
        assert_eq!(stats.n_add, 1);
        assert_eq!(stats.size, 1);
        assert_eq!(solver.integrator().calls, 2);

        // growth monotonicity: the grown query now retrieves
        let mut c = query;
        solver.solve(&mut c, T, P, 0.0, DT).unwrap();
        assert_eq!(solver.statistics().n_hit, 1);
        assert_eq!(solver.integrator().calls, 2);
    }

    #[test]
    fn distant_temperature_forces_a_new_record() {
        let mech = isomerization();
        let mut solver = ChemistrySolver::new(&mech, Counting::new(), explicit_config()).unwrap();

        let mut c = [1.0, 0.0];
        solver.solve(&mut c, T, P, 0.0, DT).unwrap();

        // the Arrhenius curvature over 100 K exceeds the tolerance, so the
        // growth test fails and a second record is stored
        let mut c = [1.0, 0.0];
        solver.solve(&mut c, T + 100.0, P, 0.0, DT).unwrap();

        let stats = solver.statistics();
        assert_eq!(stats.n_grown, 0);
        assert_eq!(stats.n_add, 2);
        assert_eq!(stats.size, 2);
    }

    #[test]
    fn capacity_sweep_evicts_least_recently_used() {
        let mech = isomerization();
        let config = TdacConfig {
            reduction: ReductionMethod::None,
            isat: IsatSettings {
                tolerance: 1e-7,
                max_elements: 16,
                ..IsatSettings::default()
            },
            ..TdacConfig::default()
        };
        let mut solver = ChemistrySolver::new(&mech, Counting::new(), config).unwrap();

        let temperature = |k: usize| 900.0 + 9.0 * k as f64;
        for k in 0..100 {
            let mut c = [1.0, 0.0];
            solver.solve(&mut c, temperature(k), P, 0.0, DT).unwrap();
            assert!(solver.statistics().size <= 16);
        }
        let stats = solver.statistics();
        assert_eq!(stats.size, 16);
        assert_eq!(stats.n_add, 100);
        assert_eq!(stats.n_evict, 84);
        assert_eq!(stats.n_hit, 0);

        // only the 16 youngest records survive
        for k in 84..100 {
            let mut c = [1.0, 0.0];
            solver.solve(&mut c, temperature(k), P, 0.0, DT).unwrap();
        }
        assert_eq!(solver.statistics().n_hit, 16);
        assert_eq!(solver.statistics().n_add, 100);
    }

    #[test]
    fn linear_approximation_conserves_elements() {
        let mech = isomerization();
        let mut solver = ChemistrySolver::new(&mech, Counting::new(), explicit_config()).unwrap();

        let mut c = [0.6, 0.4];
        solver.solve(&mut c, T, P, 0.0, DT).unwrap();

        let gradient = solver.tabulation().unwrap().leaf(0).gradient().clone();
        // element-conserving perturbation: A and B share one composition
        let dphi = DVector::from_vec(vec![1e-3, -1e-3, 0.0, 0.0]);
        let dc = &gradient * &dphi;
        let carbon = dc[0] + dc[1];
        assert!(
            carbon.abs() < 1e-12,
            "carbon imbalance {carbon} through the tangent"
        );
    }

    #[test]
    fn integration_failure_propagates() {
        struct Failing;
        impl<K: Kinetics> Integrator<K> for Failing {
            fn integrate(
                &mut self,
                _kinetics: &K,
                _reduced: &ReducedMechanism,
                _c: &mut [f64],
                _t: f64,
                _p: f64,
                _t0: f64,
                _dt: f64,
            ) -> anyhow::Result<()> {
                bail!("stiff system blew up")
            }
        }

        let mech = isomerization();
        let mut solver = ChemistrySolver::new(&mech, Failing, explicit_config()).unwrap();
        let mut c = [1.0, 0.0];
        let err = solver.solve(&mut c, T, P, 0.0, DT).expect_err("must propagate");
        assert!(matches!(err, ChemError::Integration(_)));
    }

    #[test]
    fn non_finite_inputs_abort_the_cell() {
        let mech = isomerization();
        let mut solver = ChemistrySolver::new(&mech, Counting::new(), explicit_config()).unwrap();

        let mut c = [1.0, 0.0];
        let err = solver.solve(&mut c, f64::NAN, P, 0.0, DT).expect_err("NaN T");
        assert!(matches!(err, ChemError::Kinetics(_)));

        let mut c = [f64::INFINITY, 0.0];
        let err = solver.solve(&mut c, T, P, 0.0, DT).expect_err("infinite c");
        assert!(matches!(err, ChemError::Kinetics(_)));

        let mut c = [1.0, 0.0, 0.0];
        let err = solver.solve(&mut c, T, P, 0.0, DT).expect_err("wrong length");
        assert!(matches!(err, ChemError::Config(_)));
    }

    #[test]
    fn reset_clears_cache_and_counters() {
        let mech = isomerization();
        let mut solver = ChemistrySolver::new(&mech, Counting::new(), explicit_config()).unwrap();

        let mut c = [1.0, 0.0];
        solver.solve(&mut c, T, P, 0.0, DT).unwrap();
        assert_eq!(solver.statistics().size, 1);

        solver.reset();
        let stats = solver.statistics();
        assert_eq!(stats.size, 0);
        assert_eq!(stats.n_retrieve, 0);
        assert!(solver.reducer().unwrap().ever_active().iter().all(|a| !a));
    }

    #[test]
    fn tabulation_can_be_disabled() {
        let mech = isomerization();
        let config = TdacConfig {
            tabulation: false,
            ..explicit_config()
        };
        let mut solver = ChemistrySolver::new(&mech, Counting::new(), config).unwrap();

        let mut first = [1.0, 0.0];
        solver.solve(&mut first, T, P, 0.0, DT).unwrap();
        let mut second = [1.0, 0.0];
        solver.solve(&mut second, T, P, 0.0, DT).unwrap();

        assert_eq!(first.map(f64::to_bits), second.map(f64::to_bits));
        assert_eq!(solver.integrator().calls, 2);
        assert_eq!(solver.statistics().n_retrieve, 0);
        assert!(solver.tabulation().is_none());
    }

    #[test]
    fn report_summarizes_the_run() {
        let mech = isomerization();
        let mut solver = ChemistrySolver::new(&mech, Counting::new(), explicit_config()).unwrap();
        let mut c = [1.0, 0.0];
        solver.solve(&mut c, T, P, 0.0, DT).unwrap();

        let mut out = Vec::new();
        solver.report(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("1 retrieves"));
        assert!(text.contains("1 adds"));
        assert!(text.contains("reduction"));
    }
}
