use crate::config::TdacConfig;
use crate::error::ChemError;
use crate::reduction::ReducedMechanism;
use crate::traits::{Kinetics, Observer, SpecieThermo};
use log::warn;
use std::collections::VecDeque;

/// Dynamic adaptive chemistry reducer.
///
/// For each query it builds the direct interaction graph r_AB from the
/// per-reaction net rates, seeds a search-initiating set and relaxes retained
/// importance through the graph; species whose importance never reaches
/// `eps_dac` are dropped and every reaction touching them is disabled.
///
/// All per-call buffers are owned here and reused between calls.
#[derive(Debug)]
pub struct Dac {
    n_species: usize,
    eps: f64,
    phi_tol: f64,
    nb_c_large: usize,
    nox_threshold: f64,
    automatic: bool,

    // per-species C/H/O atom counts
    s_c: Vec<u32>,
    s_h: Vec<u32>,
    s_o: Vec<u32>,

    co2: Option<usize>,
    co: Option<usize>,
    ho2: Option<usize>,
    h2o: Option<usize>,
    no: Option<usize>,
    o2: Option<usize>,

    /// Explicit search-initiating set (non-automatic mode).
    sis: Vec<usize>,
    fuel: Vec<(usize, f64)>,
    /// O/C atom ratio of the fuel blend.
    zprime: f64,
    no_started: bool,

    /// Species ever activated; `emit` folds this union back into every
    /// reduced system it produces, so a species that was active once keeps
    /// its slot and successive cells see no discontinuities.
    ever_active: Vec<bool>,

    // scratch, reused across calls
    row_entries: Vec<Vec<(usize, f64)>>,
    row_pos: Vec<i32>,
    pa: Vec<f64>,
    ca: Vec<f64>,
    r_value: Vec<f64>,
    active: Vec<bool>,
    visited: Vec<bool>,
    participants: Vec<usize>,
    w_a: Vec<f64>,
    w_a_id: Vec<usize>,
    queue: VecDeque<usize>,
}

impl Dac {
    pub fn new<K: Kinetics>(kinetics: &K, config: &TdacConfig) -> Result<Self, ChemError> {
        let n = kinetics.n_species();

        let mut s_c = vec![0u32; n];
        let mut s_h = vec![0u32; n];
        let mut s_o = vec![0u32; n];
        for i in 0..n {
            for entry in kinetics.specie_composition(i) {
                match entry.element.as_str() {
                    "C" => s_c[i] = entry.atoms,
                    "H" => s_h[i] = entry.atoms,
                    "O" => s_o[i] = entry.atoms,
                    _ => {}
                }
            }
        }

        let co2 = kinetics.specie_index("CO2");
        let co = kinetics.specie_index("CO");
        let ho2 = kinetics.specie_index("HO2");
        let h2o = kinetics.specie_index("H2O");
        let no = kinetics.specie_index("NO");
        let o2 = kinetics.specie_index("O2");

        let automatic = config.automatic_sis;
        if automatic && (co2.is_none() || co.is_none() || ho2.is_none() || h2o.is_none()) {
            return Err(ChemError::Config(
                "automatic SIS selection needs CO2, CO, HO2 and H2O in the mechanism".to_string(),
            ));
        }

        let mut fuel = Vec::new();
        let mut zprime = 0.0;
        if automatic {
            if config.fuel_species.is_empty() {
                return Err(ChemError::Config(
                    "automatic SIS selection needs a non-empty fuel_species table".to_string(),
                ));
            }
            for (name, &fraction) in &config.fuel_species {
                let id = kinetics.specie_index(name).ok_or_else(|| {
                    ChemError::Config(format!("fuel species {name} not in the mechanism"))
                })?;
                fuel.push((id, fraction));
            }
            // mole-weighted O/C ratio of the fuel blend
            let mut inv_m = 0.0;
            for &(id, fraction) in &fuel {
                inv_m += fraction / kinetics.specie_thermo(id).molar_mass();
            }
            let m_tot = 1.0 / inv_m;
            let mut nb_c = 0.0;
            let mut nb_o = 0.0;
            for &(id, fraction) in &fuel {
                let moles = fraction * m_tot / kinetics.specie_thermo(id).molar_mass();
                nb_c += moles * s_c[id] as f64;
                nb_o += moles * s_o[id] as f64;
            }
            if nb_c == 0.0 {
                return Err(ChemError::Config(
                    "fuel blend carries no carbon; the O/C ratio is undefined".to_string(),
                ));
            }
            zprime = nb_o / nb_c;
        }

        let mut sis = Vec::new();
        if !automatic {
            for name in &config.search_init_set {
                let id = kinetics.specie_index(name).ok_or_else(|| {
                    ChemError::Config(format!("search_init_set species {name} not in the mechanism"))
                })?;
                sis.push(id);
            }
        }

        Ok(Self {
            n_species: n,
            eps: config.eps_dac,
            phi_tol: config.phi_tol(),
            nb_c_large: config.nb_c_large,
            nox_threshold: config.nox_threshold,
            automatic,
            s_c,
            s_h,
            s_o,
            co2,
            co,
            ho2,
            h2o,
            no,
            o2,
            sis,
            fuel,
            zprime,
            no_started: false,
            ever_active: vec![false; n],
            row_entries: vec![Vec::new(); n],
            row_pos: vec![-1; n * n],
            pa: vec![0.0; n],
            ca: vec![0.0; n],
            r_value: vec![0.0; n],
            active: vec![false; n],
            visited: vec![false; n],
            participants: Vec::with_capacity(16),
            w_a: Vec::with_capacity(16),
            w_a_id: Vec::with_capacity(16),
            queue: VecDeque::new(),
        })
    }

    pub fn n_species(&self) -> usize {
        self.n_species
    }

    /// Cumulative activity bitmap across every reduction so far.
    pub fn ever_active(&self) -> &[bool] {
        &self.ever_active
    }

    /// Forget the cumulative activity and the NO-activation latch.
    pub fn reset(&mut self) {
        self.ever_active.fill(false);
        self.no_started = false;
    }

    fn reset_scratch(&mut self) {
        let n = self.n_species;
        for a in 0..n {
            for &(b, _) in &self.row_entries[a] {
                self.row_pos[a * n + b] = -1;
            }
        }
        for row in &mut self.row_entries {
            row.clear();
        }
        self.pa.fill(0.0);
        self.ca.fill(0.0);
        self.r_value.fill(0.0);
        self.active.fill(false);
        self.queue.clear();
    }

    fn row_add(&mut self, a: usize, b: usize, value: f64) {
        let key = a * self.n_species + b;
        let pos = self.row_pos[key];
        if pos < 0 {
            self.row_pos[key] = self.row_entries[a].len() as i32;
            self.row_entries[a].push((b, value));
        } else {
            self.row_entries[a][pos as usize].1 += value;
        }
    }

    fn seed(&mut self, id: usize) {
        self.active[id] = true;
        self.r_value[id] = 1.0;
        self.queue.push_back(id);
    }

    fn ratio(num: f64, den: f64) -> f64 {
        if den != 0.0 {
            num / den
        } else if num > 0.0 {
            f64::INFINITY
        } else {
            0.0
        }
    }

    /// Compute the reduced mechanism for the state (c, T, p) into `out`.
    pub fn reduce<K: Kinetics>(
        &mut self,
        kinetics: &K,
        c: &[f64],
        t: f64,
        p: f64,
        time: f64,
        observer: &mut dyn Observer,
        out: &mut ReducedMechanism,
    ) -> Result<(), ChemError> {
        self.reset_scratch();
        self.accumulate_interactions(kinetics, c, t, p)?;
        self.seed_search_set(c, t, time, observer);
        self.relax(time, observer);
        self.emit(kinetics, c, t, p, out);
        Ok(())
    }

    /// Build the interaction numerators r_AB and the per-species production
    /// and consumption totals.
    fn accumulate_interactions<K: Kinetics>(
        &mut self,
        kinetics: &K,
        c: &[f64],
        t: f64,
        p: f64,
    ) -> Result<(), ChemError> {
        for (j, reaction) in kinetics.reactions().iter().enumerate() {
            let rate = kinetics.omega(reaction, c, t, p);
            if !rate.net.is_finite() {
                return Err(ChemError::Kinetics(format!(
                    "non-finite rate in reaction {j}"
                )));
            }
            let omega = rate.net;

            self.w_a.clear();
            self.w_a_id.clear();

            // A reaction like A + B -> 2C may also be written A + B -> C + C:
            // every pair is counted once per occurrence of the source species,
            // with the partner set deduplicated through the visited bitmap.
            for (side, sign) in [(&reaction.lhs, -1.0), (&reaction.rhs, 1.0)] {
                for term in side {
                    let s = term.index;
                    let nu = sign * term.coeff;

                    self.participants.clear();
                    for partner in reaction.lhs.iter().chain(reaction.rhs.iter()) {
                        if !self.visited[partner.index] {
                            self.visited[partner.index] = true;
                            self.participants.push(partner.index);
                        }
                    }
                    let participants = std::mem::take(&mut self.participants);
                    for &b in &participants {
                        self.visited[b] = false;
                        if b != s {
                            self.row_add(s, b, nu * omega);
                        }
                    }
                    self.participants = participants;

                    match self.w_a_id.iter().position(|&id| id == s) {
                        Some(k) => self.w_a[k] += nu * omega,
                        None => {
                            self.w_a_id.push(s);
                            self.w_a.push(nu * omega);
                        }
                    }
                }
            }

            // net production/consumption per reaction, so a species on both
            // sides contributes its net coefficient only
            for (k, &id) in self.w_a_id.iter().enumerate() {
                let w = self.w_a[k];
                if w > 0.0 {
                    self.pa[id] += w;
                } else {
                    self.ca[id] += -w;
                }
            }
        }
        Ok(())
    }

    fn seed_search_set(&mut self, c: &[f64], t: f64, time: f64, observer: &mut dyn Observer) {
        if !self.automatic {
            let sis = std::mem::take(&mut self.sis);
            for &id in &sis {
                self.seed(id);
            }
            self.sis = sis;
            return;
        }

        // atom totals, excluding the fully oxidized products CO2 and H2O;
        // the "large" totals keep only heavy hydrocarbons and O2
        let mut na = [0.0; 3];
        let mut nal = [0.0; 3];
        for i in 0..self.n_species {
            if Some(i) == self.co2 || Some(i) == self.h2o {
                continue;
            }
            na[0] += self.s_c[i] as f64 * c[i];
            na[1] += self.s_h[i] as f64 * c[i];
            na[2] += self.s_o[i] as f64 * c[i];
            if self.s_c[i] as usize > self.nb_c_large || Some(i) == self.o2 {
                nal[0] += self.s_c[i] as f64 * c[i];
                nal[1] += self.s_h[i] as f64 * c[i];
                nal[2] += self.s_o[i] as f64 * c[i];
            }
        }
        let phi_progress = Self::ratio(
            2.0 * na[0] + na[1] / 2.0 - self.zprime * na[0],
            na[2] - self.zprime * na[0],
        );
        let phi_large = Self::ratio(2.0 * nal[0] + nal[1] / 2.0, nal[2]);
        observer.equivalence_ratios(time, phi_progress, phi_large);

        let co = self.co.expect("present under automatic SIS");
        let ho2 = self.ho2.expect("present under automatic SIS");
        if phi_large >= self.phi_tol && phi_progress >= self.phi_tol {
            // still decomposing fuel: seed CO, HO2 and the fuel species
            self.seed(co);
            self.seed(ho2);
            let fuel = std::mem::take(&mut self.fuel);
            for &(id, _) in &fuel {
                self.seed(id);
            }
            self.fuel = fuel;
        } else if phi_progress >= self.phi_tol {
            self.seed(co);
            self.seed(ho2);
        } else {
            // burnt: only the completion chemistry matters
            self.seed(self.co2.expect("present under automatic SIS"));
            self.seed(self.h2o.expect("present under automatic SIS"));
        }

        if t > self.nox_threshold {
            if let Some(no) = self.no {
                self.seed(no);
                if !self.no_started {
                    self.no_started = true;
                    observer.no_activated(time);
                }
            }
        }
    }

    /// Breadth-first relaxation of retained importance through the
    /// interaction graph.
    fn relax(&mut self, time: f64, observer: &mut dyn Observer) {
        while let Some(u) = self.queue.pop_front() {
            let den = self.pa[u].max(self.ca[u]);
            if den == 0.0 {
                continue;
            }
            for k in 0..self.row_entries[u].len() {
                let (other, num) = self.row_entries[u][k];
                let mut r_ab = num.abs() / den;
                if r_ab > 1.0 {
                    warn!("badly conditioned interaction coefficient {r_ab} for species pair ({u}, {other})");
                    r_ab = 1.0;
                }
                if r_ab < self.eps {
                    continue;
                }
                let r_composed = self.r_value[u] * r_ab;
                if self.r_value[other] < r_composed && r_composed >= self.eps {
                    if Some(other) == self.no && !self.no_started {
                        self.no_started = true;
                        observer.no_activated(time);
                    }
                    self.queue.push_back(other);
                    self.r_value[other] = r_composed;
                    self.active[other] = true;
                }
            }
        }
    }

    fn emit<K: Kinetics>(
        &mut self,
        kinetics: &K,
        c: &[f64],
        t: f64,
        p: f64,
        out: &mut ReducedMechanism,
    ) {
        let n = self.n_species;
        // activations persist: once a species has been active it keeps its
        // slot in every later reduced system
        for i in 0..n {
            self.active[i] = self.active[i] || self.ever_active[i];
            self.ever_active[i] = self.active[i];
        }

        out.reactions_disabled.clear();
        for reaction in kinetics.reactions() {
            let disabled = reaction
                .lhs
                .iter()
                .chain(reaction.rhs.iter())
                .any(|term| !self.active[term.index]);
            out.reactions_disabled.push(disabled);
        }

        out.active.clear();
        out.active.extend_from_slice(&self.active);
        out.s2c.clear();
        out.c2s.resize(n, -1);
        out.simplified_c.clear();
        for i in 0..n {
            if self.active[i] {
                out.c2s[i] = out.s2c.len() as i32;
                out.s2c.push(i);
                out.simplified_c.push(c[i]);
            } else {
                out.c2s[i] = -1;
            }
        }
        out.simplified_c.push(t);
        out.simplified_c.push(p);
        out.n_active = out.s2c.len();
    }
}
