use crate::traits::{Kinetics, SpecieThermo};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Universal gas constant, J/(mol K).
pub const R_GAS: f64 = 8.314462618;

/// One side entry of an elementary reaction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SpecieCoeff {
    pub index: usize,
    pub coeff: f64,
}

/// Modified Arrhenius rate constant k = A T^beta exp(-Ea / (R T)),
/// with Ea in J/mol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Arrhenius {
    pub a: f64,
    pub beta: f64,
    pub e_a: f64,
}

impl Arrhenius {
    pub fn rate(&self, t: f64) -> f64 {
        self.a * t.powf(self.beta) * (-self.e_a / (R_GAS * t)).exp()
    }
}

/// An elementary reaction. A reversible reaction carries an explicit reverse
/// rate constant; `reverse: None` means irreversible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reaction {
    pub lhs: Vec<SpecieCoeff>,
    pub rhs: Vec<SpecieCoeff>,
    pub forward: Arrhenius,
    pub reverse: Option<Arrhenius>,
}

/// Rate of one reaction at a given state: the net rate together with its
/// forward/reverse split and the limiting (lowest-concentration) species on
/// each side.
#[derive(Debug, Clone, Copy)]
pub struct ReactionRate {
    pub net: f64,
    pub forward: f64,
    pub reverse: f64,
    pub lhs_ref: usize,
    pub rhs_ref: usize,
}

/// (element, atom count) entry of a species' elemental composition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementCount {
    pub element: String,
    pub atoms: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Specie {
    pub name: String,
    molar_mass: f64,
    composition: Vec<ElementCount>,
}

impl SpecieThermo for Specie {
    fn molar_mass(&self) -> f64 {
        self.molar_mass
    }
}

/// A concrete mass-action mechanism implementing [`Kinetics`].
///
/// Production deployments wrap their chemistry library behind the `Kinetics`
/// trait directly; this type serves the test suite and callers without an
/// adapter of their own.
#[derive(Debug, Clone)]
pub struct Mechanism {
    species: Vec<Specie>,
    reactions: Vec<Reaction>,
    index: HashMap<String, usize>,
}

impl Mechanism {
    pub fn new() -> Self {
        Self {
            species: Vec::new(),
            reactions: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Register a species with its molar mass (kg/kmol) and elemental
    /// composition. Returns its index.
    pub fn add_specie(
        &mut self,
        name: &str,
        molar_mass: f64,
        composition: &[(&str, u32)],
    ) -> Result<usize> {
        if self.index.contains_key(name) {
            bail!("species {name} registered twice");
        }
        if !self.reactions.is_empty() {
            bail!("all species must be registered before the first reaction");
        }
        let id = self.species.len();
        self.species.push(Specie {
            name: name.to_string(),
            molar_mass,
            composition: composition
                .iter()
                .map(|&(element, atoms)| ElementCount {
                    element: element.to_string(),
                    atoms,
                })
                .collect(),
        });
        self.index.insert(name.to_string(), id);
        Ok(id)
    }

    /// Register a reaction by species names with stoichiometric coefficients.
    pub fn add_reaction(
        &mut self,
        lhs: &[(&str, f64)],
        rhs: &[(&str, f64)],
        forward: Arrhenius,
        reverse: Option<Arrhenius>,
    ) -> Result<usize> {
        let side = |terms: &[(&str, f64)]| -> Result<Vec<SpecieCoeff>> {
            terms
                .iter()
                .map(|&(name, coeff)| {
                    let index = *self
                        .index
                        .get(name)
                        .ok_or_else(|| anyhow::anyhow!("unknown species {name} in reaction"))?;
                    Ok(SpecieCoeff { index, coeff })
                })
                .collect()
        };
        let lhs = side(lhs)?;
        let rhs = side(rhs)?;
        if lhs.is_empty() || rhs.is_empty() {
            bail!("a reaction needs at least one species on each side");
        }
        self.reactions.push(Reaction {
            lhs,
            rhs,
            forward,
            reverse,
        });
        Ok(self.reactions.len() - 1)
    }

    fn side_rate(terms: &[SpecieCoeff], k: f64, c: &[f64]) -> f64 {
        let mut rate = k;
        for term in terms {
            rate *= c[term.index].max(0.0).powf(term.coeff);
        }
        rate
    }

    fn limiting(terms: &[SpecieCoeff], c: &[f64]) -> usize {
        let mut best = terms[0].index;
        for term in &terms[1..] {
            if c[term.index] < c[best] {
                best = term.index;
            }
        }
        best
    }

    /// d(side rate)/dc_j for one side of a reaction.
    fn side_rate_derivative(terms: &[SpecieCoeff], k: f64, c: &[f64], j: usize) -> f64 {
        let mut deriv = 0.0;
        for term in terms {
            if term.index != j {
                continue;
            }
            let mut partial = k * term.coeff * c[j].max(0.0).powf(term.coeff - 1.0);
            for other in terms {
                if other.index != j {
                    partial *= c[other.index].max(0.0).powf(other.coeff);
                }
            }
            deriv += partial;
        }
        deriv
    }
}

impl Default for Mechanism {
    fn default() -> Self {
        Self::new()
    }
}

impl Kinetics for Mechanism {
    type Thermo = Specie;

    fn n_species(&self) -> usize {
        self.species.len()
    }

    fn reactions(&self) -> &[Reaction] {
        &self.reactions
    }

    fn omega(&self, reaction: &Reaction, c: &[f64], t: f64, _p: f64) -> ReactionRate {
        let forward = Self::side_rate(&reaction.lhs, reaction.forward.rate(t), c);
        let reverse = match &reaction.reverse {
            Some(arrhenius) => Self::side_rate(&reaction.rhs, arrhenius.rate(t), c),
            None => 0.0,
        };
        ReactionRate {
            net: forward - reverse,
            forward,
            reverse,
            lhs_ref: Self::limiting(&reaction.lhs, c),
            rhs_ref: Self::limiting(&reaction.rhs, c),
        }
    }

    fn specie_composition(&self, i: usize) -> &[ElementCount] {
        &self.species[i].composition
    }

    fn specie_thermo(&self, i: usize) -> &Self::Thermo {
        &self.species[i]
    }

    fn specie_name(&self, i: usize) -> &str {
        &self.species[i].name
    }

    fn specie_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    fn jacobian(
        &self,
        c: &[f64],
        t: f64,
        _p: f64,
        disabled: Option<&[bool]>,
        out: &mut [f64],
    ) -> bool {
        let n = self.species.len();
        for v in out.iter_mut() {
            *v = 0.0;
        }
        for (r, reaction) in self.reactions.iter().enumerate() {
            if disabled.is_some_and(|d| d[r]) {
                continue;
            }
            let kf = reaction.forward.rate(t);
            let kr = reaction.reverse.as_ref().map(|a| a.rate(t));
            // columns: only species appearing on a side influence that side's
            // rate; a species listed on both sides is differentiated once
            let mut columns: Vec<usize> = Vec::with_capacity(reaction.lhs.len() + reaction.rhs.len());
            for term in reaction.lhs.iter().chain(reaction.rhs.iter()) {
                if !columns.contains(&term.index) {
                    columns.push(term.index);
                }
            }
            for j in columns {
                let mut dnet = Self::side_rate_derivative(&reaction.lhs, kf, c, j);
                if let Some(kr) = kr {
                    dnet -= Self::side_rate_derivative(&reaction.rhs, kr, c, j);
                }
                if dnet == 0.0 {
                    continue;
                }
                for lhs in &reaction.lhs {
                    out[lhs.index * n + j] -= lhs.coeff * dnet;
                }
                for rhs in &reaction.rhs {
                    out[rhs.index * n + j] += rhs.coeff * dnet;
                }
            }
        }
        true
    }
}
