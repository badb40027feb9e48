use crate::error::ChemError;
use crate::reduction::ReductionMethod;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tuning of the tabulation cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IsatSettings {
    /// Tolerance of the ellipsoid-of-accuracy test.
    pub tolerance: f64,
    /// Capacity of the cache; the least-recently-used record is evicted once
    /// this many records are stored.
    pub max_elements: usize,
    /// Check the tree shape every this many retrieves.
    pub max_nb_balance_test: usize,
    /// Rebalance when depth exceeds this multiple of the ideal depth.
    pub balance_threshold: f64,
    /// Maximum number of extra leaves inspected after a primary miss;
    /// 0 disables the secondary search.
    pub max_2nd_search: usize,
}

impl Default for IsatSettings {
    fn default() -> Self {
        Self {
            tolerance: 1e-4,
            max_elements: 5000,
            max_nb_balance_test: 500,
            balance_threshold: 3.0,
            max_2nd_search: 0,
        }
    }
}

/// Immutable configuration of a chemistry solver instance.
///
/// Passed once at construction and validated against the mechanism; no global
/// lookups happen afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TdacConfig {
    /// Mechanism-reduction threshold for species retention.
    pub eps_dac: f64,
    /// Derive the search-initiating set from the local equivalence ratios
    /// instead of using `search_init_set`.
    pub automatic_sis: bool,
    /// Explicit search-initiating set, used when `automatic_sis` is off.
    pub search_init_set: Vec<String>,
    /// Fuel composition as species name -> mass fraction; required under
    /// automatic SIS selection.
    pub fuel_species: BTreeMap<String, f64>,
    /// Carbon count above which a hydrocarbon counts as "large".
    pub nb_c_large: usize,
    /// Tolerance on the equivalence ratios; defaults to `eps_dac`.
    pub phi_tol: Option<f64>,
    /// Temperature above which NO joins the search-initiating set, K.
    pub nox_threshold: f64,
    /// Characteristic magnitude per dimension of the state vector
    /// (N species, then T, then p); `None` means all ones.
    pub scale_factor: Option<Vec<f64>>,
    /// Mechanism-reduction scheme.
    pub reduction: ReductionMethod,
    /// Enable tabulation.
    pub tabulation: bool,
    pub isat: IsatSettings,
}

impl Default for TdacConfig {
    fn default() -> Self {
        Self {
            eps_dac: 1e-3,
            automatic_sis: true,
            search_init_set: Vec::new(),
            fuel_species: BTreeMap::new(),
            nb_c_large: 3,
            phi_tol: None,
            nox_threshold: 1800.0,
            scale_factor: None,
            reduction: ReductionMethod::Dac,
            tabulation: true,
            isat: IsatSettings::default(),
        }
    }
}

impl TdacConfig {
    /// Effective equivalence-ratio tolerance.
    pub fn phi_tol(&self) -> f64 {
        self.phi_tol.unwrap_or(self.eps_dac)
    }

    /// Per-dimension weights of the tabulation metric: the reciprocal of the
    /// characteristic magnitudes, length N + 2.
    pub fn weights(&self, n_species: usize) -> Vec<f64> {
        match &self.scale_factor {
            Some(scale) => scale.iter().map(|s| 1.0 / s).collect(),
            None => vec![1.0; n_species + 2],
        }
    }

    pub fn validate(&self, n_species: usize) -> Result<(), ChemError> {
        let config = |msg: String| Err(ChemError::Config(msg));
        if !(self.eps_dac > 0.0) {
            return config(format!("eps_dac must be positive, got {}", self.eps_dac));
        }
        if let Some(phi_tol) = self.phi_tol {
            if !(phi_tol > 0.0) {
                return config(format!("phi_tol must be positive, got {phi_tol}"));
            }
        }
        if !(self.nox_threshold > 0.0) {
            return config(format!(
                "nox_threshold must be positive, got {}",
                self.nox_threshold
            ));
        }
        if let Some(scale) = &self.scale_factor {
            if scale.len() != n_species + 2 {
                return config(format!(
                    "scale_factor length {} does not match state dimension {}",
                    scale.len(),
                    n_species + 2
                ));
            }
            if scale.iter().any(|s| !(*s > 0.0)) {
                return config("scale_factor entries must be positive".to_string());
            }
        }
        if self.tabulation {
            if !(self.isat.tolerance > 0.0) {
                return config(format!(
                    "tabulation tolerance must be positive, got {}",
                    self.isat.tolerance
                ));
            }
            if self.isat.max_elements == 0 {
                return config("max_elements must be at least 1".to_string());
            }
            if !(self.isat.balance_threshold > 0.0) {
                return config(format!(
                    "balance_threshold must be positive, got {}",
                    self.isat.balance_threshold
                ));
            }
        }
        if self.reduction == ReductionMethod::Dac
            && !self.automatic_sis
            && self.search_init_set.is_empty()
        {
            return config("search_init_set is empty and automatic_sis is off".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{IsatSettings, TdacConfig};

    fn assert_config_err(config: &TdacConfig, needle: &str) {
        let err = config.validate(4).expect_err("expected validation failure");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected \"{needle}\" in \"{message}\""
        );
    }

    #[test]
    fn defaults_validate() {
        TdacConfig::default().validate(4).expect("defaults are valid");
    }

    #[test]
    fn phi_tol_falls_back_to_eps_dac() {
        let mut config = TdacConfig::default();
        assert_eq!(config.phi_tol(), config.eps_dac);
        config.phi_tol = Some(0.5);
        assert_eq!(config.phi_tol(), 0.5);
    }

    #[test]
    fn scale_factor_length_is_checked() {
        let config = TdacConfig {
            scale_factor: Some(vec![1.0; 3]),
            ..TdacConfig::default()
        };
        assert_config_err(&config, "scale_factor length");
    }

    #[test]
    fn nonpositive_tunables_are_rejected() {
        assert_config_err(
            &TdacConfig {
                eps_dac: 0.0,
                ..TdacConfig::default()
            },
            "eps_dac",
        );
        assert_config_err(
            &TdacConfig {
                isat: IsatSettings {
                    tolerance: -1.0,
                    ..IsatSettings::default()
                },
                ..TdacConfig::default()
            },
            "tolerance",
        );
        assert_config_err(
            &TdacConfig {
                isat: IsatSettings {
                    max_elements: 0,
                    ..IsatSettings::default()
                },
                ..TdacConfig::default()
            },
            "max_elements",
        );
    }

    #[test]
    fn explicit_sis_requires_names() {
        let config = TdacConfig {
            automatic_sis: false,
            ..TdacConfig::default()
        };
        assert_config_err(&config, "search_init_set");
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = TdacConfig {
            eps_dac: 5e-3,
            search_init_set: vec!["CO".to_string()],
            ..TdacConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: TdacConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.eps_dac, 5e-3);
        assert_eq!(back.search_init_set, vec!["CO".to_string()]);
        assert_eq!(back.isat.max_elements, config.isat.max_elements);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: TdacConfig = serde_json::from_str(r#"{"eps_dac": 0.01}"#).unwrap();
        assert_eq!(config.eps_dac, 0.01);
        assert!(config.automatic_sis);
        assert_eq!(config.isat.max_2nd_search, 0);
    }
}
