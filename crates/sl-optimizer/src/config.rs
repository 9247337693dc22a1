//! Hyperparameter search configuration.

use serde::{Deserialize, Serialize};
use sl_types::{config_error, JobConfig, SlResult};
use std::fmt;

use crate::search::SearchSpace;

/// Placeholder loss for candidates whose result could not be collected.
///
/// Taken from the single-precision maximum so the value stays finite when
/// the ledger is read back at either width.
pub const SENTINEL_MAX_LOSS: f64 = f32::MAX as f64;

/// Constant-liar batch strategy: the loss assumed for points asked earlier
/// in the same batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AcquisitionStrategy {
    #[default]
    #[serde(rename = "cl_min")]
    ClMin,
    #[serde(rename = "cl_mean")]
    ClMean,
    #[serde(rename = "cl_max")]
    ClMax,
}

impl AcquisitionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClMin => "cl_min",
            Self::ClMean => "cl_mean",
            Self::ClMax => "cl_max",
        }
    }
}

impl fmt::Display for AcquisitionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do when a candidate's result cannot be collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionPolicy {
    /// Checkpoint and abort the sweep.
    #[default]
    Strict,
    /// Score the candidate with the sentinel loss and continue.
    Tolerant,
}

/// Settings of the `hyper_search` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub max_iterations: u32,
    /// Asks answered by pure random sampling before the surrogate kicks in.
    pub n_initial_points: usize,
    /// Candidates per iteration; each iteration is one array job.
    pub n_points: usize,
    pub strategy: AcquisitionStrategy,
    /// Weight of the energy error in the scalar loss; force gets the rest.
    pub energy_weight: f64,
    pub seed: u64,
    pub collection: CollectionPolicy,
    pub sentinel_loss: f64,
    pub space: SearchSpace,
    /// Model configuration that each candidate's parameters are written into.
    pub base_config: serde_yaml::Value,
    /// Fitting command, run inside the candidate directory.
    pub fit_command: String,
    pub job: JobConfig,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            n_initial_points: 5,
            n_points: 4,
            strategy: AcquisitionStrategy::ClMin,
            energy_weight: 0.5,
            seed: 42,
            collection: CollectionPolicy::Strict,
            sentinel_loss: SENTINEL_MAX_LOSS,
            space: SearchSpace::new(),
            base_config: serde_yaml::Value::Mapping(Default::default()),
            fit_command: String::new(),
            job: JobConfig::default(),
        }
    }
}

impl SearchConfig {
    pub fn new(space: SearchSpace, fit_command: impl Into<String>) -> Self {
        Self {
            space,
            fit_command: fit_command.into(),
            ..Self::default()
        }
    }

    pub fn with_iterations(mut self, max_iterations: u32, n_points: usize) -> Self {
        self.max_iterations = max_iterations;
        self.n_points = n_points;
        self
    }

    pub fn with_collection(mut self, policy: CollectionPolicy) -> Self {
        self.collection = policy;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_base_config(mut self, base: serde_yaml::Value) -> Self {
        self.base_config = base;
        self
    }

    pub fn with_energy_weight(mut self, weight: f64) -> Self {
        self.energy_weight = weight;
        self
    }

    pub fn validate(&self) -> SlResult<()> {
        if self.max_iterations == 0 {
            return Err(config_error!("hyper_search.max_iterations", "must be at least 1"));
        }
        if self.n_points == 0 {
            return Err(config_error!("hyper_search.n_points", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.energy_weight) {
            return Err(config_error!(
                "hyper_search.energy_weight",
                "{} is outside [0, 1]",
                self.energy_weight
            ));
        }
        if !self.sentinel_loss.is_finite() {
            return Err(config_error!("hyper_search.sentinel_loss", "must be finite"));
        }
        if self.fit_command.trim().is_empty() {
            return Err(config_error!("hyper_search.fit_command", "cannot be empty"));
        }
        if !self.base_config.is_mapping() {
            return Err(config_error!("hyper_search.base_config", "must be a mapping"));
        }
        self.space.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_is_finite_in_both_widths() {
        assert!(SENTINEL_MAX_LOSS.is_finite());
        assert_eq!(SENTINEL_MAX_LOSS as f32, f32::MAX);
    }

    #[test]
    fn section_deserializes_with_defaults() {
        let yaml = r#"
max_iterations: 3
n_points: 2
strategy: cl_mean
collection: tolerant
fit_command: pacemaker model_config.yaml
space:
  parameters:
    - name: fit.loss.kappa
      type: float_range
      low: 0.1
      high: 0.9
base_config:
  fit:
    loss:
      kappa: 0.3
"#;
        let config: SearchConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.strategy, AcquisitionStrategy::ClMean);
        assert_eq!(config.collection, CollectionPolicy::Tolerant);
        assert_eq!(config.seed, 42);
        assert_eq!(config.sentinel_loss, SENTINEL_MAX_LOSS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn strategy_names_match_their_yaml_form() {
        for strategy in [
            AcquisitionStrategy::ClMin,
            AcquisitionStrategy::ClMean,
            AcquisitionStrategy::ClMax,
        ] {
            let yaml = serde_yaml::to_string(&strategy).unwrap();
            assert_eq!(yaml.trim(), strategy.to_string());
        }
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let space = SearchSpace::new().add_float("x", 0.0, 1.0);
        let ok = SearchConfig::new(space, "fit");
        assert!(ok.validate().is_ok());
        assert!(ok.clone().with_iterations(0, 2).validate().is_err());
        assert!(ok.clone().with_iterations(2, 0).validate().is_err());
        assert!(ok.clone().with_energy_weight(1.5).validate().is_err());
        assert!(SearchConfig::default().validate().is_err());
    }
}
