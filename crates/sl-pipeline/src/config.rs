//! Pipeline configuration: one YAML file with environment overrides.

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use sl_optimizer::SearchConfig;
use sl_types::{ConfigError, GeneralConfig, SlResult, StageConfig};
use std::fs;
use std::path::Path;
use tracing::info;

use crate::stage::Stage;

/// Prefix of environment overrides; `__` separates nested keys, e.g.
/// `SWEEPLINE_HYPER_SEARCH__MAX_ITERATIONS=20`.
pub const ENV_PREFIX: &str = "SWEEPLINE_";

/// Sections as they appear in the file; any of them may be absent.
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    general: Option<GeneralConfig>,
    hyper_search: Option<SearchConfig>,
    deep_training: Option<StageConfig>,
    conversion: Option<StageConfig>,
    inference: Option<StageConfig>,
    properties: Option<StageConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub general: GeneralConfig,
    pub hyper_search: SearchConfig,
    pub deep_training: Option<StageConfig>,
    pub conversion: Option<StageConfig>,
    pub inference: Option<StageConfig>,
    pub properties: Option<StageConfig>,
}

impl PipelineConfig {
    pub fn new(general: GeneralConfig, hyper_search: SearchConfig) -> Self {
        Self {
            general,
            hyper_search,
            deep_training: None,
            conversion: None,
            inference: None,
            properties: None,
        }
    }

    pub fn with_stage(mut self, stage: Stage, config: StageConfig) -> Self {
        match stage {
            Stage::Deep => self.deep_training = Some(config),
            Stage::Convert => self.conversion = Some(config),
            Stage::Inference => self.inference = Some(config),
            Stage::Properties => self.properties = Some(config),
            Stage::Search => {}
        }
        self
    }

    /// Providers for `path`, lowest precedence first.
    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load and validate the configuration at `path`.
    ///
    /// A relative `sweep_path` or `pretrained_path` is taken relative to the
    /// file, so watcher jobs started elsewhere resolve the same paths.
    pub fn load(path: &Path) -> SlResult<Self> {
        if !path.is_file() {
            return Err(ConfigError::Load {
                message: format!("{} does not exist", path.display()),
            }
            .into());
        }
        let path = fs::canonicalize(path)?;
        let mut config = Self::extract(Self::figment(&path))?;
        let base = path.parent().unwrap_or_else(|| Path::new("/"));
        if config.general.sweep_path.is_relative() {
            config.general.sweep_path = base.join(&config.general.sweep_path);
        }
        if let Some(pretrained) = &mut config.general.pretrained_path {
            if pretrained.is_relative() {
                *pretrained = base.join(&*pretrained);
            }
        }
        config.validate()?;
        info!(
            path = %path.display(),
            sweep = %config.general.sweep_path.display(),
            "configuration loaded"
        );
        Ok(config)
    }

    pub fn extract(figment: Figment) -> SlResult<Self> {
        let raw: RawConfig = figment.extract().map_err(|e| ConfigError::Load {
            message: e.to_string(),
        })?;
        Ok(Self {
            general: raw.general.ok_or_else(|| missing("general"))?,
            hyper_search: raw.hyper_search.ok_or_else(|| missing("hyper_search"))?,
            deep_training: raw.deep_training,
            conversion: raw.conversion,
            inference: raw.inference,
            properties: raw.properties,
        })
    }

    pub fn validate(&self) -> SlResult<()> {
        self.general.validate()?;
        self.hyper_search.validate()?;
        for stage in &Stage::ALL[1..] {
            if let Some(section) = self.stage(*stage) {
                section.validate(stage.section())?;
            }
        }
        Ok(())
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageConfig> {
        match stage {
            Stage::Search => None,
            Stage::Deep => self.deep_training.as_ref(),
            Stage::Convert => self.conversion.as_ref(),
            Stage::Inference => self.inference.as_ref(),
            Stage::Properties => self.properties.as_ref(),
        }
    }

    /// Section of a post-search stage the chain is about to run.
    pub fn require_stage(&self, stage: Stage) -> SlResult<&StageConfig> {
        self.stage(stage)
            .ok_or_else(|| missing(stage.section()).into())
    }

    pub fn sweep_path(&self) -> &Path {
        &self.general.sweep_path
    }
}

fn missing(section: &str) -> ConfigError {
    ConfigError::MissingSection {
        section: section.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sl_optimizer::CollectionPolicy;
    use sl_types::{Cluster, ModelKind, SlError};
    use std::path::PathBuf;
    use tempfile::tempdir;

    const CONFIG: &str = r#"
general:
  sweep_path: runs/ti
  model: mace
  cluster: habrok
  best_n_models: 3
hyper_search:
  max_iterations: 4
  n_points: 8
  collection: tolerant
  fit_command: mace_run_train --config model_config.yaml
  space:
    parameters:
      - name: fit.loss.kappa
        type: float_range
        low: 0.1
        high: 0.9
      - name: model.num_channels
        type: choice
        values: [64, 128]
  base_config:
    fit:
      maxiter: 100
deep_training:
  command: mace_run_train --config model_config.yaml --max_num_epochs 500
  job:
    resources:
      time: "48:00:00"
"#;

    fn write(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join("sweepline.yaml");
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn loads_sections_and_resolves_sweep_path() {
        let dir = tempdir().unwrap();
        let config = PipelineConfig::load(&write(dir.path(), CONFIG)).unwrap();

        assert_eq!(config.general.model, ModelKind::Mace);
        assert_eq!(config.general.cluster, Cluster::Habrok);
        assert_eq!(config.general.best_n_models, 3);
        assert_eq!(config.general.sweep_path, dir.path().join("runs/ti"));

        assert_eq!(config.hyper_search.max_iterations, 4);
        assert_eq!(config.hyper_search.n_points, 8);
        assert_eq!(config.hyper_search.collection, CollectionPolicy::Tolerant);
        assert_eq!(config.hyper_search.space.dimensions(), 2);

        let deep = config.require_stage(Stage::Deep).unwrap();
        assert_eq!(deep.job.resources["time"], "48:00:00");
        assert!(config.stage(Stage::Inference).is_none());
    }

    #[test]
    fn pretrained_path_resolves_like_the_sweep() {
        let dir = tempdir().unwrap();
        let with_model = CONFIG.replace(
            "  best_n_models: 3\n",
            "  best_n_models: 3\n  pretrained_path: models/mace_mp\n",
        );
        let config = PipelineConfig::load(&write(dir.path(), &with_model)).unwrap();
        assert_eq!(
            config.general.pretrained_path,
            Some(dir.path().join("models/mace_mp"))
        );
        assert_eq!(config.general.cohort_size(), 1);
    }

    #[test]
    fn missing_sections_are_reported_by_name() {
        let dir = tempdir().unwrap();
        let path = write(dir.path(), "general:\n  best_n_models: 2\n");
        let err = PipelineConfig::load(&path).unwrap_err();
        match err {
            SlError::Config(ConfigError::MissingSection { section }) => {
                assert_eq!(section, "hyper_search")
            }
            other => panic!("unexpected error: {other}"),
        }

        let config = PipelineConfig::load(&write(dir.path(), CONFIG)).unwrap();
        let err = config.require_stage(Stage::Properties).unwrap_err();
        assert!(err.to_string().contains("properties"));
    }

    #[test]
    fn later_providers_override_the_file() {
        let dir = tempdir().unwrap();
        let path = write(dir.path(), CONFIG);
        let figment = PipelineConfig::figment(&path)
            .merge(("hyper_search.max_iterations", 9))
            .merge(("general.email", "ops@example.org"));
        let config = PipelineConfig::extract(figment).unwrap();
        assert_eq!(config.hyper_search.max_iterations, 9);
        assert_eq!(config.general.email.as_deref(), Some("ops@example.org"));
        assert_eq!(config.hyper_search.n_points, 8);
    }

    #[test]
    fn invalid_values_fail_before_anything_runs() {
        let dir = tempdir().unwrap();
        let broken = CONFIG.replace("n_points: 8", "n_points: 0");
        assert!(PipelineConfig::load(&write(dir.path(), &broken)).is_err());

        let broken = CONFIG.replace("model: mace", "model: nequip");
        let err = PipelineConfig::load(&write(dir.path(), &broken)).unwrap_err();
        assert!(matches!(err, SlError::Config(ConfigError::Load { .. })));

        let err = PipelineConfig::load(&dir.path().join("absent.yaml")).unwrap_err();
        assert!(err.to_string().contains("absent.yaml"));
    }
}
