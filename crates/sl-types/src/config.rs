//! Configuration sections shared by every pipeline stage.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::SlResult;
use crate::job::{Cluster, ModelKind};

/// Settings common to the whole pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Root of the sweep; every stage writes below it.
    pub sweep_path: PathBuf,
    pub model: ModelKind,
    pub cluster: Cluster,
    /// How many of the best candidates are carried past the search.
    pub best_n_models: usize,
    /// Path of the `sweepline` executable that watcher jobs invoke.
    pub executable: PathBuf,
    /// Notification address for property simulations.
    pub email: Option<String>,
    pub poll_interval_secs: u64,
    /// Submit the first stage held and release it once the chain is queued.
    pub hold_until_chained: bool,
    /// Directory of an already trained model. When set, it replaces the
    /// searched and deep-trained candidates as the only model carried into
    /// conversion, inference and property simulations.
    pub pretrained_path: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            sweep_path: PathBuf::from("sweep"),
            model: ModelKind::Pacemaker,
            cluster: Cluster::Snellius,
            best_n_models: 1,
            executable: PathBuf::from("sweepline"),
            email: None,
            poll_interval_secs: 10,
            hold_until_chained: false,
            pretrained_path: None,
        }
    }
}

impl GeneralConfig {
    pub fn with_sweep_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.sweep_path = path.into();
        self
    }

    pub fn with_model(mut self, model: ModelKind) -> Self {
        self.model = model;
        self
    }

    pub fn with_cluster(mut self, cluster: Cluster) -> Self {
        self.cluster = cluster;
        self
    }

    pub fn with_best_n(mut self, n: usize) -> Self {
        self.best_n_models = n;
        self
    }

    pub fn with_pretrained(mut self, path: impl Into<PathBuf>) -> Self {
        self.pretrained_path = Some(path.into());
        self
    }

    /// Number of models each post-search stage runs on.
    pub fn cohort_size(&self) -> usize {
        if self.pretrained_path.is_some() {
            1
        } else {
            self.best_n_models
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn validate(&self) -> SlResult<()> {
        if self.best_n_models == 0 {
            return Err(crate::config_error!("best_n_models", "must be at least 1"));
        }
        if self.poll_interval_secs == 0 {
            return Err(crate::config_error!("poll_interval_secs", "must be at least 1"));
        }
        if self.sweep_path.as_os_str().is_empty() {
            return Err(crate::config_error!("sweep_path", "cannot be empty"));
        }
        if self
            .pretrained_path
            .as_ref()
            .is_some_and(|path| path.as_os_str().is_empty())
        {
            return Err(crate::config_error!("pretrained_path", "cannot be empty"));
        }
        Ok(())
    }
}

/// User-side scheduler settings for one kind of job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Overrides applied on top of the cluster preset.
    pub resources: BTreeMap<String, String>,
    /// Extra commands run after the preset setup and before the job itself.
    pub setup: Vec<String>,
}

impl JobConfig {
    pub fn with_resource(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.resources.insert(key.into(), value.into());
        self
    }

    pub fn with_setup(mut self, command: impl Into<String>) -> Self {
        self.setup.push(command.into());
        self
    }
}

/// A post-search stage: one command run for every carried candidate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Command run inside each candidate's stage directory.
    pub command: String,
    pub job: JobConfig,
    /// Resources for the watcher job; falls back to the stage's job settings.
    pub watcher: Option<JobConfig>,
}

impl StageConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn with_job(mut self, job: JobConfig) -> Self {
        self.job = job;
        self
    }

    pub fn watcher_job(&self) -> &JobConfig {
        self.watcher.as_ref().unwrap_or(&self.job)
    }

    pub fn validate(&self, section: &str) -> SlResult<()> {
        if self.command.trim().is_empty() {
            return Err(crate::config_error!(
                format!("{section}.command"),
                "cannot be empty"
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn general_defaults_are_valid() {
        let config = GeneralConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.poll_interval(), Duration::from_secs(10));
    }

    #[test]
    fn general_rejects_zero_best_n() {
        let config = GeneralConfig::default().with_best_n(0);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("best_n_models"));
    }

    #[test]
    fn stage_watcher_falls_back_to_job() {
        let stage = StageConfig::new("bash run.sh")
            .with_job(JobConfig::default().with_resource("time", "3:00:00"));
        assert_eq!(stage.watcher_job().resources["time"], "3:00:00");
        assert!(stage.validate("inference").is_ok());
        assert!(StageConfig::default().validate("inference").is_err());
    }

    #[test]
    fn sections_deserialize_with_defaults() {
        let yaml = "sweep_path: /scratch/sweep\nmodel: grace\ncluster: habrok\n";
        let config: GeneralConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.model, ModelKind::Grace);
        assert_eq!(config.cluster, Cluster::Habrok);
        assert_eq!(config.best_n_models, 1);
        assert_eq!(config.pretrained_path, None);
    }

    #[test]
    fn pretrained_model_is_a_cohort_of_one() {
        let config = GeneralConfig::default().with_best_n(4);
        assert_eq!(config.cohort_size(), 4);
        let config = config.with_pretrained("/models/mace_mp");
        assert_eq!(config.cohort_size(), 1);
        assert!(config.validate().is_ok());
        assert!(GeneralConfig::default()
            .with_pretrained("")
            .validate()
            .is_err());
    }
}
