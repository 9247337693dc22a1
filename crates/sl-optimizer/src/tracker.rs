//! Per-candidate metadata persisted next to each candidate's artifacts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sl_types::{validation_error, CollectionError, JobId, ResumeError, SlResult};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::search::{ParameterValue, SearchSpace};

/// Metadata file name inside every candidate directory.
pub const METADATA_FILE: &str = "candidate.yaml";
/// Materialized model configuration consumed by the fitting tool.
pub const MODEL_CONFIG_FILE: &str = "model_config.yaml";
/// Directory below the sweep root holding every search iteration.
pub const HYPER_SEARCH_DIR: &str = "hyper_search";

/// Validation errors of a fitted candidate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidLoss {
    pub energy: f64,
    pub force: f64,
}

impl ValidLoss {
    pub fn new(energy: f64, force: f64) -> Self {
        Self { energy, force }
    }

    /// Scalar loss, weighting energy by `energy_weight` and force by the rest.
    pub fn total(&self, energy_weight: f64) -> f64 {
        energy_weight * self.energy + (1.0 - energy_weight) * self.force
    }
}

/// One evaluated parameter set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateTracker {
    pub iteration: u32,
    pub sub_iteration: u32,
    pub parameters: BTreeMap<String, ParameterValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    valid_energy_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    valid_force_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    dir: PathBuf,
}

/// `<sweep>/hyper_search/<iteration>`
pub fn iteration_dir(sweep_path: &Path, iteration: u32) -> PathBuf {
    sweep_path.join(HYPER_SEARCH_DIR).join(iteration.to_string())
}

/// `<sweep>/hyper_search/<iteration>/<sub_iteration>`
pub fn candidate_dir(sweep_path: &Path, iteration: u32, sub_iteration: u32) -> PathBuf {
    iteration_dir(sweep_path, iteration).join(sub_iteration.to_string())
}

impl CandidateTracker {
    pub fn new(
        iteration: u32,
        sub_iteration: u32,
        parameters: BTreeMap<String, ParameterValue>,
        dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            iteration,
            sub_iteration,
            parameters,
            valid_energy_loss: None,
            valid_force_loss: None,
            job_id: None,
            created_at: Utc::now(),
            dir: dir.into(),
        }
    }

    /// Directory holding this candidate's artifacts.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    pub fn valid_loss(&self) -> Option<ValidLoss> {
        match (self.valid_energy_loss, self.valid_force_loss) {
            (Some(energy), Some(force)) => Some(ValidLoss::new(energy, force)),
            _ => None,
        }
    }

    pub fn is_scored(&self) -> bool {
        self.valid_loss().is_some()
    }

    /// Record the validation loss. A candidate is scored at most once.
    pub fn set_valid_loss(&mut self, loss: ValidLoss) -> SlResult<()> {
        if self.is_scored() {
            return Err(CollectionError::AlreadyScored {
                iteration: self.iteration,
                sub_iteration: self.sub_iteration,
            }
            .into());
        }
        self.valid_energy_loss = Some(loss.energy);
        self.valid_force_loss = Some(loss.force);
        Ok(())
    }

    pub fn save(&self) -> SlResult<()> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.metadata_path(), serde_yaml::to_string(self)?)?;
        Ok(())
    }

    /// Load the tracker stored in `dir`.
    pub fn load(dir: impl Into<PathBuf>) -> SlResult<Self> {
        let dir = dir.into();
        let path = dir.join(METADATA_FILE);
        if !path.is_file() {
            return Err(ResumeError::MissingMetadata { path }.into());
        }
        let mut tracker: Self = serde_yaml::from_str(&fs::read_to_string(&path)?)?;
        tracker.dir = dir;
        Ok(tracker)
    }

    /// Every tracker of `iteration`, ordered by sub-iteration. A missing
    /// iteration directory yields an empty list; a candidate directory
    /// without metadata is an error.
    pub fn scan(sweep_path: &Path, iteration: u32) -> SlResult<Vec<Self>> {
        let dir = iteration_dir(sweep_path, iteration);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut trackers = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let tracker = Self::load(entry.path())?;
            if tracker.iteration != iteration {
                return Err(validation_error!(
                    "{} belongs to iteration {}, found under iteration {iteration}",
                    tracker.metadata_path().display(),
                    tracker.iteration
                ));
            }
            trackers.push(tracker);
        }
        trackers.sort_by_key(|t| t.sub_iteration);
        debug!(iteration, count = trackers.len(), "scanned candidates");
        Ok(trackers)
    }
}

/// Write `point` into a copy of `base` at each parameter's dotted path.
pub fn overlay_parameters(
    base: &serde_yaml::Value,
    space: &SearchSpace,
    point: &[ParameterValue],
) -> SlResult<serde_yaml::Value> {
    let mut config = base.clone();
    for (name, value) in space.names().zip(point) {
        let mut node = &mut config;
        let mut keys = name.split('.').peekable();
        while let Some(key) = keys.next() {
            let mapping = node
                .as_mapping_mut()
                .ok_or_else(|| validation_error!("{name}: {key} is not inside a mapping"))?;
            let key = serde_yaml::Value::String(key.to_string());
            if keys.peek().is_none() {
                mapping.insert(key, serde_yaml::to_value(value)?);
                break;
            }
            node = mapping
                .entry(key)
                .or_insert_with(|| serde_yaml::Value::Mapping(Default::default()));
        }
    }
    Ok(config)
}
