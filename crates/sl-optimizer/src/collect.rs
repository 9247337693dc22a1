//! Reading a fitted candidate's validation errors.

use serde::Deserialize;
use sl_types::{CollectionError, SlResult};
use std::fs;

use crate::tracker::{CandidateTracker, ValidLoss};

/// File the fitting job writes into its candidate directory.
pub const RESULT_FILE: &str = "valid_errors.yaml";

/// Source of validation losses for finished candidates.
pub trait LossCollector: Send + Sync {
    fn collect(&self, candidate: &CandidateTracker) -> SlResult<ValidLoss>;
}

#[derive(Debug, Deserialize)]
struct ErrorFile {
    energy: f64,
    force: f64,
}

/// Reads `valid_errors.yaml` (`energy`, `force`) from the candidate
/// directory.
#[derive(Debug, Clone, Default)]
pub struct ErrorFileCollector;

impl LossCollector for ErrorFileCollector {
    fn collect(&self, candidate: &CandidateTracker) -> SlResult<ValidLoss> {
        let path = candidate.dir().join(RESULT_FILE);
        if !path.is_file() {
            return Err(CollectionError::MissingResult { path }.into());
        }
        let raw = fs::read_to_string(&path)?;
        let errors: ErrorFile =
            serde_yaml::from_str(&raw).map_err(|e| CollectionError::Malformed {
                path: path.clone(),
                message: e.to_string(),
            })?;
        if !errors.energy.is_finite() || !errors.force.is_finite() {
            return Err(CollectionError::Malformed {
                path,
                message: format!("non-finite errors {} / {}", errors.energy, errors.force),
            }
            .into());
        }
        Ok(ValidLoss::new(errors.energy, errors.force))
    }
}
