//! Versioned optimizer checkpoint.

use serde::{Deserialize, Serialize};
use sl_types::{ResumeError, SlResult};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::oracle::AskTellOracle;

pub const CHECKPOINT_FILE: &str = "optimizer_checkpoint.json";
pub const FORMAT_VERSION: u32 = 1;

/// Self-describing snapshot of the sweep's search state.
///
/// `dimensions` is stored next to the opaque oracle state so a changed
/// parameter space is caught before the oracle is rebuilt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub format_version: u32,
    pub dimensions: usize,
    /// Last iteration whose results were told to the oracle; 0 if none.
    pub told_through: u32,
    pub oracle: serde_json::Value,
}

impl Checkpoint {
    pub fn capture<O: AskTellOracle>(oracle: &O, told_through: u32) -> SlResult<Self> {
        Ok(Self {
            format_version: FORMAT_VERSION,
            dimensions: oracle.dimensions(),
            told_through,
            oracle: oracle.snapshot()?,
        })
    }

    pub fn path(sweep_path: &Path) -> PathBuf {
        sweep_path.join(CHECKPOINT_FILE)
    }

    pub fn to_bytes(&self) -> SlResult<Vec<u8>> {
        let mut bytes = serde_json::to_vec_pretty(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Write the checkpoint, replacing any previous one atomically.
    pub fn dump(&self, sweep_path: &Path) -> SlResult<PathBuf> {
        fs::create_dir_all(sweep_path)?;
        let target = Self::path(sweep_path);
        let staging = target.with_extension("json.tmp");
        fs::write(&staging, self.to_bytes()?)?;
        fs::rename(&staging, &target)?;
        info!(
            path = %target.display(),
            told_through = self.told_through,
            "checkpoint written"
        );
        Ok(target)
    }

    /// Load the checkpoint of a sweep, checking it against the configured
    /// parameter count.
    pub fn load(sweep_path: &Path, configured_dimensions: usize) -> SlResult<Self> {
        let path = Self::path(sweep_path);
        if !path.is_file() {
            return Err(ResumeError::MissingCheckpoint { path }.into());
        }
        let checkpoint: Self = serde_json::from_slice(&fs::read(&path)?)?;
        if checkpoint.format_version != FORMAT_VERSION {
            return Err(ResumeError::UnsupportedVersion {
                found: checkpoint.format_version,
                expected: FORMAT_VERSION,
            }
            .into());
        }
        if checkpoint.dimensions != configured_dimensions {
            return Err(ResumeError::DimensionMismatch {
                stored: checkpoint.dimensions,
                configured: configured_dimensions,
            }
            .into());
        }
        info!(
            path = %path.display(),
            told_through = checkpoint.told_through,
            "checkpoint loaded"
        );
        Ok(checkpoint)
    }

    pub fn restore<O: AskTellOracle>(&self) -> SlResult<O> {
        let oracle = O::restore(self.oracle.clone())?;
        if oracle.dimensions() != self.dimensions {
            return Err(ResumeError::DimensionMismatch {
                stored: oracle.dimensions(),
                configured: self.dimensions,
            }
            .into());
        }
        Ok(oracle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AcquisitionStrategy;
    use crate::oracle::SurrogateOracle;
    use crate::search::SearchSpace;
    use sl_types::SlError;
    use tempfile::tempdir;

    fn oracle() -> SurrogateOracle {
        let space = SearchSpace::new()
            .add_float("fit.loss.kappa", 0.0, 1.0)
            .add_log_uniform("fit.optimizer.lr", 1e-4, 1e-1);
        let mut oracle = SurrogateOracle::new(space, AcquisitionStrategy::ClMin, 42)
            .with_initial_points(2);
        let points = oracle.ask(3).unwrap();
        oracle.tell(&points, &[0.3, 0.1, 0.7]).unwrap();
        oracle
    }

    #[test]
    fn load_then_dump_is_byte_identical() {
        let sweep = tempdir().unwrap();
        let path = Checkpoint::capture(&oracle(), 1).unwrap().dump(sweep.path()).unwrap();
        let first = fs::read(&path).unwrap();

        let loaded = Checkpoint::load(sweep.path(), 2).unwrap();
        let restored: SurrogateOracle = loaded.restore().unwrap();
        Checkpoint::capture(&restored, loaded.told_through)
            .unwrap()
            .dump(sweep.path())
            .unwrap();
        assert_eq!(fs::read(&path).unwrap(), first);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn dimension_mismatch_is_fatal() {
        let sweep = tempdir().unwrap();
        Checkpoint::capture(&oracle(), 1).unwrap().dump(sweep.path()).unwrap();
        let err = Checkpoint::load(sweep.path(), 3).unwrap_err();
        assert!(matches!(
            err,
            SlError::Resume(ResumeError::DimensionMismatch { stored: 2, configured: 3 })
        ));
    }

    #[test]
    fn missing_or_foreign_checkpoints_are_rejected() {
        let sweep = tempdir().unwrap();
        assert!(matches!(
            Checkpoint::load(sweep.path(), 2),
            Err(SlError::Resume(ResumeError::MissingCheckpoint { .. }))
        ));

        let mut checkpoint = Checkpoint::capture(&oracle(), 1).unwrap();
        checkpoint.format_version = 99;
        checkpoint.dump(sweep.path()).unwrap();
        assert!(matches!(
            Checkpoint::load(sweep.path(), 2),
            Err(SlError::Resume(ResumeError::UnsupportedVersion { found: 99, .. }))
        ));
    }
}
