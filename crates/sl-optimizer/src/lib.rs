//! # sl-optimizer
//!
//! Checkpointed ask/tell hyperparameter search for sweepline.
//!
//! Provides the parameter search space, the [`AskTellOracle`] seam with its
//! default [`SurrogateOracle`], per-candidate metadata, the CSV result
//! ledger, the versioned optimizer checkpoint and the [`SweepLoop`] that ties
//! them to a [`sl_dispatch::Dispatcher`].

mod checkpoint;
mod collect;
mod config;
mod ledger;
mod oracle;
mod search;
mod sweep;
mod tracker;

pub use checkpoint::{Checkpoint, CHECKPOINT_FILE, FORMAT_VERSION};
pub use collect::{ErrorFileCollector, LossCollector, RESULT_FILE};
pub use config::{AcquisitionStrategy, CollectionPolicy, SearchConfig, SENTINEL_MAX_LOSS};
pub use ledger::{ResultLedger, ERRORS_FILE, PARAMETERS_FILE};
pub use oracle::{AskTellOracle, SurrogateOracle};
pub use search::{ParameterDef, ParameterKind, ParameterValue, Point, SearchSpace};
pub use sweep::{BestCandidate, SweepLoop, SweepSummary};
pub use tracker::{
    candidate_dir, iteration_dir, overlay_parameters, CandidateTracker, ValidLoss,
    HYPER_SEARCH_DIR, METADATA_FILE, MODEL_CONFIG_FILE,
};
