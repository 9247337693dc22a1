//! # sl-pipeline
//!
//! The five-stage potential pipeline on top of the sweep loop: hyperparameter
//! search, deep training, conversion, inference benchmarks and property
//! simulations. Stages are submitted as a chain of dependent scheduler jobs;
//! watcher jobs carry the best candidates from one stage to the next.

pub mod chain;
pub mod cli;
pub mod config;
pub mod prepare;
pub mod stage;

pub use chain::{ChainSummary, Invocation, StageChain};
pub use config::{PipelineConfig, ENV_PREFIX};
pub use prepare::{
    prepare, rank, stage_candidates, PreparedCandidate, RankedCandidate, PRETRAINED_ITERATION,
};
pub use stage::Stage;
