//! The five pipeline stages and the job kinds each one submits.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use sl_optimizer::HYPER_SEARCH_DIR;
use sl_types::JobKind;
use std::fmt;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Hyperparameter search, run in-process inside one long job.
    Search,
    /// Longer training of the best candidates.
    Deep,
    /// Export of trained potentials to their deployable format.
    Convert,
    /// Inference benchmark per candidate.
    Inference,
    /// Material property simulations per candidate.
    Properties,
}

impl Stage {
    /// Chain order.
    pub const ALL: [Stage; 5] = [
        Stage::Search,
        Stage::Deep,
        Stage::Convert,
        Stage::Inference,
        Stage::Properties,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Search => "search",
            Stage::Deep => "deep",
            Stage::Convert => "convert",
            Stage::Inference => "inference",
            Stage::Properties => "properties",
        }
    }

    /// Configuration section holding the stage's command and resources.
    pub fn section(&self) -> &'static str {
        match self {
            Stage::Search => "hyper_search",
            Stage::Deep => "deep_training",
            Stage::Convert => "conversion",
            Stage::Inference => "inference",
            Stage::Properties => "properties",
        }
    }

    /// Directory below the sweep root holding the stage's candidates.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Stage::Search => HYPER_SEARCH_DIR,
            Stage::Deep => "deep_train",
            Stage::Convert => "convert",
            Stage::Inference => "inference",
            Stage::Properties => "properties",
        }
    }

    /// Kind of the stage's main job.
    pub fn job_kind(&self) -> JobKind {
        match self {
            Stage::Search => JobKind::Main,
            Stage::Deep => JobKind::Deep,
            Stage::Convert => JobKind::Conv,
            Stage::Inference => JobKind::Inf,
            Stage::Properties => JobKind::Sim,
        }
    }

    /// Kind of the job that prepares the stage's inputs, if the stage has one.
    pub fn watcher_kind(&self) -> Option<JobKind> {
        match self {
            Stage::Deep => Some(JobKind::WatchDeep),
            Stage::Inference => Some(JobKind::WatchInf),
            Stage::Properties => Some(JobKind::WatchSim),
            Stage::Search | Stage::Convert => None,
        }
    }

    /// Stages whose candidates this stage draws from, nearest first.
    pub fn sources(&self) -> &'static [Stage] {
        match self {
            Stage::Search => &[],
            Stage::Deep => &[Stage::Search],
            Stage::Convert => &[Stage::Deep, Stage::Search],
            Stage::Inference | Stage::Properties => &[Stage::Convert, Stage::Deep, Stage::Search],
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
