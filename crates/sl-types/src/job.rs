//! Units of scheduled work and the handles returned for them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::errors::{ConfigError, SlError, SlResult};

/// Scheduler-assigned job identifier.
pub type JobId = u64;

/// Inclusive range of array task indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArrayRange {
    pub start: u32,
    pub end: u32,
}

impl ArrayRange {
    pub fn new(start: u32, end: u32) -> SlResult<Self> {
        if start > end {
            return Err(SlError::Validation(format!(
                "array range start {start} is after end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// Task indices `1..=count`, the shape every per-candidate array uses.
    pub fn one_based(count: usize) -> SlResult<Self> {
        if count == 0 {
            return Err(SlError::Validation(
                "an array job needs at least one task".to_string(),
            ));
        }
        Self::new(1, count as u32)
    }

    pub fn len(&self) -> usize {
        (self.end - self.start + 1) as usize
    }

    pub fn contains(&self, index: u32) -> bool {
        index >= self.start && index <= self.end
    }

    pub fn indices(&self) -> impl Iterator<Item = u32> {
        self.start..=self.end
    }
}

impl fmt::Display for ArrayRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

macro_rules! named_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ConfigError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(ConfigError::UnknownName {
                        kind: $kind.to_string(),
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

named_enum!(
    /// Kind of scheduled work. Array kinds fan out one task per candidate;
    /// the `Watch*` kinds do local bookkeeping once their dependency is done.
    JobKind, "job type" {
        Fit => "fit",
        WatchFit => "w_fit",
        Deep => "deep",
        WatchDeep => "w_deep",
        Conv => "conv",
        Inf => "inf",
        WatchInf => "w_inf",
        Sim => "sim",
        WatchSim => "w_sim",
        Main => "main",
    }
);

impl JobKind {
    pub fn is_array(&self) -> bool {
        matches!(self, JobKind::Fit | JobKind::Deep | JobKind::Inf | JobKind::Sim)
    }
}

named_enum!(
    /// Batch clusters with known presets.
    Cluster, "cluster" {
        Snellius => "snellius",
        Habrok => "habrok",
    }
);

named_enum!(
    /// Fitting tool family; selects environment setup and resources.
    ModelKind, "model" {
        Pacemaker => "pacemaker",
        Mace => "mace",
        Grace => "grace",
    }
);

/// One unit of scheduled work.
///
/// A `Job` is consumed by value when submitted, so it can't be changed or
/// submitted twice afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub kind: JobKind,
    /// Commands in execution order. Setup commands come first.
    pub commands: Vec<String>,
    pub working_dir: PathBuf,
    /// Scheduler options, e.g. `time`, `mem`, `partition`.
    pub resources: BTreeMap<String, String>,
    pub array_range: Option<ArrayRange>,
    pub dependency: Option<JobId>,
    pub hold: bool,
}

impl Job {
    pub fn new(kind: JobKind, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            commands: Vec::new(),
            working_dir: working_dir.into(),
            resources: BTreeMap::new(),
            array_range: None,
            dependency: None,
            hold: false,
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.commands.push(command.into());
        self
    }

    pub fn with_commands<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.commands.extend(commands.into_iter().map(Into::into));
        self
    }

    pub fn with_resources(mut self, resources: BTreeMap<String, String>) -> Self {
        self.resources.extend(resources);
        self
    }

    pub fn with_array(mut self, range: ArrayRange) -> Self {
        self.array_range = Some(range);
        self
    }

    pub fn with_dependency(mut self, dependency: Option<JobId>) -> Self {
        self.dependency = dependency;
        self
    }

    pub fn held(mut self) -> Self {
        self.hold = true;
        self
    }

    /// Base name for the stdout/stderr files written next to the job.
    pub fn log_stem(&self) -> &'static str {
        self.kind.as_str()
    }
}

/// Handle returned by a dispatcher for a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: JobId,
    pub array_range: Option<ArrayRange>,
}

impl JobHandle {
    /// Id reported for work that ran in-process with no scheduler identity.
    pub const LOCAL_ID: JobId = 0;

    pub fn new(id: JobId, array_range: Option<ArrayRange>) -> Self {
        Self { id, array_range }
    }

    pub fn local() -> Self {
        Self::new(Self::LOCAL_ID, None)
    }

    pub fn is_local(&self) -> bool {
        self.id == Self::LOCAL_ID
    }

    /// Id usable as the next stage's dependency. Local handles have none.
    pub fn as_dependency(&self) -> Option<JobId> {
        (!self.is_local()).then_some(self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_range_bounds() {
        let range = ArrayRange::one_based(3).unwrap();
        assert_eq!(range.to_string(), "1-3");
        assert_eq!(range.len(), 3);
        assert!(range.contains(1) && range.contains(3) && !range.contains(4));
        assert_eq!(range.indices().collect::<Vec<_>>(), vec![1, 2, 3]);

        assert!(ArrayRange::one_based(0).is_err());
        assert!(ArrayRange::new(5, 2).is_err());
    }

    #[test]
    fn job_kind_names_round_trip() {
        for kind in JobKind::ALL {
            assert_eq!(kind.as_str().parse::<JobKind>().unwrap(), *kind);
        }
        assert!(JobKind::Fit.is_array());
        assert!(!JobKind::WatchFit.is_array());
        assert!(!JobKind::Main.is_array());
    }

    #[test]
    fn unknown_names_are_rejected() {
        let err = "lumi".parse::<Cluster>().unwrap_err();
        assert!(err.to_string().contains("lumi"));
        assert!("nequip".parse::<ModelKind>().is_err());
    }

    #[test]
    fn job_builder_keeps_command_order() {
        let job = Job::new(JobKind::Deep, "/tmp/sweep")
            .with_commands(["source env.sh", "module load cuda"])
            .with_command("pacemaker input.yaml")
            .with_dependency(Some(42))
            .held();

        assert_eq!(job.commands.last().unwrap(), "pacemaker input.yaml");
        assert_eq!(job.commands.len(), 3);
        assert_eq!(job.dependency, Some(42));
        assert!(job.hold);
        assert_eq!(job.log_stem(), "deep");
    }

    #[test]
    fn local_handle_has_no_dependency() {
        assert_eq!(JobHandle::local().as_dependency(), None);
        assert_eq!(JobHandle::new(17, None).as_dependency(), Some(17));
    }

    #[test]
    fn serde_uses_wire_names() {
        let json = serde_json::to_string(&JobKind::WatchSim).unwrap();
        assert_eq!(json, "\"w_sim\"");
        let model: ModelKind = serde_json::from_str("\"mace\"").unwrap();
        assert_eq!(model, ModelKind::Mace);
    }
}
