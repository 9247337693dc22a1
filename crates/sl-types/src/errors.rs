use std::path::PathBuf;

use thiserror::Error;

use crate::job::JobId;

/// Main error type for sweepline
#[derive(Error, Debug)]
pub enum SlError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Collection error: {0}")]
    Collection(#[from] CollectionError),

    #[error("Resume error: {0}")]
    Resume(#[from] ResumeError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl SlError {
    /// Collection failures are the only errors a tolerant sweep may absorb.
    pub fn is_collection(&self) -> bool {
        matches!(self, SlError::Collection(_))
    }
}

/// Configuration errors, always raised before any job is submitted
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No {section} section found in the configuration")]
    MissingSection { section: String },

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Combination not supported: cluster {cluster}, job {job}, model {model}")]
    Unsupported {
        cluster: String,
        job: String,
        model: String,
    },

    #[error("Unknown {kind}: {value}")]
    UnknownName { kind: String, value: String },

    #[error("Configuration could not be loaded: {message}")]
    Load { message: String },
}

/// Errors raised while submitting to, or waiting on, a dispatcher
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Scheduler rejected the job: {message}")]
    SubmissionRejected { message: String },

    #[error("Unexpected submission output: {output:?}")]
    InvalidSubmitOutput { output: String },

    #[error("Queue query failed: {message}")]
    QueueQuery { message: String },

    #[error("No job has been submitted yet")]
    NothingSubmitted,

    #[error("Command {command:?} exited with status {code:?}")]
    Subprocess { command: String, code: Option<i32> },

    #[error("Failed to spawn {program}: {message}")]
    Spawn { program: String, message: String },

    #[error("Failed to release job {job_id}: {message}")]
    Release { job_id: JobId, message: String },

    #[error("Job has no commands to run")]
    EmptyJob,
}

/// Errors raised while collecting a candidate's result
#[derive(Error, Debug)]
pub enum CollectionError {
    #[error("Result file missing: {path}")]
    MissingResult { path: PathBuf },

    #[error("Malformed result in {path}: {message}")]
    Malformed { path: PathBuf, message: String },

    #[error("Candidate {iteration}.{sub_iteration} already has a validation loss")]
    AlreadyScored { iteration: u32, sub_iteration: u32 },
}

/// Errors that make a resumed sweep inconsistent with its on-disk state
#[derive(Error, Debug)]
pub enum ResumeError {
    #[error("Checkpoint has {stored} dimensions but {configured} parameters are configured")]
    DimensionMismatch { stored: usize, configured: usize },

    #[error("Candidate metadata missing: {path}")]
    MissingMetadata { path: PathBuf },

    #[error("Checkpoint not found: {path}")]
    MissingCheckpoint { path: PathBuf },

    #[error("Checkpoint format version {found} is not supported (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("Iteration {iteration} has {found} candidates on disk, expected {expected}")]
    CandidateCount {
        iteration: u32,
        found: usize,
        expected: usize,
    },
}

/// Result ledger errors
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Ledger row {iteration}.{sub_iteration} already written to {file}")]
    Duplicate {
        file: String,
        iteration: u32,
        sub_iteration: u32,
    },

    #[error("CSV error in {file}: {message}")]
    Csv { file: String, message: String },

    #[error("Expected {expected} parameter values, got {actual}")]
    ParameterCount { expected: usize, actual: usize },
}

/// Result type alias for sweepline operations
pub type SlResult<T> = Result<T, SlError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::SlError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::SlError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($field:expr, $($arg:tt)*) => {
        $crate::SlError::Config($crate::ConfigError::InvalidValue {
            field: $field.to_string(),
            message: format!($($arg)*),
        })
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ConfigError::Unsupported {
            cluster: "habrok".to_string(),
            job: "deep".to_string(),
            model: "grace".to_string(),
        };

        let message = error.to_string();
        assert!(message.contains("not supported"));
        assert!(message.contains("habrok"));
        assert!(message.contains("grace"));
    }

    #[test]
    fn test_error_conversion() {
        let dispatch_error = DispatchError::QueueQuery {
            message: "slurm_load_jobs error".to_string(),
        };
        let sl_error: SlError = dispatch_error.into();

        match sl_error {
            SlError::Dispatch(DispatchError::QueueQuery { .. }) => (),
            _ => panic!("Expected Dispatch error"),
        }
        assert!(!SlError::Internal("x".into()).is_collection());
    }

    #[test]
    fn test_macros() {
        let _validation_err = validation_error!("Invalid value: {}", 42);
        let _internal_err = internal_error!("Something went wrong");
        let config_err = config_error!("n_points", "must be at least {}", 1);
        assert!(config_err.to_string().contains("n_points"));
    }
}
