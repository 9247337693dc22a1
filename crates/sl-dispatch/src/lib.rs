//! # sl-dispatch
//!
//! Submits [`sl_types::Job`]s either to a local subprocess runner or to a
//! batch scheduler, and blocks until they finish. Scheduler resources and
//! environment setup for each `(cluster, job kind, model)` triple come from
//! the [`PresetTable`].

mod dispatcher;
mod local;
mod preset;
mod slurm;

pub use dispatcher::Dispatcher;
pub use local::LocalDispatcher;
pub use preset::{Preset, PresetRequest, PresetTable, ResolvedPreset};
pub use slurm::{
    parse_queue, parse_submit_output, render_script, BatchDispatcher, QueueSnapshot,
    SchedulerCli, SlurmCli, ARRAY_TASK_ENV,
};
