//! Submission of the pipeline as a chain of dependent scheduler jobs.
//!
//! Every stage returns the handle the next stage depends on. No state is
//! shared between stages; each watcher reads what the previous stage left
//! on disk.

use sl_dispatch::{Dispatcher, PresetRequest, PresetTable, ARRAY_TASK_ENV};
use sl_types::{
    internal_error, ArrayRange, ConfigError, JobConfig, JobHandle, JobId, JobKind, SlResult,
};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::stage::Stage;

/// Renders the `sweepline` invocations that scheduled jobs run.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub executable: PathBuf,
    pub config_path: PathBuf,
    /// Forward `--local` to the search job.
    pub local: bool,
}

impl Invocation {
    pub fn new(executable: impl Into<PathBuf>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            config_path: config_path.into(),
            local: false,
        }
    }

    pub fn with_local(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    fn base(&self, subcommand: &str) -> String {
        format!(
            "{} {subcommand} --config {}",
            self.executable.display(),
            self.config_path.display()
        )
    }

    pub fn hyper(&self, start_iteration: u32) -> String {
        let mut command = format!("{} --start-iteration {start_iteration}", self.base("hyper"));
        if self.local {
            command.push_str(" --local");
        }
        command
    }

    pub fn prepare(&self, stage: Stage) -> String {
        format!("{} --stage {stage}", self.base("prepare"))
    }
}

/// Handles submitted by one chain run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChainSummary {
    pub stages: Vec<(Stage, JobHandle)>,
    /// The held first job, released once the chain was queued.
    pub released: Option<JobHandle>,
}

impl ChainSummary {
    /// Handle of the last stage that ran.
    pub fn last(&self) -> Option<JobHandle> {
        self.stages.last().map(|(_, handle)| *handle)
    }
}

pub struct StageChain<D> {
    config: PipelineConfig,
    invocation: Invocation,
    presets: PresetTable,
    dispatcher: D,
    start_iteration: u32,
    first: Option<JobHandle>,
}

impl<D: Dispatcher> StageChain<D> {
    pub fn new(config: PipelineConfig, invocation: Invocation, dispatcher: D) -> Self {
        Self {
            config,
            invocation,
            presets: PresetTable::builtin(),
            dispatcher,
            start_iteration: 1,
            first: None,
        }
    }

    pub fn with_presets(mut self, presets: PresetTable) -> Self {
        self.presets = presets;
        self
    }

    pub fn with_start_iteration(mut self, iteration: u32) -> Self {
        self.start_iteration = iteration;
        self
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    fn sweep_path(&self) -> &Path {
        self.config.sweep_path()
    }

    /// Reject the run before anything is submitted: every enabled stage
    /// needs its section and a preset for each job it submits.
    pub fn check(&self, stages: &[Stage]) -> SlResult<()> {
        self.config.validate()?;
        let general = &self.config.general;
        for &stage in stages {
            if stage != Stage::Search {
                self.config.require_stage(stage)?;
            }
            let kinds = std::iter::once(stage.job_kind()).chain(stage.watcher_kind());
            for kind in kinds {
                if !self.presets.supports(general.cluster, kind, general.model) {
                    return Err(ConfigError::Unsupported {
                        cluster: general.cluster.to_string(),
                        job: kind.to_string(),
                        model: general.model.to_string(),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    /// The requested stages that can run. A pretrained model replaces the
    /// search and deep training.
    pub fn active_stages(&self, stages: &[Stage]) -> Vec<Stage> {
        let pretrained = self.config.general.pretrained_path.is_some();
        stages
            .iter()
            .copied()
            .filter(|stage| {
                let replaced = pretrained && matches!(stage, Stage::Search | Stage::Deep);
                if replaced {
                    info!(stage = %stage, "stage replaced by the pretrained model");
                }
                !replaced
            })
            .collect()
    }

    /// Submit the enabled stages in chain order. Stages not listed are
    /// skipped and pass the previous link through.
    ///
    /// When a submission fails after the first job was held, that job is
    /// released so the part of the chain already queued does not wait
    /// forever.
    pub async fn run(&mut self, stages: &[Stage]) -> SlResult<ChainSummary> {
        let stages = self.active_stages(stages);
        self.check(&stages)?;
        self.first = None;

        let mut summary = ChainSummary::default();
        if let Err(e) = self.submit_stages(&stages, &mut summary).await {
            if let Some(first) = self.held_first() {
                error!(job_id = first.id, error = %e, "chain incomplete, releasing held job");
                match self.dispatcher.release(&first, None).await {
                    Ok(()) => summary.released = Some(first),
                    Err(release_error) => {
                        warn!(job_id = first.id, error = %release_error, "held job left in queue");
                    }
                }
            }
            return Err(e);
        }

        if let Some(first) = self.held_first() {
            self.dispatcher.release(&first, None).await?;
            info!(job_id = first.id, "chain released");
            summary.released = Some(first);
        }
        Ok(summary)
    }

    fn held_first(&self) -> Option<JobHandle> {
        self.first.filter(|_| self.config.general.hold_until_chained)
    }

    async fn submit_stages(
        &mut self,
        stages: &[Stage],
        summary: &mut ChainSummary,
    ) -> SlResult<()> {
        let mut link: Option<JobId> = None;
        for stage in Stage::ALL {
            if !stages.contains(&stage) {
                info!(stage = %stage, "stage skipped");
                continue;
            }
            let handle = self.run_stage(stage, link).await?;
            info!(stage = %stage, job_id = handle.id, dependency = ?link, "stage submitted");
            link = handle.as_dependency().or(link);
            summary.stages.push((stage, handle));
        }
        Ok(())
    }

    /// Submit one stage after `dependency` and return the handle the next
    /// stage should depend on.
    pub async fn run_stage(
        &mut self,
        stage: Stage,
        dependency: Option<JobId>,
    ) -> SlResult<JobHandle> {
        let sweep = self.sweep_path().to_path_buf();
        match stage {
            Stage::Search => {
                let command = self.invocation.hyper(self.start_iteration);
                let request = self.request(JobKind::Main, sweep, JobConfig::default());
                self.submit(request.with_dependency(dependency), command)
                    .await
            }
            Stage::Convert => {
                let section = self.config.require_stage(stage)?;
                let count = self.config.general.cohort_size();
                let command = format!(
                    "{} && for k in $(seq 1 {count}); do (cd $k && {}) || exit 1; done",
                    self.invocation.prepare(stage),
                    section.command
                );
                let request = self.request(
                    JobKind::Conv,
                    sweep.join(stage.dir_name()),
                    section.job.clone(),
                );
                self.submit(request.with_dependency(dependency), command)
                    .await
            }
            Stage::Deep | Stage::Inference | Stage::Properties => {
                let section = self.config.require_stage(stage)?.clone();
                let watcher_kind = stage
                    .watcher_kind()
                    .ok_or_else(|| internal_error!("stage {stage} has no watcher job"))?;

                let watcher =
                    self.request(watcher_kind, sweep.clone(), section.watcher_job().clone());
                let watcher = self
                    .submit(watcher.with_dependency(dependency), self.invocation.prepare(stage))
                    .await?;

                let range = ArrayRange::one_based(self.config.general.cohort_size())?;
                let array = self
                    .request(stage.job_kind(), sweep.join(stage.dir_name()), section.job)
                    .with_array(range)
                    .with_dependency(watcher.as_dependency().or(dependency));
                let command = format!("cd ${ARRAY_TASK_ENV} && {}", section.command);
                self.submit(array, command).await
            }
        }
    }

    fn request(&self, kind: JobKind, working_dir: PathBuf, overrides: JobConfig) -> PresetRequest {
        let general = &self.config.general;
        PresetRequest::new(general.cluster, kind, general.model, working_dir)
            .with_overrides(overrides)
            .with_email(general.email.clone())
    }

    /// Submit a job built from the presets. The chain's first job is held
    /// when the configuration asks for it.
    async fn submit(&mut self, request: PresetRequest, command: String) -> SlResult<JobHandle> {
        let hold = self.config.general.hold_until_chained && self.first.is_none();
        let job = self.presets.build_job(&request.held(hold), [command])?;
        let kind = job.kind;
        let handle = self.dispatcher.submit(job).await?;
        if self.first.is_none() {
            self.first = Some(handle);
        }
        info!(
            kind = %kind,
            job_id = handle.id,
            held = hold,
            dispatcher = self.dispatcher.name(),
            "job submitted"
        );
        Ok(handle)
    }
}
