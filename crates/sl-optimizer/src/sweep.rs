//! The ask/tell sweep loop: one array job per iteration, checkpointed after
//! every state change.

use sl_dispatch::{Dispatcher, PresetRequest, PresetTable, ARRAY_TASK_ENV};
use sl_types::{
    config_error, internal_error, ArrayRange, GeneralConfig, JobHandle, JobId, JobKind,
    ResumeError, SlResult,
};
use std::collections::BTreeSet;
use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::checkpoint::Checkpoint;
use crate::collect::{ErrorFileCollector, LossCollector};
use crate::config::{CollectionPolicy, SearchConfig};
use crate::ledger::ResultLedger;
use crate::oracle::{AskTellOracle, SurrogateOracle};
use crate::search::Point;
use crate::tracker::{
    candidate_dir, iteration_dir, overlay_parameters, CandidateTracker, ValidLoss,
    MODEL_CONFIG_FILE,
};

/// Lowest-loss candidate of a sweep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestCandidate {
    pub iteration: u32,
    pub sub_iteration: u32,
    pub loss: f64,
}

/// Outcome of a completed sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepSummary {
    pub iterations: u32,
    pub history_len: usize,
    pub ledger_rows: usize,
    pub best: Option<BestCandidate>,
    pub reports: Vec<PathBuf>,
}

/// State that must be checkpointed before any fatal error propagates.
struct Session<O> {
    oracle: O,
    told_through: u32,
    ledger: ResultLedger,
    /// No earlier run left state for this sweep.
    fresh: bool,
}

impl<O: AskTellOracle> Session<O> {
    fn checkpoint(&self, sweep_path: &Path) -> SlResult<PathBuf> {
        Checkpoint::capture(&self.oracle, self.told_through)?.dump(sweep_path)
    }
}

/// Drives the hyperparameter search.
///
/// Each iteration asks the oracle for `n_points` candidates, writes their
/// configurations below `<sweep>/hyper_search/<iteration>/`, fits them as a
/// single array job, collects their validation errors, records them in the
/// ledger and tells the oracle. The oracle is checkpointed after every ask
/// and every tell, so the loop can be restarted at any iteration.
pub struct SweepLoop<D, C = ErrorFileCollector, O = SurrogateOracle> {
    general: GeneralConfig,
    config: SearchConfig,
    presets: PresetTable,
    dispatcher: D,
    collector: C,
    _oracle: PhantomData<fn() -> O>,
}

impl<D, C, O> SweepLoop<D, C, O>
where
    D: Dispatcher,
    C: LossCollector,
    O: AskTellOracle,
{
    pub fn new(general: GeneralConfig, config: SearchConfig, dispatcher: D, collector: C) -> Self {
        Self {
            general,
            config,
            presets: PresetTable::builtin(),
            dispatcher,
            collector,
            _oracle: PhantomData,
        }
    }

    pub fn with_presets(mut self, presets: PresetTable) -> Self {
        self.presets = presets;
        self
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    pub fn sweep_path(&self) -> &Path {
        &self.general.sweep_path
    }

    /// Run iterations `start_iteration..=max_iterations`.
    ///
    /// A sweep with no checkpoint or no asked candidates starts a fresh
    /// search and ledger at iteration 1. Any other start resumes from the
    /// checkpoint and the candidates already on disk.
    pub async fn run(&mut self, start_iteration: u32) -> SlResult<SweepSummary> {
        self.general.validate()?;
        self.config.validate()?;
        if start_iteration == 0 {
            return Err(config_error!("start_iteration", "iterations are numbered from 1"));
        }

        let mut session = self.open(start_iteration)?;
        match self.drive(&mut session, start_iteration).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                error!(error = %e, "sweep aborted, saving optimizer state");
                if let Err(dump_error) = session.checkpoint(self.sweep_path()) {
                    warn!(error = %dump_error, "could not checkpoint after failure");
                }
                Err(e)
            }
        }
    }

    fn open(&self, start_iteration: u32) -> SlResult<Session<O>> {
        let sweep = self.sweep_path();
        let names: Vec<String> = self.config.space.names().map(String::from).collect();

        if start_iteration == 1 && !self.has_started()? {
            info!(
                sweep = %sweep.display(),
                strategy = %self.config.strategy,
                n_points = self.config.n_points,
                "starting a new sweep"
            );
            return Ok(Session {
                oracle: O::from_config(&self.config)?,
                told_through: 0,
                ledger: ResultLedger::create(sweep, names)?,
                fresh: true,
            });
        }

        let checkpoint = Checkpoint::load(sweep, self.config.space.dimensions())?;
        let oracle: O = checkpoint.restore()?;
        info!(
            start_iteration,
            told_through = checkpoint.told_through,
            history = oracle.history_len(),
            "resuming sweep"
        );
        Ok(Session {
            oracle,
            told_through: checkpoint.told_through,
            ledger: ResultLedger::open(sweep, names)?,
            fresh: false,
        })
    }

    /// Whether a previous run checkpointed this sweep after asking for its
    /// first candidates.
    fn has_started(&self) -> SlResult<bool> {
        let sweep = self.sweep_path();
        if !Checkpoint::path(sweep).is_file() {
            return Ok(false);
        }
        Ok(!CandidateTracker::scan(sweep, 1)?.is_empty())
    }

    async fn drive(&mut self, session: &mut Session<O>, start: u32) -> SlResult<SweepSummary> {
        let max = self.config.max_iterations;
        if start > max {
            info!(start, max, "no iterations left");
            return self.finish(session, max);
        }

        let mut trackers = self.candidates_for(session, start)?;
        for iteration in start..=max {
            self.evaluate(session, iteration, &mut trackers).await?;
            if iteration < max {
                trackers = self.materialize(session, iteration + 1)?;
            }
        }
        self.finish(session, max)
    }

    /// Candidates of the first iteration this run handles: asked fresh, or
    /// read back from disk when resuming.
    fn candidates_for(
        &self,
        session: &mut Session<O>,
        iteration: u32,
    ) -> SlResult<Vec<CandidateTracker>> {
        if session.fresh {
            return self.materialize(session, iteration);
        }

        let expected = self.config.n_points;
        let existing = CandidateTracker::scan(self.sweep_path(), iteration)?;
        if existing.is_empty() {
            // The previous iteration was told but this one was never asked.
            if session.told_through + 1 < iteration {
                return Err(ResumeError::CandidateCount {
                    iteration,
                    found: 0,
                    expected,
                }
                .into());
            }
            return self.materialize(session, iteration);
        }
        if existing.len() != expected {
            return Err(ResumeError::CandidateCount {
                iteration,
                found: existing.len(),
                expected,
            }
            .into());
        }

        info!(
            iteration,
            candidates = existing.len(),
            scored = existing.iter().filter(|t| t.is_scored()).count(),
            "candidates recovered from disk"
        );
        Ok(existing)
    }

    /// Ask for the candidates of `iteration` and write them to disk.
    fn materialize(
        &self,
        session: &mut Session<O>,
        iteration: u32,
    ) -> SlResult<Vec<CandidateTracker>> {
        let n_points = self.config.n_points;
        let points = session.oracle.ask(n_points)?;
        if points.len() != n_points {
            return Err(internal_error!(
                "oracle returned {} points, {n_points} were asked",
                points.len()
            ));
        }

        let sweep = self.sweep_path();
        let mut trackers = Vec::with_capacity(n_points);
        for (sub_iteration, point) in (1u32..).zip(&points) {
            let dir = candidate_dir(sweep, iteration, sub_iteration);
            fs::create_dir_all(&dir)?;
            let model_config =
                overlay_parameters(&self.config.base_config, &self.config.space, point)?;
            fs::write(dir.join(MODEL_CONFIG_FILE), serde_yaml::to_string(&model_config)?)?;

            let parameters = self.config.space.named(point);
            let tracker = CandidateTracker::new(iteration, sub_iteration, parameters, dir);
            tracker.save()?;
            trackers.push(tracker);
        }

        info!(iteration, candidates = n_points, "candidates asked");
        session.checkpoint(sweep)?;
        Ok(trackers)
    }

    /// Fit, collect, record and tell one iteration. Each step skips work a
    /// previous run already finished.
    async fn evaluate(
        &mut self,
        session: &mut Session<O>,
        iteration: u32,
        trackers: &mut [CandidateTracker],
    ) -> SlResult<()> {
        let pending: Vec<usize> = trackers
            .iter()
            .enumerate()
            .filter(|(_, t)| !t.is_scored())
            .map(|(i, _)| i)
            .collect();

        if !pending.is_empty() {
            self.fit(iteration, trackers, &pending).await?;
            self.collect(trackers, &pending)?;
        }

        let mut points: Vec<Point> = Vec::with_capacity(trackers.len());
        let mut losses = Vec::with_capacity(trackers.len());
        for tracker in trackers.iter() {
            let valid = tracker.valid_loss().ok_or_else(|| {
                internal_error!(
                    "candidate {iteration}.{} has no loss after collection",
                    tracker.sub_iteration
                )
            })?;
            let point = self.config.space.point_from(&tracker.parameters)?;
            let loss = self.scalar_loss(valid);

            if !session.ledger.contains(iteration, tracker.sub_iteration) {
                session
                    .ledger
                    .record(iteration, tracker.sub_iteration, loss, valid, &point)?;
            }
            points.push(point);
            losses.push(loss);
        }

        if session.told_through < iteration {
            session.oracle.tell(&points, &losses)?;
            session.told_through = iteration;
            info!(
                iteration,
                told = points.len(),
                history = session.oracle.history_len(),
                "results told"
            );
        } else {
            debug!(iteration, "results already told");
        }

        session.checkpoint(self.sweep_path())?;
        Ok(())
    }

    /// Submit the iteration's array job unless every pending candidate was
    /// already submitted, then wait for it.
    async fn fit(
        &mut self,
        iteration: u32,
        trackers: &mut [CandidateTracker],
        pending: &[usize],
    ) -> SlResult<()> {
        let range = ArrayRange::one_based(trackers.len())?;
        let needs_submit = pending.iter().any(|&i| trackers[i].job_id.is_none());

        let handles: Vec<JobHandle> = if needs_submit {
            let request = PresetRequest::new(
                self.general.cluster,
                JobKind::Fit,
                self.general.model,
                iteration_dir(self.sweep_path(), iteration),
            )
            .with_overrides(self.config.job.clone())
            .with_array(range)
            .with_email(self.general.email.clone());
            let command = format!("cd ${ARRAY_TASK_ENV} && {}", self.config.fit_command);
            let job = self.presets.build_job(&request, [command])?;

            let handle = self.dispatcher.submit(job).await?;
            for tracker in trackers.iter_mut().filter(|t| !t.is_scored()) {
                tracker.job_id = Some(handle.id);
                tracker.save()?;
            }
            info!(
                iteration,
                job_id = handle.id,
                dispatcher = self.dispatcher.name(),
                "fit array submitted"
            );
            vec![handle]
        } else {
            // Work from a previous run: local runs already finished, batch
            // jobs may still be queued.
            let ids: BTreeSet<JobId> =
                pending.iter().filter_map(|&i| trackers[i].job_id).collect();
            ids.into_iter()
                .map(|id| JobHandle::new(id, Some(range)))
                .filter(|handle| !handle.is_local())
                .collect()
        };

        for handle in &handles {
            self.dispatcher.wait(handle).await?;
            info!(iteration, job_id = handle.id, "fit array finished");
        }
        Ok(())
    }

    fn collect(&self, trackers: &mut [CandidateTracker], pending: &[usize]) -> SlResult<()> {
        let sentinel = self.config.sentinel_loss;
        let tolerant = self.config.collection == CollectionPolicy::Tolerant;
        for &i in pending {
            let tracker = &mut trackers[i];
            let loss = match self.collector.collect(tracker) {
                Ok(loss) => loss,
                Err(e) if tolerant && e.is_collection() => {
                    warn!(
                        iteration = tracker.iteration,
                        sub_iteration = tracker.sub_iteration,
                        error = %e,
                        sentinel,
                        "result not collected, scoring with sentinel loss"
                    );
                    ValidLoss::new(sentinel, sentinel)
                }
                Err(e) => {
                    error!(
                        iteration = tracker.iteration,
                        sub_iteration = tracker.sub_iteration,
                        error = %e,
                        "result not collected"
                    );
                    return Err(e);
                }
            };
            tracker.set_valid_loss(loss)?;
            tracker.save()?;
            debug!(
                iteration = tracker.iteration,
                sub_iteration = tracker.sub_iteration,
                energy = loss.energy,
                force = loss.force,
                "result collected"
            );
        }
        Ok(())
    }

    fn scalar_loss(&self, valid: ValidLoss) -> f64 {
        let sentinel = self.config.sentinel_loss;
        // Weighting would round the sentinel; keep it exact.
        if valid.energy == sentinel && valid.force == sentinel {
            return sentinel;
        }
        valid.total(self.config.energy_weight)
    }

    fn finish(&self, session: &Session<O>, last_iteration: u32) -> SlResult<SweepSummary> {
        let reports = session.ledger.tabulate()?;

        let mut best: Option<BestCandidate> = None;
        for iteration in 1..=last_iteration {
            for tracker in CandidateTracker::scan(self.sweep_path(), iteration)? {
                let Some(valid) = tracker.valid_loss() else {
                    continue;
                };
                let loss = self.scalar_loss(valid);
                if best.map_or(true, |b| loss < b.loss) {
                    best = Some(BestCandidate {
                        iteration,
                        sub_iteration: tracker.sub_iteration,
                        loss,
                    });
                }
            }
        }

        let summary = SweepSummary {
            iterations: last_iteration,
            history_len: session.oracle.history_len(),
            ledger_rows: session.ledger.len(),
            best,
            reports,
        };
        info!(
            iterations = summary.iterations,
            history = summary.history_len,
            rows = summary.ledger_rows,
            best = ?summary.best,
            "sweep finished"
        );
        Ok(summary)
    }
}
