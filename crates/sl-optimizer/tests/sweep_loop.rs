use async_trait::async_trait;
use sl_dispatch::{Dispatcher, LocalDispatcher};
use sl_optimizer::{
    candidate_dir, iteration_dir, AskTellOracle, CandidateTracker, Checkpoint, CollectionPolicy,
    ErrorFileCollector, SearchConfig, SearchSpace, SurrogateOracle, SweepLoop, CHECKPOINT_FILE,
    ERRORS_FILE, METADATA_FILE, PARAMETERS_FILE, RESULT_FILE, SENTINEL_MAX_LOSS,
};
use sl_types::{
    DispatchError, GeneralConfig, Job, JobHandle, JobId, ResumeError, SlError, SlResult,
};
use std::fs;
use std::path::Path;
use tempfile::tempdir;

/// Stands in for the scheduler: "fits" every array task on submit by
/// writing its result file, unless the task is listed in `skip`.
#[derive(Default)]
struct ScriptedDispatcher {
    next_id: JobId,
    submitted: Vec<Job>,
    waited: Vec<JobId>,
    skip: Vec<u32>,
    fail_wait: bool,
}

impl ScriptedDispatcher {
    fn starting_at(next_id: JobId) -> Self {
        Self {
            next_id,
            ..Self::default()
        }
    }
}

#[async_trait]
impl Dispatcher for ScriptedDispatcher {
    async fn submit(&mut self, job: Job) -> SlResult<JobHandle> {
        let range = job.array_range.expect("fit jobs are arrays");
        for index in range.indices() {
            if self.skip.contains(&index) {
                continue;
            }
            let errors = format!(
                "energy: {}\nforce: {}\n",
                0.001 * index as f64,
                0.01 * index as f64
            );
            fs::write(job.working_dir.join(index.to_string()).join(RESULT_FILE), errors).unwrap();
        }
        self.next_id += 1;
        self.submitted.push(job);
        Ok(JobHandle::new(self.next_id, Some(range)))
    }

    async fn wait(&mut self, handle: &JobHandle) -> SlResult<()> {
        if self.fail_wait {
            return Err(DispatchError::QueueQuery {
                message: "squeue exited with 1".to_string(),
            }
            .into());
        }
        self.waited.push(handle.id);
        Ok(())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

fn general(sweep: &Path) -> GeneralConfig {
    GeneralConfig::default().with_sweep_path(sweep)
}

fn search(max_iterations: u32, n_points: usize) -> SearchConfig {
    let space = SearchSpace::new()
        .add_float("fit.loss.kappa", 0.05, 0.95)
        .add_int("potential.functions.ALL.nradmax_by_orders.0", 8, 20);
    let base = serde_yaml::from_str("fit:\n  loss:\n    kappa: 0.3\n  maxiter: 1500\n").unwrap();
    SearchConfig::new(space, "pacemaker model_config.yaml")
        .with_iterations(max_iterations, n_points)
        .with_base_config(base)
}

fn sweep_loop(
    sweep: &Path,
    config: SearchConfig,
    dispatcher: ScriptedDispatcher,
) -> SweepLoop<ScriptedDispatcher> {
    SweepLoop::new(general(sweep), config, dispatcher, ErrorFileCollector)
}

fn restored_oracle(sweep: &Path, dimensions: usize) -> (Checkpoint, SurrogateOracle) {
    let checkpoint = Checkpoint::load(sweep, dimensions).unwrap();
    let oracle = checkpoint.restore().unwrap();
    (checkpoint, oracle)
}

fn csv_rows(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .skip(1)
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn two_iterations_of_two_points() {
    let dir = tempdir().unwrap();
    let mut sweep = sweep_loop(dir.path(), search(2, 2), ScriptedDispatcher::default());
    let summary = sweep.run(1).await.unwrap();

    assert_eq!(summary.iterations, 2);
    assert_eq!(summary.history_len, 4);
    assert_eq!(summary.ledger_rows, 4);

    let dispatcher = sweep.dispatcher();
    assert_eq!(dispatcher.submitted.len(), 2);
    for (iteration, job) in (1u32..).zip(&dispatcher.submitted) {
        assert_eq!(job.resources["array"], "1-2");
        assert_eq!(job.working_dir, iteration_dir(dir.path(), iteration));
    }
    assert_eq!(dispatcher.waited, vec![1, 2]);

    // No fifth ask: the oracle handed out exactly four points.
    let (checkpoint, oracle) = restored_oracle(dir.path(), 2);
    assert_eq!(checkpoint.told_through, 2);
    assert_eq!(oracle.asked(), 4);
    assert!(!iteration_dir(dir.path(), 3).exists());

    assert_eq!(csv_rows(&dir.path().join(PARAMETERS_FILE)).len(), 4);
    assert_eq!(csv_rows(&dir.path().join(ERRORS_FILE)).len(), 4);
    assert_eq!(summary.reports.len(), 2);
    assert!(dir.path().join("parameters_final.txt").is_file());

    // Sub-iteration 1 has the lowest errors in every batch.
    let best = summary.best.unwrap();
    assert_eq!(best.sub_iteration, 1);
}

#[tokio::test]
async fn history_grows_by_batch_size() {
    let dir = tempdir().unwrap();
    let summary = sweep_loop(dir.path(), search(3, 4), ScriptedDispatcher::default())
        .run(1)
        .await
        .unwrap();
    assert_eq!(summary.history_len, 3 * 4);
    assert_eq!(summary.ledger_rows, 3 * 4);
}

#[tokio::test]
async fn candidates_carry_model_config_and_metadata() {
    let dir = tempdir().unwrap();
    sweep_loop(dir.path(), search(1, 2), ScriptedDispatcher::default())
        .run(1)
        .await
        .unwrap();

    let candidate = candidate_dir(dir.path(), 1, 2);
    let config: serde_yaml::Value =
        serde_yaml::from_str(&fs::read_to_string(candidate.join("model_config.yaml")).unwrap())
            .unwrap();
    assert_eq!(config["fit"]["maxiter"].as_i64(), Some(1500));
    assert!(config["potential"]["functions"]["ALL"]["nradmax_by_orders"]["0"].is_i64());

    let metadata = fs::read_to_string(candidate.join(METADATA_FILE)).unwrap();
    assert!(metadata.contains("iteration: 1"));
    assert!(metadata.contains("subIteration: 2"));
    assert!(metadata.contains("validEnergyLoss: 0.002"));
    assert!(metadata.contains("jobId: 1"));
}

#[tokio::test]
async fn checkpoint_reload_is_byte_identical() {
    let dir = tempdir().unwrap();
    sweep_loop(dir.path(), search(2, 3), ScriptedDispatcher::default())
        .run(1)
        .await
        .unwrap();

    let path = dir.path().join(CHECKPOINT_FILE);
    let before = fs::read(&path).unwrap();
    let (checkpoint, oracle) = restored_oracle(dir.path(), 2);
    Checkpoint::capture(&oracle, checkpoint.told_through)
        .unwrap()
        .dump(dir.path())
        .unwrap();
    assert_eq!(fs::read(&path).unwrap(), before);
}

#[tokio::test]
async fn queue_failure_then_resume_without_reask() {
    let dir = tempdir().unwrap();

    // First run: iteration 1 completes, iteration 2 is submitted but the
    // queue query fails while waiting on it.
    let mut failing = sweep_loop(dir.path(), search(2, 3), ScriptedDispatcher::default());
    failing.run(1).await.unwrap();
    let mut failing = sweep_loop(dir.path(), search(3, 3), ScriptedDispatcher {
        next_id: 10,
        fail_wait: true,
        ..ScriptedDispatcher::default()
    });
    let err = failing.run(3).await.unwrap_err();
    assert!(matches!(err, SlError::Dispatch(DispatchError::QueueQuery { .. })));
    assert_eq!(failing.dispatcher().submitted.len(), 1);

    let (checkpoint, oracle) = restored_oracle(dir.path(), 2);
    assert_eq!(checkpoint.told_through, 2);
    assert_eq!(oracle.history_len(), 6);
    let asked_before = oracle.asked();

    // Second run at the same iteration: nothing is submitted or asked, the
    // recorded array is waited on and its three results are told in order.
    let mut resumed = sweep_loop(dir.path(), search(3, 3), ScriptedDispatcher::starting_at(20));
    let summary = resumed.run(3).await.unwrap();
    assert!(resumed.dispatcher().submitted.is_empty());
    assert_eq!(resumed.dispatcher().waited, vec![11]);
    assert_eq!(summary.history_len, 9);
    assert_eq!(summary.ledger_rows, 9);

    let (checkpoint, oracle) = restored_oracle(dir.path(), 2);
    assert_eq!(checkpoint.told_through, 3);
    assert_eq!(oracle.asked(), asked_before);

    let snapshot = oracle_points(&checkpoint);
    let told_last: Vec<serde_json::Value> = snapshot[6..].to_vec();
    let on_disk: Vec<serde_json::Value> = (1..=3)
        .map(|sub| {
            let tracker = CandidateTracker::load(candidate_dir(dir.path(), 3, sub))
                .unwrap();
            serde_json::json!([
                tracker.parameters["fit.loss.kappa"],
                tracker.parameters["potential.functions.ALL.nradmax_by_orders.0"]
            ])
        })
        .collect();
    assert_eq!(told_last, on_disk);

    let keys: Vec<String> = csv_rows(&dir.path().join(PARAMETERS_FILE))
        .iter()
        .map(|row| row.split(',').take(2).collect::<Vec<_>>().join(","))
        .collect();
    assert_eq!(&keys[6..], ["3,1", "3,2", "3,3"]);
}

#[tokio::test]
async fn restart_within_the_first_iteration_waits_on_the_recorded_array() {
    let dir = tempdir().unwrap();

    let mut failing = sweep_loop(dir.path(), search(1, 2), ScriptedDispatcher {
        fail_wait: true,
        ..ScriptedDispatcher::default()
    });
    let err = failing.run(1).await.unwrap_err();
    assert!(matches!(err, SlError::Dispatch(DispatchError::QueueQuery { .. })));
    assert_eq!(failing.dispatcher().submitted.len(), 1);

    let before: Vec<CandidateTracker> = CandidateTracker::scan(dir.path(), 1).unwrap();
    assert!(before.iter().all(|t| t.job_id == Some(1)));

    let mut resumed = sweep_loop(dir.path(), search(1, 2), ScriptedDispatcher::starting_at(10));
    let summary = resumed.run(1).await.unwrap();
    assert!(resumed.dispatcher().submitted.is_empty());
    assert_eq!(resumed.dispatcher().waited, vec![1]);
    assert_eq!(summary.history_len, 2);
    assert_eq!(summary.ledger_rows, 2);

    let (checkpoint, oracle) = restored_oracle(dir.path(), 2);
    assert_eq!(checkpoint.told_through, 1);
    assert_eq!(oracle.asked(), 2);

    // Same candidates, same job, nothing re-asked.
    let after = CandidateTracker::scan(dir.path(), 1).unwrap();
    for (old, new) in before.iter().zip(&after) {
        assert_eq!(old.parameters, new.parameters);
        assert_eq!(old.created_at, new.created_at);
        assert_eq!(new.job_id, Some(1));
    }
}

fn oracle_points(checkpoint: &Checkpoint) -> Vec<serde_json::Value> {
    checkpoint.oracle["points"].as_array().unwrap().clone()
}

#[tokio::test]
async fn tolerant_mode_scores_missing_results_with_sentinel() {
    let dir = tempdir().unwrap();
    let config = search(1, 3).with_collection(CollectionPolicy::Tolerant);
    let dispatcher = ScriptedDispatcher {
        skip: vec![2],
        ..ScriptedDispatcher::default()
    };
    let summary = sweep_loop(dir.path(), config, dispatcher).run(1).await.unwrap();
    assert_eq!(summary.history_len, 3);

    let rows = csv_rows(&dir.path().join(PARAMETERS_FILE));
    assert_eq!(rows.len(), 3);
    let failed: Vec<&String> = rows.iter().filter(|r| r.starts_with("1,2,")).collect();
    assert_eq!(failed.len(), 1);
    let loss: f64 = failed[0].split(',').nth(2).unwrap().parse().unwrap();
    assert_eq!(loss, SENTINEL_MAX_LOSS);

    let errors = csv_rows(&dir.path().join(ERRORS_FILE));
    assert_eq!(errors.iter().filter(|r| r.starts_with("1,2,")).count(), 1);
}

#[tokio::test]
async fn strict_mode_checkpoints_then_aborts() {
    let dir = tempdir().unwrap();
    let dispatcher = ScriptedDispatcher {
        skip: vec![1],
        ..ScriptedDispatcher::default()
    };
    let err = sweep_loop(dir.path(), search(2, 2), dispatcher)
        .run(1)
        .await
        .unwrap_err();
    assert!(err.is_collection());

    let (checkpoint, oracle) = restored_oracle(dir.path(), 2);
    assert_eq!(checkpoint.told_through, 0);
    assert_eq!(oracle.history_len(), 0);
    assert_eq!(oracle.asked(), 2);
    assert!(csv_rows(&dir.path().join(PARAMETERS_FILE)).is_empty());
}

#[tokio::test]
async fn resume_requires_candidate_metadata() {
    let dir = tempdir().unwrap();
    sweep_loop(dir.path(), search(2, 2), ScriptedDispatcher::default())
        .run(1)
        .await
        .unwrap();
    fs::remove_file(candidate_dir(dir.path(), 2, 1).join(METADATA_FILE)).unwrap();

    let err = sweep_loop(dir.path(), search(2, 2), ScriptedDispatcher::default())
        .run(2)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SlError::Resume(ResumeError::MissingMetadata { .. })
    ));
}

#[tokio::test]
async fn resume_rejects_a_changed_space() {
    let dir = tempdir().unwrap();
    sweep_loop(dir.path(), search(2, 2), ScriptedDispatcher::default())
        .run(1)
        .await
        .unwrap();

    let mut config = search(3, 2);
    config.space = config.space.add_float("fit.weighting.energy", 0.1, 0.9);
    let err = sweep_loop(dir.path(), config, ScriptedDispatcher::default())
        .run(3)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SlError::Resume(ResumeError::DimensionMismatch { stored: 2, configured: 3 })
    ));
}

#[tokio::test]
async fn local_dispatcher_runs_the_fit_command() {
    let dir = tempdir().unwrap();
    let config = SearchConfig::new(
        SearchSpace::new().add_float("fit.loss.kappa", 0.1, 0.9),
        format!("printf 'energy: 0.5\\nforce: 1.5\\n' > {RESULT_FILE}"),
    )
    .with_iterations(2, 2)
    .with_energy_weight(0.25);

    let mut sweep: SweepLoop<LocalDispatcher> = SweepLoop::new(
        general(dir.path()),
        config,
        LocalDispatcher::new(),
        ErrorFileCollector,
    );
    let summary = sweep.run(1).await.unwrap();
    assert_eq!(summary.history_len, 4);
    assert_eq!(summary.best.unwrap().loss, 1.25);

    for sub in 1..=2 {
        assert!(iteration_dir(dir.path(), 2)
            .join(format!("fit_{sub}.out"))
            .is_file());
    }
    let tracker = CandidateTracker::load(candidate_dir(dir.path(), 1, 1)).unwrap();
    assert_eq!(tracker.job_id, Some(JobHandle::LOCAL_ID));
}
