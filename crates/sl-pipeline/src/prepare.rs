//! Watcher-side preparation of a stage: pick the best candidates of the
//! nearest finished stage and lay them out as `<sweep>/<stage>/<rank>/`.

use sl_optimizer::{
    CandidateTracker, ErrorFileCollector, LossCollector, ValidLoss, METADATA_FILE, RESULT_FILE,
};
use sl_types::{validation_error, SlResult};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::stage::Stage;

/// A candidate scored for ranking.
#[derive(Debug, Clone)]
pub struct RankedCandidate {
    pub tracker: CandidateTracker,
    pub valid: ValidLoss,
    pub loss: f64,
}

/// Iteration recorded for a pretrained model; searched candidates start at 1.
pub const PRETRAINED_ITERATION: u32 = 0;

/// A candidate carried into a stage directory.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedCandidate {
    pub rank: u32,
    pub iteration: u32,
    pub sub_iteration: u32,
    /// Unknown for a pretrained model.
    pub loss: Option<f64>,
    pub dir: PathBuf,
}

/// Numbered subdirectories of `dir`, in numeric order.
fn numbered_dirs(dir: &Path) -> SlResult<Vec<(u32, PathBuf)>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(n) = entry.file_name().to_str().and_then(|s| s.parse().ok()) {
            dirs.push((n, entry.path()));
        }
    }
    dirs.sort_by_key(|(n, _)| *n);
    Ok(dirs)
}

/// Every candidate a stage left on disk.
pub fn stage_candidates(sweep_path: &Path, stage: Stage) -> SlResult<Vec<CandidateTracker>> {
    let root = sweep_path.join(stage.dir_name());
    let mut trackers = Vec::new();
    for (n, dir) in numbered_dirs(&root)? {
        match stage {
            Stage::Search => trackers.extend(CandidateTracker::scan(sweep_path, n)?),
            _ => trackers.push(CandidateTracker::load(dir)?),
        }
    }
    Ok(trackers)
}

/// Score candidates for ranking. A result file written by the stage's own
/// job wins over the loss recorded in the metadata; unscored candidates are
/// dropped.
///
/// With `require_result`, only candidates whose stage job left a readable
/// result file are kept: the recorded loss belongs to an earlier stage and
/// says nothing about whether this one produced a model.
pub fn rank(
    trackers: Vec<CandidateTracker>,
    energy_weight: f64,
    require_result: bool,
) -> Vec<RankedCandidate> {
    let mut ranked: Vec<RankedCandidate> = trackers
        .into_iter()
        .filter_map(|tracker| {
            let valid = if tracker.dir().join(RESULT_FILE).is_file() {
                match ErrorFileCollector.collect(&tracker) {
                    Ok(valid) => Some(valid),
                    Err(e) if require_result => {
                        warn!(
                            dir = %tracker.dir().display(),
                            error = %e,
                            "unreadable result, candidate dropped"
                        );
                        None
                    }
                    Err(e) => {
                        warn!(dir = %tracker.dir().display(), error = %e, "ignoring result file");
                        tracker.valid_loss()
                    }
                }
            } else if require_result {
                warn!(
                    dir = %tracker.dir().display(),
                    "no result left by the stage, candidate dropped"
                );
                None
            } else {
                tracker.valid_loss()
            };
            match valid {
                Some(valid) => Some(RankedCandidate {
                    loss: valid.total(energy_weight),
                    valid,
                    tracker,
                }),
                None => {
                    debug!(dir = %tracker.dir().display(), "unscored candidate skipped");
                    None
                }
            }
        })
        .collect();
    ranked.sort_by(|a, b| a.loss.total_cmp(&b.loss));
    ranked
}

/// Copy a candidate's artifacts, leaving out its metadata and results.
fn copy_artifacts(from: &Path, to: &Path) -> SlResult<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let name = entry.file_name();
        if name == METADATA_FILE || name == RESULT_FILE {
            continue;
        }
        let target = to.join(&name);
        if entry.file_type()?.is_dir() {
            copy_artifacts(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

/// Fresh stage directory `<root>/<rank>` holding `from`'s artifacts.
fn stage_dir(root: &Path, rank: u32, from: &Path) -> SlResult<PathBuf> {
    let dir = root.join(rank.to_string());
    if dir.exists() {
        fs::remove_dir_all(&dir)?;
    }
    copy_artifacts(from, &dir)?;
    Ok(dir)
}

/// Prepare `stage` from the nearest earlier stage that has candidates, or
/// from the configured pretrained model.
///
/// Exactly `cohort_size` candidates are laid out, matching the array the
/// chain submitted for the stage; fewer scored candidates is an error and
/// nothing is written.
pub fn prepare(config: &PipelineConfig, stage: Stage) -> SlResult<Vec<PreparedCandidate>> {
    if stage == Stage::Search {
        return Err(validation_error!("the search stage has no inputs to prepare"));
    }
    if let Some(pretrained) = &config.general.pretrained_path {
        return prepare_pretrained(config, stage, pretrained);
    }

    let sweep = config.sweep_path();
    let mut source = None;
    for &candidate in stage.sources() {
        let trackers = stage_candidates(sweep, candidate)?;
        if !trackers.is_empty() {
            source = Some((candidate, trackers));
            break;
        }
    }
    let Some((source, trackers)) = source else {
        return Err(validation_error!(
            "no candidates found under {} for stage {stage}",
            sweep.display()
        ));
    };

    // Deep training is the only stage that rescores its candidates.
    let ranked = rank(trackers, config.hyper_search.energy_weight, source == Stage::Deep);
    if ranked.is_empty() {
        return Err(validation_error!("no scored {source} candidates to carry into {stage}"));
    }
    let cohort = config.general.cohort_size();
    if ranked.len() < cohort {
        return Err(validation_error!(
            "{stage} runs on {cohort} candidates but {source} left {} scored",
            ranked.len()
        ));
    }

    let root = sweep.join(stage.dir_name());
    let mut prepared = Vec::new();
    for (rank, candidate) in (1u32..).zip(ranked.into_iter().take(cohort)) {
        let dir = stage_dir(&root, rank, candidate.tracker.dir())?;

        let origin = &candidate.tracker;
        let mut tracker = CandidateTracker::new(
            origin.iteration,
            origin.sub_iteration,
            origin.parameters.clone(),
            &dir,
        );
        tracker.set_valid_loss(candidate.valid)?;
        tracker.save()?;

        info!(
            stage = %stage,
            rank,
            iteration = origin.iteration,
            sub_iteration = origin.sub_iteration,
            loss = candidate.loss,
            "candidate prepared"
        );
        prepared.push(PreparedCandidate {
            rank,
            iteration: origin.iteration,
            sub_iteration: origin.sub_iteration,
            loss: Some(candidate.loss),
            dir,
        });
    }

    info!(stage = %stage, source = %source, count = prepared.len(), "stage prepared");
    Ok(prepared)
}

/// Lay out the pretrained model as the stage's only candidate. Stages after
/// conversion pick up the converted copy when there is one.
fn prepare_pretrained(
    config: &PipelineConfig,
    stage: Stage,
    pretrained: &Path,
) -> SlResult<Vec<PreparedCandidate>> {
    if stage == Stage::Deep {
        return Err(validation_error!(
            "deep training does not run when a pretrained model is configured"
        ));
    }

    let sweep = config.sweep_path();
    let converted = sweep.join(Stage::Convert.dir_name()).join("1");
    let from_conversion = stage != Stage::Convert
        && CandidateTracker::load(&converted)
            .is_ok_and(|tracker| tracker.iteration == PRETRAINED_ITERATION);
    let from = if from_conversion {
        converted
    } else {
        pretrained.to_path_buf()
    };
    if !from.is_dir() {
        return Err(validation_error!(
            "pretrained model {} is not a directory",
            from.display()
        ));
    }

    let dir = stage_dir(&sweep.join(stage.dir_name()), 1, &from)?;
    CandidateTracker::new(PRETRAINED_ITERATION, 1, BTreeMap::new(), &dir).save()?;
    info!(
        stage = %stage,
        model = %from.display(),
        "pretrained model prepared"
    );
    Ok(vec![PreparedCandidate {
        rank: 1,
        iteration: PRETRAINED_ITERATION,
        sub_iteration: 1,
        loss: None,
        dir,
    }])
}

#[cfg(test)]
mod tests {
    use super::*;
    use sl_optimizer::{candidate_dir, ParameterValue, SearchConfig, SearchSpace};
    use sl_types::{GeneralConfig, StageConfig};
    use tempfile::tempdir;

    fn config(sweep: &Path, best_n: usize) -> PipelineConfig {
        let search = SearchConfig::new(
            SearchSpace::new().add_float("fit.loss.kappa", 0.0, 1.0),
            "pacemaker model_config.yaml",
        );
        PipelineConfig::new(
            GeneralConfig::default().with_sweep_path(sweep).with_best_n(best_n),
            search,
        )
        .with_stage(Stage::Deep, StageConfig::new("pacemaker -p output_potential.yaml"))
    }

    fn scored(sweep: &Path, iteration: u32, sub: u32, energy: f64, force: f64) {
        let params = BTreeMap::from([(
            "fit.loss.kappa".to_string(),
            ParameterValue::Float(0.1 * sub as f64),
        )]);
        let dir = candidate_dir(sweep, iteration, sub);
        let mut tracker = CandidateTracker::new(iteration, sub, params, &dir);
        tracker.set_valid_loss(ValidLoss::new(energy, force)).unwrap();
        tracker.save().unwrap();
        fs::write(dir.join("output_potential.yaml"), format!("{iteration}.{sub}")).unwrap();
    }

    #[test]
    fn carries_the_best_search_candidates() {
        let dir = tempdir().unwrap();
        let sweep = dir.path();
        scored(sweep, 1, 1, 0.4, 0.4);
        scored(sweep, 1, 2, 0.1, 0.1);
        scored(sweep, 2, 1, 0.3, 0.3);
        scored(sweep, 2, 2, 0.2, 0.2);
        CandidateTracker::new(2, 3, BTreeMap::new(), candidate_dir(sweep, 2, 3))
            .save()
            .unwrap();

        let prepared = prepare(&config(sweep, 2), Stage::Deep).unwrap();
        let origins: Vec<(u32, u32)> = prepared
            .iter()
            .map(|p| (p.iteration, p.sub_iteration))
            .collect();
        assert_eq!(origins, vec![(1, 2), (2, 2)]);

        let first = sweep.join("deep_train").join("1");
        assert_eq!(prepared[0].dir, first);
        assert_eq!(
            fs::read_to_string(first.join("output_potential.yaml")).unwrap(),
            "1.2"
        );
        let tracker = CandidateTracker::load(&first).unwrap();
        assert_eq!((tracker.iteration, tracker.sub_iteration), (1, 2));
        assert_eq!(tracker.valid_loss(), Some(ValidLoss::new(0.1, 0.1)));
    }

    #[test]
    fn later_stages_prefer_deep_training_results() {
        let dir = tempdir().unwrap();
        let sweep = dir.path();
        scored(sweep, 1, 1, 0.1, 0.1);
        scored(sweep, 1, 2, 0.2, 0.2);
        let config = config(sweep, 2);
        let deep = prepare(&config, Stage::Deep).unwrap();

        // Deep training reverses the order.
        fs::write(deep[0].dir.join(RESULT_FILE), "energy: 0.9\nforce: 0.9\n").unwrap();
        fs::write(deep[1].dir.join(RESULT_FILE), "energy: 0.05\nforce: 0.05\n").unwrap();

        let inference = prepare(&config, Stage::Inference).unwrap();
        assert_eq!(inference[0].sub_iteration, 2);
        assert!((inference[0].loss.unwrap() - 0.05).abs() < 1e-12);
        assert_eq!(inference[0].dir, sweep.join("inference").join("1"));
        assert!(!inference[0].dir.join(RESULT_FILE).exists());
    }

    #[test]
    fn nothing_to_prepare_is_an_error() {
        let dir = tempdir().unwrap();
        let config = config(dir.path(), 1);
        assert!(prepare(&config, Stage::Deep).is_err());
        assert!(prepare(&config, Stage::Search).is_err());

        CandidateTracker::new(1, 1, BTreeMap::new(), candidate_dir(dir.path(), 1, 1))
            .save()
            .unwrap();
        let err = prepare(&config, Stage::Deep).unwrap_err();
        assert!(err.to_string().contains("no scored"));
    }

    #[test]
    fn short_cohort_fails_without_writing() {
        let dir = tempdir().unwrap();
        let sweep = dir.path();
        scored(sweep, 1, 1, 0.1, 0.1);
        scored(sweep, 1, 2, 0.2, 0.2);

        let err = prepare(&config(sweep, 3), Stage::Deep).unwrap_err();
        assert!(err.to_string().contains("runs on 3 candidates"), "{err}");
        assert!(!sweep.join("deep_train").exists());
    }

    #[test]
    fn failed_deep_runs_are_not_carried_forward() {
        let dir = tempdir().unwrap();
        let sweep = dir.path();
        scored(sweep, 1, 1, 0.1, 0.1);
        scored(sweep, 1, 2, 0.2, 0.2);
        scored(sweep, 1, 3, 0.3, 0.3);
        let deep = prepare(&config(sweep, 3), Stage::Deep).unwrap();

        // The best search candidate's deep run left no result.
        fs::write(deep[1].dir.join(RESULT_FILE), "energy: 0.4\nforce: 0.4\n").unwrap();
        fs::write(deep[2].dir.join(RESULT_FILE), "energy: 0.5\nforce: 0.5\n").unwrap();

        let config = config(sweep, 2);
        let inference = prepare(&config, Stage::Inference).unwrap();
        let subs: Vec<u32> = inference.iter().map(|p| p.sub_iteration).collect();
        assert_eq!(subs, vec![2, 3]);

        let err = prepare(&self::config(sweep, 3), Stage::Properties).unwrap_err();
        assert!(err.to_string().contains("left 2 scored"), "{err}");
    }

    #[test]
    fn pretrained_model_replaces_the_searched_candidates() {
        let dir = tempdir().unwrap();
        let sweep = dir.path().join("sweep");
        scored(&sweep, 1, 1, 0.1, 0.1);
        let model = dir.path().join("mace_mp");
        fs::create_dir_all(model.join("checkpoints")).unwrap();
        fs::write(model.join("model_config.yaml"), "model: MACE\n").unwrap();
        fs::write(model.join("checkpoints").join("epoch_10.pt"), "weights").unwrap();

        let mut config = config(&sweep, 3);
        config.general = config.general.with_pretrained(&model);

        let converted = prepare(&config, Stage::Convert).unwrap();
        assert_eq!(converted.len(), 1);
        assert_eq!(converted[0].iteration, PRETRAINED_ITERATION);
        assert_eq!(converted[0].loss, None);
        assert!(converted[0].dir.join("checkpoints").join("epoch_10.pt").is_file());

        // Later stages use the converted copy.
        fs::write(converted[0].dir.join("potential.model"), "compiled").unwrap();
        let inference = prepare(&config, Stage::Inference).unwrap();
        assert_eq!(inference.len(), 1);
        assert_eq!(inference[0].dir, sweep.join("inference").join("1"));
        assert!(inference[0].dir.join("potential.model").is_file());
        assert!(!sweep.join("inference").join("2").exists());

        assert!(prepare(&config, Stage::Deep).is_err());
    }
}
