//! Cluster presets: scheduler options and environment setup per
//! (cluster, job kind, model) triple.

use sl_types::{
    validation_error, ArrayRange, Cluster, ConfigError, Job, JobConfig, JobId, JobKind, ModelKind,
    SlResult,
};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

/// Resources and setup commands for one supported triple.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Preset {
    pub resources: BTreeMap<String, String>,
    pub setup: Vec<String>,
}

impl Preset {
    pub fn new<K, V>(resources: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            resources: resources
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            setup: Vec::new(),
        }
    }

    pub fn with_setup<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.setup.extend(commands.into_iter().map(Into::into));
        self
    }
}

/// Everything needed to resolve the options of one job.
#[derive(Debug, Clone, PartialEq)]
pub struct PresetRequest {
    pub cluster: Cluster,
    pub kind: JobKind,
    pub model: ModelKind,
    pub working_dir: PathBuf,
    pub overrides: JobConfig,
    pub array: Option<ArrayRange>,
    pub dependency: Option<JobId>,
    pub email: Option<String>,
    pub hold: bool,
}

impl PresetRequest {
    pub fn new(
        cluster: Cluster,
        kind: JobKind,
        model: ModelKind,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cluster,
            kind,
            model,
            working_dir: working_dir.into(),
            overrides: JobConfig::default(),
            array: None,
            dependency: None,
            email: None,
            hold: false,
        }
    }

    pub fn with_overrides(mut self, overrides: JobConfig) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_array(mut self, array: ArrayRange) -> Self {
        self.array = Some(array);
        self
    }

    pub fn with_dependency(mut self, dependency: Option<JobId>) -> Self {
        self.dependency = dependency;
        self
    }

    pub fn with_email(mut self, email: Option<String>) -> Self {
        self.email = email;
        self
    }

    pub fn held(mut self, hold: bool) -> Self {
        self.hold = hold;
        self
    }
}

/// Options and setup commands produced for a request.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPreset {
    pub options: BTreeMap<String, String>,
    pub setup: Vec<String>,
}

/// Lookup table of presets. Triples missing from the table are rejected
/// rather than submitted with guessed resources.
#[derive(Debug, Clone, Default)]
pub struct PresetTable {
    presets: HashMap<(Cluster, JobKind, ModelKind), Preset>,
}

const FAULTY_NODES: &str = "gcn25,gcn56";

fn snellius_gpu(time: &str) -> Preset {
    Preset::new([
        ("time", time),
        ("mem", "50G"),
        ("nodes", "1"),
        ("ntasks", "1"),
        ("cpus_per_task", "16"),
        ("gpus", "1"),
        ("partition", "gpu_a100"),
        ("exclude", FAULTY_NODES),
    ])
}

fn habrok_gpu(time: &str) -> Preset {
    Preset::new([
        ("time", time),
        ("mem", "50G"),
        ("nodes", "1"),
        ("ntasks", "1"),
        ("cpus_per_task", "16"),
        ("gpus_per_node", "a100:1"),
        ("partition", "gpu"),
    ])
}

fn cpu(time: &str, mem: &str, cpus: &str) -> Preset {
    Preset::new([
        ("time", time),
        ("mem", mem),
        ("nodes", "1"),
        ("ntasks", "1"),
        ("cpus_per_task", cpus),
    ])
}

fn environment(cluster: Cluster, model: ModelKind) -> Vec<String> {
    let modules = match cluster {
        Cluster::Snellius => "module load 2023",
        Cluster::Habrok => "module load Anaconda3/2023.03-1",
    };
    vec![
        "module purge".to_string(),
        modules.to_string(),
        format!("source activate {model}"),
    ]
}

fn gpu_check(model: ModelKind) -> String {
    match model {
        ModelKind::Mace => {
            "python -c 'import torch; assert torch.cuda.is_available()'".to_string()
        }
        ModelKind::Pacemaker | ModelKind::Grace => {
            "python -c 'import tensorflow as tf; assert tf.config.list_physical_devices(\"GPU\")'"
                .to_string()
        }
    }
}

fn mpi_modules(model: ModelKind) -> Vec<String> {
    let mut modules = vec!["module load OpenMPI/4.1.5-GCC-12.3.0".to_string()];
    if model == ModelKind::Mace {
        modules.push("module load imkl/2023.1.0".to_string());
    }
    modules
}

impl PresetTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Presets for the clusters the pipeline ships with.
    pub fn builtin() -> Self {
        let mut table = Self::empty();

        for &model in ModelKind::ALL {
            let env = environment(Cluster::Snellius, model);
            let gpu_env: Vec<String> = env.iter().cloned().chain([gpu_check(model)]).collect();
            let mpi = mpi_modules(model);

            let entries = [
                (JobKind::Fit, snellius_gpu("12:00:00").with_setup(gpu_env.clone())),
                (JobKind::Deep, snellius_gpu("36:00:00").with_setup(gpu_env.clone())),
                (JobKind::Inf, snellius_gpu("3:00:00").with_setup(mpi.clone())),
                (
                    JobKind::Sim,
                    snellius_gpu("3:00:00")
                        .with_setup(mpi.clone())
                        .with_setup(["module load LAMMPS/2Aug2023_update2-foss-2023a-kokkos"]),
                ),
                (JobKind::Conv, cpu("1:00:00", "16G", "4").with_setup(env.clone())),
                (JobKind::Main, cpu("119:00:00", "50G", "16").with_setup(env.clone())),
                (JobKind::WatchFit, cpu("0:30:00", "8G", "1").with_setup(env.clone())),
                (JobKind::WatchDeep, cpu("0:30:00", "8G", "1").with_setup(env.clone())),
                (JobKind::WatchInf, cpu("0:30:00", "8G", "1").with_setup(env.clone())),
                (JobKind::WatchSim, cpu("0:30:00", "8G", "1").with_setup(env.clone())),
            ];
            for (kind, preset) in entries {
                table.insert(Cluster::Snellius, kind, model, preset);
            }
        }

        // Habrok runs the search, training and conversion only. Inference
        // and property jobs and their watchers have no preset there.
        for model in [ModelKind::Pacemaker, ModelKind::Mace] {
            let env = environment(Cluster::Habrok, model);
            let gpu_env: Vec<String> = env.iter().cloned().chain([gpu_check(model)]).collect();

            let entries = [
                (JobKind::Fit, habrok_gpu("12:00:00").with_setup(gpu_env.clone())),
                (JobKind::Deep, habrok_gpu("36:00:00").with_setup(gpu_env.clone())),
                (JobKind::Conv, cpu("1:00:00", "16G", "4").with_setup(env.clone())),
                (JobKind::Main, cpu("119:00:00", "50G", "16").with_setup(env.clone())),
                (JobKind::WatchFit, cpu("0:30:00", "8G", "1").with_setup(env.clone())),
                (JobKind::WatchDeep, cpu("0:30:00", "8G", "1").with_setup(env.clone())),
            ];
            for (kind, preset) in entries {
                table.insert(Cluster::Habrok, kind, model, preset);
            }
        }

        table
    }

    pub fn insert(&mut self, cluster: Cluster, kind: JobKind, model: ModelKind, preset: Preset) {
        self.presets.insert((cluster, kind, model), preset);
    }

    pub fn get(&self, cluster: Cluster, kind: JobKind, model: ModelKind) -> Option<&Preset> {
        self.presets.get(&(cluster, kind, model))
    }

    pub fn supports(&self, cluster: Cluster, kind: JobKind, model: ModelKind) -> bool {
        self.get(cluster, kind, model).is_some()
    }

    /// Resolve scheduler options and setup commands for a request.
    ///
    /// Precedence, lowest first: base options, preset resources, mail
    /// settings, user overrides. Array range and dependency come from the
    /// chain and are never overridden.
    pub fn build_options(&self, request: &PresetRequest) -> SlResult<ResolvedPreset> {
        let preset = self
            .get(request.cluster, request.kind, request.model)
            .ok_or_else(|| ConfigError::Unsupported {
                cluster: request.cluster.to_string(),
                job: request.kind.to_string(),
                model: request.model.to_string(),
            })?;

        let kind = request.kind;
        match (kind.is_array(), request.array) {
            (true, None) => {
                return Err(validation_error!("{kind} jobs need an array range"));
            }
            (false, Some(range)) => {
                return Err(validation_error!(
                    "{kind} jobs cannot run as an array (got {range})"
                ));
            }
            _ => {}
        }

        let (output, error) = if kind.is_array() {
            (format!("{kind}_%A_%a.out"), format!("{kind}_%A_%a.err"))
        } else {
            (format!("{kind}_%j.out"), format!("{kind}_%j.err"))
        };

        let mut options = BTreeMap::new();
        options.insert(
            "chdir".to_string(),
            request.working_dir.display().to_string(),
        );
        options.insert("job_name".to_string(), format!("{kind}_{}", request.model));
        options.insert("output".to_string(), output);
        options.insert("error".to_string(), error);
        options.extend(preset.resources.clone());

        if kind == JobKind::Sim {
            if let Some(email) = &request.email {
                options.insert("mail_type".to_string(), "ALL".to_string());
                options.insert("mail_user".to_string(), email.clone());
            }
        }

        options.extend(request.overrides.resources.clone());

        if let Some(range) = request.array {
            options.insert("array".to_string(), range.to_string());
        }
        if let Some(dependency) = request.dependency {
            options.insert("dependency".to_string(), format!("afterany:{dependency}"));
        }

        let setup = preset
            .setup
            .iter()
            .chain(&request.overrides.setup)
            .cloned()
            .collect();

        Ok(ResolvedPreset { options, setup })
    }

    /// Assemble a ready-to-submit job: preset setup, user setup, then
    /// `commands`.
    pub fn build_job<I, S>(&self, request: &PresetRequest, commands: I) -> SlResult<Job>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let resolved = self.build_options(request)?;
        let mut job = Job::new(request.kind, request.working_dir.clone())
            .with_resources(resolved.options)
            .with_commands(resolved.setup)
            .with_commands(commands)
            .with_dependency(request.dependency);
        if let Some(range) = request.array {
            job = job.with_array(range);
        }
        if request.hold {
            job = job.held();
        }
        Ok(job)
    }
}
