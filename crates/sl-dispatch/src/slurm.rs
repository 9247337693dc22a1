//! Batch-scheduler adapter: job-script rendering, submission, queue polling
//! and release of held jobs.

use async_trait::async_trait;
use sl_types::{DispatchError, Job, JobHandle, JobId, SlResult};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;

/// Environment variable holding the array task index inside a job.
pub const ARRAY_TASK_ENV: &str = "SLURM_ARRAY_TASK_ID";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Raw access to the scheduler's command-line tools.
///
/// Kept separate from [`BatchDispatcher`] so polling and rendering logic can
/// be exercised without a cluster.
#[async_trait]
pub trait SchedulerCli: Send + Sync {
    /// Submit a rendered job script, returning the tool's raw output.
    async fn submit(&self, script: &str) -> SlResult<String>;

    /// Machine-readable listing of the current user's active jobs.
    async fn queue(&self) -> SlResult<String>;

    /// Release a held job, attaching `dependency` first when given.
    async fn release(&self, job_id: JobId, dependency: Option<JobId>) -> SlResult<()>;
}

/// [`SchedulerCli`] backed by `sbatch`, `squeue` and `scontrol`.
#[derive(Debug, Clone, Default)]
pub struct SlurmCli;

impl SlurmCli {
    async fn run(program: &str, args: &[String]) -> SlResult<std::process::Output> {
        Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                DispatchError::Spawn {
                    program: program.to_string(),
                    message: e.to_string(),
                }
                .into()
            })
    }
}

#[async_trait]
impl SchedulerCli for SlurmCli {
    async fn submit(&self, script: &str) -> SlResult<String> {
        let mut child = Command::new("sbatch")
            .arg("--parsable")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| DispatchError::Spawn {
                program: "sbatch".to_string(),
                message: e.to_string(),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(DispatchError::SubmissionRejected {
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn queue(&self) -> SlResult<String> {
        let args = ["--me", "--noheader", "--format=%i|%T"].map(String::from);
        let output = Self::run("squeue", &args).await?;
        if !output.status.success() {
            return Err(DispatchError::QueueQuery {
                message: format!(
                    "squeue exited with {:?}: {}",
                    output.status.code(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            }
            .into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn release(&self, job_id: JobId, dependency: Option<JobId>) -> SlResult<()> {
        let mut steps = Vec::new();
        if let Some(dependency) = dependency {
            steps.push(vec![
                "update".to_string(),
                format!("JobId={job_id}"),
                format!("Dependency=afterany:{dependency}"),
            ]);
        }
        steps.push(vec!["release".to_string(), job_id.to_string()]);

        for args in steps {
            let output = Self::run("scontrol", &args).await?;
            if !output.status.success() {
                return Err(DispatchError::Release {
                    job_id,
                    message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                }
                .into());
            }
        }
        Ok(())
    }
}

/// Snapshot of the scheduler's active queue, keyed by (parent) job id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueSnapshot {
    jobs: HashMap<JobId, String>,
}

impl QueueSnapshot {
    pub fn contains(&self, job_id: JobId) -> bool {
        self.jobs.contains_key(&job_id)
    }

    pub fn status(&self, job_id: JobId) -> Option<&str> {
        self.jobs.get(&job_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Parse `<id>|<state>` lines into a snapshot.
///
/// Array task rows (`123_4`, `123_[5-9%2]`) are folded into their parent id,
/// so an array stays visible until its last task leaves the queue.
pub fn parse_queue(listing: &str) -> SlResult<QueueSnapshot> {
    let mut jobs = HashMap::new();
    for line in listing.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let (raw_id, state) = line.split_once('|').unwrap_or((line, ""));
        let parent = raw_id.split('_').next().unwrap_or(raw_id);
        let id: JobId = parent.trim().parse().map_err(|_| DispatchError::QueueQuery {
            message: format!("unparseable queue row: {line:?}"),
        })?;
        jobs.entry(id).or_insert_with(|| state.trim().to_string());
    }
    Ok(QueueSnapshot { jobs })
}

/// Parse `sbatch --parsable` output: `<id>` or `<id>;<cluster>`.
pub fn parse_submit_output(output: &str) -> SlResult<JobId> {
    let trimmed = output.trim();
    trimmed
        .split(';')
        .next()
        .and_then(|id| id.trim().parse().ok())
        .ok_or_else(|| {
            DispatchError::InvalidSubmitOutput {
                output: trimmed.to_string(),
            }
            .into()
        })
}

/// Render a job into a batch script: one directive per option, then the
/// commands in order.
pub fn render_script(job: &Job) -> String {
    let mut script = String::from("#!/bin/bash\n");

    for (key, value) in &job.resources {
        let key = key.replace('_', "-");
        if value.is_empty() {
            let _ = writeln!(script, "#SBATCH --{key}");
        } else {
            let _ = writeln!(script, "#SBATCH --{key}={value}");
        }
    }
    if let Some(range) = job.array_range {
        if !job.resources.contains_key("array") {
            let _ = writeln!(script, "#SBATCH --array={range}");
        }
    }
    if let Some(dependency) = job.dependency {
        if !job.resources.contains_key("dependency") {
            let _ = writeln!(script, "#SBATCH --dependency=afterany:{dependency}");
        }
    }
    if job.hold {
        script.push_str("#SBATCH --hold\n");
    }

    script.push('\n');
    for command in &job.commands {
        script.push_str(command);
        script.push('\n');
    }
    script
}

/// Dispatcher that hands jobs to a batch scheduler and polls its queue.
#[derive(Debug)]
pub struct BatchDispatcher<C: SchedulerCli> {
    cli: C,
    poll_interval: Duration,
    queue: QueueSnapshot,
    submitted: Vec<JobHandle>,
}

impl<C: SchedulerCli> BatchDispatcher<C> {
    pub fn new(cli: C) -> Self {
        Self {
            cli,
            poll_interval: DEFAULT_POLL_INTERVAL,
            queue: QueueSnapshot::default(),
            submitted: Vec::new(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Handles submitted through this dispatcher, in submission order.
    pub fn submitted(&self) -> &[JobHandle] {
        &self.submitted
    }

    /// Last queue snapshot taken by [`Dispatcher::wait`].
    pub fn queue(&self) -> &QueueSnapshot {
        &self.queue
    }

    pub fn cli(&self) -> &C {
        &self.cli
    }

    async fn refresh_queue(&mut self) -> SlResult<()> {
        let listing = self.cli.queue().await?;
        self.queue = parse_queue(&listing)?;
        Ok(())
    }
}

impl BatchDispatcher<SlurmCli> {
    pub fn slurm() -> Self {
        Self::new(SlurmCli)
    }
}

#[async_trait]
impl<C: SchedulerCli> Dispatcher for BatchDispatcher<C> {
    async fn submit(&mut self, job: Job) -> SlResult<JobHandle> {
        if job.commands.is_empty() {
            return Err(DispatchError::EmptyJob.into());
        }
        tokio::fs::create_dir_all(&job.working_dir).await?;

        let script = render_script(&job);
        debug!(kind = %job.kind, script = %script, "submitting batch job");
        let output = self.cli.submit(&script).await?;
        let handle = JobHandle::new(parse_submit_output(&output)?, job.array_range);

        info!(
            job_id = handle.id,
            kind = %job.kind,
            array = ?job.array_range,
            dependency = ?job.dependency,
            held = job.hold,
            "batch job submitted"
        );
        self.submitted.push(handle);
        Ok(handle)
    }

    async fn wait(&mut self, handle: &JobHandle) -> SlResult<()> {
        if handle.is_local() {
            return Err(DispatchError::NothingSubmitted.into());
        }

        loop {
            // A failed query must abort: reading it as "gone" would release
            // everything that depends on this job.
            if let Err(e) = self.refresh_queue().await {
                warn!(job_id = handle.id, error = %e, "queue query failed while waiting");
                return Err(e);
            }
            match self.queue.status(handle.id) {
                None => break,
                Some(status) => debug!(job_id = handle.id, status, "job still active"),
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        info!(job_id = handle.id, "batch job left the queue");
        Ok(())
    }

    async fn release(&mut self, handle: &JobHandle, dependency: Option<JobId>) -> SlResult<()> {
        self.cli.release(handle.id, dependency).await?;
        info!(job_id = handle.id, ?dependency, "batch job released");
        Ok(())
    }

    fn name(&self) -> &str {
        "batch"
    }
}
