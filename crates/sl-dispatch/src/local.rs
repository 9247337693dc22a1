//! Foreground subprocess runner.

use async_trait::async_trait;
use sl_types::{DispatchError, Job, JobHandle, SlResult};
use std::fs::File;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

use crate::dispatcher::Dispatcher;
use crate::slurm::ARRAY_TASK_ENV;

/// Runs a job's last command synchronously in its working directory.
///
/// Setup commands (module loads, environment activation) only make sense on
/// a cluster node and are skipped. Array jobs run their command once per
/// index, in order, with the array index exported the same way the batch
/// scheduler does.
#[derive(Debug, Clone)]
pub struct LocalDispatcher {
    shell: String,
    submitted: bool,
}

impl Default for LocalDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalDispatcher {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
            submitted: false,
        }
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    async fn run_one(&self, job: &Job, command: &str, index: Option<u32>) -> SlResult<()> {
        let stem = match index {
            Some(index) => format!("{}_{}", job.log_stem(), index),
            None => job.log_stem().to_string(),
        };
        let stdout = File::create(job.working_dir.join(format!("{stem}.out")))?;
        let stderr = File::create(job.working_dir.join(format!("{stem}.err")))?;

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .current_dir(&job.working_dir)
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        if let Some(index) = index {
            cmd.env(ARRAY_TASK_ENV, index.to_string());
        }

        debug!(kind = %job.kind, ?index, command, "running local job");
        let status = cmd.status().await.map_err(|e| DispatchError::Spawn {
            program: self.shell.clone(),
            message: e.to_string(),
        })?;

        if !status.success() {
            return Err(DispatchError::Subprocess {
                command: command.to_string(),
                code: status.code(),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl Dispatcher for LocalDispatcher {
    async fn submit(&mut self, job: Job) -> SlResult<JobHandle> {
        let command = job.commands.last().ok_or(DispatchError::EmptyJob)?.clone();
        tokio::fs::create_dir_all(&job.working_dir).await?;

        match job.array_range {
            Some(range) => {
                for index in range.indices() {
                    self.run_one(&job, &command, Some(index)).await?;
                }
            }
            None => self.run_one(&job, &command, None).await?,
        }

        self.submitted = true;
        info!(kind = %job.kind, dir = %job.working_dir.display(), "local job finished");
        Ok(JobHandle::local())
    }

    async fn wait(&mut self, _handle: &JobHandle) -> SlResult<()> {
        if !self.submitted {
            return Err(DispatchError::NothingSubmitted.into());
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "local"
    }
}
