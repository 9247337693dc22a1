//! Dispatcher abstraction shared by the local and batch runners.

use async_trait::async_trait;
use sl_types::{Job, JobHandle, JobId, SlResult};

/// Core dispatch interface.
///
/// Implementations either run work in the foreground (see
/// [`super::LocalDispatcher`]) or hand it to an external batch scheduler
/// (see [`super::BatchDispatcher`]).
#[async_trait]
pub trait Dispatcher: Send {
    /// Submit a job. The job is consumed; the returned handle is the only
    /// way to refer to it afterwards.
    async fn submit(&mut self, job: Job) -> SlResult<JobHandle>;

    /// Block until the job (the whole array, for array jobs) is no longer
    /// active.
    async fn wait(&mut self, handle: &JobHandle) -> SlResult<()>;

    /// Unblock a job submitted in a held state, optionally attaching a new
    /// dependency first. Runners without a hold concept accept this as a
    /// no-op.
    async fn release(&mut self, handle: &JobHandle, dependency: Option<JobId>) -> SlResult<()> {
        let _ = (handle, dependency);
        Ok(())
    }

    /// Human-readable runner name.
    fn name(&self) -> &str;
}

#[async_trait]
impl<D: Dispatcher + ?Sized> Dispatcher for Box<D> {
    async fn submit(&mut self, job: Job) -> SlResult<JobHandle> {
        (**self).submit(job).await
    }

    async fn wait(&mut self, handle: &JobHandle) -> SlResult<()> {
        (**self).wait(handle).await
    }

    async fn release(&mut self, handle: &JobHandle, dependency: Option<JobId>) -> SlResult<()> {
        (**self).release(handle, dependency).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
