//! Lifecycle callbacks around job invocation.
//!
//! Hooks are side calls. The worker logs a failing hook and carries on with
//! the job's real outcome.
use crate::{error::BoxError, job::JobInfo};

/// Callbacks the worker runs at fixed points of a job's life.
///
/// Order for one invocation: `before`, then `success` or `error`, then
/// `after`. `failure` follows `error` when the job has run out of attempts.
pub trait JobHooks: Send + Sync {
    fn before(&self, _job: &JobInfo) -> Result<(), BoxError> {
        Ok(())
    }

    fn success(&self, _job: &JobInfo) -> Result<(), BoxError> {
        Ok(())
    }

    /// The handler failed; `job` still has its pre-failure attempt count.
    fn error(&self, _job: &JobInfo, _error: &BoxError) -> Result<(), BoxError> {
        Ok(())
    }

    fn after(&self, _job: &JobInfo) -> Result<(), BoxError> {
        Ok(())
    }

    /// The job failed for good and will not be claimed again.
    fn failure(&self, _job: &JobInfo) -> Result<(), BoxError> {
        Ok(())
    }
}

impl JobHooks for () {}
