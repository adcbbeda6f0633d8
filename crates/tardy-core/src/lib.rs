//! Core contract between worker and job store.
//!
//! A [`Worker`] claims batches of jobs from a [`Backend`], runs them with a
//! user handler, and records the outcome:
//! - success deletes the job;
//! - failure reschedules it with backoff until it runs out of attempts,
//!   then marks it failed for good;
//! - store hiccups while finalizing are retried a bounded number of times;
//! - repeated failures to claim end the run instead of spinning forever.
//!
//! The backend owns atomicity of the claim. Many workers, in one process or
//! many, can share a store without talking to each other.
pub mod backend;
pub mod config;
pub mod error;
pub mod hooks;
pub mod job;
pub mod memory;
pub mod retry;
pub mod worker;

pub use backend::{Backend, WorkerInfo};
pub use config::WorkerConfig;
pub use error::{BackendError, BackendErrorKind, BoxError, PanicError, WorkerError};
pub use hooks::JobHooks;
pub use job::{Job, JobId, JobInfo, NewJob};
pub use memory::MemoryBackend;
pub use retry::{Backoff, JobFailureDecision, RetryPolicy, StoreErrorDecision};
pub use worker::{WorkOff, Worker, WorkerBuilder, WorkerWithGracefulShutdown};

/// Outcome of a job handler. `Err` counts as a failed attempt.
pub type JobResult = Result<(), BoxError>;

/// Trait implemented by functions that process a job.
///
/// The `M` type parameter determines which combination of [`JobData`] and
/// [`WorkerContext`] the handler expects. The associated [`Data`] type
/// specifies the payload that the job carries.
///
/// [`Data`]: JobHandler::Data
pub trait JobHandler<M>: Send + Sync + Clone + 'static {
    /// The job data type handled by this function.
    type Data: Send + 'static;
    /// Type of the shared context provided to the handler.
    type Context: Send + 'static;

    /// Future returned by the handler.
    type Future: Future<Output = JobResult> + Send;

    /// Invoke the handler with the job data and worker context.
    fn call(self, data: Self::Data, context: Self::Context) -> Self::Future;
}

/// Explicitly opt-in to receive the payload.
pub struct JobData<T>(pub T);

/// Explicitly opt-in to receive shared context (e.g., pools, config).
///
/// Context is cloned per job.
pub struct WorkerContext<S>(pub S);

impl<F, Fut> JobHandler<()> for F
where
    F: FnOnce() -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send,
{
    type Data = ();
    type Context = ();
    type Future = Fut;

    fn call(self, _data: Self::Data, _context: Self::Context) -> Self::Future {
        self()
    }
}

impl<F, Fut, T> JobHandler<JobData<T>> for F
where
    T: Send + 'static,
    F: FnOnce(JobData<T>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send,
{
    type Data = T;
    type Context = ();
    type Future = Fut;

    fn call(self, data: Self::Data, _context: Self::Context) -> Self::Future {
        self(JobData(data))
    }
}

impl<F, Fut, S> JobHandler<WorkerContext<S>> for F
where
    S: Send + 'static,
    F: FnOnce(WorkerContext<S>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send,
{
    type Data = ();
    type Context = S;
    type Future = Fut;

    fn call(self, _data: Self::Data, context: Self::Context) -> Self::Future {
        self(WorkerContext(context))
    }
}

impl<F, Fut, T, S> JobHandler<(JobData<T>, WorkerContext<S>)> for F
where
    T: Send + 'static,
    S: Send + 'static,
    F: FnOnce(JobData<T>, WorkerContext<S>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send,
{
    type Data = T;
    type Context = S;
    type Future = Fut;

    fn call(self, data: Self::Data, context: Self::Context) -> Self::Future {
        self(JobData(data), WorkerContext(context))
    }
}
