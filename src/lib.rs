//! Background job worker.
//!
//! Re-exports the worker engine from `tardy-core` and, with the `postgres`
//! feature, the PostgreSQL backend and client from `tardy-sqlx`.
pub use tardy_core::{
    Backend, BackendError, BackendErrorKind, Backoff, BoxError, Job, JobData, JobHandler,
    JobHooks, JobId, JobInfo, JobResult, MemoryBackend, NewJob, RetryPolicy, WorkOff, Worker,
    WorkerBuilder, WorkerConfig, WorkerContext, WorkerError, WorkerInfo,
    WorkerWithGracefulShutdown,
};
pub use tardy_core::{backend, config, hooks, memory, retry, worker};

#[cfg(feature = "postgres")]
pub use tardy_sqlx::{Client, PostgresBackend, install_schema};
