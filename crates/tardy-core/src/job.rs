//! Job records as seen by the worker.
//!
//! A [`Job`] pairs the payload handed to the handler with the [`JobInfo`]
//! bookkeeping the worker and backend need afterwards. Splitting the two
//! lets the handler take ownership of the payload while the worker keeps
//! enough state to finalize the job.
use std::time::SystemTime;

use crate::retry::MAX_DELAY;

/// Backend-assigned job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(pub i64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Attempt, scheduling and claim state of a stored job.
///
/// `locked_by` and `locked_at` belong to the backend; the worker reads them
/// for logging only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
    pub id: JobId,
    pub name: String,
    pub attempts: u32,
    /// Per-job ceiling. `None` defers to the worker's configured default.
    pub max_attempts: Option<u32>,
    pub last_error: Option<String>,
    pub priority: i32,
    pub queue: Option<String>,
    pub run_at: SystemTime,
    pub locked_by: Option<String>,
    pub locked_at: Option<SystemTime>,
    /// Set once the job has failed for good.
    pub failed_at: Option<SystemTime>,
}

impl JobInfo {
    /// Effective attempt ceiling given the worker default.
    pub fn max_attempts_or(&self, default: u32) -> u32 {
        self.max_attempts.unwrap_or(default)
    }

    pub fn is_failed(&self) -> bool {
        self.failed_at.is_some()
    }
}

/// Pair of job payload and bookkeeping.
#[derive(Debug, Clone)]
pub struct Job<Data> {
    info: JobInfo,
    data: Data,
}

impl<Data> Job<Data> {
    /// Build a job from bookkeeping and payload.
    pub fn from_parts(info: JobInfo, data: Data) -> Self {
        Self { info, data }
    }

    /// Separate payload and bookkeeping for handler and finalization.
    pub fn split_parts(self) -> (Data, JobInfo) {
        (self.data, self.info)
    }

    pub fn info(&self) -> &JobInfo {
        &self.info
    }

    pub fn data(&self) -> &Data {
        &self.data
    }
}

/// Configuration for enqueuing a job.
///
/// The generic `T` is the payload a handler will receive. Everything else
/// has a default: the name comes from the payload type, attempts fall back
/// to the worker's ceiling, and the job is runnable immediately.
#[derive(Debug, Clone)]
pub struct NewJob<T> {
    data: T,
    name: String,
    max_attempts: Option<u32>,
    priority: i32,
    queue: Option<String>,
    /// Delay before the job becomes eligible for execution.
    delay: std::time::Duration,
}

impl<T> NewJob<T> {
    /// Create a new `NewJob` wrapping the provided payload.
    pub fn new(data: T) -> Self {
        Self {
            data,
            name: short_type_name::<T>().to_owned(),
            max_attempts: None,
            priority: 0,
            queue: None,
            delay: std::time::Duration::ZERO,
        }
    }

    /// Override the label used in log lines.
    pub fn name(self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self
        }
    }

    /// Set how many attempts the job gets before it fails for good.
    pub fn max_attempts(self, max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..self
        }
    }

    /// Lower values run first.
    pub fn priority(self, priority: i32) -> Self {
        Self { priority, ..self }
    }

    pub fn queue(self, queue: impl Into<String>) -> Self {
        Self {
            queue: Some(queue.into()),
            ..self
        }
    }

    /// Delay the job's execution by the provided duration.
    pub fn delay(self, delay: std::time::Duration) -> Self {
        Self { delay, ..self }
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn job_name(&self) -> &str {
        &self.name
    }

    pub fn job_max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    pub fn job_priority(&self) -> i32 {
        self.priority
    }

    pub fn job_queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    /// When the job becomes runnable, counted from `now`.
    pub fn run_at(&self, now: SystemTime) -> SystemTime {
        now.checked_add(self.delay.min(MAX_DELAY)).unwrap_or(now)
    }

    /// Extract the wrapped job payload.
    pub fn into_inner(self) -> T {
        self.data
    }
}

impl<T> From<T> for NewJob<T> {
    fn from(value: T) -> Self {
        NewJob::new(value)
    }
}

// `my_app::jobs::SendEmail<u8>` -> `SendEmail<u8>`
fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    let head = full.split('<').next().unwrap_or(full);
    match head.rfind("::") {
        Some(index) => &full[index + 2..],
        None => full,
    }
}
