//! Backend-facing trait: claim jobs and persist their outcomes.
//!
//! Small surface, strong separation: the worker drives; the backend stores.
//!
//! - The backend owns the atomic claim. Two workers must never both get the
//!   same job back from `reserve`; the worker adds no locking of its own.
//! - Methods take `&self` so one worker can finalize several claimed jobs
//!   at once. Implementations synchronize internally (pool, mutex).
//! - Errors carry a [`BackendErrorKind`](crate::BackendErrorKind) so the
//!   worker knows which failures are worth retrying.
use crate::job::JobInfo;

/// Identity and filters of the worker asking for jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub name: String,
    /// Only claim jobs from these queues. Empty means every queue.
    pub queues: Vec<String>,
    pub min_priority: Option<i32>,
    pub max_priority: Option<i32>,
}

impl WorkerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queues: Vec::new(),
            min_priority: None,
            max_priority: None,
        }
    }

    /// Whether the queue and priority filters admit `job`.
    pub fn accepts(&self, job: &JobInfo) -> bool {
        let queue_ok = self.queues.is_empty()
            || job
                .queue
                .as_ref()
                .is_some_and(|queue| self.queues.contains(queue));
        let min_ok = self.min_priority.is_none_or(|min| job.priority >= min);
        let max_ok = self.max_priority.is_none_or(|max| job.priority <= max);
        queue_ok && min_ok && max_ok
    }
}

mod tmp {
    use crate::{
        backend::WorkerInfo,
        error::BackendError,
        job::{Job, JobInfo},
    };

    #[trait_variant::make(Backend: Send)]
    pub trait LocalBackend {
        type Data: Send + 'static;

        /// Atomically claim up to `batch_size` available jobs for `worker`.
        ///
        /// Returns an empty vector, not an error, when nothing is available.
        /// Implementations locate candidates the way
        /// [`find_available`](Self::find_available) does.
        #[allow(unused)]
        async fn reserve(
            &self,
            worker: &WorkerInfo,
            batch_size: usize,
        ) -> Result<Vec<Job<Self::Data>>, BackendError>;

        /// Query-only candidate search; claims nothing.
        #[allow(unused)]
        async fn find_available(
            &self,
            worker: &WorkerInfo,
            limit: usize,
            now: std::time::SystemTime,
        ) -> Result<Vec<Job<Self::Data>>, BackendError>;

        /// Remove a job that completed.
        #[allow(unused)]
        async fn destroy(&self, job: &JobInfo) -> Result<(), BackendError>;

        /// Store `attempts`, `last_error` and `run_at` and release the claim.
        #[allow(unused)]
        async fn persist_failure(&self, job: &JobInfo) -> Result<(), BackendError>;

        /// Store `attempts`, `last_error` and `failed_at`. The job stays in the
        /// store but is never claimed again.
        #[allow(unused)]
        async fn mark_permanently_failed(&self, job: &JobInfo) -> Result<(), BackendError>;

        /// Chance to self-heal after `reserve` failed, before the next poll.
        fn recover_from(
            &self,
            _error: &BackendError,
        ) -> impl Future<Output = Result<(), BackendError>> {
            async { Ok(()) }
        }

        /// Release every claim held by `worker`. Called when a run ends.
        fn clear_locks(
            &self,
            _worker: &WorkerInfo,
        ) -> impl Future<Output = Result<(), BackendError>> {
            async { Ok(()) }
        }
    }
}

pub use tmp::Backend;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobId;

    fn job(priority: i32, queue: Option<&str>) -> JobInfo {
        JobInfo {
            id: JobId(1),
            name: "Job".to_owned(),
            attempts: 0,
            max_attempts: None,
            last_error: None,
            priority,
            queue: queue.map(str::to_owned),
            run_at: std::time::SystemTime::UNIX_EPOCH,
            locked_by: None,
            locked_at: None,
            failed_at: None,
        }
    }

    #[test]
    fn unfiltered_worker_accepts_everything() {
        let worker = WorkerInfo::new("w");
        assert!(worker.accepts(&job(0, None)));
        assert!(worker.accepts(&job(100, Some("mail"))));
    }

    #[test]
    fn queue_filter_rejects_other_and_unqueued_jobs() {
        let mut worker = WorkerInfo::new("w");
        worker.queues = vec!["mail".to_owned()];
        assert!(worker.accepts(&job(0, Some("mail"))));
        assert!(!worker.accepts(&job(0, Some("reports"))));
        assert!(!worker.accepts(&job(0, None)));
    }

    #[test]
    fn priority_bounds_are_inclusive() {
        let mut worker = WorkerInfo::new("w");
        worker.min_priority = Some(-5);
        worker.max_priority = Some(5);
        assert!(worker.accepts(&job(-5, None)));
        assert!(worker.accepts(&job(5, None)));
        assert!(!worker.accepts(&job(6, None)));
        assert!(!worker.accepts(&job(-6, None)));
    }
}
