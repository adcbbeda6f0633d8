//! Process-local backend.
//!
//! Keeps every job behind one mutex, so a claim is atomic with respect to
//! every other worker sharing the same `MemoryBackend` (clones share the
//! store). Useful for tests and single-process deployments.
use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, SystemTime},
};

use parking_lot::Mutex;

use crate::{
    backend::{Backend, WorkerInfo},
    error::BackendError,
    job::{Job, JobId, JobInfo, NewJob},
};

/// Claims older than this are considered abandoned by a crashed worker.
pub const DEFAULT_MAX_RUN_TIME: Duration = Duration::from_secs(4 * 60 * 60);

struct State<D> {
    next_id: i64,
    jobs: BTreeMap<JobId, (JobInfo, D)>,
}

pub struct MemoryBackend<D> {
    state: Arc<Mutex<State<D>>>,
    max_run_time: Duration,
}

impl<D> Clone for MemoryBackend<D> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            max_run_time: self.max_run_time,
        }
    }
}

impl<D> Default for MemoryBackend<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> std::fmt::Debug for MemoryBackend<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("jobs", &self.len())
            .field("max_run_time", &self.max_run_time)
            .finish()
    }
}

impl<D> MemoryBackend<D> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                next_id: 1,
                jobs: BTreeMap::new(),
            })),
            max_run_time: DEFAULT_MAX_RUN_TIME,
        }
    }

    /// Change how long a claim is honoured before other workers may take
    /// the job over.
    pub fn with_max_run_time(self, max_run_time: Duration) -> Self {
        Self {
            max_run_time,
            ..self
        }
    }

    /// Store a new job and return its id.
    pub fn enqueue(&self, job: impl Into<NewJob<D>>) -> JobId {
        let job = job.into();
        let now = SystemTime::now();
        let mut state = self.state.lock();
        let id = JobId(state.next_id);
        state.next_id += 1;

        let info = JobInfo {
            id,
            name: job.job_name().to_owned(),
            attempts: 0,
            max_attempts: job.job_max_attempts(),
            last_error: None,
            priority: job.job_priority(),
            queue: job.job_queue().map(str::to_owned),
            run_at: job.run_at(now),
            locked_by: None,
            locked_at: None,
            failed_at: None,
        };
        state.jobs.insert(id, (info, job.into_inner()));
        tracing::trace!(job_id = %id, "Enqueued job");
        id
    }

    /// Current bookkeeping of a stored job.
    pub fn get(&self, id: JobId) -> Option<JobInfo> {
        self.state.lock().jobs.get(&id).map(|(info, _)| info.clone())
    }

    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Jobs that failed for good.
    pub fn failed(&self) -> Vec<JobInfo> {
        self.state
            .lock()
            .jobs
            .values()
            .filter(|(info, _)| info.is_failed())
            .map(|(info, _)| info.clone())
            .collect()
    }

    fn is_available(&self, info: &JobInfo, worker: &WorkerInfo, now: SystemTime) -> bool {
        if info.is_failed() || info.run_at > now || !worker.accepts(info) {
            return false;
        }
        match (&info.locked_by, info.locked_at) {
            (None, _) => true,
            (Some(owner), _) if *owner == worker.name => true,
            (Some(_), Some(locked_at)) => locked_at
                .checked_add(self.max_run_time)
                .is_some_and(|expires| expires <= now),
            (Some(_), None) => false,
        }
    }

    /// Ids of available jobs in claim order: priority, then `run_at`, then id.
    fn candidates(
        &self,
        state: &State<D>,
        worker: &WorkerInfo,
        limit: usize,
        now: SystemTime,
    ) -> Vec<JobId> {
        let mut available: Vec<&JobInfo> = state
            .jobs
            .values()
            .map(|(info, _)| info)
            .filter(|info| self.is_available(info, worker, now))
            .collect();
        available.sort_by_key(|info| (info.priority, info.run_at, info.id));
        available.into_iter().take(limit).map(|info| info.id).collect()
    }

    fn update(&self, job: &JobInfo, apply: impl FnOnce(&mut JobInfo)) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        match state.jobs.get_mut(&job.id) {
            Some((info, _)) => {
                apply(info);
                Ok(())
            }
            None => Err(BackendError::permanent(format!("job {} not found", job.id))),
        }
    }
}

impl<D> Backend for MemoryBackend<D>
where
    D: Clone + Send + 'static,
{
    type Data = D;

    async fn reserve(
        &self,
        worker: &WorkerInfo,
        batch_size: usize,
    ) -> Result<Vec<Job<D>>, BackendError> {
        let now = SystemTime::now();
        let mut state = self.state.lock();
        let ids = self.candidates(&state, worker, batch_size, now);

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((info, data)) = state.jobs.get_mut(&id) {
                info.locked_by = Some(worker.name.clone());
                info.locked_at = Some(now);
                jobs.push(Job::from_parts(info.clone(), data.clone()));
            }
        }
        Ok(jobs)
    }

    async fn find_available(
        &self,
        worker: &WorkerInfo,
        limit: usize,
        now: SystemTime,
    ) -> Result<Vec<Job<D>>, BackendError> {
        let state = self.state.lock();
        let jobs = self
            .candidates(&state, worker, limit, now)
            .into_iter()
            .filter_map(|id| state.jobs.get(&id))
            .map(|(info, data)| Job::from_parts(info.clone(), data.clone()))
            .collect();
        Ok(jobs)
    }

    async fn destroy(&self, job: &JobInfo) -> Result<(), BackendError> {
        // Idempotent.
        self.state.lock().jobs.remove(&job.id);
        Ok(())
    }

    async fn persist_failure(&self, job: &JobInfo) -> Result<(), BackendError> {
        self.update(job, |info| {
            info.attempts = job.attempts;
            info.last_error = job.last_error.clone();
            info.run_at = job.run_at;
            info.locked_by = None;
            info.locked_at = None;
        })
    }

    async fn mark_permanently_failed(&self, job: &JobInfo) -> Result<(), BackendError> {
        self.update(job, |info| {
            info.attempts = job.attempts;
            info.last_error = job.last_error.clone();
            info.failed_at = Some(job.failed_at.unwrap_or_else(SystemTime::now));
            info.locked_by = None;
            info.locked_at = None;
        })
    }

    async fn clear_locks(&self, worker: &WorkerInfo) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        for (info, _) in state.jobs.values_mut() {
            if info.locked_by.as_deref() == Some(worker.name.as_str()) {
                info.locked_by = None;
                info.locked_at = None;
            }
        }
        Ok(())
    }
}
