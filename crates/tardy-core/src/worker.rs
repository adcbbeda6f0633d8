//! Worker engine and builder.
//!
//! Claim a batch, run it, finalize every job, claim again. The worker only
//! sleeps after a poll that produced nothing, and both that sleep and the
//! gaps between jobs watch the shutdown signal. Running handlers are never
//! interrupted.
use std::{
    panic::AssertUnwindSafe,
    pin::Pin,
    time::{Duration, Instant, SystemTime},
};

use futures::{FutureExt as _, StreamExt as _, future::Fuse, stream::FuturesUnordered};
use tracing::Level;

use crate::{
    JobHandler,
    backend::{Backend, WorkerInfo},
    config::WorkerConfig,
    error::{BackendError, BoxError, PanicError, WorkerError},
    hooks::JobHooks,
    job::{Job, JobInfo},
    retry::{Backoff, JobFailureDecision, RetryPolicy, StoreErrorDecision},
};

/// Jobs finished by [`Worker::work_off`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkOff {
    pub succeeded: usize,
    pub failed: usize,
}

impl WorkOff {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }
}

impl std::ops::AddAssign for WorkOff {
    fn add_assign(&mut self, other: Self) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
    }
}

enum JobOutcome {
    Succeeded,
    Failed,
}

/// Format of every per-job log line.
pub fn job_message(job: &JobInfo, message: &str) -> String {
    format!("Job {} (id={}) {}", job.name, job.id, message)
}

/// Backend + handler + hooks + frozen configuration.
pub struct Worker<B, F, M, H = ()>
where
    B: Backend,
    F: JobHandler<M, Data = B::Data>,
{
    backend: B,
    handler: F,
    context: F::Context,
    hooks: H,
    config: WorkerConfig,
    info: WorkerInfo,
    policy: RetryPolicy,
    // Consecutive `reserve` failures; only the polling path touches it.
    failed_reserve_count: usize,
    marker: std::marker::PhantomData<fn() -> M>,
}

impl<B, F, M, H> Worker<B, F, M, H>
where
    B: Backend + Sync,
    F: JobHandler<M, Data = B::Data>,
    F::Context: Clone,
    M: 'static,
    H: JobHooks,
{
    /// Name recorded as the lock owner of claimed jobs.
    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn backend_ref(&self) -> &B {
        &self.backend
    }

    pub fn failed_reserve_count(&self) -> usize {
        self.failed_reserve_count
    }

    /// Add a shutdown signal, checked between jobs and between polls.
    pub fn with_graceful_shutdown<Signal>(
        self,
        signal: Signal,
    ) -> WorkerWithGracefulShutdown<B, F, M, H, Signal>
    where
        Signal: Future<Output = ()> + Send,
    {
        WorkerWithGracefulShutdown {
            worker: self,
            signal,
        }
    }

    /// Run until `exit_on_complete` sees an empty poll, or until a fatal
    /// error. Without `exit_on_complete` this only returns on error.
    pub async fn run(self) -> Result<(), WorkerError> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Poll at most `iterations` times, stopping early once a poll yields
    /// no jobs. Backend failures count toward the ceiling across calls.
    pub async fn work_off(&mut self, iterations: usize) -> Result<WorkOff, WorkerError> {
        let mut stop = StopSignal::new(std::future::pending::<()>());
        let mut total = WorkOff::default();
        for _ in 0..iterations {
            match self.work_off_once(&mut stop).await? {
                Some(report) => total += report,
                None => break,
            }
        }
        Ok(total)
    }

    /// Log `message` about `job` at the configured level.
    pub fn job_say(&self, job: &JobInfo, message: &str) {
        self.job_say_at(job, message, self.config.log_level);
    }

    pub fn job_say_at(&self, job: &JobInfo, message: &str, level: Level) {
        say(level, &self.info.name, &job_message(job, message));
    }

    async fn run_until<Signal>(mut self, signal: Signal) -> Result<(), WorkerError>
    where
        Signal: Future,
    {
        let mut stop = StopSignal::new(signal);
        tracing::info!(worker = %self.info.name, "Starting job worker");

        let result = self.run_loop(&mut stop).await;

        if let Err(error) = self.backend.clear_locks(&self.info).await {
            tracing::error!(error = %error, worker = %self.info.name, "Failed to clear job locks");
        }
        match &result {
            Ok(()) => tracing::info!(worker = %self.info.name, "Exiting job worker"),
            Err(error) => {
                tracing::error!(error = %error, worker = %self.info.name, "Job worker stopped")
            }
        }
        result
    }

    async fn run_loop<Signal>(&mut self, stop: &mut StopSignal<Signal>) -> Result<(), WorkerError>
    where
        Signal: Future,
    {
        loop {
            if stop.is_requested() {
                return Ok(());
            }

            let started = Instant::now();
            match self.work_off_once(stop).await? {
                Some(report) => {
                    let elapsed = started.elapsed().as_secs_f64();
                    let rate = if elapsed > 0.0 {
                        report.total() as f64 / elapsed
                    } else {
                        0.0
                    };
                    tracing::info!(
                        worker = %self.info.name,
                        "{} jobs processed at {:.4} j/s, {} failed",
                        report.total(),
                        rate,
                        report.failed
                    );
                }
                None if self.config.exit_on_complete => {
                    tracing::info!(worker = %self.info.name, "No more jobs available. Exiting");
                    return Ok(());
                }
                None => {
                    if stop.sleep(self.config.sleep_delay).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// One poll. `None` when nothing was claimed (empty or failed poll).
    async fn work_off_once<Signal>(
        &mut self,
        stop: &mut StopSignal<Signal>,
    ) -> Result<Option<WorkOff>, WorkerError>
    where
        Signal: Future,
    {
        let jobs = self.reserve_jobs().await?;
        if jobs.is_empty() {
            return Ok(None);
        }
        self.drain_batch(jobs, stop).await.map(Some)
    }

    async fn reserve_jobs(&mut self) -> Result<Vec<Job<B::Data>>, WorkerError> {
        let reserved = self
            .backend
            .reserve(&self.info, self.config.read_ahead)
            .await;

        match reserved {
            Ok(jobs) => {
                self.failed_reserve_count = 0;
                tracing::trace!(worker = %self.info.name, count = jobs.len(), "Reserved jobs");
                Ok(jobs)
            }
            Err(error) => {
                tracing::error!(error = %error, worker = %self.info.name, "Error while reserving job");
                if let Err(recover_error) = self.backend.recover_from(&error).await {
                    tracing::error!(
                        error = %recover_error,
                        worker = %self.info.name,
                        "Backend failed to recover from reservation error"
                    );
                }

                self.failed_reserve_count += 1;
                if self.failed_reserve_count >= self.config.max_backend_failures {
                    return Err(WorkerError::FatalBackend {
                        failures: self.failed_reserve_count,
                        source: error,
                    });
                }
                Ok(Vec::new())
            }
        }
    }

    /// Run a claimed batch with at most `concurrency` jobs in flight.
    ///
    /// A store error does not abandon the rest of the batch; the first one
    /// is returned once every started job has been finalized.
    async fn drain_batch<Signal>(
        &self,
        jobs: Vec<Job<B::Data>>,
        stop: &mut StopSignal<Signal>,
    ) -> Result<WorkOff, WorkerError>
    where
        Signal: Future,
    {
        let concurrency = self.config.concurrency.max(1);
        let mut pending = jobs.into_iter();
        let mut in_flight = FuturesUnordered::new();
        let mut report = WorkOff::default();
        let mut first_error = None;

        loop {
            while in_flight.len() < concurrency && !stop.is_requested() {
                let Some(job) = pending.next() else {
                    break;
                };
                in_flight.push(self.run_job(job));
            }

            let Some(outcome) = in_flight.next().await else {
                break;
            };
            match outcome {
                Ok(JobOutcome::Succeeded) => report.succeeded += 1,
                Ok(JobOutcome::Failed) => report.failed += 1,
                Err(error) => {
                    first_error.get_or_insert(error);
                }
            }
        }

        if pending.len() > 0 {
            // Still locked by us; `clear_locks` hands them back on exit.
            tracing::debug!(
                worker = %self.info.name,
                skipped = pending.len(),
                "Shutdown requested, leaving claimed jobs unstarted"
            );
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(report),
        }
    }

    async fn run_job(&self, job: Job<B::Data>) -> Result<JobOutcome, WorkerError> {
        let (data, info) = job.split_parts();
        self.job_say(&info, "RUNNING");
        self.run_hook(&info, "before", self.hooks.before(&info));

        let started = Instant::now();
        let invocation = self.handler.clone().call(data, self.context.clone());
        let result = AssertUnwindSafe(invocation)
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(Box::new(PanicError::from_payload(panic)) as BoxError));

        match &result {
            Ok(()) => self.run_hook(&info, "success", self.hooks.success(&info)),
            Err(error) => self.run_hook(&info, "error", self.hooks.error(&info, error)),
        }
        self.run_hook(&info, "after", self.hooks.after(&info));

        match result {
            Ok(()) => self.complete(info, started).await,
            Err(error) => self.handle_failed_job(info, error).await,
        }
    }

    async fn complete(&self, mut info: JobInfo, started: Instant) -> Result<JobOutcome, WorkerError> {
        let destroyed = self
            .finalize(&info, "destroy", || self.backend.destroy(&info))
            .await;

        if let Err(error) = destroyed {
            // The attempt count stays: the handler itself succeeded.
            info.last_error = Some(error.to_string());
            self.job_say_at(&info, &format!("could not be removed: {error}"), Level::ERROR);
            if let Err(persist_error) = self.backend.persist_failure(&info).await {
                tracing::error!(
                    error = %persist_error,
                    job_id = %info.id,
                    "Failed to record store error on job"
                );
            }
            return Err(WorkerError::Store {
                job_id: info.id,
                source: error,
            });
        }

        self.job_say(
            &info,
            &format!("COMPLETED after {:.4}", started.elapsed().as_secs_f64()),
        );
        Ok(JobOutcome::Succeeded)
    }

    async fn handle_failed_job(
        &self,
        mut info: JobInfo,
        error: BoxError,
    ) -> Result<JobOutcome, WorkerError> {
        let now = SystemTime::now();
        let decision = self.policy.on_job_failure(&info, now);
        info.last_error = Some(error.to_string());

        let finalized = match decision {
            JobFailureDecision::Reschedule { attempts, run_at } => {
                info.attempts = attempts;
                info.run_at = run_at;
                self.job_say_at(
                    &info,
                    &format!("failed with {error} - {attempts} failed attempts"),
                    Level::ERROR,
                );
                self.finalize(&info, "persist_failure", || {
                    self.backend.persist_failure(&info)
                })
                .await
            }
            JobFailureDecision::Fail { attempts } => {
                info.attempts = attempts;
                info.failed_at = Some(now);
                self.job_say_at(
                    &info,
                    &format!("REMOVED permanently because of {attempts} consecutive failures"),
                    Level::ERROR,
                );
                self.run_hook(&info, "failure", self.hooks.failure(&info));
                self.finalize(&info, "mark_permanently_failed", || {
                    self.backend.mark_permanently_failed(&info)
                })
                .await
            }
        };

        finalized.map_err(|source| WorkerError::Store {
            job_id: info.id,
            source,
        })?;
        Ok(JobOutcome::Failed)
    }

    /// Run a store write, repeating it while the policy calls the error
    /// transient and retries remain.
    async fn finalize<Op, Fut>(
        &self,
        job: &JobInfo,
        action: &'static str,
        mut op: Op,
    ) -> Result<(), BackendError>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<(), BackendError>>,
    {
        let mut retries = 0;
        loop {
            let error = match op().await {
                Ok(()) => return Ok(()),
                Err(error) => error,
            };
            match self.policy.on_store_error(retries, &error) {
                StoreErrorDecision::Retry => {
                    retries += 1;
                    tracing::warn!(
                        error = %error,
                        job_id = %job.id,
                        action,
                        retries,
                        "Transient store error, retrying"
                    );
                }
                StoreErrorDecision::Raise => return Err(error),
            }
        }
    }

    fn run_hook(&self, job: &JobInfo, hook: &'static str, result: Result<(), BoxError>) {
        if let Err(error) = result {
            tracing::warn!(error = %error, job_id = %job.id, hook, "Job hook failed");
        }
    }
}

/// Worker variant that reacts to a shutdown signal.
pub struct WorkerWithGracefulShutdown<B, F, M, H, Signal>
where
    B: Backend,
    F: JobHandler<M, Data = B::Data>,
{
    worker: Worker<B, F, M, H>,
    signal: Signal,
}

impl<B, F, M, H, Signal> WorkerWithGracefulShutdown<B, F, M, H, Signal>
where
    B: Backend + Sync,
    F: JobHandler<M, Data = B::Data>,
    F::Context: Clone,
    M: 'static,
    H: JobHooks,
    Signal: Future<Output = ()> + Send,
{
    /// Run until shutdown, `exit_on_complete`, or a fatal error. Jobs
    /// already running are finished first.
    pub async fn run(self) -> Result<(), WorkerError> {
        self.worker.run_until(self.signal).await
    }
}

/// Shutdown future that can be checked without blocking.
struct StopSignal<Signal: Future> {
    signal: Pin<Box<Fuse<Signal>>>,
    requested: bool,
}

impl<Signal: Future> StopSignal<Signal> {
    fn new(signal: Signal) -> Self {
        Self {
            signal: Box::pin(signal.fuse()),
            requested: false,
        }
    }

    fn is_requested(&mut self) -> bool {
        if !self.requested && self.signal.as_mut().now_or_never().is_some() {
            tracing::debug!("received graceful shutdown signal");
            self.requested = true;
        }
        self.requested
    }

    /// Sleep for `delay` unless shutdown arrives first. Returns whether
    /// shutdown was requested.
    async fn sleep(&mut self, delay: Duration) -> bool {
        if self.is_requested() {
            return true;
        }
        let mut delay = futures_timer::Delay::new(delay).fuse();
        futures::select! {
            _ = delay => {},
            _ = self.signal.as_mut() => {
                tracing::debug!("received graceful shutdown signal while idle");
                self.requested = true;
            }
        }
        self.requested
    }
}

fn say(level: Level, worker: &str, text: &str) {
    if level == Level::ERROR {
        tracing::error!(worker, "{text}");
    } else if level == Level::WARN {
        tracing::warn!(worker, "{text}");
    } else if level == Level::INFO {
        tracing::info!(worker, "{text}");
    } else if level == Level::DEBUG {
        tracing::debug!(worker, "{text}");
    } else {
        tracing::trace!(worker, "{text}");
    }
}

/// Builder for `Worker`. Starts from the process-wide default config.
pub struct WorkerBuilder<Handler = (), M = (), Ctx = (), H = ()> {
    config: WorkerConfig,
    handler: Handler,
    context: Ctx,
    hooks: H,
    marker: std::marker::PhantomData<fn() -> M>,
}

impl Default for WorkerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerBuilder {
    /// Start from a snapshot of [`WorkerConfig::global`].
    pub fn new() -> Self {
        Self::with_config(WorkerConfig::global())
    }

    /// Start from an explicit configuration.
    pub fn with_config(config: WorkerConfig) -> Self {
        WorkerBuilder {
            config,
            handler: (),
            context: (),
            hooks: (),
            marker: std::marker::PhantomData,
        }
    }
}

impl<Handler, M, Ctx, H> WorkerBuilder<Handler, M, Ctx, H> {
    /// Jobs requested per poll. Raised to 1 when 0.
    pub fn read_ahead(mut self, read_ahead: usize) -> Self {
        self.config.read_ahead = read_ahead;
        self
    }

    /// Attempt ceiling for jobs that do not carry their own.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.config.max_attempts = max_attempts;
        self
    }

    pub fn exit_on_complete(mut self, exit_on_complete: bool) -> Self {
        self.config.exit_on_complete = exit_on_complete;
        self
    }

    /// Pause after a poll that found nothing.
    pub fn sleep_delay(mut self, sleep_delay: Duration) -> Self {
        self.config.sleep_delay = sleep_delay;
        self
    }

    pub fn max_backend_failures(mut self, max_backend_failures: usize) -> Self {
        self.config.max_backend_failures = max_backend_failures;
        self
    }

    pub fn transient_retry_limit(mut self, transient_retry_limit: usize) -> Self {
        self.config.transient_retry_limit = transient_retry_limit;
        self
    }

    /// Set concurrency (max in-flight jobs of one batch).
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.config.concurrency = concurrency;
        self
    }

    pub fn queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    pub fn min_priority(mut self, min_priority: i32) -> Self {
        self.config.min_priority = Some(min_priority);
        self
    }

    pub fn max_priority(mut self, max_priority: i32) -> Self {
        self.config.max_priority = Some(max_priority);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = Some(name.into());
        self
    }

    pub fn log_level(mut self, log_level: Level) -> Self {
        self.config.log_level = log_level;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.config.backoff = backoff;
        self
    }

    /// Attach lifecycle hooks.
    pub fn hooks<H2>(self, hooks: H2) -> WorkerBuilder<Handler, M, Ctx, H2>
    where
        H2: JobHooks,
    {
        let Self {
            config,
            handler,
            context,
            hooks: _,
            marker,
        } = self;
        WorkerBuilder {
            config,
            handler,
            context,
            hooks,
            marker,
        }
    }
}

impl<Ctx, H> WorkerBuilder<(), (), Ctx, H> {
    /// Provide the job handler.
    pub fn handler<F, M>(self, handler: F) -> WorkerBuilder<F, M, Ctx, H>
    where
        F: JobHandler<M>,
    {
        let Self {
            config,
            handler: _,
            context,
            hooks,
            marker: _,
        } = self;
        WorkerBuilder {
            config,
            handler,
            context,
            hooks,
            marker: std::marker::PhantomData,
        }
    }
}

impl<Handler, M, H> WorkerBuilder<Handler, M, (), H> {
    /// Attach shared context cloned for each job.
    pub fn context<Ctx>(self, context: Ctx) -> WorkerBuilder<Handler, M, Ctx, H>
    where
        Ctx: Clone + Send,
    {
        let Self {
            config,
            handler,
            context: _,
            hooks,
            marker,
        } = self;
        WorkerBuilder {
            config,
            handler,
            context,
            hooks,
            marker,
        }
    }
}

impl<Handler, M, H> WorkerBuilder<Handler, M, Handler::Context, H>
where
    Handler: JobHandler<M>,
    H: JobHooks,
{
    /// Finalize the worker with a backend that stores the handler's data type.
    pub fn build<B>(self, backend: B) -> Worker<B, Handler, M, H>
    where
        B: Backend<Data = Handler::Data>,
    {
        let Self {
            mut config,
            handler,
            context,
            hooks,
            marker,
        } = self;
        // A zero-sized poll never claims anything.
        config.read_ahead = config.read_ahead.max(1);
        let info = WorkerInfo {
            name: config.worker_name(),
            queues: config.queues.clone(),
            min_priority: config.min_priority,
            max_priority: config.max_priority,
        };
        let policy = RetryPolicy::from_config(&config);
        Worker {
            backend,
            handler,
            context,
            hooks,
            config,
            info,
            policy,
            failed_reserve_count: 0,
            marker,
        }
    }
}
