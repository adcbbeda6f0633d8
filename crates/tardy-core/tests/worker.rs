use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering::SeqCst},
    },
    time::{Duration, SystemTime},
};

use tardy_core::{
    Backend, BackendError, BackendErrorKind, BoxError, Job, JobData, JobHooks, JobInfo, JobResult, MemoryBackend,
    NewJob, WorkOff, WorkerBuilder, WorkerConfig, WorkerContext, WorkerError, WorkerInfo,
};

fn config(name: &str) -> WorkerConfig {
    WorkerConfig {
        name: Some(name.to_owned()),
        sleep_delay: Duration::from_millis(10),
        ..WorkerConfig::default()
    }
}

async fn succeed(JobData(_): JobData<u32>) -> JobResult {
    Ok(())
}

async fn fail(JobData(_): JobData<u32>) -> JobResult {
    Err("boom".into())
}

async fn explode(JobData(_): JobData<u32>) -> JobResult {
    panic!("kaboom")
}

async fn slow(JobData(_): JobData<u32>) -> JobResult {
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}

type Seen = Arc<Mutex<Vec<u32>>>;

async fn record(JobData(n): JobData<u32>, WorkerContext(seen): WorkerContext<Seen>) -> JobResult {
    seen.lock().unwrap().push(n);
    Ok(())
}

/// Delegates to a memory store but fails the first `failures` destroys.
struct FlakyDestroy {
    inner: MemoryBackend<u32>,
    kind: BackendErrorKind,
    failures_left: AtomicUsize,
    destroy_calls: AtomicUsize,
}

impl FlakyDestroy {
    fn new(inner: MemoryBackend<u32>, failures: usize) -> Self {
        Self::with_kind(inner, failures, BackendErrorKind::Transient)
    }

    fn with_kind(inner: MemoryBackend<u32>, failures: usize, kind: BackendErrorKind) -> Self {
        Self {
            inner,
            kind,
            failures_left: AtomicUsize::new(failures),
            destroy_calls: AtomicUsize::new(0),
        }
    }
}

impl Backend for FlakyDestroy {
    type Data = u32;

    async fn reserve(
        &self,
        worker: &WorkerInfo,
        batch_size: usize,
    ) -> Result<Vec<Job<u32>>, BackendError> {
        self.inner.reserve(worker, batch_size).await
    }

    async fn find_available(
        &self,
        worker: &WorkerInfo,
        limit: usize,
        now: SystemTime,
    ) -> Result<Vec<Job<u32>>, BackendError> {
        self.inner.find_available(worker, limit, now).await
    }

    async fn destroy(&self, job: &JobInfo) -> Result<(), BackendError> {
        self.destroy_calls.fetch_add(1, SeqCst);
        if self.failures_left.load(SeqCst) > 0 {
            self.failures_left.fetch_sub(1, SeqCst);
            return Err(BackendError::new(self.kind, "deadlock detected"));
        }
        self.inner.destroy(job).await
    }

    async fn persist_failure(&self, job: &JobInfo) -> Result<(), BackendError> {
        self.inner.persist_failure(job).await
    }

    async fn mark_permanently_failed(&self, job: &JobInfo) -> Result<(), BackendError> {
        self.inner.mark_permanently_failed(job).await
    }

    async fn clear_locks(&self, worker: &WorkerInfo) -> Result<(), BackendError> {
        self.inner.clear_locks(worker).await
    }
}

/// Fails the first `failures` writes of a failed attempt, then delegates.
struct FlakyPersist {
    inner: MemoryBackend<u32>,
    failures_left: AtomicUsize,
    write_calls: AtomicUsize,
}

impl FlakyPersist {
    fn new(inner: MemoryBackend<u32>, failures: usize) -> Self {
        Self {
            inner,
            failures_left: AtomicUsize::new(failures),
            write_calls: AtomicUsize::new(0),
        }
    }

    fn flake(&self) -> Result<(), BackendError> {
        self.write_calls.fetch_add(1, SeqCst);
        if self.failures_left.load(SeqCst) > 0 {
            self.failures_left.fetch_sub(1, SeqCst);
            return Err(BackendError::transient("could not serialize access"));
        }
        Ok(())
    }
}

impl Backend for FlakyPersist {
    type Data = u32;

    async fn reserve(
        &self,
        worker: &WorkerInfo,
        batch_size: usize,
    ) -> Result<Vec<Job<u32>>, BackendError> {
        self.inner.reserve(worker, batch_size).await
    }

    async fn find_available(
        &self,
        worker: &WorkerInfo,
        limit: usize,
        now: SystemTime,
    ) -> Result<Vec<Job<u32>>, BackendError> {
        self.inner.find_available(worker, limit, now).await
    }

    async fn destroy(&self, job: &JobInfo) -> Result<(), BackendError> {
        self.inner.destroy(job).await
    }

    async fn persist_failure(&self, job: &JobInfo) -> Result<(), BackendError> {
        self.flake()?;
        self.inner.persist_failure(job).await
    }

    async fn mark_permanently_failed(&self, job: &JobInfo) -> Result<(), BackendError> {
        self.flake()?;
        self.inner.mark_permanently_failed(job).await
    }
}

/// Fails the first `failures` reservations, then delegates.
struct FailingReserve {
    inner: MemoryBackend<u32>,
    failures_left: AtomicUsize,
    recoveries: AtomicUsize,
    recovered_from: Mutex<Vec<String>>,
}

impl FailingReserve {
    fn new(inner: MemoryBackend<u32>, failures: usize) -> Self {
        Self {
            inner,
            failures_left: AtomicUsize::new(failures),
            recoveries: AtomicUsize::new(0),
            recovered_from: Mutex::default(),
        }
    }
}

impl Backend for FailingReserve {
    type Data = u32;

    async fn reserve(
        &self,
        worker: &WorkerInfo,
        batch_size: usize,
    ) -> Result<Vec<Job<u32>>, BackendError> {
        if self.failures_left.load(SeqCst) > 0 {
            self.failures_left.fetch_sub(1, SeqCst);
            return Err(BackendError::transient("connection refused"));
        }
        self.inner.reserve(worker, batch_size).await
    }

    async fn find_available(
        &self,
        worker: &WorkerInfo,
        limit: usize,
        now: SystemTime,
    ) -> Result<Vec<Job<u32>>, BackendError> {
        self.inner.find_available(worker, limit, now).await
    }

    async fn destroy(&self, job: &JobInfo) -> Result<(), BackendError> {
        self.inner.destroy(job).await
    }

    async fn persist_failure(&self, job: &JobInfo) -> Result<(), BackendError> {
        self.inner.persist_failure(job).await
    }

    async fn mark_permanently_failed(&self, job: &JobInfo) -> Result<(), BackendError> {
        self.inner.mark_permanently_failed(job).await
    }

    async fn recover_from(&self, error: &BackendError) -> Result<(), BackendError> {
        self.recoveries.fetch_add(1, SeqCst);
        self.recovered_from.lock().unwrap().push(error.to_string());
        Ok(())
    }
}

/// Remembers the batch size of every reservation.
struct RecordingBackend {
    inner: MemoryBackend<u32>,
    batch_sizes: Mutex<Vec<usize>>,
}

impl Backend for RecordingBackend {
    type Data = u32;

    async fn reserve(
        &self,
        worker: &WorkerInfo,
        batch_size: usize,
    ) -> Result<Vec<Job<u32>>, BackendError> {
        self.batch_sizes.lock().unwrap().push(batch_size);
        self.inner.reserve(worker, batch_size).await
    }

    async fn find_available(
        &self,
        worker: &WorkerInfo,
        limit: usize,
        now: SystemTime,
    ) -> Result<Vec<Job<u32>>, BackendError> {
        self.inner.find_available(worker, limit, now).await
    }

    async fn destroy(&self, job: &JobInfo) -> Result<(), BackendError> {
        self.inner.destroy(job).await
    }

    async fn persist_failure(&self, job: &JobInfo) -> Result<(), BackendError> {
        self.inner.persist_failure(job).await
    }

    async fn mark_permanently_failed(&self, job: &JobInfo) -> Result<(), BackendError> {
        self.inner.mark_permanently_failed(job).await
    }
}

#[derive(Clone, Default)]
struct RecordingHooks {
    calls: Arc<Mutex<Vec<&'static str>>>,
}

impl RecordingHooks {
    fn push(&self, call: &'static str) -> Result<(), BoxError> {
        self.calls.lock().unwrap().push(call);
        Ok(())
    }

    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }
}

impl JobHooks for RecordingHooks {
    fn before(&self, _job: &JobInfo) -> Result<(), BoxError> {
        self.push("before")
    }

    fn success(&self, _job: &JobInfo) -> Result<(), BoxError> {
        self.push("success")
    }

    fn error(&self, _job: &JobInfo, _error: &BoxError) -> Result<(), BoxError> {
        self.push("error")
    }

    fn after(&self, _job: &JobInfo) -> Result<(), BoxError> {
        self.push("after")
    }

    fn failure(&self, _job: &JobInfo) -> Result<(), BoxError> {
        self.push("failure")
    }
}

struct BrokenHooks;

impl JobHooks for BrokenHooks {
    fn before(&self, _job: &JobInfo) -> Result<(), BoxError> {
        Err("before hook broke".into())
    }

    fn success(&self, _job: &JobInfo) -> Result<(), BoxError> {
        Err("success hook broke".into())
    }

    fn after(&self, _job: &JobInfo) -> Result<(), BoxError> {
        Err("after hook broke".into())
    }
}

#[tokio::test]
async fn runs_queued_jobs_then_exits_when_empty() {
    let backend = MemoryBackend::<u32>::new();
    backend.enqueue(1);
    backend.enqueue(2);
    let seen = Seen::default();

    let worker = WorkerBuilder::with_config(config("w"))
        .exit_on_complete(true)
        .handler(record)
        .context(seen.clone())
        .build(backend.clone());

    tokio::time::timeout(Duration::from_secs(2), worker.run())
        .await
        .expect("worker should exit on its own")
        .unwrap();

    let mut seen = seen.lock().unwrap().clone();
    seen.sort();
    assert_eq!(seen, vec![1, 2]);
    assert!(backend.is_empty());
}

#[tokio::test]
async fn exit_on_complete_with_empty_store_terminates() {
    let worker = WorkerBuilder::with_config(config("w"))
        .exit_on_complete(true)
        .sleep_delay(Duration::from_secs(60))
        .handler(succeed)
        .build(MemoryBackend::<u32>::new());

    let result = tokio::time::timeout(Duration::from_secs(2), worker.run()).await;
    assert!(matches!(result, Ok(Ok(()))));
}

#[tokio::test]
async fn transient_destroy_errors_are_retried() {
    let inner = MemoryBackend::<u32>::new();
    let id = inner.enqueue(1);

    let mut worker = WorkerBuilder::with_config(config("w"))
        .handler(succeed)
        .build(FlakyDestroy::new(inner.clone(), 3));

    let report = worker.work_off(1).await.unwrap();

    assert_eq!(report, WorkOff { succeeded: 1, failed: 0 });
    assert_eq!(worker.backend_ref().destroy_calls.load(SeqCst), 4);
    assert!(inner.get(id).is_none());
}

#[tokio::test]
async fn destroy_errors_past_retry_limit_are_raised() {
    let inner = MemoryBackend::<u32>::new();
    let id = inner.enqueue(1);

    let mut worker = WorkerBuilder::with_config(config("w"))
        .handler(succeed)
        .build(FlakyDestroy::new(inner.clone(), 4));

    let error = worker.work_off(1).await.unwrap_err();

    assert!(matches!(error, WorkerError::Store { job_id, .. } if job_id == id));
    assert!(error.backend_error().is_transient());
    assert_eq!(worker.backend_ref().destroy_calls.load(SeqCst), 4);

    let info = inner.get(id).expect("job must survive a failed destroy");
    assert_eq!(info.last_error.as_deref(), Some("deadlock detected"));
    assert_eq!(info.attempts, 0);
    assert_eq!(info.locked_by, None);
}

#[tokio::test]
async fn permanent_destroy_error_is_not_retried() {
    let inner = MemoryBackend::<u32>::new();
    let id = inner.enqueue(1);

    let mut worker = WorkerBuilder::with_config(config("w"))
        .handler(succeed)
        .build(FlakyDestroy::with_kind(
            inner.clone(),
            usize::MAX,
            BackendErrorKind::Permanent,
        ));

    let error = worker.work_off(1).await.unwrap_err();

    assert!(matches!(error, WorkerError::Store { job_id, .. } if job_id == id));
    assert_eq!(error.backend_error().kind(), BackendErrorKind::Permanent);
    assert_eq!(worker.backend_ref().destroy_calls.load(SeqCst), 1);
    assert!(inner.get(id).is_some());
}

#[tokio::test]
async fn transient_persist_errors_are_retried() {
    let inner = MemoryBackend::<u32>::new();
    let id = inner.enqueue(1);

    let mut worker = WorkerBuilder::with_config(config("w"))
        .handler(fail)
        .build(FlakyPersist::new(inner.clone(), 3));

    let report = worker.work_off(1).await.unwrap();

    assert_eq!(report, WorkOff { succeeded: 0, failed: 1 });
    assert_eq!(worker.backend_ref().write_calls.load(SeqCst), 4);
    let info = inner.get(id).unwrap();
    assert_eq!(info.attempts, 1);
    assert_eq!(info.last_error.as_deref(), Some("boom"));
}

#[tokio::test]
async fn persist_errors_past_retry_limit_are_raised() {
    let inner = MemoryBackend::<u32>::new();
    let id = inner.enqueue(1);

    let mut worker = WorkerBuilder::with_config(config("w"))
        .handler(fail)
        .build(FlakyPersist::new(inner.clone(), 4));

    let error = worker.work_off(1).await.unwrap_err();

    assert!(matches!(error, WorkerError::Store { job_id, .. } if job_id == id));
    assert!(error.backend_error().is_transient());
    assert_eq!(worker.backend_ref().write_calls.load(SeqCst), 4);
    assert_eq!(inner.get(id).unwrap().attempts, 0);
}

#[tokio::test]
async fn permanent_failure_writes_are_retried_within_limit() {
    let inner = MemoryBackend::<u32>::new();
    let ok = inner.enqueue(NewJob::new(1).max_attempts(1));

    let mut worker = WorkerBuilder::with_config(config("w"))
        .handler(fail)
        .build(FlakyPersist::new(inner.clone(), 3));
    assert_eq!(worker.work_off(1).await.unwrap().failed, 1);
    assert_eq!(worker.backend_ref().write_calls.load(SeqCst), 4);
    assert!(inner.get(ok).unwrap().is_failed());

    let inner = MemoryBackend::<u32>::new();
    let raised = inner.enqueue(NewJob::new(2).max_attempts(1));
    let mut worker = WorkerBuilder::with_config(config("w"))
        .handler(fail)
        .build(FlakyPersist::new(inner.clone(), 4));
    let error = worker.work_off(1).await.unwrap_err();
    assert!(matches!(error, WorkerError::Store { job_id, .. } if job_id == raised));
    assert_eq!(worker.backend_ref().write_calls.load(SeqCst), 4);
    assert!(!inner.get(raised).unwrap().is_failed());
}

#[tokio::test]
async fn repeated_reserve_failures_end_the_run() {
    let mut worker = WorkerBuilder::with_config(config("w"))
        .handler(succeed)
        .build(FailingReserve::new(MemoryBackend::new(), usize::MAX));

    for failures in 1..10 {
        let report = worker.work_off(1).await.unwrap();
        assert_eq!(report.total(), 0);
        assert_eq!(worker.failed_reserve_count(), failures);
    }

    let error = worker.work_off(1).await.unwrap_err();
    assert!(matches!(error, WorkerError::FatalBackend { failures: 10, .. }));
    assert_eq!(error.backend_error().to_string(), "connection refused");
    assert_eq!(worker.backend_ref().recoveries.load(SeqCst), 10);
    let recovered_from = worker.backend_ref().recovered_from.lock().unwrap().clone();
    assert_eq!(recovered_from, vec!["connection refused".to_owned(); 10]);
}

#[tokio::test]
async fn run_gives_up_after_reserve_failure_ceiling() {
    let worker = WorkerBuilder::with_config(config("w"))
        .sleep_delay(Duration::from_millis(1))
        .max_backend_failures(3)
        .handler(succeed)
        .build(FailingReserve::new(MemoryBackend::new(), usize::MAX));

    let result = tokio::time::timeout(Duration::from_secs(2), worker.run())
        .await
        .expect("worker should give up");
    assert!(matches!(
        result,
        Err(WorkerError::FatalBackend { failures: 3, .. })
    ));
}

#[tokio::test]
async fn successful_reserve_resets_failure_count() {
    let inner = MemoryBackend::<u32>::new();
    inner.enqueue(1);

    let mut worker = WorkerBuilder::with_config(config("w"))
        .handler(succeed)
        .build(FailingReserve::new(inner.clone(), 3));

    for _ in 0..3 {
        worker.work_off(1).await.unwrap();
    }
    assert_eq!(worker.failed_reserve_count(), 3);

    let report = worker.work_off(1).await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(worker.failed_reserve_count(), 0);
    assert!(inner.is_empty());
}

#[tokio::test]
async fn reserve_uses_configured_read_ahead() {
    let backend = RecordingBackend {
        inner: MemoryBackend::new(),
        batch_sizes: Mutex::default(),
    };
    let mut worker = WorkerBuilder::with_config(config("w"))
        .handler(succeed)
        .build(backend);
    worker.work_off(1).await.unwrap();
    assert_eq!(*worker.backend_ref().batch_sizes.lock().unwrap(), vec![5]);

    let backend = RecordingBackend {
        inner: MemoryBackend::new(),
        batch_sizes: Mutex::default(),
    };
    let mut worker = WorkerBuilder::with_config(config("w"))
        .read_ahead(15)
        .handler(succeed)
        .build(backend);
    worker.work_off(1).await.unwrap();
    assert_eq!(*worker.backend_ref().batch_sizes.lock().unwrap(), vec![15]);
}

#[tokio::test]
async fn failed_job_is_rescheduled_with_backoff() {
    let backend = MemoryBackend::<u32>::new();
    let id = backend.enqueue(1);
    let mut worker = WorkerBuilder::with_config(config("w"))
        .handler(fail)
        .build(backend.clone());

    let report = worker.work_off(1).await.unwrap();
    assert_eq!(report, WorkOff { succeeded: 0, failed: 1 });

    let info = backend.get(id).unwrap();
    assert_eq!(info.attempts, 1);
    assert_eq!(info.last_error.as_deref(), Some("boom"));
    assert_eq!(info.locked_by, None);
    assert!(info.failed_at.is_none());
    assert!(info.run_at > SystemTime::now());

    // Not runnable until the backoff expires.
    assert_eq!(worker.work_off(1).await.unwrap(), WorkOff::default());
}

#[tokio::test]
async fn job_out_of_attempts_fails_for_good() {
    let backend = MemoryBackend::<u32>::new();
    let id = backend.enqueue(NewJob::new(1).max_attempts(1));
    let hooks = RecordingHooks::default();
    let mut worker = WorkerBuilder::with_config(config("w"))
        .hooks(hooks.clone())
        .handler(fail)
        .build(backend.clone());

    let report = worker.work_off(1).await.unwrap();
    assert_eq!(report.failed, 1);

    let info = backend.get(id).unwrap();
    assert_eq!(info.attempts, 1);
    assert!(info.failed_at.is_some());
    assert_eq!(backend.failed().len(), 1);
    assert_eq!(hooks.calls(), vec!["before", "error", "after", "failure"]);

    assert_eq!(worker.work_off(1).await.unwrap(), WorkOff::default());
}

#[tokio::test]
async fn worker_default_max_attempts_applies_to_plain_jobs() {
    let backend = MemoryBackend::<u32>::new();
    let id = backend.enqueue(1);
    let mut worker = WorkerBuilder::with_config(config("w"))
        .max_attempts(1)
        .handler(fail)
        .build(backend.clone());

    worker.work_off(1).await.unwrap();
    assert!(backend.get(id).unwrap().is_failed());
}

#[tokio::test]
async fn panicking_handler_counts_as_failure() {
    let backend = MemoryBackend::<u32>::new();
    let id = backend.enqueue(1);
    let mut worker = WorkerBuilder::with_config(config("w"))
        .handler(explode)
        .build(backend.clone());

    let report = worker.work_off(1).await.unwrap();
    assert_eq!(report.failed, 1);

    let info = backend.get(id).unwrap();
    assert_eq!(info.attempts, 1);
    assert_eq!(info.last_error.as_deref(), Some("job panicked: kaboom"));
}

#[tokio::test]
async fn hooks_run_in_order_on_success() {
    let backend = MemoryBackend::<u32>::new();
    backend.enqueue(1);
    let hooks = RecordingHooks::default();
    let mut worker = WorkerBuilder::with_config(config("w"))
        .handler(succeed)
        .hooks(hooks.clone())
        .build(backend);

    worker.work_off(1).await.unwrap();
    assert_eq!(hooks.calls(), vec!["before", "success", "after"]);
}

#[tokio::test]
async fn failing_hooks_do_not_change_the_outcome() {
    let backend = MemoryBackend::<u32>::new();
    backend.enqueue(1);
    let mut worker = WorkerBuilder::with_config(config("w"))
        .hooks(BrokenHooks)
        .handler(succeed)
        .build(backend.clone());

    let report = worker.work_off(1).await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert!(backend.is_empty());
}

#[tokio::test]
async fn shutdown_signal_interrupts_idle_sleep() {
    let worker = WorkerBuilder::with_config(config("w"))
        .sleep_delay(Duration::from_secs(60))
        .handler(succeed)
        .build(MemoryBackend::<u32>::new());

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        worker
            .with_graceful_shutdown(tokio::time::sleep(Duration::from_millis(50)))
            .run(),
    )
    .await;
    assert!(matches!(result, Ok(Ok(()))));
}

#[tokio::test]
async fn shutdown_finishes_running_job_and_releases_the_rest() {
    let backend = MemoryBackend::<u32>::new();
    for n in 0..3 {
        backend.enqueue(n);
    }
    let worker = WorkerBuilder::with_config(config("w"))
        .sleep_delay(Duration::from_secs(60))
        .handler(slow)
        .build(backend.clone());

    tokio::time::timeout(
        Duration::from_secs(5),
        worker
            .with_graceful_shutdown(tokio::time::sleep(Duration::from_millis(20)))
            .run(),
    )
    .await
    .expect("worker should stop")
    .unwrap();

    assert_eq!(backend.len(), 2);
    let available = backend
        .find_available(&WorkerInfo::new("other"), 10, SystemTime::now())
        .await
        .unwrap();
    assert_eq!(available.len(), 2);
}

#[derive(Clone, Default)]
struct InFlight {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

async fn track(JobData(_): JobData<u32>, WorkerContext(flight): WorkerContext<InFlight>) -> JobResult {
    let running = flight.current.fetch_add(1, SeqCst) + 1;
    flight.peak.fetch_max(running, SeqCst);
    tokio::time::sleep(Duration::from_millis(20)).await;
    flight.current.fetch_sub(1, SeqCst);
    Ok(())
}

#[tokio::test]
async fn batch_runs_up_to_concurrency_jobs_at_once() {
    let backend = MemoryBackend::<u32>::new();
    for n in 0..4 {
        backend.enqueue(n);
    }
    let flight = InFlight::default();
    let mut worker = WorkerBuilder::with_config(config("w"))
        .read_ahead(4)
        .concurrency(2)
        .handler(track)
        .context(flight.clone())
        .build(backend.clone());

    let report = worker.work_off(1).await.unwrap();

    assert_eq!(report.succeeded, 4);
    assert_eq!(flight.peak.load(SeqCst), 2);
    assert!(backend.is_empty());
}

type Counts = Arc<Mutex<HashMap<u32, usize>>>;

async fn count(JobData(n): JobData<u32>, WorkerContext(counts): WorkerContext<Counts>) -> JobResult {
    tokio::task::yield_now().await;
    *counts.lock().unwrap().entry(n).or_default() += 1;
    Ok(())
}

#[tokio::test]
async fn workers_sharing_a_store_run_each_job_once() {
    let backend = MemoryBackend::<u32>::new();
    for n in 0..20 {
        backend.enqueue(n);
    }
    let counts = Counts::default();

    let build = |name: &str| {
        WorkerBuilder::with_config(config(name))
            .read_ahead(3)
            .exit_on_complete(true)
            .handler(count)
            .context(counts.clone())
            .build(backend.clone())
    };
    let (first, second) = (build("a"), build("b"));

    let (a, b) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(first.run(), second.run())
    })
    .await
    .expect("both workers should exit");
    a.unwrap();
    b.unwrap();

    let counts = counts.lock().unwrap();
    assert_eq!(counts.len(), 20);
    assert!(counts.values().all(|&runs| runs == 1));
    assert!(backend.is_empty());
}

async fn count_slowly(
    JobData(n): JobData<u32>,
    WorkerContext(counts): WorkerContext<Counts>,
) -> JobResult {
    tokio::time::sleep(Duration::from_millis(50)).await;
    *counts.lock().unwrap().entry(n).or_default() += 1;
    Ok(())
}

#[tokio::test]
async fn unnamed_workers_in_one_process_do_not_share_claims() {
    let backend = MemoryBackend::<u32>::new();
    for n in 0..4 {
        backend.enqueue(n);
    }
    let counts = Counts::default();
    let unnamed = WorkerConfig {
        sleep_delay: Duration::from_millis(10),
        ..WorkerConfig::default()
    };

    let build = || {
        WorkerBuilder::with_config(unnamed.clone())
            .read_ahead(2)
            .exit_on_complete(true)
            .handler(count_slowly)
            .context(counts.clone())
            .build(backend.clone())
    };
    let (first, second) = (build(), build());
    assert_ne!(first.name(), second.name());

    let (a, b) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(first.run(), second.run())
    })
    .await
    .expect("both workers should exit");
    a.unwrap();
    b.unwrap();

    let counts = counts.lock().unwrap();
    assert_eq!(counts.len(), 4);
    assert!(counts.values().all(|&runs| runs == 1));
    assert!(backend.is_empty());
}

#[tokio::test]
async fn workers_with_separate_stores_are_isolated() {
    let mine = MemoryBackend::<u32>::new();
    let theirs = MemoryBackend::<u32>::new();
    mine.enqueue(1);
    theirs.enqueue(2);

    let mut worker = WorkerBuilder::with_config(config("w"))
        .handler(succeed)
        .build(mine.clone());
    worker.work_off(5).await.unwrap();

    assert!(mine.is_empty());
    assert_eq!(theirs.len(), 1);
}
