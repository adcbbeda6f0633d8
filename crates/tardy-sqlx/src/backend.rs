use std::time::{Duration, SystemTime};

use serde::de::DeserializeOwned;
use tardy_core::{
    Backend, BackendError, BackendErrorKind, Job, JobId, JobInfo, WorkerInfo,
};

use crate::PgDateTime;

/// Claims older than this are considered abandoned by a crashed worker.
pub const DEFAULT_MAX_RUN_TIME: Duration = Duration::from_secs(4 * 60 * 60);

// SQLSTATEs worth retrying: deadlock, serialization failure, lock not
// available, query canceled (statement/lock timeout).
const TRANSIENT_SQLSTATES: &[&str] = &["40P01", "40001", "55P03", "57014"];

/// Categorize a database error for the worker's retry decisions.
pub fn classify(error: &sqlx::Error) -> BackendErrorKind {
    match error {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some(code) if TRANSIENT_SQLSTATES.contains(&code) || code.starts_with("08") => {
                BackendErrorKind::Transient
            }
            // integrity violation, data exception, syntax or access rule
            Some(code) if ["23", "22", "42"].iter().any(|class| code.starts_with(class)) => {
                BackendErrorKind::Permanent
            }
            _ => BackendErrorKind::Unknown,
        },
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => BackendErrorKind::Transient,
        sqlx::Error::RowNotFound
        | sqlx::Error::PoolClosed
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::Encode(_) => BackendErrorKind::Permanent,
        _ => BackendErrorKind::Unknown,
    }
}

fn db_error(error: sqlx::Error) -> BackendError {
    BackendError::new(classify(&error), error)
}

macro_rules! job_columns {
    () => {
        "id, name, queue, priority, attempts, max_attempts, job_data, last_error, \
         run_at, locked_at, locked_by, failed_at"
    };
}

// $1 now, $2 worker name, $3 stale lock cutoff, $4 queues, $5 min priority,
// $6 max priority
macro_rules! available_filter {
    () => {
        "failed_at IS NULL \
         AND run_at <= $1 \
         AND (locked_at IS NULL OR locked_by = $2 OR locked_at < $3) \
         AND (cardinality($4::text[]) = 0 OR queue = ANY($4)) \
         AND ($5::integer IS NULL OR priority >= $5) \
         AND ($6::integer IS NULL OR priority <= $6)"
    };
}

const FIND_AVAILABLE_SQL: &str = concat!(
    "SELECT ",
    job_columns!(),
    " FROM tardy_jobs WHERE ",
    available_filter!(),
    " ORDER BY priority, run_at, id LIMIT $7"
);

const RESERVE_SQL: &str = concat!(
    "WITH candidates AS (SELECT id FROM tardy_jobs WHERE ",
    available_filter!(),
    " ORDER BY priority, run_at, id LIMIT $7 FOR UPDATE SKIP LOCKED) \
     UPDATE tardy_jobs AS jobs SET locked_by = $2, locked_at = $1, updated_at = $1 \
     FROM candidates WHERE jobs.id = candidates.id RETURNING ",
    "jobs.id, jobs.name, jobs.queue, jobs.priority, jobs.attempts, jobs.max_attempts, \
     jobs.job_data, jobs.last_error, jobs.run_at, jobs.locked_at, jobs.locked_by, \
     jobs.failed_at"
);

const DESTROY_SQL: &str = "DELETE FROM tardy_jobs WHERE id = $1";

const PERSIST_FAILURE_SQL: &str = "UPDATE tardy_jobs \
     SET attempts = $2, last_error = $3, run_at = $4, \
         locked_at = NULL, locked_by = NULL, updated_at = now() \
     WHERE id = $1";

const MARK_FAILED_SQL: &str = "UPDATE tardy_jobs \
     SET attempts = $2, last_error = $3, failed_at = $4, \
         locked_at = NULL, locked_by = NULL, updated_at = now() \
     WHERE id = $1";

const CLEAR_LOCKS_SQL: &str =
    "UPDATE tardy_jobs SET locked_at = NULL, locked_by = NULL WHERE locked_by = $1";

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: i64,
    name: String,
    queue: Option<String>,
    priority: i32,
    attempts: i32,
    max_attempts: Option<i32>,
    job_data: serde_json::Value,
    last_error: Option<String>,
    run_at: PgDateTime,
    locked_at: Option<PgDateTime>,
    locked_by: Option<String>,
    failed_at: Option<PgDateTime>,
}

impl JobRow {
    fn into_parts(self) -> (JobInfo, serde_json::Value) {
        let info = JobInfo {
            id: JobId(self.id),
            name: self.name,
            attempts: u32::try_from(self.attempts).unwrap_or(0),
            max_attempts: self.max_attempts.and_then(|max| u32::try_from(max).ok()),
            last_error: self.last_error,
            priority: self.priority,
            queue: self.queue,
            run_at: self.run_at.0,
            locked_by: self.locked_by,
            locked_at: self.locked_at.map(|at| at.0),
            failed_at: self.failed_at.map(|at| at.0),
        };
        (info, self.job_data)
    }
}

fn attempts_column(job: &JobInfo) -> i32 {
    i32::try_from(job.attempts).unwrap_or(i32::MAX)
}

/// Backend for claiming and finalizing jobs stored in postgres.
///
/// `T` is the payload type; rows whose `job_data` does not deserialize into
/// `T` are marked failed by `reserve` instead of being handed to the worker.
#[derive(Debug)]
pub struct PostgresBackend<T> {
    pool: sqlx::PgPool,
    max_run_time: Duration,
    marker: std::marker::PhantomData<fn() -> T>,
}

impl<T> Clone for PostgresBackend<T> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            max_run_time: self.max_run_time,
            marker: std::marker::PhantomData,
        }
    }
}

impl<T> PostgresBackend<T> {
    pub const fn new(pool: sqlx::PgPool) -> Self {
        Self {
            pool,
            max_run_time: DEFAULT_MAX_RUN_TIME,
            marker: std::marker::PhantomData,
        }
    }

    /// Change how long a claim is honoured before other workers may take
    /// the job over.
    pub fn max_run_time(self, max_run_time: Duration) -> Self {
        Self {
            max_run_time,
            ..self
        }
    }

    pub fn pool(&self) -> &sqlx::PgPool {
        &self.pool
    }

    fn stale_cutoff(&self, now: SystemTime) -> PgDateTime {
        PgDateTime(
            now.checked_sub(self.max_run_time)
                .unwrap_or(SystemTime::UNIX_EPOCH),
        )
    }

    async fn write_permanent_failure(&self, job: &JobInfo) -> Result<(), BackendError> {
        let failed_at = job.failed_at.unwrap_or_else(SystemTime::now);
        sqlx::query(MARK_FAILED_SQL)
            .bind(job.id.0)
            .bind(attempts_column(job))
            .bind(job.last_error.as_deref())
            .bind(PgDateTime(failed_at))
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }
}

/// Split rows into jobs and the rows whose payload does not deserialize.
fn decode_rows<T>(rows: Vec<JobRow>) -> (Vec<Job<T>>, Vec<(JobInfo, serde_json::Error)>)
where
    T: DeserializeOwned,
{
    let mut jobs = Vec::with_capacity(rows.len());
    let mut undecodable = Vec::new();
    for row in rows {
        let (info, value) = row.into_parts();
        match serde_json::from_value::<T>(value) {
            Ok(data) => jobs.push(Job::from_parts(info, data)),
            Err(error) => undecodable.push((info, error)),
        }
    }
    (jobs, undecodable)
}

impl<T> Backend for PostgresBackend<T>
where
    T: DeserializeOwned + Send + 'static,
{
    type Data = T;

    async fn reserve(
        &self,
        worker: &WorkerInfo,
        batch_size: usize,
    ) -> Result<Vec<Job<T>>, BackendError> {
        let now = SystemTime::now();
        let mut rows: Vec<JobRow> = sqlx::query_as(RESERVE_SQL)
            .bind(PgDateTime(now))
            .bind(&worker.name)
            .bind(self.stale_cutoff(now))
            .bind(&worker.queues)
            .bind(worker.min_priority)
            .bind(worker.max_priority)
            .bind(i64::try_from(batch_size).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;

        // RETURNING does not keep the CTE's order.
        rows.sort_by_key(|row| (row.priority, row.run_at, row.id));
        tracing::trace!(worker = %worker.name, count = rows.len(), "Locked jobs");

        let (jobs, undecodable) = decode_rows(rows);
        for (mut info, error) in undecodable {
            tracing::error!(
                error = %error,
                job_id = %info.id,
                job_name = %info.name,
                "Failed to decode job payload, marking job failed"
            );
            info.last_error = Some(format!("failed to decode job payload: {error}"));
            info.failed_at = Some(SystemTime::now());
            self.write_permanent_failure(&info).await?;
        }
        Ok(jobs)
    }

    async fn find_available(
        &self,
        worker: &WorkerInfo,
        limit: usize,
        now: SystemTime,
    ) -> Result<Vec<Job<T>>, BackendError> {
        let rows: Vec<JobRow> = sqlx::query_as(FIND_AVAILABLE_SQL)
            .bind(PgDateTime(now))
            .bind(&worker.name)
            .bind(self.stale_cutoff(now))
            .bind(&worker.queues)
            .bind(worker.min_priority)
            .bind(worker.max_priority)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;

        let (jobs, undecodable) = decode_rows(rows);
        for (info, error) in undecodable {
            tracing::warn!(
                error = %error,
                job_id = %info.id,
                job_name = %info.name,
                "Skipping job with undecodable payload"
            );
        }
        Ok(jobs)
    }

    async fn destroy(&self, job: &JobInfo) -> Result<(), BackendError> {
        sqlx::query(DESTROY_SQL)
            .bind(job.id.0)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn persist_failure(&self, job: &JobInfo) -> Result<(), BackendError> {
        sqlx::query(PERSIST_FAILURE_SQL)
            .bind(job.id.0)
            .bind(attempts_column(job))
            .bind(job.last_error.as_deref())
            .bind(PgDateTime(job.run_at))
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn mark_permanently_failed(&self, job: &JobInfo) -> Result<(), BackendError> {
        self.write_permanent_failure(job).await
    }

    async fn recover_from(&self, error: &BackendError) -> Result<(), BackendError> {
        if !error.is_transient() {
            return Ok(());
        }
        // A dropped connection is replaced on the next acquire.
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        tracing::debug!("Database connection verified after reservation error");
        Ok(())
    }

    async fn clear_locks(&self, worker: &WorkerInfo) -> Result<(), BackendError> {
        let released = sqlx::query(CLEAR_LOCKS_SQL)
            .bind(&worker.name)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        tracing::debug!(
            worker = %worker.name,
            released = released.rows_affected(),
            "Released job locks"
        );
        Ok(())
    }
}
