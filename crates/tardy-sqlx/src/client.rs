//! Client utilities for enqueuing jobs into the `tardy_jobs` table.

use serde::Serialize;
use tardy_core::{JobId, NewJob};

use crate::PgDateTime;

const INSERT_SQL: &str = "INSERT INTO tardy_jobs \
     (name, queue, priority, max_attempts, job_data, run_at) \
     VALUES ($1, $2, $3, $4, $5, $6) RETURNING id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
/// Categories of errors that can occur when inserting a job.
pub enum ErrorKind {
    /// An error was returned by the database layer.
    DataBase,
    /// Serialization of the job data failed.
    Encode,
}

#[derive(Debug)]
/// Error type returned by [`Client`] operations.
pub struct Error {
    kind: ErrorKind,
    inner: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl Error {
    /// Return the category of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<sqlx::Error> for Error {
    fn from(value: sqlx::Error) -> Self {
        Self {
            kind: ErrorKind::DataBase,
            inner: Box::new(value),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self {
            kind: ErrorKind::Encode,
            inner: Box::new(value),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.inner.as_ref())
    }
}

/// Column values of one job, serialized up front.
struct JobValues {
    name: String,
    queue: Option<String>,
    priority: i32,
    max_attempts: Option<i32>,
    job_data: serde_json::Value,
    run_at: PgDateTime,
}

impl JobValues {
    fn new<T: Serialize>(job: &NewJob<T>, now: std::time::SystemTime) -> Result<Self, Error> {
        Ok(Self {
            name: job.job_name().to_owned(),
            queue: job.job_queue().map(str::to_owned),
            priority: job.job_priority(),
            max_attempts: job
                .job_max_attempts()
                .map(|max| i32::try_from(max).unwrap_or(i32::MAX)),
            job_data: serde_json::to_value(job.data())?,
            run_at: PgDateTime(job.run_at(now)),
        })
    }
}

/// A handle used to enqueue jobs into a PostgreSQL-backed queue.
#[derive(Debug)]
pub struct Client<T> {
    pool: sqlx::PgPool,
    data_type: std::marker::PhantomData<fn(T)>,
}

impl<T> Clone for Client<T> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            data_type: std::marker::PhantomData,
        }
    }
}

impl<T> Client<T> {
    /// Create a new client bound to the given connection pool.
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self {
            pool,
            data_type: std::marker::PhantomData,
        }
    }
}

impl<T> Client<T>
where
    T: Serialize + Sync,
{
    /// Insert a job using the client's connection pool.
    pub async fn insert(&self, job: &NewJob<T>) -> Result<JobId, Error> {
        let mut conn = self.pool.acquire().await?;
        self.insert_tx(job, &mut *conn).await
    }

    /// Insert a job using an existing transaction or connection, so the job
    /// only becomes visible if the caller's transaction commits.
    #[allow(clippy::manual_async_fn)]
    pub fn insert_tx<'a, 'c, A>(
        &self,
        job: &NewJob<T>,
        tx: A,
    ) -> impl Future<Output = Result<JobId, Error>> + Send
    where
        A: sqlx::Acquire<'c, Database = sqlx::Postgres> + Send + 'a,
    {
        async move {
            let values = JobValues::new(job, std::time::SystemTime::now())?;
            let mut conn = tx.acquire().await?;

            let id: i64 = sqlx::query_scalar(INSERT_SQL)
                .bind(values.name)
                .bind(values.queue)
                .bind(values.priority)
                .bind(values.max_attempts)
                .bind(values.job_data)
                .bind(values.run_at)
                .fetch_one(&mut *conn)
                .await?;

            tracing::debug!(job_id = id, job_name = %job.job_name(), "Enqueued job");
            Ok(JobId(id))
        }
    }

    /// Insert several jobs in one statement and one transaction.
    ///
    /// Ids come back in the order of `jobs`.
    pub async fn insert_batch<'job, I>(&self, jobs: I) -> Result<Vec<JobId>, Error>
    where
        I: IntoIterator<Item = &'job NewJob<T>>,
        T: 'job,
    {
        let now = std::time::SystemTime::now();
        let rows = jobs
            .into_iter()
            .map(|job| JobValues::new(job, now))
            .collect::<Result<Vec<_>, _>>()?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder = sqlx::QueryBuilder::<sqlx::Postgres>::new(
            "INSERT INTO tardy_jobs (name, queue, priority, max_attempts, job_data, run_at) ",
        );
        builder.push_values(rows, |mut row, values| {
            row.push_bind(values.name)
                .push_bind(values.queue)
                .push_bind(values.priority)
                .push_bind(values.max_attempts)
                .push_bind(values.job_data)
                .push_bind(values.run_at);
        });
        builder.push(" RETURNING id");

        let mut tx = self.pool.begin().await?;
        let ids: Vec<i64> = builder
            .build_query_scalar()
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::debug!(count = ids.len(), "Enqueued job batch");
        Ok(ids.into_iter().map(JobId).collect())
    }
}
