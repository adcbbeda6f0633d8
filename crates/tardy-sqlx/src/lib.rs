//! PostgreSQL storage for tardy workers.
//!
//! [`PostgresBackend`] claims jobs with `FOR UPDATE SKIP LOCKED`, so any
//! number of worker processes can poll the same table. [`Client`] enqueues
//! jobs, optionally inside a caller's transaction.
pub use sqlx::PgPool;
pub use tardy_core;

pub mod backend;
pub mod client;

pub use backend::{PostgresBackend, classify};
pub use client::{Client, Error, ErrorKind};

/// DDL for the jobs table. Safe to run more than once.
pub const SCHEMA: &str = include_str!("schema.sql");

/// Create the jobs table and its index if they do not exist yet.
pub async fn install_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    tracing::debug!("Installed tardy_jobs schema");
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct PgDateTime(pub std::time::SystemTime);

impl sqlx::Type<sqlx::Postgres> for PgDateTime {
    fn type_info() -> <sqlx::Postgres as sqlx::Database>::TypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("timestamptz")
    }
}

const OUT_OF_RANGE_MESSAGE: &str = "timestamp out of range for PostgreSQL i64 micros";

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for PgDateTime {
    fn encode_by_ref(
        &self,
        buf: &mut <sqlx::Postgres as sqlx::Database>::ArgumentBuffer<'q>,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        let pg_us = to_pg_micros(self.0).ok_or(OUT_OF_RANGE_MESSAGE)?;
        sqlx::Encode::<sqlx::Postgres>::encode(pg_us, buf)
    }

    fn size_hint(&self) -> usize {
        std::mem::size_of::<i64>()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for PgDateTime {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let pg_us = <i64 as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        let time = from_pg_micros(pg_us).ok_or(OUT_OF_RANGE_MESSAGE)?;
        Ok(PgDateTime(time))
    }
}

/// `timestamptz` travels as microseconds since `2000-01-01 00:00:00 UTC`,
/// which is this many seconds after the UNIX epoch.
/// https://www.postgresql.org/docs/current/protocol-logicalrep-message-formats.html
const POSTGRESQL_EPOCH_DURATION: std::time::Duration = std::time::Duration::from_secs(946684800);

fn postgres_epoch() -> std::time::SystemTime {
    std::time::SystemTime::UNIX_EPOCH + POSTGRESQL_EPOCH_DURATION
}

fn to_pg_micros(time: std::time::SystemTime) -> Option<i64> {
    match time.duration_since(postgres_epoch()) {
        Ok(d) => i64::try_from(d.as_micros()).ok(),
        Err(e) => i64::try_from(e.duration().as_micros()).ok().map(|v| -v),
    }
}

fn from_pg_micros(pg_us: i64) -> Option<std::time::SystemTime> {
    let offset = std::time::Duration::from_micros(pg_us.unsigned_abs());
    if pg_us >= 0 {
        postgres_epoch().checked_add(offset)
    } else {
        postgres_epoch().checked_sub(offset)
    }
}
