//! Error types shared by the worker and its backends.
//!
//! Backends classify their own failures into a [`BackendErrorKind`] so retry
//! decisions branch on a tag, never on message text.
use crate::job::JobId;

/// Boxed error returned by job handlers and hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// Categorization of store failures, filled in by the concrete backend.
pub enum BackendErrorKind {
    /// Contention the store expects to clear on its own (deadlock, lock wait
    /// timeout, serialization failure, dropped connection).
    Transient,
    /// Retrying cannot help (constraint violation, bad payload, closed pool).
    Permanent,
    /// The backend could not tell.
    Unknown,
}

#[derive(Debug)]
pub struct BackendError {
    kind: BackendErrorKind,
    inner: BoxError,
}

impl BackendError {
    pub fn new<E>(kind: BackendErrorKind, error: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self {
            kind,
            inner: error.into(),
        }
    }

    pub fn transient<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::new(BackendErrorKind::Transient, error)
    }

    pub fn permanent<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::new(BackendErrorKind::Permanent, error)
    }

    pub fn unknown<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::new(BackendErrorKind::Unknown, error)
    }

    /// Return the category of this error.
    pub fn kind(&self) -> BackendErrorKind {
        self.kind
    }

    pub fn is_transient(&self) -> bool {
        self.kind == BackendErrorKind::Transient
    }
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

impl std::error::Error for BackendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.inner.as_ref())
    }
}

/// Error that ends a worker run.
#[derive(Debug)]
pub enum WorkerError {
    /// `reserve` failed `failures` times in a row, reaching the ceiling.
    FatalBackend {
        failures: usize,
        source: BackendError,
    },
    /// Finalizing a job kept failing after the transient retries ran out.
    Store { job_id: JobId, source: BackendError },
}

impl WorkerError {
    /// The backend error behind this failure.
    pub fn backend_error(&self) -> &BackendError {
        match self {
            WorkerError::FatalBackend { source, .. } => source,
            WorkerError::Store { source, .. } => source,
        }
    }
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerError::FatalBackend { failures, source } => write!(
                f,
                "backend failed {failures} consecutive times while reserving jobs: {source}"
            ),
            WorkerError::Store { job_id, source } => {
                write!(f, "store error while finalizing job {job_id}: {source}")
            }
        }
    }
}

impl std::error::Error for WorkerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.backend_error())
    }
}

/// A job handler panicked.
#[derive(Debug)]
pub struct PanicError {
    message: String,
}

impl PanicError {
    pub(crate) fn from_payload(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_owned()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "unknown panic payload".to_owned()
        };
        Self { message }
    }
}

impl std::fmt::Display for PanicError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job panicked: {}", self.message)
    }
}

impl std::error::Error for PanicError {}
