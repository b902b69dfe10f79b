use std::path::PathBuf;
use std::time::Duration;

/// Unified library error type.
///
/// Admission denials are not errors at this level: `check` reports them as an
/// [`AdmissionDecision`](crate::admission::AdmissionDecision). They only become
/// an error once the coordinator refuses to serve a request, see
/// [`ResolveError`](crate::coordinator::ResolveError).
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("Timed out after {waited:?} waiting for lock '{path}'")]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("Lock error on '{path}': {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("State error: {0}")]
    State(String),

    #[error("Cache error: {0}")]
    Cache(#[from] crate::cache::CacheError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl GateError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<serde_json::Error> for GateError {
    fn from(err: serde_json::Error) -> Self {
        Self::State(format!("JSON error: {err}"))
    }
}

impl From<rusqlite::Error> for GateError {
    fn from(err: rusqlite::Error) -> Self {
        tracing::error!(error = %err, "Database error");
        Self::Database(err.to_string())
    }
}
