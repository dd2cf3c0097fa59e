//! Unified error types for posa-offline.
//!
//! Every variant renders with a stable CODE prefix so callers on the other
//! side of a message boundary can classify a failure from its text alone.

use tokio_rusqlite::rusqlite;

/// Unified error type shared by every crate in the workspace.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid input parameters (e.g., empty key).
    #[error("INVALID_INPUT: {0}")]
    InvalidInput(String),

    /// Invalid or unsupported URL.
    #[error("INVALID_URL: {0}")]
    InvalidUrl(String),

    /// The network rejected or timed out a fetch.
    #[error("NETWORK_UNAVAILABLE: {0}")]
    NetworkUnavailable(String),

    /// HTTP response could not be read.
    #[error("HTTP_ERROR: {0}")]
    HttpError(String),

    /// No reply arrived from the background context before the deadline.
    #[error("WORKER_TIMEOUT: {kind} (call {id}) got no reply within {timeout_ms}ms")]
    WorkerTimeout { id: u64, kind: String, timeout_ms: u64 },

    /// The background context crashed or exited.
    #[error("WORKER_FATAL: {0}")]
    WorkerFatal(String),

    /// The channel was torn down while the call was outstanding.
    #[error("WORKER_DESTROYED: background context destroyed")]
    WorkerDestroyed,

    /// The background context answered with a named error reply.
    #[error("WORKER_ERROR: {0}")]
    Worker(String),

    /// A reply could not be matched to the protocol.
    #[error("PROTOCOL_ERROR: {0}")]
    Protocol(String),

    /// Database operation failed.
    #[error("STORAGE_ERROR: {0}")]
    Database(tokio_rusqlite::Error),

    /// Non-database storage failed (files, key/value stores).
    #[error("STORAGE_ERROR: {0}")]
    Storage(String),

    /// A chunk of a bulk write failed; earlier chunks stay committed.
    #[error("STORAGE_ERROR: chunk {chunk} of {total} failed: {reason}")]
    ChunkFailed { chunk: usize, total: usize, reason: String },

    /// Migration failed to apply.
    #[error("MIGRATION_FAILED: {0}")]
    MigrationFailed(String),

    /// One or more storage classes could not be cleared.
    #[error("PURGE_FAILED: {0}")]
    PurgeFailed(String),

    /// Configuration could not be loaded or is invalid.
    #[error("CONFIG_ERROR: {0}")]
    Config(String),

    /// JSON (de)serialization failed.
    #[error("INVALID_INPUT: json: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidInput(_) | Error::Json(_) => "INVALID_INPUT",
            Error::InvalidUrl(_) => "INVALID_URL",
            Error::NetworkUnavailable(_) => "NETWORK_UNAVAILABLE",
            Error::HttpError(_) => "HTTP_ERROR",
            Error::WorkerTimeout { .. } => "WORKER_TIMEOUT",
            Error::WorkerFatal(_) => "WORKER_FATAL",
            Error::WorkerDestroyed => "WORKER_DESTROYED",
            Error::Worker(_) => "WORKER_ERROR",
            Error::Protocol(_) => "PROTOCOL_ERROR",
            Error::Database(_) | Error::Storage(_) | Error::ChunkFailed { .. } => "STORAGE_ERROR",
            Error::MigrationFailed(_) => "MIGRATION_FAILED",
            Error::PurgeFailed(_) => "PURGE_FAILED",
            Error::Config(_) => "CONFIG_ERROR",
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::NetworkUnavailable(_) | Error::WorkerTimeout { .. })
    }
}

impl From<tokio_rusqlite::Error<Error>> for Error {
    fn from(err: tokio_rusqlite::Error<Error>) -> Self {
        match err {
            tokio_rusqlite::Error::Error(e) => e,
            tokio_rusqlite::Error::ConnectionClosed => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
            tokio_rusqlite::Error::Close(c) => Error::Database(tokio_rusqlite::Error::Close(c)),
            _ => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
        }
    }
}

impl From<tokio_rusqlite::Error<rusqlite::Error>> for Error {
    fn from(err: tokio_rusqlite::Error<rusqlite::Error>) -> Self {
        Error::Database(err)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(tokio_rusqlite::Error::Error(err))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::WorkerTimeout { id: 7, kind: "persist".into(), timeout_ms: 10_000 };
        let text = err.to_string();
        assert!(text.starts_with("WORKER_TIMEOUT"));
        assert!(text.contains("persist"));
        assert!(text.contains("10000ms"));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::WorkerDestroyed.code(), "WORKER_DESTROYED");
        assert_eq!(Error::Storage("disk full".into()).code(), "STORAGE_ERROR");
        assert_eq!(
            Error::ChunkFailed { chunk: 2, total: 3, reason: "x".into() }.code(),
            "STORAGE_ERROR"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(Error::NetworkUnavailable("offline".into()).is_retryable());
        assert!(!Error::WorkerFatal("boom".into()).is_retryable());
    }

    #[test]
    fn test_from_rusqlite() {
        let err: Error = rusqlite::Error::QueryReturnedNoRows.into();
        assert_eq!(err.code(), "STORAGE_ERROR");
    }
}
