//! Sync error types
//!
//! The taxonomy follows the failure classes the engine distinguishes when
//! deciding whether to retry, degrade or surface an error:
//! transport, quota, validation, store and state errors.

use crate::sync::validation::ValidationIssue;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// HTTP statuses the fetcher treats as transient
pub const RETRYABLE_STATUS_CODES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or HTTP failure talking to the upstream API
    #[error("Transport error{}: {message}", .status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default())]
    Transport {
        status: Option<u16>,
        message: String,
        retryable: bool,
    },

    /// Upstream quota exhausted (HTTP 429)
    #[error("Quota exceeded: {message}")]
    Quota {
        retry_after: Option<Duration>,
        message: String,
    },

    /// A fetched batch contained error-severity issues
    #[error("Validation failed for {series_id}: {} error(s)", .issues.len())]
    Validation {
        series_id: String,
        issues: Vec<ValidationIssue>,
    },

    /// Observation or checkpoint store failure
    #[error("Store error: {message}")]
    Store { message: String, transient: bool },

    /// Inconsistent sync state (e.g. resume without a checkpoint)
    #[error("State error: {0}")]
    State(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A retryable operation ran out of attempts
    #[error("Gave up after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<SyncError>,
    },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Build a transport error, classifying retryability from the status code.
    /// A missing status means the connection itself failed, which is retryable.
    pub fn transport(status: Option<u16>, message: impl Into<String>) -> Self {
        let retryable = match status {
            Some(code) => RETRYABLE_STATUS_CODES.contains(&code),
            None => true,
        };
        SyncError::Transport {
            status,
            message: message.into(),
            retryable,
        }
    }

    /// Build a non-retryable error for an unparseable upstream payload
    pub fn malformed(message: impl Into<String>) -> Self {
        SyncError::Transport {
            status: None,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn store(message: impl Into<String>, transient: bool) -> Self {
        SyncError::Store {
            message: message.into(),
            transient,
        }
    }

    /// Whether the retry policy may attempt the operation again
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Quota { .. } => true,
            SyncError::Store { transient, .. } => *transient,
            SyncError::Sqlite(e) => matches!(
                e.sqlite_error_code(),
                Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
            ),
            // r2d2 only fails a checkout when no connection freed up in time
            SyncError::Pool(_) => true,
            SyncError::DuckDb(e) => is_transient_duckdb_message(&e.to_string()),
            SyncError::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e
                        .status()
                        .map(|s| RETRYABLE_STATUS_CODES.contains(&s.as_u16()))
                        .unwrap_or(false)
            }
            _ => false,
        }
    }

    /// Server-provided wait hint, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SyncError::Quota { retry_after, .. } => *retry_after,
            SyncError::RetriesExhausted { last, .. } => last.retry_after(),
            _ => None,
        }
    }

    /// Last upstream HTTP status carried by this error
    pub fn status_code(&self) -> Option<u16> {
        match self {
            SyncError::Transport { status, .. } => *status,
            SyncError::Quota { .. } => Some(429),
            SyncError::Http(e) => e.status().map(|s| s.as_u16()),
            SyncError::RetriesExhausted { last, .. } => last.status_code(),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            SyncError::Cancelled(_) => true,
            SyncError::RetriesExhausted { last, .. } => last.is_cancelled(),
            _ => false,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::Transport { .. } => "TRANSPORT_ERROR",
            SyncError::Quota { .. } => "QUOTA_ERROR",
            SyncError::Validation { .. } => "VALIDATION_ERROR",
            SyncError::Store { .. } => "STORE_ERROR",
            SyncError::State(_) => "STATE_ERROR",
            SyncError::Config(_) => "CONFIG_ERROR",
            SyncError::Cancelled(_) => "CANCELLED",
            SyncError::NotFound(_) => "NOT_FOUND",
            SyncError::RetriesExhausted { .. } => "RETRIES_EXHAUSTED",
            SyncError::Sqlite(_) => "SQLITE_ERROR",
            SyncError::Pool(_) => "POOL_ERROR",
            SyncError::DuckDb(_) => "DUCKDB_ERROR",
            SyncError::Serialization(_) => "SERIALIZATION_ERROR",
            SyncError::Http(_) => "HTTP_ERROR",
            SyncError::Io(_) => "IO_ERROR",
            SyncError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Serializable error response for API consumers
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<&SyncError> for ErrorResponse {
    fn from(err: &SyncError) -> Self {
        ErrorResponse {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

impl Serialize for SyncError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        ErrorResponse::from(self).serialize(serializer)
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// DuckDB reports write conflicts and file lock contention only through
/// the message text
fn is_transient_duckdb_message(message: &str) -> bool {
    const TRANSIENT: [&str; 3] = ["Conflict", "Could not set lock", "IO Error"];
    TRANSIENT.iter().any(|marker| message.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        for code in RETRYABLE_STATUS_CODES {
            assert!(SyncError::transport(Some(code), "x").is_retryable(), "{}", code);
        }
        assert!(!SyncError::transport(Some(400), "bad request").is_retryable());
        assert!(!SyncError::transport(Some(404), "missing").is_retryable());
        assert!(SyncError::transport(None, "connection reset").is_retryable());
        assert!(!SyncError::malformed("not json").is_retryable());
    }

    #[test]
    fn test_quota_always_retryable() {
        let err = SyncError::Quota {
            retry_after: Some(Duration::from_secs(3)),
            message: "slow down".into(),
        };
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(err.status_code(), Some(429));
    }

    #[test]
    fn test_exhausted_keeps_last_status() {
        let err = SyncError::RetriesExhausted {
            attempts: 3,
            last: Box::new(SyncError::transport(Some(503), "unavailable")),
        };
        assert_eq!(err.status_code(), Some(503));
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("HTTP 503"));
    }

    #[test]
    fn test_error_response_code() {
        let err = SyncError::store("disk full", false);
        let response = ErrorResponse::from(&err);
        assert_eq!(response.code, "STORE_ERROR");
        assert!(response.message.contains("disk full"));

        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "STORE_ERROR");
    }

    #[test]
    fn test_busy_sqlite_is_retryable() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".into()),
        );
        assert!(SyncError::from(busy).is_retryable());

        let constraint = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        );
        assert!(!SyncError::from(constraint).is_retryable());
        assert!(!SyncError::from(rusqlite::Error::QueryReturnedNoRows).is_retryable());
    }

    #[test]
    fn test_pool_checkout_timeout_is_retryable() {
        let pool = r2d2::Pool::builder()
            .max_size(1)
            .connection_timeout(Duration::from_millis(50))
            .build(r2d2_sqlite::SqliteConnectionManager::memory())
            .unwrap();
        let _held = pool.get().unwrap();

        let err = SyncError::from(pool.get().unwrap_err());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_duckdb_conflicts_are_transient() {
        assert!(is_transient_duckdb_message(
            "TransactionContext Error: Conflict on tuple deletion!"
        ));
        assert!(is_transient_duckdb_message(
            "IO Error: Could not set lock on file \"series.duckdb\""
        ));
        assert!(!is_transient_duckdb_message(
            "Constraint Error: NOT NULL constraint failed: observations.value"
        ));
    }
}
