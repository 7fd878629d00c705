//! Error types for the repository runtime.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Expected alternate outcomes (a migration that already ran, a database that already
//! exists) are not errors; see [`crate::migration::MigrationOutcome`] and
//! [`crate::storage::StorageOutcome`].

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Driver {
        message: String,
        /// MySQL error code, e.g. "1146" for an unknown table
        code: Option<String>,
        suggestion: String,
    },

    #[error("Timeout: {operation} exceeded {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Transaction error: {message} (task: {task})")]
    Transaction { message: String, task: String },

    #[error("Shape mismatch: {message}")]
    ShapeMismatch { message: String },

    #[error("Storage error: {output}")]
    Storage { output: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a driver error with an optional server error code.
    pub fn driver(
        message: impl Into<String>,
        code: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Driver {
            message: message.into(),
            code,
            suggestion: suggestion.into(),
        }
    }

    /// Create a timeout error for an operation bounded by `bound`.
    pub fn timeout(operation: impl Into<String>, bound: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms: bound.as_millis() as u64,
        }
    }

    /// Create a transaction error.
    pub fn transaction(message: impl Into<String>, task: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            task: task.into(),
        }
    }

    pub fn shape_mismatch(message: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            message: message.into(),
        }
    }

    /// Wrap unrecognized output of the provisioning tool.
    pub fn storage(output: impl Into<String>) -> Self {
        Self::Storage {
            output: output.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Driver { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    ///
    /// This is a classification for callers; nothing in this crate retries on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    /// Whether the connection that produced this error must not be reused.
    ///
    /// A timed-out statement may still be running server-side and a lost connection is
    /// unusable, so both retire the connection instead of returning it to the pool.
    pub fn invalidates_connection(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection URL format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                // Prefer the numeric server error over the SQLSTATE
                let code = db_err
                    .try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>()
                    .map(|e| e.number().to_string())
                    .or_else(|| db_err.code().map(|c| c.to_string()));
                DbError::driver(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::driver(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => {
                DbError::timeout("connection checkout", Duration::from_secs(30))
            }
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Start the repository again")
            }
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify ssl options and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::connection(
                "Database worker crashed",
                "Reconnect to the database",
            ),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::connection("Failed to connect", "Check credentials");
        assert!(err.to_string().contains("Connection failed"));
    }

    #[test]
    fn test_error_suggestion() {
        let err = DbError::driver("Syntax error", Some("1064".to_string()), "Check SQL syntax");
        assert_eq!(err.suggestion(), Some("Check SQL syntax"));
        assert_eq!(DbError::shape_mismatch("x").suggestion(), None);
    }

    #[test]
    fn test_error_retryable() {
        assert!(DbError::timeout("query", Duration::from_millis(5000)).is_retryable());
        assert!(DbError::connection("err", "sugg").is_retryable());
        assert!(!DbError::driver("dup", None, "sugg").is_retryable());
    }

    #[test]
    fn test_timeout_reports_bound_in_millis() {
        let err = DbError::timeout("pool checkout", Duration::from_millis(1500));
        assert_eq!(err.to_string(), "Timeout: pool checkout exceeded 1500ms");
    }

    #[test]
    fn test_driver_errors_keep_connection() {
        assert!(!DbError::driver("syntax", None, "fix it").invalidates_connection());
        assert!(DbError::connection("reset", "retry").invalidates_connection());
        assert!(DbError::timeout("query", Duration::from_secs(1)).invalidates_connection());
    }

    #[test]
    fn test_pool_closed_maps_to_connection() {
        let err: DbError = sqlx::Error::PoolClosed.into();
        assert!(matches!(err, DbError::Connection { .. }));
    }
}
