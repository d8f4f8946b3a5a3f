//! Error types for tenant-scoped execution.
//!
//! Every infrastructure failure the execution core can produce is a variant of
//! [`TenancyError`]. Unit-of-work errors are never wrapped in it: callers pick
//! their own error type `E: From<TenancyError>` and get their own values back.

use crate::models::IsolationScope;
use thiserror::Error;

/// SQLSTATE codes the store uses for transient conflicts.
const RETRYABLE_SQL_STATES: &[&str] = &["40001", "40P01"];

/// The transaction statement that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionPhase {
    Begin,
    Commit,
    Rollback,
}

impl std::fmt::Display for TransactionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Begin => write!(f, "BEGIN"),
            Self::Commit => write!(f, "COMMIT"),
            Self::Rollback => write!(f, "ROLLBACK"),
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum TenancyError {
    #[error("Invalid tenant identifier: {message}")]
    InvalidTenant { message: String },

    #[error("Failed to acquire connection: {message}")]
    Acquisition { message: String, suggestion: String },

    #[error("Failed to configure {scope} isolation: {message}")]
    IsolationConfig {
        scope: IsolationScope,
        message: String,
        sql_state: Option<String>,
    },

    #[error("{phase} failed: {message}")]
    Transaction {
        phase: TransactionPhase,
        message: String,
        sql_state: Option<String>,
    },

    #[error("Session cleanup failed: {message}")]
    Cleanup { message: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "23505" for unique violation
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u32,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl TenancyError {
    /// Create an invalid tenant error.
    pub fn invalid_tenant(message: impl Into<String>) -> Self {
        Self::InvalidTenant {
            message: message.into(),
        }
    }

    /// Create an acquisition error with a helpful suggestion.
    pub fn acquisition(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Acquisition {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Wrap a failed configuration statement.
    pub fn isolation_config(scope: IsolationScope, cause: TenancyError) -> Self {
        Self::IsolationConfig {
            scope,
            sql_state: cause.sql_state().map(String::from),
            message: cause.detail(),
        }
    }

    /// Wrap a failed BEGIN / COMMIT / ROLLBACK.
    pub fn transaction(phase: TransactionPhase, cause: TenancyError) -> Self {
        Self::Transaction {
            phase,
            sql_state: cause.sql_state().map(String::from),
            message: cause.detail(),
        }
    }

    /// Wrap a failed session reset.
    pub fn cleanup(cause: TenancyError) -> Self {
        Self::Cleanup {
            message: cause.detail(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u32) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Short machine-readable name, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidTenant { .. } => "invalid_tenant",
            Self::Acquisition { .. } => "acquisition",
            Self::IsolationConfig { .. } => "isolation_config",
            Self::Transaction {
                phase: TransactionPhase::Begin,
                ..
            } => "begin",
            Self::Transaction {
                phase: TransactionPhase::Commit,
                ..
            } => "commit",
            Self::Transaction {
                phase: TransactionPhase::Rollback,
                ..
            } => "rollback",
            Self::Cleanup { .. } => "cleanup",
            Self::Database { .. } => "database",
            Self::InvalidInput { .. } => "invalid_input",
            Self::Timeout { .. } => "timeout",
            Self::Internal { .. } => "internal",
        }
    }

    /// SQLSTATE reported by the store, if any.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Database { sql_state, .. }
            | Self::IsolationConfig { sql_state, .. }
            | Self::Transaction { sql_state, .. } => sql_state.as_deref(),
            _ => None,
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Acquisition { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Acquisition { .. } | Self::Timeout { .. } => true,
            _ => self
                .sql_state()
                .is_some_and(|code| RETRYABLE_SQL_STATES.contains(&code)),
        }
    }

    /// The underlying message without the variant prefix.
    fn detail(&self) -> String {
        match self {
            Self::InvalidTenant { message }
            | Self::Acquisition { message, .. }
            | Self::IsolationConfig { message, .. }
            | Self::Transaction { message, .. }
            | Self::Cleanup { message }
            | Self::Database { message, .. }
            | Self::InvalidInput { message }
            | Self::Internal { message } => message.clone(),
            Self::Timeout { .. } => self.to_string(),
        }
    }
}

/// Convert sqlx errors to TenancyError.
impl From<sqlx::Error> for TenancyError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => TenancyError::invalid_input(format!(
                "Invalid connection configuration: {}",
                msg
            )),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                TenancyError::database(
                    db_err.message(),
                    code,
                    "Check the SQL statement and the row-security policy for this tenant",
                )
            }
            sqlx::Error::RowNotFound => TenancyError::database(
                "No rows returned",
                None,
                "Verify the query conditions match rows visible to this tenant",
            ),
            sqlx::Error::PoolTimedOut => TenancyError::acquisition(
                "Timed out waiting for a pooled connection",
                "Increase max_connections or acquire_timeout, or reduce concurrent callers",
            ),
            sqlx::Error::PoolClosed => TenancyError::acquisition(
                "Connection pool is closed",
                "Reconnect to the database",
            ),
            sqlx::Error::Io(io_err) => TenancyError::database(
                format!("I/O error: {}", io_err),
                None,
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => TenancyError::database(
                format!("TLS error: {}", tls_err),
                None,
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => TenancyError::database(
                format!("Protocol error: {}", msg),
                None,
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnNotFound(col) => {
                TenancyError::invalid_input(format!("Column not found: {}", col))
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => TenancyError::internal(
                format!("Column index {} out of bounds (len: {})", index, len),
            ),
            sqlx::Error::ColumnDecode { index, source } => {
                TenancyError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => {
                TenancyError::internal(format!("Decode error: {}", source))
            }
            sqlx::Error::WorkerCrashed => TenancyError::internal("Database worker crashed"),
            _ => TenancyError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, TenancyError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_violation() -> TenancyError {
        TenancyError::database(
            "duplicate key value violates unique constraint",
            Some("23505".to_string()),
            "check keys",
        )
    }

    #[test]
    fn test_error_display() {
        let err = TenancyError::invalid_tenant("missing");
        assert_eq!(err.to_string(), "Invalid tenant identifier: missing");
    }

    #[test]
    fn test_isolation_config_keeps_sql_state() {
        let err = TenancyError::isolation_config(IsolationScope::Local, unique_violation());
        assert_eq!(err.sql_state(), Some("23505"));
        assert_eq!(err.kind(), "isolation_config");
        assert!(err.to_string().contains("local"));
        assert!(err.to_string().contains("duplicate key"));
    }

    #[test]
    fn test_transaction_phase_in_message() {
        let err = TenancyError::transaction(TransactionPhase::Commit, unique_violation());
        assert!(err.to_string().starts_with("COMMIT failed"));
        assert_eq!(err.kind(), "commit");
    }

    #[test]
    fn test_error_suggestion() {
        assert_eq!(unique_violation().suggestion(), Some("check keys"));
        assert!(TenancyError::invalid_tenant("x").suggestion().is_none());
    }

    #[test]
    fn test_error_retryable() {
        assert!(TenancyError::acquisition("exhausted", "wait").is_retryable());
        assert!(TenancyError::timeout("query", 30).is_retryable());
        let serialization =
            TenancyError::database("could not serialize", Some("40001".into()), "retry");
        assert!(serialization.is_retryable());
        assert!(!unique_violation().is_retryable());
        assert!(!TenancyError::invalid_tenant("abc").is_retryable());
    }

    #[test]
    fn test_pool_timeout_maps_to_acquisition() {
        let err: TenancyError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, TenancyError::Acquisition { .. }));

        let err: TenancyError = sqlx::Error::PoolClosed.into();
        assert_eq!(err.kind(), "acquisition");
    }

    #[test]
    fn test_row_not_found_maps_to_database() {
        let err: TenancyError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, TenancyError::Database { .. }));
        assert!(err.sql_state().is_none());
    }
}
