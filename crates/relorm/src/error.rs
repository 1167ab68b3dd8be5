//! Error types for relorm

use crate::connection::Role;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for relorm operations
pub type OrmResult<T> = Result<T, OrmError>;

/// Error types for database operations
#[derive(Debug, Error)]
pub enum OrmError {
    /// Malformed clause argument or builder misuse
    #[error("Validation error: {0}")]
    Validation(String),

    /// Placeholder count differs from the bound parameter count
    #[error("Placeholder mismatch: {placeholders} placeholder(s) but {params} param(s) in `{sql}`")]
    PlaceholderMismatch {
        sql: String,
        placeholders: usize,
        params: usize,
    },

    /// No dialect registered under the requested name
    #[error("Unknown dialect: {0}")]
    UnknownDialect(String),

    /// Invalid or incomplete configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Row not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Statement execution failed on the database
    #[error("Database error ({param_count} param(s)) in `{sql}`: {source}")]
    Database {
        sql: String,
        param_count: usize,
        #[source]
        source: tokio_postgres::Error,
    },

    /// Database connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// No connection could be acquired from the pools of a role in time
    #[error("Pool exhausted: no {role} connection available after {waited:?}")]
    PoolExhausted { role: Role, waited: Duration },

    /// Query timeout error
    #[error("Query timeout after {0:?}")]
    Timeout(Duration),

    /// Commit/rollback/savepoint misuse
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Relation declaration or eager-loading failure
    #[error("Relation error on `{path}`: {message}")]
    Relation { path: String, message: String },

    /// Value decode/mapping error
    #[error("Decode error on column '{column}': {message}")]
    Decode { column: String, message: String },
}

impl OrmError {
    /// Create a decode error for a specific column
    pub fn decode(column: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode {
            column: column.into(),
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a transaction-discipline error
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction(message.into())
    }

    /// Create a relation error for a dotted relation path
    pub fn relation(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Relation {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Check if this is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Whether retrying the same call later may succeed.
    ///
    /// Only resource exhaustion and timeouts qualify; configuration and
    /// transaction-discipline errors never do.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. } | Self::Timeout(_))
    }

    /// Whether this error signals a caller/configuration bug rather than a runtime condition.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::PlaceholderMismatch { .. }
                | Self::UnknownDialect(_)
                | Self::Config(_)
        )
    }

    /// Wrap a driver error together with the statement that caused it.
    pub fn from_db_error(err: tokio_postgres::Error, sql: &str, param_count: usize) -> Self {
        if err.is_closed() {
            return Self::Connection(format!("{err} while running `{sql}`"));
        }
        Self::Database {
            sql: sql.to_string(),
            param_count,
            source: err,
        }
    }
}

#[cfg(feature = "pool")]
impl From<deadpool_postgres::PoolError> for OrmError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        Self::Connection(err.to_string())
    }
}

impl From<toml::de::Error> for OrmError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}
