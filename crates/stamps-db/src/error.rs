//! Error taxonomy for pooled database access.
//!
//! Every failure that leaves this crate is a [`DbError`]. Driver errors are
//! classified once, where the driver raises them (see [`crate::mysql`]), so
//! the executor decides retry and connection disposal from the variant alone.

use std::fmt;
use std::time::Duration;

/// Why the server rejected a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Malformed SQL.
    Syntax,
    /// Unique or primary key violation.
    DuplicateKey,
    /// Foreign key violation.
    ForeignKey,
    /// Anything else the server reported for this statement.
    Other,
}

impl QueryErrorKind {
    /// Whether running the same statement again could succeed.
    pub fn is_retryable(self) -> bool {
        matches!(self, QueryErrorKind::Other)
    }
}

impl fmt::Display for QueryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryErrorKind::Syntax => write!(f, "syntax"),
            QueryErrorKind::DuplicateKey => write!(f, "duplicate key"),
            QueryErrorKind::ForeignKey => write!(f, "foreign key"),
            QueryErrorKind::Other => write!(f, "other"),
        }
    }
}

/// Errors raised by the pool, the connection factory and the query executor.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// No idle connection and the pool is at its bound.
    #[error("Connection pool exhausted (active={active}, idle={idle}, max={max})")]
    PoolExhausted {
        active: usize,
        idle: usize,
        max: usize,
    },

    /// The pool was shut down; no further checkouts.
    #[error("Connection pool is shut down")]
    PoolClosed,

    /// The connection dropped or could not be established.
    #[error("Database connection error: {message}")]
    ConnectionLost { message: String },

    /// An operation exceeded its deadline.
    #[error("Database {operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// The server rejected the statement.
    #[error("Query error ({kind}): {message}")]
    Query {
        kind: QueryErrorKind,
        message: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl DbError {
    /// Creates a new connection-lost error.
    #[must_use]
    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::ConnectionLost {
            message: message.into(),
        }
    }

    /// Creates a new query error.
    #[must_use]
    pub fn query(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Self::Query {
            kind,
            message: message.into(),
        }
    }

    /// Creates a new timeout error.
    #[must_use]
    pub fn timeout(operation: &'static str, timeout: Duration) -> Self {
        Self::Timeout { operation, timeout }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether the executor should try again after this error.
    ///
    /// Syntax, duplicate-key and foreign-key rejections can never succeed on
    /// a retry, and neither can a checkout from a shut-down pool. Everything
    /// else, including unrecognized server errors, is retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            DbError::Query { kind, .. } => kind.is_retryable(),
            DbError::Config { .. } | DbError::PoolClosed => false,
            DbError::PoolExhausted { .. }
            | DbError::ConnectionLost { .. }
            | DbError::Timeout { .. } => true,
        }
    }

    /// Whether the connection that produced this error must be closed rather
    /// than returned to the pool.
    pub fn discards_connection(&self) -> bool {
        matches!(
            self,
            DbError::ConnectionLost { .. } | DbError::Timeout { .. }
        )
    }

    /// Short label for logs and metrics.
    pub fn class(&self) -> &'static str {
        match self {
            DbError::PoolExhausted { .. } => "pool_exhausted",
            DbError::PoolClosed => "pool_closed",
            DbError::ConnectionLost { .. } => "connection_lost",
            DbError::Timeout { .. } => "timeout",
            DbError::Query { kind, .. } if kind.is_retryable() => "query",
            DbError::Query { .. } => "query_rejected",
            DbError::Config { .. } => "config",
        }
    }
}

/// Result type alias for database operations.
pub type Result<T> = std::result::Result<T, DbError>;
