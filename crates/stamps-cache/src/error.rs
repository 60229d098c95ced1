//! Remote cache errors.
//!
//! These never leave the tiered cache: every one of them degrades to the
//! in-process tier and a background reconnection.

use std::time::Duration;

/// Failure talking to the remote cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The remote cache could not be reached.
    #[error("Remote cache unreachable: {0}")]
    Unreachable(String),

    /// A remote cache operation exceeded its deadline.
    #[error("Remote cache {operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// The remote cache rejected a command.
    #[error("Remote cache command failed: {0}")]
    Command(String),

    /// The sentinel written during a probe did not read back.
    #[error("Remote cache read-after-write check failed")]
    RoundTrip,

    /// Configuration error.
    #[error("Cache configuration error: {0}")]
    Config(String),
}

impl CacheError {
    /// Short label for logs and metrics.
    pub fn class(&self) -> &'static str {
        match self {
            CacheError::Unreachable(_) => "unreachable",
            CacheError::Timeout { .. } => "timeout",
            CacheError::Command(_) => "command",
            CacheError::RoundTrip => "round_trip",
            CacheError::Config(_) => "config",
        }
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            CacheError::Unreachable(err.to_string())
        } else {
            CacheError::Command(err.to_string())
        }
    }
}

impl From<deadpool_redis::PoolError> for CacheError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        CacheError::Unreachable(err.to_string())
    }
}

/// Result type alias for remote cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Runs `fut` under `timeout`, mapping expiry to [`CacheError::Timeout`].
pub(crate) async fn bounded<T>(
    operation: &'static str,
    timeout: Duration,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(timeout, fut)
        .await
        .unwrap_or(Err(CacheError::Timeout { operation, timeout }))
}
