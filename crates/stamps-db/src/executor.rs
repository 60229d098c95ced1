//! Query execution with classification-aware retry.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::backoff::backoff_delay;
use crate::config::DbConfig;
use crate::error::{DbError, Result};
use crate::metrics;
use crate::pool::ConnectionPool;
use crate::types::{RowSet, SqlParam};

/// Runs statements on pooled connections.
///
/// Each attempt checks out a connection (health-probed by the pool), runs the
/// statement under a timeout and disposes of the connection according to the
/// error class: connection losses and timeouts close it, everything else
/// returns it to the pool. Rejections that cannot succeed on a retry (syntax,
/// duplicate key, foreign key) are surfaced immediately.
#[derive(Clone)]
pub struct QueryExecutor {
    pool: Arc<ConnectionPool>,
    max_attempts: u32,
    retry_interval: Duration,
    max_retry_delay: Duration,
    query_timeout: Duration,
}

impl QueryExecutor {
    pub fn new(pool: Arc<ConnectionPool>, config: &DbConfig) -> Self {
        Self {
            pool,
            max_attempts: config.max_retries.max(1),
            retry_interval: config.retry_interval(),
            max_retry_delay: config.max_retry_delay(),
            query_timeout: config.query_timeout(),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    #[instrument(skip(self, params), fields(params = params.len()))]
    pub async fn execute(&self, query: &str, params: &[SqlParam]) -> Result<RowSet> {
        let mut attempt = 1;

        loop {
            let error = match self.attempt(query, params).await {
                Ok(rows) => return Ok(rows),
                Err(e) => e,
            };

            if !error.is_retryable() {
                warn!(attempt, error = %error, "Query rejected; not retrying");
                metrics::record_query_failure(error.class());
                return Err(error);
            }

            if attempt >= self.max_attempts {
                warn!(
                    attempt,
                    max_attempts = self.max_attempts,
                    error = %error,
                    "Query failed after exhausting retries"
                );
                metrics::record_query_failure(error.class());
                return Err(error);
            }

            let delay = backoff_delay(self.retry_interval, attempt, self.max_retry_delay);
            match &error {
                DbError::Timeout { .. } => warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Query timed out; retrying"
                ),
                _ => debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    class = error.class(),
                    error = %error,
                    "Query attempt failed; retrying"
                ),
            }
            metrics::record_query_retry(error.class());

            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn attempt(&self, query: &str, params: &[SqlParam]) -> Result<RowSet> {
        // Connect failures count against `execute`'s own attempts.
        let mut conn = self.pool.get_connection_once().await?;

        let outcome = tokio::time::timeout(self.query_timeout, conn.execute(query, params))
            .await
            .unwrap_or_else(|_| Err(DbError::timeout("query", self.query_timeout)));

        match &outcome {
            Err(e) if e.discards_connection() => self.pool.close(conn).await,
            _ => self.pool.release(conn).await,
        }

        outcome
    }
}
