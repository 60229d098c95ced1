//! Connection factory: bounded-retry connects plus session defaults.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::backoff::backoff_delay;
use crate::config::DbConfig;
use crate::connection::{Connector, DbConnection};
use crate::error::{DbError, Result};

/// Opens connections through a [`Connector`], retrying failed attempts with
/// exponential backoff and applying session defaults to each new handle.
pub struct ConnectionFactory {
    connector: Arc<dyn Connector>,
    max_attempts: u32,
    retry_interval: Duration,
    max_retry_delay: Duration,
    connect_timeout: Duration,
    session_statements: Vec<String>,
    attempts: AtomicU64,
}

impl ConnectionFactory {
    pub fn new(connector: Arc<dyn Connector>, config: &DbConfig) -> Self {
        let session_statements = config
            .timezone
            .as_deref()
            .map(|tz| vec![format!("SET time_zone = '{}'", tz.replace('\'', ""))])
            .unwrap_or_default();

        Self {
            connector,
            max_attempts: config.max_retries.max(1),
            retry_interval: config.retry_interval(),
            max_retry_delay: config.max_retry_delay(),
            connect_timeout: config.connect_timeout(),
            session_statements,
            attempts: AtomicU64::new(0),
        }
    }

    /// Total connect attempts made since start, successful or not.
    pub fn connection_attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn target(&self) -> String {
        self.connector.describe()
    }

    /// Opens a connection, trying up to the configured retry ceiling.
    ///
    /// A connection whose session setup fails is closed and counts as a
    /// failed attempt.
    pub async fn create(&self) -> Result<Box<dyn DbConnection>> {
        self.create_with(self.max_attempts).await
    }

    /// Opens a connection with a single attempt, for callers that already
    /// retry around it.
    pub async fn create_once(&self) -> Result<Box<dyn DbConnection>> {
        self.create_with(1).await
    }

    async fn create_with(&self, max_attempts: u32) -> Result<Box<dyn DbConnection>> {
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            self.attempts.fetch_add(1, Ordering::Relaxed);

            match self.try_create().await {
                Ok(conn) => {
                    if attempt > 1 {
                        info!(attempt, target = %self.connector.describe(), "Database connection established after retry");
                    } else {
                        debug!(target = %self.connector.describe(), "Database connection established");
                    }
                    return Ok(conn);
                }
                Err(e) => {
                    warn!(
                        attempt,
                        max_attempts,
                        error = %e,
                        "Database connection attempt failed"
                    );
                    last_error = Some(e);
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(backoff_delay(
                    self.retry_interval,
                    attempt,
                    self.max_retry_delay,
                ))
                .await;
            }
        }

        Err(last_error.unwrap_or_else(|| DbError::connection_lost("no connection attempt was made")))
    }

    async fn try_create(&self) -> Result<Box<dyn DbConnection>> {
        let mut conn = tokio::time::timeout(self.connect_timeout, self.connector.connect())
            .await
            .map_err(|_| DbError::timeout("connect", self.connect_timeout))??;

        for statement in &self.session_statements {
            let applied = tokio::time::timeout(self.connect_timeout, conn.execute(statement, &[]))
                .await
                .map_err(|_| DbError::timeout("session setup", self.connect_timeout))
                .and_then(|r| r);
            if let Err(e) = applied {
                if let Err(close_err) = conn.close().await {
                    debug!(error = %close_err, "Failed to close connection after session setup error");
                }
                return Err(e);
            }
        }

        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Failure, ScriptedConnector};

    fn config(max_retries: u32) -> DbConfig {
        DbConfig::default()
            .with_max_retries(max_retries)
            .with_retry_interval_ms(1)
    }

    #[tokio::test]
    async fn test_create_applies_session_timezone() {
        let connector = ScriptedConnector::new();
        let factory = ConnectionFactory::new(Arc::new(connector.clone()), &config(3));

        let conn = factory.create().await.expect("connect");
        drop(conn);

        assert_eq!(factory.connection_attempts(), 1);
        assert_eq!(connector.executions_of("SET time_zone = '+00:00'"), 1);
    }

    #[tokio::test]
    async fn test_create_retries_until_success() {
        let connector = ScriptedConnector::new();
        connector.fail_next_connects(2);
        let factory = ConnectionFactory::new(Arc::new(connector.clone()), &config(3));

        assert!(factory.create().await.is_ok());
        assert_eq!(factory.connection_attempts(), 3);
        assert_eq!(connector.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_create_gives_up_after_ceiling() {
        let connector = ScriptedConnector::new();
        connector.fail_next_connects(10);
        let factory = ConnectionFactory::new(Arc::new(connector.clone()), &config(3));

        let err = factory.create().await.expect_err("must give up");
        assert!(matches!(err, DbError::ConnectionLost { .. }));
        assert_eq!(factory.connection_attempts(), 3);
    }

    #[tokio::test]
    async fn test_create_once_makes_a_single_attempt() {
        let connector = ScriptedConnector::new();
        connector.fail_next_connects(1);
        let factory = ConnectionFactory::new(Arc::new(connector.clone()), &config(5));

        assert!(factory.create_once().await.is_err());
        assert_eq!(factory.connection_attempts(), 1);
        assert!(factory.create_once().await.is_ok());
        assert_eq!(factory.connection_attempts(), 2);
    }

    #[tokio::test]
    async fn test_failed_session_setup_closes_connection_and_retries() {
        let connector = ScriptedConnector::new();
        connector.fail_next_session_setup(Failure::Other);
        let factory = ConnectionFactory::new(Arc::new(connector.clone()), &config(3));

        assert!(factory.create().await.is_ok());
        assert_eq!(factory.connection_attempts(), 2);
        assert_eq!(connector.opened(), 2);
        assert_eq!(connector.closed(), 1);
    }

    #[tokio::test]
    async fn test_no_session_statements_without_timezone() {
        let connector = ScriptedConnector::new();
        let factory = ConnectionFactory::new(
            Arc::new(connector.clone()),
            &config(1).with_timezone(None),
        );

        factory.create().await.expect("connect");
        assert_eq!(connector.executions_of("SET"), 0);
    }
}
