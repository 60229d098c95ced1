//! Configuration types for pooled database access.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default retry ceiling for connection attempts and query execution.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Configuration for the connection pool, the connection factory and the
/// query executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(default, skip_serializing)]
    pub password: String,
    pub database: String,

    /// Connection charset.
    pub charset: String,

    /// Session `time_zone` applied to every new connection.
    pub timezone: Option<String>,

    /// Retry ceiling shared by the factory and the executor.
    pub max_retries: u32,

    /// Connections created at warm-up.
    pub min_connections: usize,

    /// Upper bound on idle + active connections.
    pub max_connections: usize,

    /// Backoff base in milliseconds.
    pub retry_interval_ms: u64,

    /// Upper bound on a single backoff delay in milliseconds.
    pub max_retry_delay_ms: u64,

    /// Timeout for a single connection attempt in milliseconds.
    pub connect_timeout_ms: u64,

    /// Timeout for a single query execution in milliseconds.
    pub query_timeout_ms: u64,

    /// Timeout for a health probe in milliseconds.
    pub probe_timeout_ms: u64,

    /// Keep-alive sweep period in seconds. Zero disables the sweeper.
    pub keepalive_interval_secs: u64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 3306,
            user: String::new(),
            password: String::new(),
            database: String::new(),
            charset: "utf8mb4".into(),
            timezone: Some("+00:00".into()),
            max_retries: DEFAULT_MAX_RETRIES,
            min_connections: 2,
            max_connections: 10,
            retry_interval_ms: 500,
            max_retry_delay_ms: 5000,
            connect_timeout_ms: 5000,
            query_timeout_ms: 30_000,
            probe_timeout_ms: 2000,
            keepalive_interval_secs: 30,
        }
    }
}

impl DbConfig {
    /// Creates a configuration targeting the given host and database.
    #[must_use]
    pub fn new(host: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            database: database.into(),
            ..Default::default()
        }
    }

    /// Sets the credentials.
    #[must_use]
    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    /// Sets the port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the retry ceiling. Zero falls back to the default.
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = if retries == 0 {
            DEFAULT_MAX_RETRIES
        } else {
            retries
        };
        self
    }

    /// Sets the warm-up size and the pool bound.
    #[must_use]
    pub fn with_pool_size(mut self, min: usize, max: usize) -> Self {
        self.min_connections = min;
        self.max_connections = max;
        self
    }

    /// Sets the backoff base.
    #[must_use]
    pub fn with_retry_interval_ms(mut self, interval: u64) -> Self {
        self.retry_interval_ms = interval;
        self
    }

    /// Sets the session time zone.
    #[must_use]
    pub fn with_timezone(mut self, timezone: Option<String>) -> Self {
        self.timezone = timezone;
        self
    }

    /// Sets the keep-alive period.
    #[must_use]
    pub fn with_keepalive_interval_secs(mut self, secs: u64) -> Self {
        self.keepalive_interval_secs = secs;
        self
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// `None` when the sweeper is disabled.
    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_secs > 0)
            .then(|| Duration::from_secs(self.keepalive_interval_secs))
    }

    /// Connection URL with the password masked, for logging.
    pub fn display_url(&self) -> String {
        let credentials = if self.password.is_empty() {
            self.user.clone()
        } else {
            format!("{}:****", self.user)
        };
        format!(
            "mysql://{}@{}:{}/{}",
            credentials, self.host, self.port, self.database
        )
    }
}
