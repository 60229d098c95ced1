//! Environment configuration.
//!
//! Flat, upper-case keys (`DB_HOST`, `CACHE_ENDPOINT`, ...) read from the
//! process environment, after an optional `.env` has been loaded by the
//! binary.

use std::fmt;

use serde::{Deserialize, Serialize};
use stamps_cache::CacheConfig;
use stamps_db::{DEFAULT_MAX_RETRIES, DbConfig};

/// Environment name that turns caching off.
pub const DEVELOPMENT: &str = "development";

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub db_host: String,
    pub db_user: String,
    #[serde(skip_serializing)]
    pub db_password: String,
    pub db_port: u16,
    pub db_name: String,
    pub db_max_retries: u32,
    pub db_min_connections: usize,
    pub db_max_pool_size: usize,
    pub db_retry_interval_ms: u64,
    pub db_connect_timeout_ms: u64,
    pub db_query_timeout_ms: u64,
    pub db_probe_timeout_ms: u64,
    pub db_keepalive_interval_secs: u64,
    pub db_timezone: String,
    pub db_charset: String,

    pub cache_endpoint: String,
    pub cache_port: u16,
    pub cache_tls: bool,
    pub cache_pool_size: usize,
    pub cache_timeout_ms: u64,
    pub cache_reconnect_max_delay_ms: u64,

    pub environment: String,
    /// `false` disables caching regardless of environment.
    pub cache: bool,
    pub skip_cache_connection: bool,

    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        let db = DbConfig::default();
        let cache = CacheConfig::default();
        Self {
            db_host: String::new(),
            db_user: String::new(),
            db_password: String::new(),
            db_port: db.port,
            db_name: String::new(),
            db_max_retries: DEFAULT_MAX_RETRIES,
            db_min_connections: db.min_connections,
            db_max_pool_size: db.max_connections,
            db_retry_interval_ms: db.retry_interval_ms,
            db_connect_timeout_ms: db.connect_timeout_ms,
            db_query_timeout_ms: db.query_timeout_ms,
            db_probe_timeout_ms: db.probe_timeout_ms,
            db_keepalive_interval_secs: db.keepalive_interval_secs,
            db_timezone: "+00:00".into(),
            db_charset: db.charset,
            cache_endpoint: String::new(),
            cache_port: cache.port,
            cache_tls: cache.tls,
            cache_pool_size: cache.pool_size,
            cache_timeout_ms: cache.timeout_ms,
            cache_reconnect_max_delay_ms: cache.reconnect_max_delay_ms,
            environment: DEVELOPMENT.into(),
            cache: true,
            skip_cache_connection: false,
            log_level: "info".into(),
        }
    }
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("db", &self.db_config().display_url())
            .field("db_max_retries", &self.db_max_retries)
            .field("db_pool", &(self.db_min_connections, self.db_max_pool_size))
            .field("cache_endpoint", &self.cache_config().display_url())
            .field("environment", &self.environment)
            .field("cache", &self.cache)
            .field("skip_cache_connection", &self.skip_cache_connection)
            .field("log_level", &self.log_level)
            .finish_non_exhaustive()
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.db_max_pool_size == 0 {
            return Err("DB_MAX_POOL_SIZE must be > 0".into());
        }
        if self.db_min_connections > self.db_max_pool_size {
            return Err("DB_MIN_CONNECTIONS must be <= DB_MAX_POOL_SIZE".into());
        }
        if self.db_connect_timeout_ms == 0
            || self.db_query_timeout_ms == 0
            || self.db_probe_timeout_ms == 0
            || self.cache_timeout_ms == 0
        {
            return Err("timeouts must be > 0".into());
        }
        if self.cache_pool_size == 0 {
            return Err("CACHE_POOL_SIZE must be > 0".into());
        }
        let lvl = self.log_level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("LOG_LEVEL must be one of {valid_levels:?}"));
        }
        Ok(())
    }

    /// Caching is off in development or when `CACHE=false`.
    pub fn caching_enabled(&self) -> bool {
        self.cache && !self.environment.eq_ignore_ascii_case(DEVELOPMENT)
    }

    pub fn db_config(&self) -> DbConfig {
        let timezone = Some(self.db_timezone.trim())
            .filter(|tz| !tz.is_empty())
            .map(str::to_string);
        DbConfig {
            host: self.db_host.clone(),
            port: self.db_port,
            user: self.db_user.clone(),
            password: self.db_password.clone(),
            database: self.db_name.clone(),
            charset: self.db_charset.clone(),
            connect_timeout_ms: self.db_connect_timeout_ms,
            query_timeout_ms: self.db_query_timeout_ms,
            probe_timeout_ms: self.db_probe_timeout_ms,
            keepalive_interval_secs: self.db_keepalive_interval_secs,
            ..DbConfig::default()
        }
        .with_max_retries(self.db_max_retries)
        .with_pool_size(self.db_min_connections, self.db_max_pool_size)
        .with_retry_interval_ms(self.db_retry_interval_ms)
        .with_timezone(timezone)
    }

    pub fn cache_config(&self) -> CacheConfig {
        let max_retries = if self.db_max_retries == 0 {
            DEFAULT_MAX_RETRIES
        } else {
            self.db_max_retries
        };
        CacheConfig {
            endpoint: self.cache_endpoint.clone(),
            port: self.cache_port,
            tls: self.cache_tls,
            pool_size: self.cache_pool_size,
            timeout_ms: self.cache_timeout_ms,
            max_retries,
            retry_interval_ms: self.db_retry_interval_ms,
            reconnect_max_delay_ms: self.cache_reconnect_max_delay_ms,
            enabled: self.caching_enabled(),
            skip_connection: self.skip_cache_connection,
        }
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, Map};

    /// Loads configuration from the process environment and validates it.
    pub fn load_config() -> Result<AppConfig, String> {
        build(Environment::default())
    }

    /// Loads configuration from an explicit key/value map instead of the
    /// process environment.
    pub fn load_config_from(vars: Map<String, String>) -> Result<AppConfig, String> {
        build(Environment::default().source(Some(vars)))
    }

    fn build(env: Environment) -> Result<AppConfig, String> {
        let cfg = Config::builder()
            .add_source(env.try_parsing(true))
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}
