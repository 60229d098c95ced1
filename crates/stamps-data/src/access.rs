//! The per-process data-access handle.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use stamps_cache::{
    CacheLifecycle, CacheStats, CacheTtl, RedisRemoteCache, RemoteCache, TieredCache,
};
use stamps_db::{
    ConnectionFactory, ConnectionPool, Connector, DbError, KeepAliveSweeper, MySqlConnector,
    PoolStats, QueryExecutor, RowSet, SqlParam,
};
use tracing::{info, instrument};

use crate::config::AppConfig;
use crate::error::DataError;

/// Pool and cache statistics together, for health endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct DataStats {
    pub pool: PoolStats,
    pub cache: CacheStats,
}

/// Connection pool, query executor and tiered cache behind one handle.
///
/// Build one per process and pass it (usually in an `Arc`) to every caller.
pub struct DataAccess {
    pool: Arc<ConnectionPool>,
    executor: QueryExecutor,
    cache: TieredCache,
    sweeper: Mutex<Option<KeepAliveSweeper>>,
}

impl DataAccess {
    /// Brings the layer up against MySQL and Redis.
    pub async fn connect(config: &AppConfig) -> Result<Self, DataError> {
        config.validate().map_err(DataError::Config)?;
        let connector = Arc::new(MySqlConnector::new(&config.db_config()));
        let remote = Arc::new(RedisRemoteCache::new(&config.cache_config())?);
        Ok(Self::start(config, connector, remote).await)
    }

    /// Brings the layer up on the given driver and remote tier: warms the
    /// pool, starts the keep-alive sweeper and, when caching is on,
    /// initializes the remote tier.
    #[instrument(skip_all)]
    pub async fn start(
        config: &AppConfig,
        connector: Arc<dyn Connector>,
        remote: Arc<dyn RemoteCache>,
    ) -> Self {
        let db_config = config.db_config();
        let cache_config = config.cache_config();

        let factory = ConnectionFactory::new(connector, &db_config);
        let pool = Arc::new(ConnectionPool::new(factory, &db_config));
        pool.warm_up().await;

        let sweeper = db_config
            .keepalive_interval()
            .map(|period| KeepAliveSweeper::spawn(Arc::clone(&pool), period));

        let lifecycle = Arc::new(CacheLifecycle::new(remote, &cache_config));
        if cache_config.enabled {
            lifecycle.initialize().await;
        }
        let cache = TieredCache::new(lifecycle, &cache_config);

        info!(
            db = %db_config.display_url(),
            cache = %cache_config.display_url(),
            caching = cache_config.enabled,
            "Data access layer started"
        );

        Self {
            executor: QueryExecutor::new(Arc::clone(&pool), &db_config),
            pool,
            cache,
            sweeper: Mutex::new(sweeper),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn executor(&self) -> &QueryExecutor {
        &self.executor
    }

    pub fn cache(&self) -> &TieredCache {
        &self.cache
    }

    /// Runs a statement with classified retry.
    pub async fn execute(&self, query: &str, params: &[SqlParam]) -> Result<RowSet, DbError> {
        self.executor.execute(query, params).await
    }

    /// Runs a statement through the tiered cache. Cache trouble never
    /// surfaces here; only database errors do.
    pub async fn execute_with_cache(
        &self,
        query: &str,
        params: &[SqlParam],
        ttl: CacheTtl,
    ) -> Result<RowSet, DbError> {
        if self.cache.is_bypassed() {
            return self.execute(query, params).await;
        }
        let key = self.cache.query_key(query, params);
        self.cache
            .get_or_compute(&key, || self.execute(query, params), ttl)
            .await
    }

    /// Caches an arbitrary computed value under `key`.
    pub async fn get_or_compute<T, F, Fut, E>(
        &self,
        key: &str,
        compute: F,
        ttl: CacheTtl,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.cache.get_or_compute(key, compute, ttl).await
    }

    pub async fn invalidate_by_pattern(&self, glob: &str) {
        self.cache.invalidate_by_pattern(glob).await;
    }

    pub async fn invalidate_by_category(&self, category: &str) {
        self.cache.invalidate_by_category(category).await;
    }

    pub fn connection_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn stats(&self) -> DataStats {
        DataStats {
            pool: self.connection_stats(),
            cache: self.cache_stats(),
        }
    }

    /// Closes every connection and warms the pool up again.
    pub async fn reset_pool(&self) -> usize {
        self.pool.reset_pool().await
    }

    /// Starts a remote-cache reconnection cycle even after an earlier one
    /// gave up.
    pub fn probe_cache(&self) -> bool {
        self.cache.lifecycle().probe_now()
    }

    /// Stops background tasks and closes idle connections. Connections
    /// still checked out are closed when they come back.
    pub async fn shutdown(&self) {
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.stop().await;
        }
        self.cache.lifecycle().shutdown().await;
        self.pool.shutdown().await;
        info!("Data access layer shut down");
    }
}

