//! Redis implementation of [`RemoteCache`] on a deadpool connection pool.

use async_trait::async_trait;
use deadpool_redis::{Config, Connection, Pool, PoolConfig, Runtime, Timeouts};
use redis::AsyncCommands;
use tracing::{debug, info};

use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::remote::{DELETE_BATCH, RemoteCache, SCAN_COUNT};
use crate::ttl::{CacheTtl, KeyTtl};

/// Redis-backed remote tier.
///
/// Built without a pool when the configured endpoint is empty or the
/// unreachable sentinel; every operation then fails with
/// [`CacheError::Unreachable`].
pub struct RedisRemoteCache {
    pool: Option<Pool>,
    target: String,
}

impl RedisRemoteCache {
    /// Creates the client. No connection is opened until first use.
    pub fn new(config: &CacheConfig) -> Result<Self> {
        let target = config.display_url();
        let Some(url) = config.url() else {
            info!("No remote cache endpoint configured");
            return Ok(Self { pool: None, target });
        };

        let timeout = Some(config.timeout());
        let mut redis_config = Config::from_url(url);
        let mut pool_config = PoolConfig::new(config.pool_size.max(1));
        pool_config.timeouts = Timeouts {
            wait: timeout,
            create: timeout,
            recycle: timeout,
        };
        redis_config.pool = Some(pool_config);

        let pool = redis_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| CacheError::Config(e.to_string()))?;

        debug!(target = %target, pool_size = config.pool_size, "Remote cache pool created");
        Ok(Self {
            pool: Some(pool),
            target,
        })
    }

    async fn conn(&self) -> Result<Connection> {
        match &self.pool {
            Some(pool) => Ok(pool.get().await?),
            None => Err(CacheError::Unreachable(format!(
                "no endpoint configured ({})",
                self.target
            ))),
        }
    }
}

#[async_trait]
impl RemoteCache for RedisRemoteCache {
    async fn connect(&self) -> Result<()> {
        self.conn().await.map(|_| ())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
        if reply.eq_ignore_ascii_case("PONG") {
            Ok(())
        } else {
            Err(CacheError::Command(format!("unexpected PING reply: {reply}")))
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        Ok(conn.get::<_, Option<Vec<u8>>>(key).await?)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: CacheTtl) -> Result<()> {
        let mut conn = self.conn().await?;
        match ttl {
            CacheTtl::Never => conn.set::<_, _, ()>(key, value).await?,
            CacheTtl::Seconds(secs) => conn.set_ex::<_, _, ()>(key, value, secs).await?,
        }
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let mut cursor: u64 = 0;
        let mut found = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            found.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once.
        found.sort_unstable();
        found.dedup();
        Ok(found)
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        let mut removed = 0;
        for batch in keys.chunks(DELETE_BATCH) {
            removed += conn.del::<_, u64>(batch.to_vec()).await?;
        }
        Ok(removed)
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let mut conn = self.conn().await?;
        let reply: i64 = conn.ttl(key).await?;
        Ok(KeyTtl::from_reply(reply))
    }

    fn describe(&self) -> String {
        self.target.clone()
    }
}
