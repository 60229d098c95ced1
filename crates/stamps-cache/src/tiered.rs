//! Tiered cache: remote tier first, in-process tier as the safety net.
//!
//! ```text
//! get_or_compute → bypass? ─────────────────────────────→ compute
//!                  remote down → local ─ miss ──────────→ compute → local
//!                  remote up   → remote ─ miss ─────────→ compute → remote + local
//!                                  └ error → degrade, local lookup
//! ```
//!
//! No cache failure ever reaches the caller; only `compute` errors do.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use stamps_db::SqlParam;
use tracing::{debug, info, instrument, warn};

use crate::config::CacheConfig;
use crate::error::bounded;
use crate::glob::GlobPattern;
use crate::keys::generate_key;
use crate::lifecycle::CacheLifecycle;
use crate::local::LocalCache;
use crate::metrics;
use crate::registry::CacheKeyRegistry;
use crate::remote::RemoteCache;
use crate::ttl::CacheTtl;

/// Cache statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// `bypass`, `remote` or `local`.
    pub mode: &'static str,
    pub remote_available: bool,
    pub available_at_startup: bool,
    pub local_entries: usize,
    pub registered_keys: usize,
}

pub struct TieredCache {
    lifecycle: Arc<CacheLifecycle>,
    local: LocalCache,
    registry: CacheKeyRegistry,
    bypass: bool,
    timeout: Duration,
}

impl TieredCache {
    pub fn new(lifecycle: Arc<CacheLifecycle>, config: &CacheConfig) -> Self {
        Self::with_registry(lifecycle, config, CacheKeyRegistry::new())
    }

    pub fn with_registry(
        lifecycle: Arc<CacheLifecycle>,
        config: &CacheConfig,
        registry: CacheKeyRegistry,
    ) -> Self {
        if !config.enabled {
            info!("Caching disabled; every lookup computes directly");
        }
        Self {
            lifecycle,
            local: LocalCache::new(),
            registry,
            bypass: !config.enabled,
            timeout: config.timeout(),
        }
    }

    pub fn lifecycle(&self) -> &Arc<CacheLifecycle> {
        &self.lifecycle
    }

    pub fn registry(&self) -> &CacheKeyRegistry {
        &self.registry
    }

    pub fn is_bypassed(&self) -> bool {
        self.bypass
    }

    fn remote(&self) -> &dyn RemoteCache {
        self.lifecycle.remote().as_ref()
    }

    /// Key for a query, registered under the query's category.
    pub fn query_key(&self, query: &str, params: &[SqlParam]) -> String {
        let key = generate_key(query, params);
        self.registry.register(&key, query);
        key
    }

    /// Returns the cached value for `key`, or computes, caches and returns it.
    ///
    /// Concurrent callers missing on the same key each compute.
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
        if self.bypass {
            return compute().await;
        }

        if !self.lifecycle.is_available() {
            self.lifecycle.nudge();
            if let Some(value) = self.lookup_local(key) {
                return Ok(value);
            }
            metrics::record_cache_miss();
            let value = compute().await?;
            if let Some(bytes) = encode(key, &value) {
                self.store_local(key, bytes, ttl);
            }
            return Ok(value);
        }

        match bounded("get", self.timeout, self.remote().get(key)).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(value) => {
                    debug!(key, "cache hit (remote)");
                    metrics::record_cache_hit("remote");
                    return Ok(value);
                }
                Err(e) => debug!(key, error = %e, "Undecodable remote cache entry; recomputing"),
            },
            Ok(None) => {}
            Err(e) => {
                self.lifecycle.report_failure(&e);
                if let Some(value) = self.lookup_local(key) {
                    return Ok(value);
                }
            }
        }

        debug!(key, "cache miss");
        metrics::record_cache_miss();
        let value = compute().await?;
        if let Some(bytes) = encode(key, &value) {
            self.store(key, bytes, ttl).await;
        }
        Ok(value)
    }

    async fn store(&self, key: &str, bytes: Vec<u8>, ttl: CacheTtl) {
        if ttl.is_storable() && self.lifecycle.is_available() {
            if let Err(e) = bounded("set", self.timeout, self.remote().set(key, &bytes, ttl)).await
            {
                self.lifecycle.report_failure(&e);
            }
        }
        self.store_local(key, bytes, ttl);
    }

    fn store_local(&self, key: &str, bytes: Vec<u8>, ttl: CacheTtl) {
        self.local.insert(key, bytes, ttl);
        metrics::set_local_entries(self.local.len());
    }

    fn lookup_local<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.local.get(key)?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => {
                debug!(key, "cache hit (local)");
                metrics::record_cache_hit("local");
                Some(value)
            }
            Err(e) => {
                debug!(key, error = %e, "Undecodable local cache entry; recomputing");
                None
            }
        }
    }

    /// Deletes every key matching `glob` from the remote tier (when up) and
    /// from the local tier.
    #[instrument(skip(self))]
    pub async fn invalidate_by_pattern(&self, glob: &str) {
        if self.lifecycle.is_available() {
            match bounded("scan", self.timeout, self.remote().keys(glob)).await {
                Ok(keys) if keys.is_empty() => {}
                Ok(keys) => {
                    match bounded("delete", self.timeout, self.remote().delete(&keys)).await {
                        Ok(removed) => info!(removed, "Remote cache invalidated by pattern"),
                        Err(e) => self.lifecycle.report_failure(&e),
                    }
                }
                Err(e) => self.lifecycle.report_failure(&e),
            }
        }

        match GlobPattern::new(glob) {
            Ok(pattern) => {
                let removed = self.local.remove_matching(&pattern);
                debug!(removed, "Local cache invalidated by pattern");
                metrics::set_local_entries(self.local.len());
            }
            Err(e) => warn!(error = %e, "Invalid invalidation pattern"),
        }
    }

    /// Deletes the keys registered under `category` and empties its set.
    #[instrument(skip(self))]
    pub async fn invalidate_by_category(&self, category: &str) {
        let keys = self.registry.take(category);
        if keys.is_empty() {
            debug!("No keys registered for category");
            return;
        }

        if self.lifecycle.is_available() {
            match bounded("delete", self.timeout, self.remote().delete(&keys)).await {
                Ok(removed) => info!(removed, "Remote cache invalidated by category"),
                Err(e) => self.lifecycle.report_failure(&e),
            }
        }

        let removed = self.local.remove_keys(&keys);
        debug!(removed, "Local cache invalidated by category");
        metrics::set_local_entries(self.local.len());
    }

    pub fn stats(&self) -> CacheStats {
        let remote_available = self.lifecycle.is_available();
        CacheStats {
            mode: if self.bypass {
                "bypass"
            } else if remote_available {
                "remote"
            } else {
                "local"
            },
            remote_available,
            available_at_startup: self.lifecycle.available_at_startup(),
            local_entries: self.local.len(),
            registered_keys: self.registry.len(),
        }
    }
}

fn encode<T: Serialize>(key: &str, value: &T) -> Option<Vec<u8>> {
    match serde_json::to_vec(value) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!(key, error = %e, "Value not cacheable");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::memory::MemoryRemoteCache;
    use crate::ttl::KeyTtl;

    async fn tiered(remote: &MemoryRemoteCache, config: CacheConfig) -> TieredCache {
        let lifecycle = Arc::new(CacheLifecycle::new(Arc::new(remote.clone()), &config));
        lifecycle.initialize().await;
        TieredCache::new(lifecycle, &config)
    }

    fn config() -> CacheConfig {
        CacheConfig::new("memory").with_retry(2, 100)
    }

    async fn counted(
        cache: &TieredCache,
        key: &str,
        calls: &AtomicUsize,
        value: u64,
        ttl: CacheTtl,
    ) -> u64 {
        cache
            .get_or_compute(
                key,
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, Infallible>(value)
                },
                ttl,
            )
            .await
            .expect("infallible")
    }

    #[tokio::test]
    async fn test_remote_hit_skips_compute() {
        let remote = MemoryRemoteCache::new();
        let cache = tiered(&remote, config()).await;
        let calls = AtomicUsize::new(0);

        assert_eq!(counted(&cache, "k", &calls, 7, CacheTtl::Seconds(60)).await, 7);
        assert_eq!(counted(&cache, "k", &calls, 8, CacheTtl::Seconds(60)).await, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(remote.contains("k"));
        assert_eq!(cache.stats().local_entries, 1);
    }

    #[tokio::test]
    async fn test_zero_ttl_is_not_written_remotely() {
        let remote = MemoryRemoteCache::new();
        let cache = tiered(&remote, config()).await;
        let calls = AtomicUsize::new(0);
        let sets_after_startup = remote.sets();

        counted(&cache, "k", &calls, 1, CacheTtl::Seconds(0)).await;
        counted(&cache, "k", &calls, 1, CacheTtl::Seconds(0)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(remote.sets(), sets_after_startup);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_remote_uses_local_tier() {
        let remote = MemoryRemoteCache::new();
        remote.set_failing(true);
        let cache = tiered(&remote, config()).await;
        let calls = AtomicUsize::new(0);

        assert_eq!(counted(&cache, "k", &calls, 11, CacheTtl::Seconds(30)).await, 11);
        assert_eq!(counted(&cache, "k", &calls, 12, CacheTtl::Seconds(30)).await, 11);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().mode, "local");

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(counted(&cache, "k", &calls, 12, CacheTtl::Seconds(30)).await, 12);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_error_degrades_without_failing_caller() {
        let remote = MemoryRemoteCache::new();
        let cache = tiered(&remote, config()).await;
        let calls = AtomicUsize::new(0);
        counted(&cache, "k", &calls, 1, CacheTtl::Never).await;

        remote.set_failing(true);
        // The local safety-net copy answers.
        assert_eq!(counted(&cache, "k", &calls, 2, CacheTtl::Never).await, 1);
        assert!(!cache.lifecycle().is_available());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert_eq!(counted(&cache, "other", &calls, 3, CacheTtl::Never).await, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        cache.lifecycle().shutdown().await;
    }

    #[tokio::test]
    async fn test_compute_errors_propagate_and_are_not_cached() {
        let remote = MemoryRemoteCache::new();
        let cache = tiered(&remote, config()).await;

        let err = cache
            .get_or_compute("k", || async { Err::<u64, _>("db down") }, CacheTtl::Never)
            .await
            .expect_err("compute failed");
        assert_eq!(err, "db down");
        assert!(!remote.contains("k"));
        assert_eq!(cache.stats().local_entries, 0);
    }

    #[tokio::test]
    async fn test_bypass_never_caches() {
        let remote = MemoryRemoteCache::new();
        let cache = tiered(&remote, config().with_enabled(false)).await;
        let calls = AtomicUsize::new(0);

        counted(&cache, "k", &calls, 1, CacheTtl::Seconds(60)).await;
        counted(&cache, "k", &calls, 1, CacheTtl::Seconds(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!remote.contains("k"));
        assert_eq!(cache.stats().mode, "bypass");
        assert_eq!(cache.stats().local_entries, 0);
    }

    #[tokio::test]
    async fn test_never_ttl_is_persistent_remotely() {
        let remote = MemoryRemoteCache::new();
        let cache = tiered(&remote, config()).await;
        let calls = AtomicUsize::new(0);

        counted(&cache, "k", &calls, 5, CacheTtl::Never).await;
        assert_eq!(remote.ttl("k").await.expect("ttl"), KeyTtl::Persistent);
    }

    #[tokio::test]
    async fn test_invalidate_by_category() {
        let remote = MemoryRemoteCache::new();
        let cache = tiered(&remote, config()).await;
        let calls = AtomicUsize::new(0);

        let balance = cache.query_key("SELECT * FROM balances WHERE address = ?", &["a".into()]);
        let block = cache.query_key("SELECT MAX(block_index) FROM blocks", &[]);
        counted(&cache, &balance, &calls, 1, CacheTtl::Never).await;
        counted(&cache, &block, &calls, 2, CacheTtl::Never).await;

        cache.invalidate_by_category("balance").await;
        assert!(!remote.contains(&balance));
        assert!(remote.contains(&block));
        assert!(cache.registry().keys("balance").is_empty());

        counted(&cache, &balance, &calls, 1, CacheTtl::Never).await;
        counted(&cache, &block, &calls, 2, CacheTtl::Never).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_invalidate_by_pattern_scans_and_batches() {
        let remote = MemoryRemoteCache::new();
        let cache = tiered(&remote, config()).await;
        let calls = AtomicUsize::new(0);

        for i in 0..150 {
            counted(&cache, &format!("src20:{i}"), &calls, i, CacheTtl::Never).await;
        }
        counted(&cache, "stamp:1", &calls, 1, CacheTtl::Never).await;

        cache.invalidate_by_pattern("src20:*").await;
        assert_eq!(remote.delete_batches(), vec![100, 50]);
        assert!(remote.contains("stamp:1"));
        assert_eq!(cache.stats().local_entries, 1);

        // Nothing matched: no delete issued.
        cache.invalidate_by_pattern("dispenser:*").await;
        assert_eq!(remote.delete_batches().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pattern_invalidation_sweeps_local_when_remote_down() {
        let remote = MemoryRemoteCache::new();
        remote.set_failing(true);
        let cache = tiered(&remote, config()).await;
        let calls = AtomicUsize::new(0);

        counted(&cache, "stamp:1", &calls, 1, CacheTtl::Never).await;
        counted(&cache, "block:1", &calls, 2, CacheTtl::Never).await;
        cache.invalidate_by_pattern("stamp:*").await;

        assert_eq!(cache.stats().local_entries, 1);
        assert!(remote.delete_batches().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pattern_invalidation_degrades_when_remote_fails_mid_run() {
        let remote = MemoryRemoteCache::new();
        let cache = tiered(&remote, config()).await;
        let calls = AtomicUsize::new(0);
        counted(&cache, "stamp:1", &calls, 1, CacheTtl::Never).await;
        counted(&cache, "stamp:2", &calls, 2, CacheTtl::Never).await;
        counted(&cache, "block:1", &calls, 3, CacheTtl::Never).await;
        assert!(cache.lifecycle().is_available());

        remote.set_failing(true);
        cache.invalidate_by_pattern("stamp:*").await;

        assert_eq!(cache.stats().local_entries, 1);
        assert!(!cache.lifecycle().is_available());
        assert!(cache.lifecycle().is_retrying());
        cache.lifecycle().shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_category_invalidation_degrades_when_remote_fails_mid_run() {
        let remote = MemoryRemoteCache::new();
        let cache = tiered(&remote, config()).await;
        let calls = AtomicUsize::new(0);
        let balance = cache.query_key("SELECT * FROM balances WHERE address = ?", &["a".into()]);
        let block = cache.query_key("SELECT MAX(block_index) FROM blocks", &[]);
        counted(&cache, &balance, &calls, 1, CacheTtl::Never).await;
        counted(&cache, &block, &calls, 2, CacheTtl::Never).await;

        remote.set_failing(true);
        cache.invalidate_by_category("balance").await;

        assert_eq!(cache.stats().local_entries, 1);
        assert!(cache.registry().keys("balance").is_empty());
        assert!(!cache.lifecycle().is_available());
        assert!(cache.lifecycle().is_retrying());

        // The invalidated key is recomputed from the local path.
        counted(&cache, &balance, &calls, 1, CacheTtl::Never).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        cache.lifecycle().shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_remote_write_keeps_local_copy() {
        let remote = MemoryRemoteCache::new();
        let cache = tiered(&remote, config()).await;
        let calls = AtomicUsize::new(0);

        remote.set_failing_writes(true);
        assert_eq!(counted(&cache, "k", &calls, 4, CacheTtl::Never).await, 4);
        assert!(!remote.contains("k"));
        assert!(!cache.lifecycle().is_available());
        assert!(cache.lifecycle().is_retrying());

        assert_eq!(counted(&cache, "k", &calls, 5, CacheTtl::Never).await, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        cache.lifecycle().shutdown().await;
    }
}
