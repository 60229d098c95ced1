//! In-process [`RemoteCache`] with failure injection.
//!
//! Behaves like a single shared Redis node: clones share storage, so two
//! tiered caches built on clones see the same remote tier. Used by tests
//! and single-node setups without a cache service.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::{CacheError, Result};
use crate::glob::GlobPattern;
use crate::remote::{DELETE_BATCH, RemoteCache, SCAN_COUNT};
use crate::ttl::{CacheTtl, KeyTtl};

#[derive(Debug)]
struct StoredValue {
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

#[derive(Debug, Default)]
struct Shared {
    entries: Mutex<HashMap<String, StoredValue>>,
    failing: AtomicBool,
    failing_writes: AtomicBool,
    gets: AtomicU64,
    sets: AtomicU64,
    scan_pages: AtomicU64,
    delete_batches: Mutex<Vec<usize>>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryRemoteCache {
    shared: Arc<Shared>,
}

impl MemoryRemoteCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every operation fails as if the service were down.
    pub fn set_failing(&self, failing: bool) {
        self.shared.failing.store(failing, Ordering::SeqCst);
    }

    /// While set, `set` and `delete` fail but reads still succeed.
    pub fn set_failing_writes(&self, failing: bool) {
        self.shared.failing_writes.store(failing, Ordering::SeqCst);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.shared
            .entries
            .lock()
            .get(key)
            .is_some_and(|v| !v.is_expired())
    }

    /// Live entries.
    pub fn len(&self) -> usize {
        self.shared
            .entries
            .lock()
            .values()
            .filter(|v| !v.is_expired())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn gets(&self) -> u64 {
        self.shared.gets.load(Ordering::SeqCst)
    }

    pub fn sets(&self) -> u64 {
        self.shared.sets.load(Ordering::SeqCst)
    }

    /// Cursor pages served by [`RemoteCache::keys`].
    pub fn scan_pages(&self) -> u64 {
        self.shared.scan_pages.load(Ordering::SeqCst)
    }

    /// Size of every delete batch issued, in order.
    pub fn delete_batches(&self) -> Vec<usize> {
        self.shared.delete_batches.lock().clone()
    }

    fn check(&self) -> Result<()> {
        if self.shared.failing.load(Ordering::SeqCst) {
            Err(CacheError::Unreachable("connection refused".into()))
        } else {
            Ok(())
        }
    }

    fn check_write(&self) -> Result<()> {
        self.check()?;
        if self.shared.failing_writes.load(Ordering::SeqCst) {
            Err(CacheError::Command(
                "READONLY You can't write against a read only replica.".into(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RemoteCache for MemoryRemoteCache {
    async fn connect(&self) -> Result<()> {
        self.check()
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check()?;
        self.shared.gets.fetch_add(1, Ordering::SeqCst);
        let mut entries = self.shared.entries.lock();
        match entries.get(key) {
            Some(v) if v.is_expired() => {
                entries.remove(key);
                Ok(None)
            }
            Some(v) => Ok(Some(v.data.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: CacheTtl) -> Result<()> {
        self.check_write()?;
        self.shared.sets.fetch_add(1, Ordering::SeqCst);
        let expires_at = ttl.as_duration().map(|d| Instant::now() + d);
        self.shared.entries.lock().insert(
            key.to_string(),
            StoredValue {
                data: value.to_vec(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.check()?;
        let glob = GlobPattern::new(pattern).map_err(|e| CacheError::Command(e.to_string()))?;

        let mut all: Vec<String> = {
            let entries = self.shared.entries.lock();
            entries
                .iter()
                .filter(|(_, v)| !v.is_expired())
                .map(|(k, _)| k.clone())
                .collect()
        };
        all.sort_unstable();

        let mut found = Vec::new();
        for page in all.chunks(SCAN_COUNT) {
            self.shared.scan_pages.fetch_add(1, Ordering::SeqCst);
            found.extend(page.iter().filter(|k| glob.is_match(k)).cloned());
        }
        if all.is_empty() {
            self.shared.scan_pages.fetch_add(1, Ordering::SeqCst);
        }
        Ok(found)
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        self.check_write()?;
        let mut removed = 0;
        for batch in keys.chunks(DELETE_BATCH) {
            self.shared.delete_batches.lock().push(batch.len());
            let mut entries = self.shared.entries.lock();
            removed += batch.iter().filter(|k| entries.remove(*k).is_some()).count() as u64;
        }
        Ok(removed)
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        self.check()?;
        let entries = self.shared.entries.lock();
        Ok(match entries.get(key) {
            None => KeyTtl::Missing,
            Some(v) if v.is_expired() => KeyTtl::Missing,
            Some(StoredValue {
                expires_at: None, ..
            }) => KeyTtl::Persistent,
            Some(StoredValue {
                expires_at: Some(at),
                ..
            }) => KeyTtl::Expires(at.saturating_duration_since(Instant::now())),
        })
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_set_get_and_expiry() {
        let cache = MemoryRemoteCache::new();
        cache.set("a", b"1", CacheTtl::Seconds(10)).await.expect("set");
        cache.set("b", b"2", CacheTtl::Never).await.expect("set");

        assert_eq!(cache.get("a").await.expect("get"), Some(b"1".to_vec()));
        assert!(matches!(cache.ttl("a").await.expect("ttl"), KeyTtl::Expires(_)));
        assert_eq!(cache.ttl("b").await.expect("ttl"), KeyTtl::Persistent);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.get("a").await.expect("get"), None);
        assert_eq!(cache.ttl("a").await.expect("ttl"), KeyTtl::Missing);
        assert!(cache.contains("b"));
    }

    #[tokio::test]
    async fn test_failing_rejects_everything() {
        let cache = MemoryRemoteCache::new();
        cache.set_failing(true);
        assert!(cache.ping().await.is_err());
        assert!(cache.get("a").await.is_err());
        cache.set_failing(false);
        assert!(cache.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_failing_writes_still_serve_reads() {
        let cache = MemoryRemoteCache::new();
        cache.set("a", b"1", CacheTtl::Never).await.expect("set");
        cache.set_failing_writes(true);

        assert!(cache.ping().await.is_ok());
        assert_eq!(cache.get("a").await.expect("get"), Some(b"1".to_vec()));
        assert!(cache.set("b", b"2", CacheTtl::Never).await.is_err());
        assert!(cache.delete(&["a".to_string()]).await.is_err());
        assert!(cache.contains("a"));
    }

    #[tokio::test]
    async fn test_keys_are_scanned_in_pages_and_deleted_in_batches() {
        let cache = MemoryRemoteCache::new();
        for i in 0..250 {
            cache
                .set(&format!("stamp:{i}"), b"x", CacheTtl::Never)
                .await
                .expect("set");
        }
        cache.set("block:1", b"x", CacheTtl::Never).await.expect("set");

        let keys = cache.keys("stamp:*").await.expect("keys");
        assert_eq!(keys.len(), 250);
        assert_eq!(cache.scan_pages(), 3);

        assert_eq!(cache.delete(&keys).await.expect("del"), 250);
        assert_eq!(cache.delete_batches(), vec![100, 100, 50]);
        assert_eq!(cache.len(), 1);
    }
}
