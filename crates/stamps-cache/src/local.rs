//! In-process fallback tier.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::glob::GlobPattern;
use crate::ttl::CacheTtl;

/// A cached value with its expiry.
///
/// The data is wrapped in `Arc` so hits clone a pointer, not the payload.
#[derive(Clone, Debug)]
pub struct CachedEntry {
    pub data: Arc<Vec<u8>>,
    pub expires_at: Option<Instant>,
}

impl CachedEntry {
    pub fn new(data: Vec<u8>, ttl: CacheTtl) -> Self {
        Self {
            data: Arc::new(data),
            expires_at: ttl.as_duration().map(|d| Instant::now() + d),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Expiring concurrent map, per process.
#[derive(Debug, Default)]
pub struct LocalCache {
    entries: DashMap<String, CachedEntry>,
}

impl LocalCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live value for `key`. An expired entry is removed on the way.
    pub fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        let entry = self.entries.get(key)?;
        if !entry.is_expired() {
            return Some(Arc::clone(&entry.data));
        }
        drop(entry);
        self.entries.remove_if(key, |_, e| e.is_expired());
        None
    }

    /// Stores `data`. A zero lifetime is already expired and is not stored.
    pub fn insert(&self, key: &str, data: Vec<u8>, ttl: CacheTtl) {
        if !ttl.is_storable() {
            return;
        }
        self.entries.insert(key.to_string(), CachedEntry::new(data, ttl));
    }

    pub fn remove_keys(&self, keys: &[String]) -> usize {
        keys.iter()
            .filter(|k| self.entries.remove(k.as_str()).is_some())
            .count()
    }

    /// Removes every key matching `pattern`; returns how many.
    pub fn remove_matching(&self, pattern: &GlobPattern) -> usize {
        let before = self.entries.len();
        self.entries.retain(|k, _| !pattern.is_match(k));
        before.saturating_sub(self.entries.len())
    }

    /// Entries held, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}
