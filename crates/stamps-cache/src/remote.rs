//! Remote cache client seam.

use async_trait::async_trait;

use crate::error::Result;
use crate::ttl::{CacheTtl, KeyTtl};

/// Page size hint for cursor-based key listing.
pub const SCAN_COUNT: usize = 100;

/// Most keys removed by one delete command.
pub const DELETE_BATCH: usize = 100;

/// Thin interface to a remote key-value cache.
///
/// Implementations do not retry and do not track availability; the
/// lifecycle manager and the tiered cache own both concerns.
#[async_trait]
pub trait RemoteCache: Send + Sync {
    /// Checks that a connection to the service can be obtained.
    async fn connect(&self) -> Result<()>;

    async fn ping(&self) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: &[u8], ttl: CacheTtl) -> Result<()>;

    /// Lists keys matching a glob with cursor iteration, never a blocking
    /// full keyspace listing.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Deletes `keys` in batches of at most [`DELETE_BATCH`]. Returns how
    /// many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64>;

    async fn ttl(&self, key: &str) -> Result<KeyTtl>;

    /// Target description for logs. Must not contain secrets.
    fn describe(&self) -> String {
        "remote cache".to_string()
    }
}
