//! Tiered caching for the Stamps data-access layer.
//!
//! ## Architecture
//!
//! - **Remote tier**: a shared key-value service behind [`RemoteCache`]
//!   ([`RedisRemoteCache`] in production, [`MemoryRemoteCache`] in tests)
//! - **Local tier**: a per-process expiring [`LocalCache`] used whenever the
//!   remote tier is down, and as a safety-net copy when it is up
//! - **Lifecycle**: [`CacheLifecycle`] owns remote availability and
//!   reconnects in the background
//! - **Registry**: [`CacheKeyRegistry`] files query keys under categories
//!   for targeted invalidation
//!
//! ## Graceful Degradation
//!
//! Remote errors are absorbed: the call is served from the local tier or
//! computed directly, availability flips to false and a reconnection is
//! scheduled.

mod config;
mod error;
mod glob;
mod keys;
mod lifecycle;
mod local;
mod memory;
mod redis_store;
mod registry;
mod remote;
mod tiered;
mod ttl;

pub mod metrics;

pub use config::{CacheConfig, UNREACHABLE_ENDPOINT};
pub use error::{CacheError, Result};
pub use glob::GlobPattern;
pub use keys::generate_key;
pub use lifecycle::{CacheLifecycle, LifecycleState, LifecycleStatus, PROBE_KEY};
pub use local::{CachedEntry, LocalCache};
pub use memory::MemoryRemoteCache;
pub use redis_store::RedisRemoteCache;
pub use registry::{CacheKeyRegistry, DEFAULT_RULES};
pub use remote::{DELETE_BATCH, RemoteCache, SCAN_COUNT};
pub use tiered::{CacheStats, TieredCache};
pub use ttl::{CacheTtl, KeyTtl};
