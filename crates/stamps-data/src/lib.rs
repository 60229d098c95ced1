//! Resilient data access for the Stamps explorer.
//!
//! [`DataAccess`] is the single per-process handle controllers use: pooled,
//! self-healing MySQL access from [`stamps_db`] plus tiered caching from
//! [`stamps_cache`].
//!
//! # Example
//!
//! ```ignore
//! use stamps_data::{AppConfig, CacheTtl, DataAccess};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = stamps_data::config::loader::load_config()?;
//! let data = DataAccess::connect(&config).await?;
//!
//! let rows = data
//!     .execute_with_cache(
//!         "SELECT * FROM balances WHERE address = ?",
//!         &["bc1q...".into()],
//!         CacheTtl::Seconds(60),
//!     )
//!     .await?;
//! data.invalidate_by_category("balance").await;
//! # Ok(())
//! # }
//! ```

mod access;
mod error;

pub mod config;
pub mod metrics;
pub mod observability;

pub use access::{DataAccess, DataStats};
pub use config::AppConfig;
pub use error::DataError;
pub use metrics::{init_metrics, render_metrics};
pub use observability::{apply_logging_level, init_tracing, init_tracing_with_level};

// Re-export the types callers handle directly.
pub use stamps_cache::{CacheStats, CacheTtl};
pub use stamps_db::{DbError, PoolStats, QueryErrorKind, RowSet, SqlParam};
