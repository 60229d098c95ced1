//! Pooled, self-healing MySQL access for the Stamps explorer.
//!
//! This crate owns everything between a caller's SQL text and the server:
//! opening connections with bounded retry, keeping a bounded pool of them
//! healthy, and running statements with retry driven by error class.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use stamps_db::{ConnectionFactory, ConnectionPool, DbConfig, MySqlConnector, QueryExecutor};
//!
//! # async fn example() -> stamps_db::Result<()> {
//! let config = DbConfig::new("localhost", "stamps").with_credentials("app", "secret");
//! let factory = ConnectionFactory::new(Arc::new(MySqlConnector::new(&config)), &config);
//! let pool = Arc::new(ConnectionPool::new(factory, &config));
//! pool.warm_up().await;
//!
//! let executor = QueryExecutor::new(pool, &config);
//! let rows = executor
//!     .execute("SELECT * FROM stamps WHERE cpid = ?", &["A123".into()])
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`connection`]: the driver seam ([`Connector`], [`DbConnection`])
//! - [`mysql`]: the MySQL driver and server error classification
//! - [`ConnectionFactory`]: connect with retry and session defaults
//! - [`ConnectionPool`]: bounded, health-checked checkout
//! - [`KeepAliveSweeper`]: periodic pruning of dead idle connections
//! - [`QueryExecutor`]: classified retry around single statements

mod backoff;
mod config;
mod error;
mod executor;
mod factory;
mod pool;
mod sweeper;
mod types;

pub mod connection;
pub mod health;
pub mod metrics;
pub mod mysql;

/// In-process scripted driver for tests.
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use backoff::{BACKOFF_MULTIPLIER, backoff_delay};
pub use config::{DEFAULT_MAX_RETRIES, DbConfig};
pub use connection::{Connector, DbConnection};
pub use error::{DbError, QueryErrorKind, Result};
pub use executor::QueryExecutor;
pub use factory::ConnectionFactory;
pub use mysql::{MySqlConnector, MySqlDbConnection};
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
pub use sweeper::KeepAliveSweeper;
pub use types::{Row, RowSet, SqlParam};

/// Convenient imports for callers.
pub mod prelude {
    pub use crate::{
        ConnectionPool, DbConfig, DbError, PoolStats, QueryExecutor, Result, RowSet, SqlParam,
    };
}
