//! Driver seam: what the pool needs from a database connection.

use std::fmt;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{RowSet, SqlParam};

/// An open database handle.
///
/// Handles are never shared: the pool owns idle ones and exactly one caller
/// owns a checked-out one, so methods take `&mut self`.
#[async_trait]
pub trait DbConnection: Send + fmt::Debug {
    /// Runs one statement with positional parameters.
    async fn execute(&mut self, query: &str, params: &[SqlParam]) -> Result<RowSet>;

    /// Closes the underlying transport.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Opens a single connection, with no retry.
///
/// [`crate::ConnectionFactory`] layers retry and session defaults on top.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn DbConnection>>;

    /// Target description for logs. Must not contain secrets.
    fn describe(&self) -> String {
        "database".to_string()
    }
}
