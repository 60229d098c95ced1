//! Health probe for pooled connections.

use std::time::Duration;

use tracing::debug;

use crate::connection::DbConnection;
use crate::error::{DbError, Result};

/// Round-trip statement used to prove a connection is alive.
pub const PROBE_QUERY: &str = "SELECT 1";

/// Runs [`PROBE_QUERY`] on `conn`, failing if it errors or takes longer than
/// `timeout`.
pub async fn probe(conn: &mut dyn DbConnection, timeout: Duration) -> Result<()> {
    match tokio::time::timeout(timeout, conn.execute(PROBE_QUERY, &[])).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => {
            debug!(error = %e, "health probe failed");
            Err(e)
        }
        Err(_) => {
            debug!(timeout_ms = timeout.as_millis() as u64, "health probe timed out");
            Err(DbError::timeout("health probe", timeout))
        }
    }
}
