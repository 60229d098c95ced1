//! Prometheus exporter for the metrics recorded by the pool and the cache.

use std::sync::OnceLock;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use stamps_cache::metrics::names as cache;
use stamps_db::metrics::names as db;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics exporter.
///
/// Returns `true` if initialization succeeded, `false` if already initialized.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        tracing::debug!("Prometheus metrics already initialized");
        return false;
    }

    // Pull-based: the embedding process serves the rendering itself.
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_err() {
                tracing::warn!("Failed to store Prometheus handle (already set)");
                return false;
            }
            describe();
            tracing::info!("Prometheus metrics initialized");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus recorder");
            false
        }
    }
}

/// Render all metrics in Prometheus text format.
///
/// Returns `None` if metrics were not initialized.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

fn describe() {
    describe_gauge!(db::DB_POOL_CONNECTIONS_TOTAL, "Pooled connections, idle plus active");
    describe_gauge!(db::DB_POOL_CONNECTIONS_IDLE, "Idle pooled connections");
    describe_gauge!(db::DB_POOL_CONNECTIONS_ACTIVE, "Checked-out pooled connections");
    describe_histogram!(
        db::DB_POOL_ACQUIRE_DURATION_SECONDS,
        Unit::Seconds,
        "Time to check out a healthy connection"
    );
    describe_counter!(db::DB_POOL_EVICTIONS_TOTAL, "Connections evicted after a failed probe");
    describe_counter!(db::DB_QUERY_RETRIES_TOTAL, "Query attempts retried, by error class");
    describe_counter!(db::DB_QUERY_FAILURES_TOTAL, "Queries failed for good, by error class");

    describe_counter!(cache::CACHE_HITS_TOTAL, "Cache hits, by tier");
    describe_counter!(cache::CACHE_MISSES_TOTAL, "Cache misses");
    describe_gauge!(cache::CACHE_ENTRIES, "Entries held in the local tier");
    describe_gauge!(cache::CACHE_REMOTE_AVAILABLE, "1 when the remote tier is in use");
    describe_counter!(cache::CACHE_REMOTE_ERRORS_TOTAL, "Remote cache errors, by class");
}
