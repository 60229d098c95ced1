//! Pool and query metrics.
//!
//! Recorded through the `metrics` facade; nothing is emitted unless the
//! process installs a recorder.

use std::time::Duration;

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    pub const DB_POOL_CONNECTIONS_TOTAL: &str = "db_pool_connections_total";
    pub const DB_POOL_CONNECTIONS_IDLE: &str = "db_pool_connections_idle";
    pub const DB_POOL_CONNECTIONS_ACTIVE: &str = "db_pool_connections_active";
    pub const DB_POOL_ACQUIRE_DURATION_SECONDS: &str = "db_pool_acquire_duration_seconds";
    pub const DB_POOL_EVICTIONS_TOTAL: &str = "db_pool_evictions_total";
    pub const DB_QUERY_RETRIES_TOTAL: &str = "db_query_retries_total";
    pub const DB_QUERY_FAILURES_TOTAL: &str = "db_query_failures_total";
}

/// Record database pool statistics.
pub fn record_pool_stats(total: usize, idle: usize, active: usize) {
    gauge!(names::DB_POOL_CONNECTIONS_TOTAL).set(total as f64);
    gauge!(names::DB_POOL_CONNECTIONS_IDLE).set(idle as f64);
    gauge!(names::DB_POOL_CONNECTIONS_ACTIVE).set(active as f64);
}

/// Record database connection acquire duration.
pub fn record_acquire_duration(duration: Duration) {
    histogram!(names::DB_POOL_ACQUIRE_DURATION_SECONDS).record(duration.as_secs_f64());
}

/// Record a connection evicted after failing its health probe.
pub fn record_eviction(reason: &'static str) {
    counter!(names::DB_POOL_EVICTIONS_TOTAL, "reason" => reason).increment(1);
}

/// Record a retried query attempt.
pub fn record_query_retry(class: &'static str) {
    counter!(names::DB_QUERY_RETRIES_TOTAL, "class" => class).increment(1);
}

/// Record a query that failed for good.
pub fn record_query_failure(class: &'static str) {
    counter!(names::DB_QUERY_FAILURES_TOTAL, "class" => class).increment(1);
}
