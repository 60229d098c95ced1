//! Cache metrics.

use metrics::{counter, gauge};

/// Metric names as constants for consistency.
pub mod names {
    pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";
    pub const CACHE_ENTRIES: &str = "cache_entries";
    pub const CACHE_REMOTE_AVAILABLE: &str = "cache_remote_available";
    pub const CACHE_REMOTE_ERRORS_TOTAL: &str = "cache_remote_errors_total";
}

/// Record a cache hit on `tier` (`remote` or `local`).
pub fn record_cache_hit(tier: &'static str) {
    counter!(names::CACHE_HITS_TOTAL, "tier" => tier).increment(1);
}

pub fn record_cache_miss() {
    counter!(names::CACHE_MISSES_TOTAL).increment(1);
}

/// Set the number of local-tier entries.
pub fn set_local_entries(count: usize) {
    gauge!(names::CACHE_ENTRIES, "tier" => "local").set(count as f64);
}

pub fn set_remote_available(available: bool) {
    gauge!(names::CACHE_REMOTE_AVAILABLE).set(if available { 1.0 } else { 0.0 });
}

pub fn record_remote_error(class: &'static str) {
    counter!(names::CACHE_REMOTE_ERRORS_TOTAL, "class" => class).increment(1);
}
