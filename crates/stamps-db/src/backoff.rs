//! Exponential backoff shared by every retry loop in the layer.

use std::time::Duration;

/// Growth factor between consecutive attempts.
pub const BACKOFF_MULTIPLIER: f64 = 1.5;

/// Delay before retry number `attempt` (1-based): `base * 1.5^(attempt-1)`,
/// never more than `cap`.
pub fn backoff_delay(base: Duration, attempt: u32, cap: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(64) as i32;
    let scaled = base.as_secs_f64() * BACKOFF_MULTIPLIER.powi(exponent);
    if !scaled.is_finite() || scaled >= cap.as_secs_f64() {
        cap
    } else {
        Duration::from_secs_f64(scaled)
    }
}
