//! Reconnect delay policy: jittered minimum delay and the retry growth curve.

use std::time::Duration;

use rand::Rng;

/// Return a delay uniformly distributed in `[min_delay, min_delay + jitter_range)`.
///
/// Spreads reconnect attempts of many clients after a shared outage so they do
/// not hit the server in lockstep. A zero range returns `min_delay`.
pub fn jittered_delay(min_delay: Duration, jitter_range: Duration) -> Duration {
    let range_nanos = u64::try_from(jitter_range.as_nanos()).unwrap_or(u64::MAX);
    if range_nanos == 0 {
        return min_delay;
    }
    let jitter = rand::thread_rng().gen_range(0..range_nanos);
    min_delay.saturating_add(Duration::from_nanos(jitter))
}

/// Delay before connect attempt number `attempt` (0 = first connect, no delay).
///
/// Grows geometrically from `min` by `grow_factor` per failed attempt and is
/// capped at `max`: 1s, 1.3s, 1.69s, ... with the defaults.
pub fn reconnect_delay(attempt: u32, min: Duration, max: Duration, grow_factor: f64) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let exp = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
    let secs = min.as_secs_f64() * grow_factor.max(1.0).powi(exp);
    if !secs.is_finite() || secs >= max.as_secs_f64() {
        return max;
    }
    Duration::from_secs_f64(secs).min(max)
}
