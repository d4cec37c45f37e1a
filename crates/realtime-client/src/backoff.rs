//! Capped exponential backoff shared by reconnection and ack retries.
//!
//! ```text
//! delay[n] = min(base * 2^(n-1), cap)
//! ```

use std::time::Duration;

/// Delay before attempt `attempt` (1-based). Attempt 0 is treated as 1.
pub fn delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exp).min(cap)
}

/// [`delay`] with up to `ratio` of the delay added as jitter.
///
/// Jitter is derived from the wall clock's subsecond nanos, which is enough
/// spread for reconnect storms without pulling in an RNG.
pub fn jittered(base: Duration, cap: Duration, attempt: u32, ratio: f64) -> Duration {
    let d = delay(base, cap, attempt);
    if ratio <= 0.0 {
        return d;
    }
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    let unit = f64::from(nanos % 1000) / 1000.0;
    d + d.mul_f64(ratio.min(1.0) * unit)
}
