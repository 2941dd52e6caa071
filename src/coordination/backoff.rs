use std::time::Duration;

/// Delay before retry number `failures`: `base * 2^(failures-1)`, capped at `max`
pub fn backoff_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent).unwrap_or(max).min(max)
}
