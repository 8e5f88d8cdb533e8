use std::time::Duration;

/// Exponential backoff for the `attempt`-th consecutive failure.
///
/// `delay = base * 2^(attempt - 1)`, capped at `max`. Attempt 0 waits nothing.
pub fn compute_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let base_ms = base.as_millis() as u64;
    let max_ms = max.as_millis() as u64;
    let multiplier = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
    let delay_ms = base_ms.saturating_mul(multiplier).min(max_ms);

    Duration::from_millis(delay_ms)
}
