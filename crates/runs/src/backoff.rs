//! Retry backoff policy.

/// Delay before the first retry.
pub const BASE_DELAY_SECONDS: u64 = 30;

/// Hard cap on the retry delay (15 minutes).
pub const MAX_DELAY_SECONDS: u64 = 900;

/// Delay in seconds before retrying after the given attempt.
///
/// `min(30 * 2^max(0, attempt_count - 1), 900)`: first retry after 30s,
/// doubling each attempt, capped at 15 minutes. Deterministic, no jitter.
pub fn retry_delay_seconds(attempt_count: u32) -> u64 {
    let exponent = attempt_count.saturating_sub(1).min(31);
    BASE_DELAY_SECONDS
        .saturating_mul(1u64 << exponent)
        .min(MAX_DELAY_SECONDS)
}
