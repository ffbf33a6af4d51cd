//! Retry scheduling.
//!
//! Delays grow exponentially with the attempt number and are optionally
//! spread by ±25% jitter so that a burst of failures does not come back as a
//! burst of retries.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Fraction of the exponential delay used as the jitter half-width.
pub const JITTER_FRACTION: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay_ms: i64,
    pub max_delay_ms: i64,
    pub use_jitter: bool,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: i64) -> i64 {
        compute_delay(
            attempt,
            self.base_delay_ms,
            self.max_delay_ms,
            self.use_jitter,
            self.multiplier,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule attempt number `attempt` (1-based) after `delay_ms`.
    Retry { attempt: i64, delay_ms: i64 },
    /// No retries left.
    DeadLetter,
}

/// Decide what happens to a message that has failed `retry_count` times
/// before this failure.
pub fn decide(retry_count: i64, max_retries: i64, policy: &RetryPolicy) -> RetryDecision {
    let attempt = retry_count + 1;
    if attempt <= max_retries {
        RetryDecision::Retry {
            attempt,
            delay_ms: policy.delay_for(attempt),
        }
    } else {
        RetryDecision::DeadLetter
    }
}

/// Delay before retry number `attempt` (1-based), using the thread rng for
/// jitter.
pub fn compute_delay(
    attempt: i64,
    base_delay_ms: i64,
    max_delay_ms: i64,
    use_jitter: bool,
    multiplier: f64,
) -> i64 {
    compute_delay_with(
        &mut rand::thread_rng(),
        attempt,
        base_delay_ms,
        max_delay_ms,
        use_jitter,
        multiplier,
    )
}

/// `clamp(base * multiplier^(attempt - 1) ± jitter, 0, max)`.
pub fn compute_delay_with<R: Rng + ?Sized>(
    rng: &mut R,
    attempt: i64,
    base_delay_ms: i64,
    max_delay_ms: i64,
    use_jitter: bool,
    multiplier: f64,
) -> i64 {
    let max = max_delay_ms.max(0) as f64;
    let exponent = (attempt.max(1) - 1).min(i32::MAX as i64) as i32;

    let delay = base_delay_ms.max(0) as f64 * multiplier.powi(exponent);
    let delay = if delay.is_nan() { 0.0 } else { delay.min(f64::MAX) };

    // Jitter is a share of the uncapped value. When even its low end is past
    // the cap the result is the cap, so the rng is skipped.
    let spread = delay * JITTER_FRACTION;
    let delay = if use_jitter && spread > 0.0 && delay - spread < max {
        delay + rng.gen_range(-spread..=spread)
    } else {
        delay
    };

    delay.clamp(0.0, max).round() as i64
}
