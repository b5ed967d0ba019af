//! Backoff policy for rate-limited provider calls.

use std::time::Duration;

/// Attempts beyond this fail with a fatal error.
pub const MAX_RETRIES: u32 = 8;

const BASE_DELAY_MS: u64 = 2_000;

/// Delay before retry `attempt` (1-indexed): exponential from 2 s with 20%
/// headroom, unless the vendor supplied a `Retry-After`.
pub fn backoff_delay(attempt: u32, retry_after_secs: Option<u64>) -> Duration {
    if let Some(secs) = retry_after_secs {
        return Duration::from_secs(secs);
    }
    let backoff_ms = BASE_DELAY_MS.saturating_mul(1 << (attempt.saturating_sub(1)).min(20));
    let jitter_ms = backoff_ms / 5;
    Duration::from_millis(backoff_ms + jitter_ms)
}

/// Rate-limit and overload statuses for the Anthropic API family.
pub fn anthropic_retryable(status: u16) -> bool {
    matches!(status, 429 | 529)
}

/// Equivalent transient statuses for the OpenAI API family.
pub fn openai_retryable(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503)
}

/// Parse a `Retry-After` header value (seconds form only).
pub fn parse_retry_after(value: Option<&str>) -> Option<u64> {
    value.and_then(|v| v.trim().parse().ok())
}
