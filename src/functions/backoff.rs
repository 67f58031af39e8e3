use crate::schema::RetrySettings;
use chrono::{DateTime, Duration, Utc};

/// Delay used when no retry intervals are configured at all.
pub const FALLBACK_RETRY_SECS: u64 = 300;
const MAX_RETRY_SECS: u64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffDecision {
    Retry { at: DateTime<Utc>, delay: Duration },
    Exhausted,
}

/// Delay before the attempt that follows attempt number `attempts` (1-based).
///
/// Indexes `retry_intervals` by `attempts - 1`, clamped to the last entry.
pub fn retry_delay(attempts: i32, retry_intervals: &[u64]) -> Duration {
    let index = usize::try_from(attempts.saturating_sub(1)).unwrap_or(0);
    let secs = retry_intervals
        .get(index)
        .or_else(|| retry_intervals.last())
        .copied()
        .unwrap_or(FALLBACK_RETRY_SECS)
        .min(MAX_RETRY_SECS);
    Duration::seconds(secs as i64)
}

/// `attempts` is the count after the failed attempt has been added.
pub fn decide(attempts: i32, settings: &RetrySettings, now: DateTime<Utc>) -> BackoffDecision {
    if attempts >= settings.max_attempts.max(1) {
        return BackoffDecision::Exhausted;
    }
    let delay = retry_delay(attempts, &settings.retry_intervals);
    BackoffDecision::Retry {
        at: now + delay,
        delay,
    }
}
