use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;
pub const DEFAULT_RETRY_INTERVALS: [u64; 3] = [30, 120, 300];

/// Delivery retry policy, re-read before every backoff decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_attempts: i32,
    /// Delay before attempt `n + 1`, in seconds, indexed by `n - 1`.
    pub retry_intervals: Vec<u64>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_intervals: DEFAULT_RETRY_INTERVALS.to_vec(),
        }
    }
}

impl RetrySettings {
    pub fn new(max_attempts: i32, retry_intervals: Vec<u64>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            retry_intervals,
        }
    }
}
