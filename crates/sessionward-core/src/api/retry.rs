//! Retry classification and backoff.
//!
//! The policy never sleeps; it only says whether an error is worth another
//! attempt and how long the caller should wait first.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ApiError;

/// Initial backoff delay in milliseconds.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Backoff ceiling in milliseconds.
const MAX_BACKOFF_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: INITIAL_BACKOFF_MS,
            max_delay_ms: MAX_BACKOFF_MS,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay_ms: base_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
        }
    }

    /// Timeouts, network failures, 408, 429 and 5xx are transient.
    /// Auth failures go through the refresh path instead.
    pub fn is_retryable(&self, error: &ApiError) -> bool {
        match error {
            ApiError::Timeout | ApiError::Network(_) => true,
            ApiError::Http { status, .. } => matches!(status, 408 | 429 | 500..=599),
            ApiError::AuthExpired { .. }
            | ApiError::RefreshFailed(_)
            | ApiError::InvalidResponse(_) => false,
        }
    }

    /// Delay before retry number `attempt` (0-based): base doubled per attempt, capped.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}
