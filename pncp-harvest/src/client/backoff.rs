//! Retry backoff schedule
//!
//! One policy object maps attempt number to delay; the client consumes it
//! uniformly for every transient failure so retry pacing never leaks into
//! business logic.
//!
//! **Schedule:**
//! - attempt 1 -> base (1s default)
//! - attempt n -> base * 2^(n-1)
//! - capped at `cap` (60s default)

use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retrying after the given (1-based) failed attempt
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base.saturating_mul(1u32 << exp);
        delay.min(self.cap)
    }
}
