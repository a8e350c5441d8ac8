//! Circuit breaker guarding the upstream API (lock-free)
//!
//! States: Closed (initial) -> Open after N consecutive failures -> exactly
//! one HalfOpen probe after the cooldown -> Closed on probe success, back to
//! Open on probe failure. While Open, callers fail fast without touching the
//! transport. All non-idle transitions are logged.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BreakerState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl BreakerState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

pub struct CircuitBreaker {
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    opened_at_ms: AtomicU64,
    failure_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: AtomicU8::new(BreakerState::Closed as u8),
            consecutive_failures: AtomicU32::new(0),
            opened_at_ms: AtomicU64::new(0),
            failure_threshold,
            cooldown,
        }
    }

    pub fn state(&self) -> BreakerState {
        BreakerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// Returns `true` if the caller may issue a request.
    ///
    /// After the cooldown, the CAS winner becomes the single half-open
    /// probe; every other caller keeps failing fast until the probe
    /// resolves.
    pub fn allow_request(&self) -> bool {
        match self.state() {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let opened = self.opened_at_ms.load(Ordering::Acquire);
                if Self::now_ms().saturating_sub(opened) >= self.cooldown.as_millis() as u64 {
                    let won = self
                        .state
                        .compare_exchange(
                            BreakerState::Open as u8,
                            BreakerState::HalfOpen as u8,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok();
                    if won {
                        info!(
                            cooldown_ms = self.cooldown.as_millis() as u64,
                            "Circuit breaker half-open, allowing one probe"
                        );
                    }
                    won
                } else {
                    false
                }
            }
            // A probe is already in flight
            BreakerState::HalfOpen => false,
        }
    }

    pub fn record_success(&self) {
        match self.state() {
            BreakerState::Closed => {
                self.consecutive_failures.store(0, Ordering::Release);
            }
            BreakerState::HalfOpen => {
                self.state
                    .store(BreakerState::Closed as u8, Ordering::Release);
                self.consecutive_failures.store(0, Ordering::Release);
                info!("Circuit breaker closed (upstream recovered)");
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        // A failed probe re-opens immediately and restarts the cooldown
        if self.state() == BreakerState::HalfOpen {
            self.state.store(BreakerState::Open as u8, Ordering::Release);
            self.opened_at_ms.store(Self::now_ms(), Ordering::Release);
            warn!("Circuit breaker re-opened (probe failed), cooldown restarted");
            return;
        }

        let prev = self.consecutive_failures.fetch_add(1, Ordering::AcqRel);

        // >= handles concurrent fetch_add races past the threshold
        if prev + 1 >= self.failure_threshold && self.state() != BreakerState::Open {
            self.state.store(BreakerState::Open as u8, Ordering::Release);
            self.opened_at_ms.store(Self::now_ms(), Ordering::Release);
            warn!(
                consecutive_failures = prev + 1,
                threshold = self.failure_threshold,
                "Circuit breaker opened, failing fast"
            );
        }
    }
}
