//! FSM timers: one-shot, jittered durations fired as events back to the FSM
//!
//! A jittered one-shot `tokio::time::Sleep`, since RFC 4271 Section 10
//! recommends randomizing timer resets to avoid synchronized peer churn.

// SPDX-License-Identifier: AGPL-3.0-or-later

use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

/// Multiply a nominal duration by a uniform factor in [0.75, 1.00), per
/// RFC 4271 Section 10.
#[must_use]
pub fn jitter(nominal: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.75..1.00);
    nominal.mul_f64(factor)
}

/// Default `ConnectRetryTime` (RFC 4271 Section 8)
pub const DEFAULT_CONNECT_RETRY_TIME: Duration = Duration::from_secs(120);
/// Default large `HoldTime` used before the first OPEN negotiates one
pub const DEFAULT_LARGE_HOLD_TIME: Duration = Duration::from_secs(240);
/// Default `DelayOpenTime` (RFC 4271 does not fix a value; see Open Questions)
pub const DEFAULT_DELAY_OPEN_TIME: Duration = Duration::from_secs(1);
/// Ceiling applied to the exponential `IdleHoldTime` backoff
pub const MAX_IDLE_HOLD_TIME: Duration = Duration::from_secs(60);

/// A one-shot timer that can be armed, cancelled, and polled for expiry.
///
/// The FSM owns one `Timer` per RFC 4271 timer (`ConnectRetryTimer`,
/// `HoldTimer`, `KeepaliveTimer`, `DelayOpenTimer`, `IdleHoldTimer`); firing
/// is surfaced as an `Event` rather than mutating FSM state directly, so the
/// per-peer task can `tokio::select!` over all of them uniformly.
#[derive(Debug)]
pub struct Timer {
    deadline: Option<Instant>,
}

impl Default for Timer {
    fn default() -> Self {
        Self { deadline: None }
    }
}

impl Timer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer to fire `duration` from now, jittered.
    pub fn arm(&mut self, duration: Duration) {
        self.deadline = Some(Instant::now() + jitter(duration));
    }

    /// Arm the timer without jitter (used for Hold/Keepalive restarts that
    /// should track a fixed negotiated cadence).
    pub fn arm_exact(&mut self, duration: Duration) {
        self.deadline = Some(Instant::now() + duration);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// The instant this timer will next fire, if armed.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Await this timer's deadline, suspending forever if unarmed. Intended
    /// for use as one branch of a `tokio::select!` alongside socket I/O.
    pub async fn wait(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_within_bounds() {
        for _ in 0..1000 {
            let d = jitter(Duration::from_secs(100));
            assert!(d >= Duration::from_millis(75_000));
            assert!(d < Duration::from_millis(100_000));
        }
    }

    #[test]
    fn test_unarmed_timer_has_no_deadline() {
        let t = Timer::new();
        assert!(!t.is_armed());
        assert!(t.deadline().is_none());
    }

    #[tokio::test]
    async fn test_armed_timer_fires() {
        let mut t = Timer::new();
        t.arm_exact(Duration::from_millis(1));
        t.wait().await;
    }
}
