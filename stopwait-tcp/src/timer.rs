//! Retransmit timer management.
//!
//! Reliable delivery requires that an unacknowledged datagram is re-sent if no
//! reply arrives within a bounded time.  This module provides:
//! - [`RetransmitPolicy`] — per-attempt timeout, attempt ceiling and backoff.
//! - [`RetransmitTimer`] — the per-exchange timeout state, created fresh for
//!   every exchange and backed off after each expiry.
//!
//! With [`Backoff::Exponential`] the timeout doubles on each consecutive
//! expiry (RFC 6298 §5.5) up to a configurable maximum.

use std::time::Duration;

/// How the per-attempt timeout evolves across retransmissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Every attempt waits the same time.
    Fixed,
    /// Double after every expiry, never exceeding `max`.
    Exponential { max: Duration },
}

/// Adjustable retransmission parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmitPolicy {
    /// Wait for a reply to the first transmission.
    pub timeout: Duration,
    /// Total transmissions (first send included) before giving up.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetransmitPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(500),
            max_attempts: 20,
            backoff: Backoff::Fixed,
        }
    }
}

impl RetransmitPolicy {
    /// Upper bound on the time one exchange can block.
    pub fn worst_case(&self) -> Duration {
        let mut timer = RetransmitTimer::new(*self);
        let mut total = Duration::ZERO;
        for _ in 0..self.max_attempts {
            total += timer.current_rto;
            timer.back_off();
        }
        total
    }
}

/// Timeout state for one send-and-wait exchange.
#[derive(Debug, Clone)]
pub struct RetransmitTimer {
    pub policy: RetransmitPolicy,
    /// Wait applied to the next transmission.
    pub current_rto: Duration,
}

impl RetransmitTimer {
    pub fn new(policy: RetransmitPolicy) -> Self {
        Self {
            policy,
            current_rto: policy.timeout,
        }
    }

    /// Grow the timeout after an expiry, according to the policy.
    ///
    /// Never shrinks: a `max` below the initial timeout acts as no growth.
    pub fn back_off(&mut self) {
        if let Backoff::Exponential { max } = self.policy.backoff {
            let cap = max.max(self.policy.timeout);
            self.current_rto = (self.current_rto * 2).min(cap);
        }
    }
}
