//! Per-connection tunables.

use std::time::Duration;

use crate::timer::{Backoff, RetransmitPolicy};

/// Timing parameters of one [`crate::connection::Connection`].
///
/// Connections spawned by `accept` inherit the listener's configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Governs every send-and-wait exchange (SYN, SYN_ACK, data, FIN).
    pub retransmit: RetransmitPolicy,
    /// How long FIN_WAIT_2 waits for the peer's FIN before forcing CLOSED.
    pub fin_wait_timeout: Duration,
    /// TIME_WAIT linger, during which retransmitted peer FINs are re-ACKed.
    pub time_wait: Duration,
    /// Bound on a single `receive`; `None` waits indefinitely.
    pub receive_timeout: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        let retransmit = RetransmitPolicy::default();
        Self {
            retransmit,
            fin_wait_timeout: Duration::from_secs(30),
            time_wait: retransmit.timeout * 2,
            receive_timeout: None,
        }
    }
}

impl ConnectionConfig {
    /// Set the per-attempt timeout; TIME_WAIT follows at twice the value.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.retransmit.timeout = timeout;
        self.time_wait = timeout * 2;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.retransmit.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.retransmit.backoff = backoff;
        self
    }

    pub fn with_fin_wait_timeout(mut self, fin_wait_timeout: Duration) -> Self {
        self.fin_wait_timeout = fin_wait_timeout;
        self
    }

    pub fn with_time_wait(mut self, time_wait: Duration) -> Self {
        self.time_wait = time_wait;
        self
    }

    pub fn with_receive_timeout(mut self, receive_timeout: Option<Duration>) -> Self {
        self.receive_timeout = receive_timeout;
        self
    }
}
