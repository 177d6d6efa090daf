//! Connection finite-state machine (FSM) types.
//!
//! This module defines every state a [`crate::connection::Connection`] can
//! occupy, mirroring the TCP state diagram (RFC 793 §3.2) reduced to what a
//! stop-and-wait protocol needs, plus the table of legal edges.  The
//! transitions themselves are driven by [`crate::connection`]; every one of
//! them is checked against [`ConnectionState::can_transition_to`].
//!
//! ```text
//!                 connect                 SYN_ACK / ACK
//!   CLOSED ─────────────────▶ SYN_SENT ─────────────────▶ ESTABLISHED
//!     │  ▲                                                  │    │
//!     │  │ hand-off                 SYN / SYN_ACK, ACK      │    │
//!     ▼  │                                                  │    │
//!   LISTEN ── SYN ──▶ SYN_RCVD (spawned) ───────────────────┘    │
//!                                                                │
//!          close: FIN                           peer FIN: ACK    │
//!   ESTABLISHED ──────▶ FIN_WAIT_1        ESTABLISHED ──────▶ CLOSE_WAIT
//!                           │ ACK                                │ close: FIN
//!                           ▼                                    ▼
//!                       FIN_WAIT_2                            LAST_ACK
//!                           │ peer FIN: ACK                      │ ACK
//!                           ▼                                    ▼
//!                       TIME_WAIT ──── linger ───▶ CLOSED ◀──────┘
//! ```

use std::fmt;

/// All possible states of the connection FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No connection exists; initial and terminal state.
    #[default]
    Closed,
    /// Passive open: waiting for a SYN.
    Listen,
    /// SYN has been sent; waiting for SYN_ACK.
    SynSent,
    /// SYN received; SYN_ACK sent; waiting for ACK.
    SynReceived,
    /// Handshake complete; data transfer in progress.
    Established,
    /// Local side sent FIN; waiting for its ACK.
    FinWait1,
    /// ACK of local FIN received; waiting for the peer's FIN.
    FinWait2,
    /// Peer's FIN received and ACKed; waiting for the local application to close.
    CloseWait,
    /// Local FIN sent after CLOSE_WAIT; waiting for its ACK.
    LastAck,
    /// Both FINs exchanged; lingering to re-ACK a retransmitted peer FIN.
    TimeWait,
}

impl ConnectionState {
    /// `true` if moving from `self` to `next` is an edge of the state diagram.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (Closed, SynSent)
                | (SynSent, Established)
                | (SynSent, Closed)
                | (Closed, Listen)
                | (Listen, SynReceived)
                | (Listen, Closed)
                | (Closed, SynReceived)
                | (SynReceived, Established)
                | (SynReceived, Closed)
                | (Established, FinWait1)
                | (FinWait1, FinWait2)
                | (FinWait1, Closed)
                | (FinWait2, TimeWait)
                | (FinWait2, Closed)
                | (TimeWait, Closed)
                | (Established, CloseWait)
                | (CloseWait, LastAck)
                | (LastAck, Closed)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Closed => "CLOSED",
            ConnectionState::Listen => "LISTEN",
            ConnectionState::SynSent => "SYN_SENT",
            ConnectionState::SynReceived => "SYN_RCVD",
            ConnectionState::Established => "ESTABLISHED",
            ConnectionState::FinWait1 => "FIN_WAIT_1",
            ConnectionState::FinWait2 => "FIN_WAIT_2",
            ConnectionState::CloseWait => "CLOSE_WAIT",
            ConnectionState::LastAck => "LAST_ACK",
            ConnectionState::TimeWait => "TIME_WAIT",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionState::{self, *};

    const ALL: [ConnectionState; 10] = [
        Closed,
        Listen,
        SynSent,
        SynReceived,
        Established,
        FinWait1,
        FinWait2,
        CloseWait,
        LastAck,
        TimeWait,
    ];

    #[test]
    fn default_is_closed() {
        assert_eq!(ConnectionState::default(), Closed);
    }

    #[test]
    fn active_close_path_is_legal() {
        let path = [Closed, SynSent, Established, FinWait1, FinWait2, TimeWait, Closed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn passive_close_path_is_legal() {
        let path = [Closed, SynReceived, Established, CloseWait, LastAck, Closed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn no_self_loops() {
        for s in ALL {
            assert!(!s.can_transition_to(s), "{s} -> {s}");
        }
    }

    #[test]
    fn established_is_unreachable_from_closed_directly() {
        assert!(!Closed.can_transition_to(Established));
        assert!(!Listen.can_transition_to(Established));
    }

    #[test]
    fn teardown_cannot_skip_states() {
        assert!(!Established.can_transition_to(Closed));
        assert!(!Established.can_transition_to(TimeWait));
        assert!(!FinWait1.can_transition_to(TimeWait));
        assert!(!CloseWait.can_transition_to(Closed));
    }

    #[test]
    fn states_with_a_direct_edge_to_closed() {
        let direct: Vec<_> = ALL.iter().filter(|s| s.can_transition_to(Closed)).collect();
        assert_eq!(
            direct,
            vec![&Listen, &SynSent, &SynReceived, &FinWait1, &FinWait2, &LastAck, &TimeWait]
        );
    }

    #[test]
    fn display_uses_protocol_names() {
        assert_eq!(SynReceived.to_string(), "SYN_RCVD");
        assert_eq!(FinWait2.to_string(), "FIN_WAIT_2");
    }
}
