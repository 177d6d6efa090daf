//! Stop-and-wait retransmission engine.
//!
//! [`send_with_retransmit`] sends one datagram and waits for the single reply
//! that answers it, resending on timeout until the policy's attempt ceiling
//! is reached.  [`wait_for`] is the discard loop underneath it, shared with
//! the connection's own blocking waits (`receive`, FIN_WAIT_2, TIME_WAIT).
//!
//! # Stop-and-wait contract
//! - At most **one** datagram awaits acknowledgement at any moment.
//! - A reply matches when it is checksum-valid, carries the expected flag,
//!   carries `ack == datagram.seq`, and comes from the expected peer (if the
//!   peer is known yet).
//! - Checksum-invalid arrivals are dropped without a trace above `trace`.
//! - A retransmission of the last datagram accepted from the peer is
//!   re-ACKed: the peer evidently missed our ACK.
//! - Channel failures end the exchange immediately; only timeouts retry.
//!
//! Every pass of the discard loop re-checks the deadline before blocking
//! again, so a flood of junk cannot stretch the wait beyond its bound.

use std::net::SocketAddr;

use tokio::time::{timeout_at, Instant};

use crate::channel::Channel;
use crate::connection::ConnError;
use crate::datagram::{Datagram, Flag};
use crate::timer::{RetransmitPolicy, RetransmitTimer};

/// What a wait loop does with one valid arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// Hand it to the caller and stop waiting.
    Accept,
    /// Answer it with an ACK and keep waiting.
    Reack,
    /// Ignore it and keep waiting.
    Discard,
}

/// One send-and-wait exchange.
#[derive(Debug)]
pub(crate) struct Exchange<'a> {
    /// The datagram to (re)send.
    pub datagram: &'a Datagram,
    /// Flag the answer must carry.
    pub reply: Flag,
    /// Required source of the answer; `None` while the peer is unknown.
    pub peer: Option<SocketAddr>,
    /// Most recent datagram accepted from the peer, re-ACKed if it shows up again.
    pub last_accepted: Option<&'a Datagram>,
}

impl Exchange<'_> {
    fn classify(&self, incoming: &Datagram) -> Verdict {
        let from_peer = self.peer.is_none_or(|peer| incoming.src() == peer);
        if from_peer
            && incoming.flag() == self.reply
            && incoming.ack() == self.datagram.seq()
        {
            Verdict::Accept
        } else if self
            .last_accepted
            .is_some_and(|last| incoming.is_retransmission_of(last))
        {
            Verdict::Reack
        } else {
            Verdict::Discard
        }
    }
}

/// Send `exchange.datagram` and return the reply that answers it.
///
/// Sends at most `policy.max_attempts` times; fails with
/// [`ConnError::Timeout`] once all of them went unanswered.
pub(crate) async fn send_with_retransmit<C: Channel>(
    channel: &C,
    exchange: &Exchange<'_>,
    policy: RetransmitPolicy,
) -> Result<Datagram, ConnError> {
    let datagram = exchange.datagram;
    let mut timer = RetransmitTimer::new(policy);

    for attempt in 1..=policy.max_attempts {
        channel.send(datagram).await?;
        log::debug!(
            "[co {}] → {datagram} (attempt {attempt}/{})",
            datagram.src(),
            policy.max_attempts
        );

        let deadline = Instant::now() + timer.current_rto;
        let reply = wait_for(channel, Some(deadline), datagram.seq(), |d| {
            exchange.classify(d)
        })
        .await?;

        if let Some(reply) = reply {
            log::debug!("[co {}] ← {reply}", datagram.src());
            return Ok(reply);
        }
        timer.back_off();
    }

    log::debug!(
        "[co {}] giving up on {} after {} attempt(s)",
        datagram.src(),
        datagram.flag(),
        policy.max_attempts
    );
    Err(ConnError::Timeout {
        waiting_for: exchange.reply,
        attempts: policy.max_attempts,
    })
}

/// Receive until `classify` accepts a valid datagram or `deadline` passes.
///
/// Returns `Ok(None)` on deadline; with no deadline it only returns on
/// acceptance or channel failure.  Re-ACKs carry `ack_seq` as their own
/// sequence number.
pub(crate) async fn wait_for<C, F>(
    channel: &C,
    deadline: Option<Instant>,
    ack_seq: u32,
    mut classify: F,
) -> Result<Option<Datagram>, ConnError>
where
    C: Channel,
    F: FnMut(&Datagram) -> Verdict,
{
    loop {
        let incoming = match deadline {
            Some(deadline) => {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                match timeout_at(deadline, channel.recv()).await {
                    Ok(result) => result?,
                    Err(_elapsed) => return Ok(None),
                }
            }
            None => channel.recv().await?,
        };

        if !incoming.is_valid() {
            log::trace!("[co {}] discarding corrupt {incoming}", channel.local_addr());
            continue;
        }

        match classify(&incoming) {
            Verdict::Accept => return Ok(Some(incoming)),
            Verdict::Reack => {
                log::debug!(
                    "[co {}] ← duplicate {incoming}; → ACK again",
                    channel.local_addr()
                );
                channel.send(&incoming.ack_for(ack_seq)).await?;
            }
            Verdict::Discard => {
                log::trace!("[co {}] ignoring {incoming}", channel.local_addr());
            }
        }
    }
}

/// Verdict for a datagram that must come from `peer` and carry one of
/// `wanted`, given the last datagram accepted from that peer.
///
/// New datagrams are those whose `seq` lies ahead of `last.seq` in
/// wrap-around space; older ones are stale and dropped.
pub(crate) fn classify_from_peer(
    incoming: &Datagram,
    peer: SocketAddr,
    last: Option<&Datagram>,
    wanted: &[Flag],
) -> Verdict {
    if incoming.src() != peer {
        return Verdict::Discard;
    }
    match last {
        Some(last) if incoming.is_retransmission_of(last) => Verdict::Reack,
        Some(last) if wanted.contains(&incoming.flag()) && seq_ahead(last.seq(), incoming.seq()) => {
            Verdict::Accept
        }
        None if wanted.contains(&incoming.flag()) => Verdict::Accept,
        _ => Verdict::Discard,
    }
}

/// `true` when `seq` comes strictly after `last`, assuming the two are less
/// than `u32::MAX / 2` apart.
#[inline]
fn seq_ahead(last: u32, seq: u32) -> bool {
    let distance = seq.wrapping_sub(last);
    distance != 0 && distance <= u32::MAX / 2
}
