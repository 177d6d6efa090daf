//! Per-connection lifecycle: handshake, stop-and-wait transfer, teardown.
//!
//! A [`Connection`] owns one bound endpoint on a [`Network`] plus the state
//! machine of [`crate::state`].  Every blocking exchange goes through the
//! engine in `retransmit`.
//!
//! ```text
//!  client                                server (listener → spawned)
//!  ──────                                ───────────────────────────
//!  connect()  ── SYN(seq=x) ─────────▶  accept(): LISTEN
//!                                        spawn on a fresh port, SYN_RCVD
//!             ◀── SYN_ACK(seq=y,ack=x)   (from the spawned endpoint)
//!  ESTABLISHED ── ACK(ack=y) ─────────▶  ESTABLISHED, listener back to CLOSED
//!
//!  send()     ── DATA(seq=x+1) ───────▶  receive()
//!             ◀── ACK(ack=x+1)
//!
//!  close()    ── FIN ─────────────────▶  receive() → Eof, CLOSE_WAIT
//!  FIN_WAIT_1 ◀── ACK
//!  FIN_WAIT_2 ◀── FIN ─────────────────  close(): LAST_ACK
//!  TIME_WAIT  ── ACK ─────────────────▶  CLOSED
//!  CLOSED     (after lingering)
//! ```
//!
//! Once a connection has been torn down its port is released and the value
//! is finished: every further operation fails with [`ConnError::Finished`].
//!
//! Simultaneous close is not supported.  If both sides call `close` from
//! ESTABLISHED at once, each discards the other's FIN while waiting for its
//! own ACK and both end in a timeout.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};

use thiserror::Error;
use tokio::time::Instant;

use crate::channel::{Channel, ChannelError, Network};
use crate::config::ConnectionConfig;
use crate::datagram::{Datagram, Flag, MAX_PAYLOAD};
use crate::registry::{PortError, PortRegistry};
use crate::retransmit::{self, Exchange, Verdict};
use crate::state::ConnectionState;

/// SYNs a listener remembers after handing their peers off, so that late
/// retransmissions of them do not start a second handshake.
const RECENT_SYNS: usize = 32;

#[derive(Debug, Error)]
pub enum ConnError {
    #[error("cannot {op} in state {state}")]
    InvalidState {
        op: &'static str,
        state: ConnectionState,
    },
    #[error("no {waiting_for} received after {attempts} attempt(s)")]
    Timeout { waiting_for: Flag, attempts: u32 },
    #[error("payload of {len} bytes exceeds the {max}-byte limit")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("peer closed the connection")]
    Eof,
    #[error("connection is finished and its port released")]
    Finished,
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Port(#[from] PortError),
}

/// One endpoint of a TCP-like connection over an unreliable [`Network`].
pub struct Connection<N: Network> {
    network: N,
    channel: N::Channel,
    registry: PortRegistry,
    config: ConnectionConfig,
    local: SocketAddr,
    remote: Option<SocketAddr>,
    state: ConnectionState,
    /// Sequence number of the next SYN, SYN_ACK, data or FIN we send.
    next_seq: u32,
    /// Most recent datagram accepted from the peer.  Retransmissions of it
    /// are re-ACKed, never redelivered.
    last_accepted: Option<Datagram>,
    /// `(source, seq)` of SYNs already handed off by `accept`.
    recent_syns: VecDeque<(SocketAddr, u32)>,
    port_held: bool,
}

impl<N: Network> Connection<N> {
    /// Claim `local.port()` in `registry` and bind a channel there.
    pub async fn new(
        network: N,
        registry: PortRegistry,
        local: SocketAddr,
        config: ConnectionConfig,
    ) -> Result<Self, ConnError> {
        registry.bind(local.port())?;
        Self::open(network, registry, local, config).await
    }

    /// Like [`Connection::new`] on a port drawn from the registry's free range.
    pub async fn ephemeral(
        network: N,
        registry: PortRegistry,
        ip: IpAddr,
        config: ConnectionConfig,
    ) -> Result<Self, ConnError> {
        let port = registry.allocate_free()?;
        Self::open(network, registry, SocketAddr::new(ip, port), config).await
    }

    /// `local.port()` is already claimed; give it back if binding fails.
    async fn open(
        network: N,
        registry: PortRegistry,
        local: SocketAddr,
        config: ConnectionConfig,
    ) -> Result<Self, ConnError> {
        let isn: u32 = rand::random();
        let channel = match network.bind(local).await {
            Ok(channel) => channel,
            Err(e) => {
                registry.release(local.port());
                return Err(e.into());
            }
        };
        log::debug!("[co {local}] bound, isn={isn}");
        Ok(Self {
            network,
            channel,
            registry,
            config,
            local,
            remote: None,
            state: ConnectionState::Closed,
            next_seq: isn,
            last_accepted: None,
            recent_syns: VecDeque::new(),
            port_held: true,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// The peer, known from the handshake until the connection closes.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Handshake
    // -----------------------------------------------------------------------

    /// Active open: SYN, wait for SYN_ACK, ACK it.
    ///
    /// The peer's address is taken from the SYN_ACK, which comes from the
    /// endpoint the server spawned rather than from `remote` itself.  On
    /// failure the connection is CLOSED again and may be retried.
    pub async fn connect(&mut self, remote: SocketAddr) -> Result<(), ConnError> {
        self.require("connect", &[ConnectionState::Closed])?;

        self.transition(ConnectionState::SynSent);
        let syn = self.next_datagram(Flag::Syn, remote, 0);
        let exchange = Exchange {
            datagram: &syn,
            reply: Flag::SynAck,
            peer: None,
            last_accepted: None,
        };
        let synack =
            match retransmit::send_with_retransmit(&self.channel, &exchange, self.config.retransmit)
                .await
            {
                Ok(synack) => synack,
                Err(e) => {
                    log::debug!("[co {}] connect to {remote} failed: {e}", self.local);
                    self.transition(ConnectionState::Closed);
                    return Err(e);
                }
            };

        let ack = synack.ack_for(self.next_seq);
        if let Err(e) = self.channel.send(&ack).await {
            self.transition(ConnectionState::Closed);
            return Err(e.into());
        }
        log::debug!("[co {}] → {ack}", self.local);

        self.remote = Some(synack.src());
        self.last_accepted = Some(synack);
        self.transition(ConnectionState::Established);
        Ok(())
    }

    /// Passive open: wait for a SYN and hand the peer off to a new connection.
    ///
    /// The returned connection sits on a fresh ephemeral port and is
    /// ESTABLISHED; this one is CLOSED again and can `accept` once more.
    /// Peers are served one at a time.  A peer whose handshake stalls is
    /// abandoned and the listener keeps waiting for the next SYN.
    pub async fn accept(&mut self) -> Result<Connection<N>, ConnError> {
        self.require("accept", &[ConnectionState::Closed])?;
        self.transition(ConnectionState::Listen);

        loop {
            let served = &self.recent_syns;
            let waited = retransmit::wait_for(&self.channel, None, self.next_seq, |d| {
                if d.flag() == Flag::Syn && !served.contains(&(d.src(), d.seq())) {
                    Verdict::Accept
                } else {
                    Verdict::Discard
                }
            })
            .await;
            let syn = match waited {
                Ok(Some(syn)) => syn,
                Ok(None) => continue,
                Err(e) => {
                    self.transition(ConnectionState::Closed);
                    return Err(e);
                }
            };
            log::debug!("[co {}] ← {syn}", self.local);

            let spawned = Connection::ephemeral(
                self.network.clone(),
                self.registry.clone(),
                self.local.ip(),
                self.config.clone(),
            )
            .await;
            let mut conn = match spawned {
                Ok(conn) => conn,
                // Port taken outside the registry; the peer's next SYN gets another.
                Err(ConnError::Channel(ChannelError::Io(e)))
                    if e.kind() == io::ErrorKind::AddrInUse =>
                {
                    log::warn!(
                        "[co {}] no endpoint for {}: {e}; waiting for its retransmission",
                        self.local,
                        syn.src()
                    );
                    continue;
                }
                Err(e) => {
                    self.transition(ConnectionState::Closed);
                    return Err(e);
                }
            };

            match conn.synchronize(syn.clone()).await {
                Ok(()) => {
                    log::info!(
                        "[co {}] accepted {} on {}",
                        self.local,
                        syn.src(),
                        conn.local
                    );
                    if self.recent_syns.len() == RECENT_SYNS {
                        self.recent_syns.pop_front();
                    }
                    self.recent_syns.push_back((syn.src(), syn.seq()));
                    self.transition(ConnectionState::Closed);
                    return Ok(conn);
                }
                Err(
                    e @ (ConnError::Timeout { .. }
                    | ConnError::Channel(ChannelError::Refused(_) | ChannelError::Unreachable(_))),
                ) => {
                    log::warn!(
                        "[co {}] handshake with {} abandoned: {e}",
                        self.local,
                        syn.src()
                    );
                }
                Err(e) => {
                    self.transition(ConnectionState::Closed);
                    return Err(e);
                }
            }
        }
    }

    /// Server half of the handshake, run by the spawned connection.
    async fn synchronize(&mut self, syn: Datagram) -> Result<(), ConnError> {
        let peer = syn.src();
        self.transition(ConnectionState::SynReceived);
        self.remote = Some(peer);

        let synack = self.next_datagram(Flag::SynAck, peer, syn.seq());
        self.last_accepted = Some(syn);
        match self.exchange(&synack, Flag::Ack).await {
            Ok(_) => {
                self.transition(ConnectionState::Established);
                Ok(())
            }
            Err(e) => {
                self.transition(ConnectionState::Closed);
                self.last_accepted = None;
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Data transfer
    // -----------------------------------------------------------------------

    /// Send one payload and wait until the peer has acknowledged it.
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), ConnError> {
        self.require("send", &[ConnectionState::Established])?;
        if payload.len() > MAX_PAYLOAD {
            return Err(ConnError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD,
            });
        }

        let peer = self.peer()?;
        let seq = self.take_seq();
        let data = Datagram::data(seq, self.local, peer, payload.to_vec());
        self.exchange(&data, Flag::Ack).await?;
        Ok(())
    }

    /// Wait for the next payload from the peer.
    ///
    /// Each payload is delivered exactly once and in order.  A FIN moves the
    /// connection to CLOSE_WAIT and yields [`ConnError::Eof`], as does every
    /// later call.
    pub async fn receive(&mut self) -> Result<Vec<u8>, ConnError> {
        match self.state {
            ConnectionState::Established if self.port_held => {}
            ConnectionState::CloseWait => return Err(ConnError::Eof),
            _ => self.require("receive", &[ConnectionState::Established])?,
        }

        let peer = self.peer()?;
        let deadline = self.config.receive_timeout.map(|t| Instant::now() + t);
        let last = self.last_accepted.as_ref();
        let incoming = retransmit::wait_for(&self.channel, deadline, self.next_seq, |d| {
            retransmit::classify_from_peer(d, peer, last, &[Flag::None, Flag::Fin])
        })
        .await?;
        let Some(incoming) = incoming else {
            return Err(ConnError::Timeout {
                waiting_for: Flag::None,
                attempts: 1,
            });
        };

        self.channel.send(&incoming.ack_for(self.next_seq)).await?;
        log::debug!("[co {}] ← {incoming}; → ACK", self.local);

        if incoming.flag() == Flag::Fin {
            self.last_accepted = Some(incoming);
            self.transition(ConnectionState::CloseWait);
            return Err(ConnError::Eof);
        }
        let payload = incoming.payload().to_vec();
        self.last_accepted = Some(incoming);
        Ok(payload)
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Close the connection, actively from ESTABLISHED or passively from
    /// CLOSE_WAIT.
    ///
    /// Whatever happens the connection ends CLOSED with its port released.
    /// A peer that stops answering turns into [`ConnError::Timeout`].
    pub async fn close(&mut self) -> Result<(), ConnError> {
        self.require(
            "close",
            &[ConnectionState::Established, ConnectionState::CloseWait],
        )?;
        let result = if self.state == ConnectionState::Established {
            self.active_close().await
        } else {
            self.passive_close().await
        };
        if let Err(e) = &result {
            log::warn!("[co {}] teardown incomplete; force-closing: {e}", self.local);
        }
        self.finish();
        result
    }

    async fn active_close(&mut self) -> Result<(), ConnError> {
        let peer = self.peer()?;
        self.transition(ConnectionState::FinWait1);
        let fin = self.next_datagram(Flag::Fin, peer, 0);
        self.exchange(&fin, Flag::Ack).await?;

        self.transition(ConnectionState::FinWait2);
        let deadline = Instant::now() + self.config.fin_wait_timeout;
        let last = self.last_accepted.as_ref();
        let peer_fin = retransmit::wait_for(&self.channel, Some(deadline), self.next_seq, |d| {
            retransmit::classify_from_peer(d, peer, last, &[Flag::Fin])
        })
        .await?
        .ok_or(ConnError::Timeout {
            waiting_for: Flag::Fin,
            attempts: 1,
        })?;

        self.channel.send(&peer_fin.ack_for(self.next_seq)).await?;
        log::debug!("[co {}] ← {peer_fin}; → ACK", self.local);
        self.last_accepted = Some(peer_fin);
        self.transition(ConnectionState::TimeWait);
        self.linger().await;
        Ok(())
    }

    async fn passive_close(&mut self) -> Result<(), ConnError> {
        let peer = self.peer()?;
        self.transition(ConnectionState::LastAck);
        let fin = self.next_datagram(Flag::Fin, peer, 0);
        self.exchange(&fin, Flag::Ack).await?;
        Ok(())
    }

    /// TIME_WAIT: re-ACK the peer's FIN should our ACK have been lost.
    async fn linger(&self) {
        let deadline = Instant::now() + self.config.time_wait;
        let last = self.last_accepted.as_ref();
        let waited = retransmit::wait_for(&self.channel, Some(deadline), self.next_seq, |d| {
            match last {
                Some(fin) if d.is_retransmission_of(fin) => Verdict::Reack,
                _ => Verdict::Discard,
            }
        })
        .await;
        if let Err(e) = waited {
            log::debug!("[co {}] TIME_WAIT cut short: {e}", self.local);
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn exchange(&self, datagram: &Datagram, reply: Flag) -> Result<Datagram, ConnError> {
        let exchange = Exchange {
            datagram,
            reply,
            peer: self.remote,
            last_accepted: self.last_accepted.as_ref(),
        };
        retransmit::send_with_retransmit(&self.channel, &exchange, self.config.retransmit).await
    }

    fn take_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq = seq.wrapping_add(1);
        seq
    }

    fn next_datagram(&mut self, flag: Flag, dst: SocketAddr, ack: u32) -> Datagram {
        let seq = self.take_seq();
        Datagram::control(flag, seq, ack, self.local, dst)
    }

    fn peer(&self) -> Result<SocketAddr, ConnError> {
        self.remote.ok_or(ConnError::InvalidState {
            op: "reach the peer",
            state: self.state,
        })
    }

    fn require(&self, op: &'static str, allowed: &[ConnectionState]) -> Result<(), ConnError> {
        if !self.port_held {
            Err(ConnError::Finished)
        } else if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(ConnError::InvalidState {
                op,
                state: self.state,
            })
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {} -> {next}",
            self.state
        );
        log::debug!("[co {}] {} -> {next}", self.local, self.state);
        self.state = next;
        if next == ConnectionState::Closed {
            self.remote = None;
        }
    }

    /// Terminal CLOSED after teardown.
    fn finish(&mut self) {
        if self.state != ConnectionState::Closed {
            self.transition(ConnectionState::Closed);
        }
        self.last_accepted = None;
        self.recent_syns.clear();
        self.release_port();
    }

    fn release_port(&mut self) {
        if self.port_held {
            self.registry.release(self.local.port());
            self.port_held = false;
        }
    }
}

impl<N: Network> Drop for Connection<N> {
    fn drop(&mut self) {
        self.release_port();
    }
}

impl<N: Network> fmt::Debug for Connection<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("state", &self.state)
            .field("next_seq", &self.next_seq)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::simulator::SimNetwork;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn fast() -> ConnectionConfig {
        ConnectionConfig::default()
            .with_timeout(Duration::from_millis(20))
            .with_max_attempts(5)
    }

    #[tokio::test]
    async fn new_claims_port_and_starts_closed() {
        let registry = PortRegistry::new();
        let conn = Connection::new(SimNetwork::reliable(), registry.clone(), addr(4000), fast())
            .await
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(conn.remote_addr(), None);
        assert!(registry.is_bound(4000));
    }

    #[tokio::test]
    async fn second_connection_on_same_port_is_rejected() {
        let net = SimNetwork::reliable();
        let registry = PortRegistry::new();
        let _first = Connection::new(net.clone(), registry.clone(), addr(4000), fast())
            .await
            .unwrap();
        let err = Connection::new(net, registry, addr(4000), fast())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnError::Port(PortError::InUse(4000))));
    }

    #[tokio::test]
    async fn drop_releases_port() {
        let registry = PortRegistry::new();
        let conn = Connection::ephemeral(
            SimNetwork::reliable(),
            registry.clone(),
            addr(0).ip(),
            fast(),
        )
        .await
        .unwrap();
        let port = conn.local_addr().port();
        assert!(registry.is_bound(port));
        drop(conn);
        assert!(!registry.is_bound(port));
    }

    #[tokio::test]
    async fn operations_in_wrong_state_leave_state_alone() {
        let mut conn = Connection::new(SimNetwork::reliable(), PortRegistry::new(), addr(4000), fast())
            .await
            .unwrap();

        assert!(matches!(
            conn.send(b"x").await,
            Err(ConnError::InvalidState { op: "send", state: ConnectionState::Closed })
        ));
        assert!(matches!(
            conn.receive().await,
            Err(ConnError::InvalidState { op: "receive", .. })
        ));
        assert!(matches!(
            conn.close().await,
            Err(ConnError::InvalidState { op: "close", .. })
        ));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn connect_to_silent_peer_times_out_back_to_closed() {
        let net = SimNetwork::reliable();
        let mut conn = Connection::new(net.clone(), PortRegistry::new(), addr(4000), fast())
            .await
            .unwrap();

        let err = conn.connect(addr(5000)).await.unwrap_err();
        assert!(matches!(
            err,
            ConnError::Timeout { waiting_for: Flag::SynAck, attempts: 5 }
        ));
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(conn.remote_addr(), None);
        assert_eq!(net.stats().sent, 5);
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected_before_sending() {
        let net = SimNetwork::reliable();
        let registry = PortRegistry::new();
        let mut server = Connection::new(net.clone(), registry.clone(), addr(4000), fast())
            .await
            .unwrap();
        let mut client = Connection::new(net.clone(), registry, addr(4001), fast())
            .await
            .unwrap();

        let accept = tokio::spawn(async move { server.accept().await });
        client.connect(addr(4000)).await.unwrap();
        let _peer = accept.await.unwrap().unwrap();

        let sent_before = net.stats().sent;
        let err = client.send(&vec![0u8; MAX_PAYLOAD + 1]).await.unwrap_err();
        assert!(matches!(err, ConnError::PayloadTooLarge { .. }));
        assert_eq!(net.stats().sent, sent_before);
        assert_eq!(client.state(), ConnectionState::Established);
    }
}
