//! The unreliable datagram network as seen by a connection.
//!
//! A [`Network`] hands out [`Channel`]s bound to a local endpoint; a channel
//! sends [`Datagram`]s to the endpoint named in their destination field and
//! yields whatever arrives for its own endpoint.  Delivery may lose, reorder,
//! duplicate or corrupt datagrams.  Only hard failures (unreachable, refused,
//! channel gone) surface as [`ChannelError`]s.
//!
//! Two implementations ship with the crate:
//! - [`crate::socket::UdpNetwork`] over real UDP sockets.
//! - [`crate::simulator::SimNetwork`], an in-memory fault-injecting network.

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::datagram::Datagram;

/// Hard failures of the datagram network.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// No route to the destination.
    #[error("destination {0} is unreachable")]
    Unreachable(SocketAddr),
    /// The destination actively refused the datagram.
    #[error("destination {0} refused the datagram")]
    Refused(SocketAddr),
    /// The channel can never deliver another datagram.
    #[error("channel closed")]
    Closed,
    /// Any other OS-level I/O failure.
    #[error("channel I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ChannelError {
    /// Classify an I/O error raised while talking to `peer`.
    pub fn from_io(err: io::Error, peer: SocketAddr) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset => {
                Self::Refused(peer)
            }
            io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::AddrNotAvailable => Self::Unreachable(peer),
            _ => Self::Io(err),
        }
    }
}

/// One endpoint's view of the network.
///
/// `recv` must be cancel-safe: callers race it against retransmission
/// deadlines and drop the pending future when the deadline wins.
pub trait Channel: Send + Sync + 'static {
    /// The endpoint this channel receives on.
    fn local_addr(&self) -> SocketAddr;

    /// Send `datagram` towards `datagram.dst()`.
    fn send(&self, datagram: &Datagram) -> impl Future<Output = Result<(), ChannelError>> + Send;

    /// Wait for the next datagram addressed to this channel.
    fn recv(&self) -> impl Future<Output = Result<Datagram, ChannelError>> + Send;
}

/// Factory for [`Channel`]s.
///
/// Cloned into every connection, including those spawned by `accept`.
pub trait Network: Clone + Send + Sync + 'static {
    type Channel: Channel;

    /// Bind a channel that receives datagrams addressed to `local`.
    fn bind(
        &self,
        local: SocketAddr,
    ) -> impl Future<Output = Result<Self::Channel, ChannelError>> + Send;
}
