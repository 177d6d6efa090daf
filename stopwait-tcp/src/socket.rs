//! UDP-backed [`Network`].
//!
//! [`UdpChannel`] is a thin wrapper around `tokio::net::UdpSocket` that
//! speaks [`Datagram`] instead of raw bytes.  All protocol logic lives
//! elsewhere; this module owns only byte I/O.

use std::net::SocketAddr;

use tokio::net::UdpSocket;

use crate::channel::{Channel, ChannelError, Network};
use crate::datagram::Datagram;

/// Maximum UDP payload size (theoretical limit; in practice kept much smaller).
const MAX_DATAGRAM: usize = 65_535;

/// Binds a fresh UDP socket for every channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct UdpNetwork;

impl Network for UdpNetwork {
    type Channel = UdpChannel;

    async fn bind(&self, local: SocketAddr) -> Result<UdpChannel, ChannelError> {
        UdpChannel::bind(local).await
    }
}

/// An async, datagram-oriented UDP socket.
#[derive(Debug)]
pub struct UdpChannel {
    local_addr: SocketAddr,
    inner: UdpSocket,
}

impl UdpChannel {
    /// Bind a new socket to `local_addr`.
    ///
    /// The address is kept as given (not the OS-resolved one) because it is
    /// what peers see in the datagram's source field.
    pub async fn bind(local_addr: SocketAddr) -> Result<Self, ChannelError> {
        let inner = UdpSocket::bind(local_addr).await?;
        let local_addr = if local_addr.port() == 0 {
            SocketAddr::new(local_addr.ip(), inner.local_addr()?.port())
        } else {
            local_addr
        };
        Ok(Self { local_addr, inner })
    }
}

impl Channel for UdpChannel {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn send(&self, datagram: &Datagram) -> Result<(), ChannelError> {
        let dst = datagram.dst();
        self.inner
            .send_to(&datagram.encode(), dst)
            .await
            .map_err(|e| ChannelError::from_io(e, dst))?;
        Ok(())
    }

    /// Receive the next datagram that decodes.
    ///
    /// Bytes that do not even parse as a datagram are dropped here; they are
    /// noise, not errors.  Checksum validity is left to the caller.
    async fn recv(&self) -> Result<Datagram, ChannelError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (n, from) = self
                .inner
                .recv_from(&mut buf)
                .await
                .map_err(|e| ChannelError::from_io(e, self.local_addr))?;
            match Datagram::decode(&buf[..n]) {
                Ok(datagram) => return Ok(datagram),
                Err(e) => log::debug!("[udp] dropping {n} undecodable bytes from {from}: {e}"),
            }
        }
    }
}
