//! `stopwait-tcp` — a TCP-like connection over an unreliable datagram network.
//!
//! Three-way handshake, stop-and-wait data transfer (one message per
//! datagram, each individually acknowledged) and four-way teardown, on top
//! of a network that may drop, duplicate or corrupt datagrams.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────────────────────────────┐
//!  │             Connection               │  connect / accept / send /
//!  │  (state machine + last accepted)     │  receive / close
//!  └────┬──────────────────────┬──────────┘
//!       │ send and wait        │ claim / release port
//!  ┌────▼──────────┐      ┌────▼──────────┐
//!  │  retransmit   │      │ PortRegistry  │
//!  │ (timer-bound) │      └───────────────┘
//!  └────┬──────────┘
//!       │ Datagrams
//!  ┌────▼─────────────────────────────────┐
//!  │  Network / Channel                   │
//!  │   UdpNetwork  (tokio UdpSocket)      │
//!  │   SimNetwork  (lossy, in-memory)     │
//!  └──────────────────────────────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`datagram`]   — datagram value type, wire format and checksum
//! - [`channel`]    — the `Network` / `Channel` traits a connection runs on
//! - [`socket`]     — UDP-backed network
//! - [`simulator`]  — fault-injecting in-memory network for testing
//! - [`registry`]   — local port bookkeeping
//! - [`timer`]      — retransmission policy and backoff
//! - `retransmit`   — send-and-wait engine and discard loops
//! - [`state`]      — finite-state-machine types
//! - [`config`]     — per-connection tunables
//! - [`connection`] — per-connection lifecycle
//!
//! ```no_run
//! use stopwait_tcp::{Connection, ConnectionConfig, PortRegistry, UdpNetwork};
//!
//! # async fn demo() -> Result<(), stopwait_tcp::ConnError> {
//! let registry = PortRegistry::new();
//! let mut conn = Connection::ephemeral(
//!     UdpNetwork,
//!     registry,
//!     "127.0.0.1".parse().unwrap(),
//!     ConnectionConfig::default(),
//! )
//! .await?;
//! conn.connect("127.0.0.1:9000".parse().unwrap()).await?;
//! conn.send(b"hello").await?;
//! let reply = conn.receive().await?;
//! conn.close().await?;
//! # let _ = reply;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod connection;
pub mod datagram;
pub mod registry;
mod retransmit;
pub mod simulator;
pub mod socket;
pub mod state;
pub mod timer;

pub use channel::{Channel, ChannelError, Network};
pub use config::ConnectionConfig;
pub use connection::{ConnError, Connection};
pub use datagram::{Datagram, Flag};
pub use registry::{PortError, PortRegistry};
pub use simulator::{SimNetwork, SimulatorConfig};
pub use socket::UdpNetwork;
pub use state::ConnectionState;
pub use timer::{Backoff, RetransmitPolicy};
