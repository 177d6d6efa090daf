//! In-memory network simulator for deterministic testing.
//!
//! Real networks drop, reorder, duplicate, and corrupt packets.  To exercise the
//! reliability mechanisms without depending on actual network conditions,
//! [`SimNetwork`] routes [`Datagram`]s between in-process [`SimChannel`]s and
//! applies a configurable fault model on every send:
//!
//! | Fault            | Description                                         |
//! |------------------|-----------------------------------------------------|
//! | Packet loss      | Drop a datagram with probability `loss_rate`.       |
//! | Corruption       | Flip bits in the datagram, leaving a stale checksum.|
//! | Duplication      | Deliver a datagram twice.                           |
//! | Reordering       | Hold a datagram back until the next send, letting   |
//! |                  | that later datagram overtake it.                    |
//! | Refusal          | Fail sends to unbound endpoints with `Refused`.     |
//!
//! Faults are drawn from a seeded RNG so failures are reproducible.  Tests
//! that need an exact scenario install a [`SimNetwork::set_rule`] hook that
//! decides the fate of individual datagrams.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;

use crate::channel::{Channel, ChannelError, Network};
use crate::datagram::Datagram;

/// What happens to one datagram in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Deliver,
    Drop,
    Duplicate,
    Corrupt,
    /// Release after the next datagram sent on the network.
    Delay,
}

/// Configuration for the fault-injection model.
///
/// All probabilities are in the range `[0.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Probability that any given datagram is silently dropped.
    pub loss_rate: f64,
    /// Probability that a datagram arrives with a bad checksum.
    pub corrupt_rate: f64,
    /// Probability that a datagram is delivered twice.
    pub duplicate_rate: f64,
    /// Probability that a datagram is held back and overtaken.
    pub reorder_rate: f64,
    /// Fail sends to unbound endpoints instead of dropping them.
    pub refuse_unbound: bool,
    /// Seed of the fault RNG.
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // No faults by default: the simulator is a transparent pass-through.
        Self {
            loss_rate: 0.0,
            corrupt_rate: 0.0,
            duplicate_rate: 0.0,
            reorder_rate: 0.0,
            refuse_unbound: false,
            seed: 0x5eed,
        }
    }
}

/// Counters kept by the simulator, one increment per datagram.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub sent: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub duplicated: u64,
    pub corrupted: u64,
    pub reordered: u64,
    pub unroutable: u64,
}

type Rule = Box<dyn FnMut(&Datagram) -> Option<Fault> + Send>;

struct Inner {
    config: SimulatorConfig,
    rng: StdRng,
    endpoints: HashMap<SocketAddr, mpsc::UnboundedSender<Datagram>>,
    rule: Option<Rule>,
    /// Datagrams waiting for a later send to overtake them.
    held: Vec<Datagram>,
    stats: SimStats,
}

impl Inner {
    fn random_fault(&mut self) -> Fault {
        let config = &self.config;
        let (loss, corrupt, duplicate, reorder) = (
            config.loss_rate.clamp(0.0, 1.0),
            config.corrupt_rate.clamp(0.0, 1.0),
            config.duplicate_rate.clamp(0.0, 1.0),
            config.reorder_rate.clamp(0.0, 1.0),
        );
        if self.rng.random_bool(loss) {
            Fault::Drop
        } else if self.rng.random_bool(corrupt) {
            Fault::Corrupt
        } else if self.rng.random_bool(duplicate) {
            Fault::Duplicate
        } else if reorder > 0.0 && self.rng.random_bool(reorder) {
            Fault::Delay
        } else {
            Fault::Deliver
        }
    }

    fn route(&self, dst: SocketAddr) -> Option<mpsc::UnboundedSender<Datagram>> {
        self.endpoints.get(&dst).filter(|tx| !tx.is_closed()).cloned()
    }
}

/// A fault-injecting in-memory network shared by every channel bound on it.
#[derive(Clone)]
pub struct SimNetwork {
    inner: Arc<Mutex<Inner>>,
}

impl SimNetwork {
    pub fn new(config: SimulatorConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                config,
                rng,
                endpoints: HashMap::new(),
                rule: None,
                held: Vec::new(),
                stats: SimStats::default(),
            })),
        }
    }

    /// A network that never loses, corrupts, duplicates, or reorders anything.
    pub fn reliable() -> Self {
        Self::new(SimulatorConfig::default())
    }

    /// Install a hook consulted before the random fault model.
    ///
    /// Returning `None` falls back to the random model for that datagram.
    pub fn set_rule<F>(&self, rule: F)
    where
        F: FnMut(&Datagram) -> Option<Fault> + Send + 'static,
    {
        self.lock().rule = Some(Box::new(rule));
    }

    pub fn clear_rule(&self) {
        self.lock().rule = None;
    }

    pub fn stats(&self) -> SimStats {
        self.lock().stats
    }

    /// Deliver `datagram` to its destination exactly as given, bypassing the
    /// fault model.  Returns `false` when nothing is bound there.
    pub fn inject(&self, datagram: Datagram) -> bool {
        let inner = self.lock();
        match inner.route(datagram.dst()) {
            Some(tx) => tx.send(datagram).is_ok(),
            None => false,
        }
    }

    fn transmit(&self, datagram: &Datagram) -> Result<(), ChannelError> {
        let mut inner = self.lock();
        inner.stats.sent += 1;

        let dst = datagram.dst();
        let Some(tx) = inner.route(dst) else {
            if inner.config.refuse_unbound {
                return Err(ChannelError::Refused(dst));
            }
            inner.stats.unroutable += 1;
            return Ok(());
        };

        let ruled = inner.rule.as_mut().and_then(|rule| rule(datagram));
        let fault = match ruled {
            Some(fault) => fault,
            None => inner.random_fault(),
        };
        log::trace!("[sim] {fault:?} {datagram}");

        // Anything held back so far goes out after this datagram.
        let overtaken = std::mem::take(&mut inner.held);

        // A send error means the receiver went away mid-flight: same as loss.
        match fault {
            Fault::Deliver => {
                let _ = tx.send(datagram.clone());
                inner.stats.delivered += 1;
            }
            Fault::Drop => inner.stats.dropped += 1,
            Fault::Duplicate => {
                let _ = tx.send(datagram.clone());
                let _ = tx.send(datagram.clone());
                inner.stats.duplicated += 1;
                inner.stats.delivered += 2;
            }
            Fault::Corrupt => {
                let damaged = corrupt(datagram, &mut inner.rng);
                let _ = tx.send(damaged);
                inner.stats.corrupted += 1;
            }
            Fault::Delay => {
                inner.held.push(datagram.clone());
                inner.stats.reordered += 1;
            }
        }

        for late in overtaken {
            if let Some(tx) = inner.route(late.dst()) {
                log::trace!("[sim] released {late}");
                let _ = tx.send(late);
                inner.stats.delivered += 1;
            }
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Network for SimNetwork {
    type Channel = SimChannel;

    async fn bind(&self, local: SocketAddr) -> Result<SimChannel, ChannelError> {
        let mut inner = self.lock();
        if inner.route(local).is_some() {
            return Err(ChannelError::Io(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{local} is already bound on the simulated network"),
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inner.endpoints.insert(local, tx);
        Ok(SimChannel {
            local,
            network: self.clone(),
            rx: tokio::sync::Mutex::new(rx),
        })
    }
}

/// One endpoint on a [`SimNetwork`].  Unbinds itself when dropped.
pub struct SimChannel {
    local: SocketAddr,
    network: SimNetwork,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>,
}

impl Channel for SimChannel {
    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    async fn send(&self, datagram: &Datagram) -> Result<(), ChannelError> {
        self.network.transmit(datagram)
    }

    async fn recv(&self) -> Result<Datagram, ChannelError> {
        self.rx.lock().await.recv().await.ok_or(ChannelError::Closed)
    }
}

/// Damage one random byte of `datagram` without fixing its checksum.
pub fn corrupt<R: Rng + ?Sized>(datagram: &Datagram, rng: &mut R) -> Datagram {
    let span = 8 + datagram.payload().len();
    let mask = rng.random_range(1..=u8::MAX);
    datagram.with_flipped_bits(rng.random_range(0..span), mask)
}
