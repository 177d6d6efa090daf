//! Local port bookkeeping shared by every connection of a process.
//!
//! [`PortRegistry`] is a cheap, cloneable handle; all clones see the same
//! set of bound ports.  It is passed explicitly to each
//! [`crate::connection::Connection`], so independent registries (one per
//! test, say) never interfere.
//!
//! Every operation takes the lock once for its whole check-and-mutate, which
//! makes `bind`, `allocate_free` and `release` linearizable: two callers can
//! never both come away holding the same port.

use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::Rng;
use thiserror::Error;

/// Ports handed out by [`PortRegistry::allocate_free`] by default.
pub const EPHEMERAL_PORTS: RangeInclusive<u16> = 20_000..=65_534;

/// Random draws attempted before falling back to a linear scan.
const MAX_RANDOM_DRAWS: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("port {0} is already in use")]
    InUse(u16),
    #[error("no free port left in {start}..={end}")]
    Exhausted { start: u16, end: u16 },
}

#[derive(Debug, Clone)]
pub struct PortRegistry {
    ports: Arc<Mutex<HashSet<u16>>>,
    range: RangeInclusive<u16>,
}

impl Default for PortRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PortRegistry {
    /// An empty registry allocating from [`EPHEMERAL_PORTS`].
    pub fn new() -> Self {
        Self::with_range(EPHEMERAL_PORTS)
    }

    /// An empty registry allocating from `range`.
    pub fn with_range(range: RangeInclusive<u16>) -> Self {
        Self {
            ports: Arc::new(Mutex::new(HashSet::new())),
            range,
        }
    }

    /// Claim `port`, failing if someone already holds it.
    pub fn bind(&self, port: u16) -> Result<(), PortError> {
        if self.lock().insert(port) {
            log::trace!("[ports] bound {port}");
            Ok(())
        } else {
            Err(PortError::InUse(port))
        }
    }

    /// Claim a random unused port from the ephemeral range.
    ///
    /// No fairness is promised, only uniqueness.  Fails with
    /// [`PortError::Exhausted`] when every port in the range is taken.
    pub fn allocate_free(&self) -> Result<u16, PortError> {
        let exhausted = PortError::Exhausted {
            start: *self.range.start(),
            end: *self.range.end(),
        };
        if self.range.is_empty() {
            return Err(exhausted);
        }
        let mut ports = self.lock();
        let mut rng = rand::rng();

        for _ in 0..MAX_RANDOM_DRAWS {
            let port = rng.random_range(self.range.clone());
            if ports.insert(port) {
                log::trace!("[ports] allocated {port}");
                return Ok(port);
            }
        }

        // Crowded range: pick the first hole instead of drawing forever.
        let port = self
            .range
            .clone()
            .find(|p| !ports.contains(p))
            .ok_or(exhausted)?;
        ports.insert(port);
        log::trace!("[ports] allocated {port} after scan");
        Ok(port)
    }

    /// Make `port` available again.  Releasing a free port is a no-op.
    pub fn release(&self, port: u16) {
        if self.lock().remove(&port) {
            log::trace!("[ports] released {port}");
        }
    }

    pub fn is_bound(&self, port: u16) -> bool {
        self.lock().contains(&port)
    }

    /// Number of ports currently held.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<u16>> {
        self.ports.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn duplicate_bind_is_rejected() {
        let registry = PortRegistry::new();
        registry.bind(4000).unwrap();
        assert_eq!(registry.bind(4000), Err(PortError::InUse(4000)));
    }

    #[test]
    fn release_makes_port_reusable() {
        let registry = PortRegistry::new();
        registry.bind(4000).unwrap();
        registry.release(4000);
        assert!(!registry.is_bound(4000));
        registry.bind(4000).unwrap();
    }

    #[test]
    fn double_release_is_a_noop() {
        let registry = PortRegistry::new();
        registry.bind(4000).unwrap();
        registry.release(4000);
        registry.release(4000);
        assert!(!registry.is_bound(4000));
        assert!(registry.is_empty());
    }

    #[test]
    fn allocated_port_lies_in_range_and_is_bound() {
        let registry = PortRegistry::new();
        let port = registry.allocate_free().unwrap();
        assert!(EPHEMERAL_PORTS.contains(&port));
        assert!(registry.is_bound(port));
        assert_eq!(registry.bind(port), Err(PortError::InUse(port)));
    }

    #[test]
    fn small_range_is_filled_completely_then_exhausted() {
        let registry = PortRegistry::with_range(100..=104);
        let mut got: HashSet<u16> = HashSet::new();
        for _ in 0..5 {
            assert!(got.insert(registry.allocate_free().unwrap()));
        }
        assert_eq!(got, (100..=104).collect());
        assert_eq!(
            registry.allocate_free(),
            Err(PortError::Exhausted { start: 100, end: 104 })
        );

        registry.release(102);
        assert_eq!(registry.allocate_free(), Ok(102));
    }

    #[test]
    fn empty_range_is_exhausted_from_the_start() {
        #[allow(clippy::reversed_empty_ranges)]
        let registry = PortRegistry::with_range(5..=4);
        assert_eq!(
            registry.allocate_free(),
            Err(PortError::Exhausted { start: 5, end: 4 })
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn clones_share_state_but_registries_are_independent() {
        let a = PortRegistry::new();
        let a2 = a.clone();
        let b = PortRegistry::new();
        a.bind(5000).unwrap();
        assert!(a2.is_bound(5000));
        assert!(!b.is_bound(5000));
        b.bind(5000).unwrap();
    }

    #[test]
    fn concurrent_allocation_never_hands_out_a_port_twice() {
        let registry = PortRegistry::with_range(30_000..=30_199);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || {
                    (0..25)
                        .map(|_| registry.allocate_free().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for port in handle.join().unwrap() {
                assert!(seen.insert(port), "port {port} handed out twice");
            }
        }
        assert_eq!(seen.len(), 200);
        assert!(registry.allocate_free().is_err());
    }

    #[test]
    fn concurrent_bind_release_keeps_ownership_exclusive() {
        let registry = PortRegistry::with_range(40_000..=40_009);
        let handles: Vec<_> = (0..6)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || {
                    let mut rng = rand::rng();
                    for _ in 0..500 {
                        let port = rng.random_range(40_000..=40_009);
                        if registry.bind(port).is_ok() {
                            // We own it: nobody else may claim it now.
                            assert_eq!(registry.bind(port), Err(PortError::InUse(port)));
                            registry.release(port);
                        }
                        if let Ok(port) = registry.allocate_free() {
                            assert!(registry.is_bound(port));
                            registry.release(port);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(registry.is_empty());
    }
}
