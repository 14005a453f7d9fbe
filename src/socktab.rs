//! The port-to-socket table.
//!
//! Demultiplexes incoming packets by destination port. Lookups never
//! block; insertion and removal take a short per-shard write lock inside
//! the map. The iteration used by global teardown is safe against
//! concurrent removal of any entry.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use ahash::RandomState;
use dashmap::DashMap;

use crate::error::{HomaError, Result};
use crate::sock::{HomaSock, MIN_EPHEMERAL_PORT};
use crate::type_alias::*;

pub(crate) struct SockTab {
    ports: DashMap<Port, Arc<HomaSock>, RandomState>,

    /// Next candidate for an ephemeral client port; wraps within the
    /// ephemeral range.
    next_client_port: AtomicU16,
}

impl SockTab {
    pub(crate) fn new() -> Self {
        Self {
            ports: DashMap::with_hasher(RandomState::new()),
            next_client_port: AtomicU16::new(MIN_EPHEMERAL_PORT),
        }
    }

    /// Reserve an unused ephemeral port. The entry is inserted by the
    /// caller once the socket exists (see [`SockTab::claim_client`]).
    pub(crate) fn alloc_client_port(&self) -> Result<Port> {
        let range = (Port::MAX - MIN_EPHEMERAL_PORT) as u32 + 1;
        for _ in 0..range {
            let raw = self.next_client_port.fetch_add(1, Ordering::Relaxed);
            let port = if raw < MIN_EPHEMERAL_PORT {
                // The counter wrapped around the u16 space.
                self.next_client_port
                    .store(MIN_EPHEMERAL_PORT.wrapping_add(1), Ordering::Relaxed);
                MIN_EPHEMERAL_PORT
            } else {
                raw
            };
            if !self.ports.contains_key(&port) {
                return Ok(port);
            }
        }
        Err(HomaError::OutOfPorts)
    }

    /// Register a socket under its freshly allocated client port.
    pub(crate) fn claim_client(&self, port: Port, sock: &Arc<HomaSock>) -> Result<()> {
        self.claim(port, sock)
    }

    /// Register a socket under a port; fails if the port is taken.
    pub(crate) fn claim(&self, port: Port, sock: &Arc<HomaSock>) -> Result<()> {
        match self.ports.entry(port) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(HomaError::PortInUse(port)),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(sock.clone());
                Ok(())
            }
        }
    }

    /// Remove a port mapping, but only if it still belongs to `sock`.
    pub(crate) fn release(&self, port: Port, sock: &Arc<HomaSock>) {
        self.ports
            .remove_if(&port, |_, owner| Arc::ptr_eq(owner, sock));
    }

    /// Find the socket behind a destination port.
    pub(crate) fn find(&self, port: Port) -> Option<Arc<HomaSock>> {
        self.ports.get(&port).map(|s| s.clone())
    }

    /// Snapshot of all sockets (each socket appears once per registered
    /// port; callers deduplicate by client port if needed).
    pub(crate) fn sockets(&self) -> Vec<Arc<HomaSock>> {
        let mut seen: Vec<Arc<HomaSock>> = Vec::new();
        for entry in self.ports.iter() {
            if !seen.iter().any(|s| Arc::ptr_eq(s, entry.value())) {
                seen.push(entry.value().clone());
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HomaConfig;
    use crate::tests::mock::CaptureDriver;
    use crate::transport::Homa;

    #[test]
    fn test_client_ports_unique() {
        let homa = Homa::new(HomaConfig::default(), CaptureDriver::shared().1).unwrap();
        let a = homa.socket().unwrap();
        let b = homa.socket().unwrap();
        assert_ne!(a.client_port(), b.client_port());
        assert!(a.client_port() >= MIN_EPHEMERAL_PORT);
    }

    #[test]
    fn test_bind_conflicts() {
        let homa = Homa::new(HomaConfig::default(), CaptureDriver::shared().1).unwrap();
        let a = homa.socket().unwrap();
        let b = homa.socket().unwrap();
        a.bind(99).unwrap();
        assert_eq!(b.bind(99).unwrap_err(), HomaError::PortInUse(99));
        assert_eq!(
            b.bind(MIN_EPHEMERAL_PORT).unwrap_err(),
            HomaError::InvalidPort(MIN_EPHEMERAL_PORT)
        );
        assert_eq!(b.bind(0).unwrap_err(), HomaError::InvalidPort(0));
    }

    #[test]
    fn test_shutdown_releases_ports() {
        let homa = Homa::new(HomaConfig::default(), CaptureDriver::shared().1).unwrap();
        let a = homa.socket().unwrap();
        a.bind(98).unwrap();
        let client_port = a.client_port();
        a.shutdown();
        assert!(homa.socktab().find(98).is_none());
        assert!(homa.socktab().find(client_port).is_none());

        let b = homa.socket().unwrap();
        b.bind(98).unwrap();
    }
}
