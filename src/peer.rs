//! Peer records and the peer table.
//!
//! One [`Peer`] exists for every machine this host has communicated with,
//! as client or server. Entries are created lazily on first need and are
//! never removed for the lifetime of the process: peers are referenced
//! from many RPCs across many threads, and a table that never shrinks
//! lets all of them hold their references without coordination.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use ahash::RandomState;
use dashmap::DashMap;

use crate::driver::{Driver, Route};
use crate::metrics::{Metrics, MetricsRegistry};
use crate::type_alias::*;
use crate::wire::NUM_PRIORITIES;

/// State kept per remote machine.
pub(crate) struct Peer {
    /// IPv4 address of the machine.
    pub addr: Ipv4Addr,

    /// Route handle resolved once at creation and cached forever.
    pub route: Route,

    /// Priorities to use for unscheduled bytes sent to this host, as
    /// published in the most recent CUTOFFS packet from it.
    cutoffs: Mutex<[u32; NUM_PRIORITIES]>,

    /// Version from the most recent CUTOFFS packet received from this
    /// peer; 0 means none has arrived yet.
    pub cutoff_version: AtomicU16,

    /// Timer tick when we last sent a CUTOFFS packet to this peer; rate
    /// limits refreshes when the peer keeps sending stale versions.
    pub last_cutoffs_sent_tick: AtomicU32,

    /// Timer tick when we last sent a RESEND to this peer; rate limits
    /// RESENDs across all of the peer's RPCs.
    pub last_resend_tick: AtomicU32,
}

impl Peer {
    fn new(addr: Ipv4Addr, route: Route) -> Self {
        // Until the peer tells us otherwise, every message length maps to
        // the top priority band.
        Self {
            addr,
            route,
            cutoffs: Mutex::new([u32::MAX; NUM_PRIORITIES]),
            cutoff_version: AtomicU16::new(0),
            last_cutoffs_sent_tick: AtomicU32::new(0),
            last_resend_tick: AtomicU32::new(0),
        }
    }

    /// Select the priority for unscheduled bytes of a `length`-byte
    /// message sent to this peer: the highest priority whose cutoff
    /// admits the length.
    pub(crate) fn unsched_priority(&self, max_prio: Priority, length: usize) -> Priority {
        let cutoffs = self.cutoffs.lock().unwrap();
        let mut prio = max_prio as usize;
        loop {
            if length <= cutoffs[prio] as usize || prio == 0 {
                return prio as Priority;
            }
            prio -= 1;
        }
    }

    /// Install a cutoff vector received in a CUTOFFS packet.
    pub(crate) fn set_cutoffs(&self, cutoffs: [u32; NUM_PRIORITIES], version: u16) {
        *self.cutoffs.lock().unwrap() = cutoffs;
        self.cutoff_version.store(version, Ordering::Release);
    }
}

/// Address-to-peer table. Lookups never block; insertion takes a short
/// per-shard write lock inside the map.
pub(crate) struct PeerTab {
    peers: DashMap<Ipv4Addr, Arc<Peer>, RandomState>,
}

impl PeerTab {
    pub(crate) fn new() -> Self {
        Self {
            peers: DashMap::with_hasher(RandomState::new()),
        }
    }

    /// Return the peer for `addr`, creating it on first contact. `None`
    /// means the driver could not produce a route; the caller discards
    /// the triggering packet or fails the send.
    pub(crate) fn find(
        &self,
        addr: Ipv4Addr,
        driver: &dyn Driver,
        metrics: &MetricsRegistry,
    ) -> Option<Arc<Peer>> {
        if let Some(peer) = self.peers.get(&addr) {
            return Some(peer.clone());
        }
        let route = match driver.route(addr) {
            Ok(route) => route,
            Err(e) => {
                log::warn!("no route to peer {}: {}", addr, e);
                Metrics::inc(&metrics.shard().peer_route_errors);
                return None;
            }
        };
        let peer = self
            .peers
            .entry(addr)
            .or_insert_with(|| {
                Metrics::inc(&metrics.shard().peer_new_entries);
                Arc::new(Peer::new(addr, route))
            })
            .clone();
        Some(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::AtomicU64;

    struct FakeDriver {
        routes: AtomicU64,
        fail: bool,
    }

    impl Driver for FakeDriver {
        fn route(&self, _daddr: Ipv4Addr) -> io::Result<Route> {
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no route"));
            }
            Ok(Route(self.routes.fetch_add(1, Ordering::SeqCst)))
        }

        fn transmit(&self, _route: Route, _prio: Priority, _dgram: &[u8]) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_find_creates_once() {
        let tab = PeerTab::new();
        let driver = FakeDriver {
            routes: AtomicU64::new(0),
            fail: false,
        };
        let metrics = MetricsRegistry::new();
        let addr = Ipv4Addr::new(10, 0, 0, 1);

        let a = tab.find(addr, &driver, &metrics).unwrap();
        let b = tab.find(addr, &driver, &metrics).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(metrics.snapshot().peer_new_entries, 1);
    }

    #[test]
    fn test_route_failure_counted() {
        let tab = PeerTab::new();
        let driver = FakeDriver {
            routes: AtomicU64::new(0),
            fail: true,
        };
        let metrics = MetricsRegistry::new();
        assert!(tab
            .find(Ipv4Addr::new(10, 0, 0, 2), &driver, &metrics)
            .is_none());
        assert_eq!(metrics.snapshot().peer_route_errors, 1);
    }

    #[test]
    fn test_unsched_priority_scan() {
        let peer = Peer::new(Ipv4Addr::new(10, 0, 0, 1), Route(0));
        peer.set_cutoffs(
            [
                u32::MAX,
                u32::MAX,
                u32::MAX,
                u32::MAX,
                u32::MAX,
                u32::MAX,
                50_000,
                1_400,
            ],
            2,
        );
        // Short messages land in the highest band, longer ones fall
        // through toward lower priorities.
        assert_eq!(peer.unsched_priority(7, 100), 7);
        assert_eq!(peer.unsched_priority(7, 1_400), 7);
        assert_eq!(peer.unsched_priority(7, 1_401), 6);
        assert_eq!(peer.unsched_priority(7, 60_000), 5);
    }

    #[test]
    fn test_default_cutoffs_use_top_band() {
        let peer = Peer::new(Ipv4Addr::new(10, 0, 0, 1), Route(0));
        assert_eq!(peer.unsched_priority(7, 1_000_000), 7);
    }
}
