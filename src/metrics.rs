//! Performance counters.
//!
//! Counters are striped across shards indexed by thread so the hot paths
//! never share a cache line with another core; a snapshot sums the shards.
//! All counters are free-running.

use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::RandomState;

use crate::wire::PktType;

/// Number of packet types tracked in the per-type arrays.
const NUM_PKT_TYPES: usize = 7;

/// Number of metric shards. Power of two; plenty for typical core counts.
const NUM_SHARDS: usize = 16;

/// One shard of counters. Incremented with relaxed atomics; a shard is
/// effectively thread-private so the atomics never contend.
#[derive(Default)]
pub(crate) struct Metrics {
    pub packets_sent: [AtomicU64; NUM_PKT_TYPES],
    pub packets_received: [AtomicU64; NUM_PKT_TYPES],
    pub requests_received: AtomicU64,
    pub responses_received: AtomicU64,
    pub short_packets: AtomicU64,
    pub unknown_packet_types: AtomicU64,
    pub unknown_rpcs: AtomicU64,
    pub server_cant_create_rpcs: AtomicU64,
    pub peer_new_entries: AtomicU64,
    pub peer_route_errors: AtomicU64,
    pub data_xmit_errors: AtomicU64,
    pub control_xmit_errors: AtomicU64,
    pub resent_packets: AtomicU64,
    pub client_rpc_timeouts: AtomicU64,
    pub server_rpc_timeouts: AtomicU64,
    pub rpcs_reaped: AtomicU64,
}

impl Metrics {
    #[inline(always)]
    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn pkt_sent(&self, t: PktType) {
        Self::inc(&self.packets_sent[t.index()]);
    }

    #[inline(always)]
    pub(crate) fn pkt_received(&self, t: PktType) {
        Self::inc(&self.packets_received[t.index()]);
    }
}

/// The striped counter set owned by a transport instance.
pub(crate) struct MetricsRegistry {
    shards: Box<[Metrics]>,
    hasher: RandomState,
}

impl MetricsRegistry {
    pub(crate) fn new() -> Self {
        Self {
            shards: (0..NUM_SHARDS).map(|_| Metrics::default()).collect(),
            hasher: RandomState::new(),
        }
    }

    /// The shard for the calling thread.
    #[inline]
    pub(crate) fn shard(&self) -> &Metrics {
        let mut h = self.hasher.build_hasher();
        std::thread::current().id().hash(&mut h);
        &self.shards[(h.finish() as usize) & (NUM_SHARDS - 1)]
    }

    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        let sum = |f: fn(&Metrics) -> &AtomicU64| -> u64 {
            self.shards
                .iter()
                .map(|m| f(m).load(Ordering::Relaxed))
                .sum()
        };
        let sum_array = |f: fn(&Metrics) -> &[AtomicU64; NUM_PKT_TYPES]| -> [u64; NUM_PKT_TYPES] {
            let mut out = [0u64; NUM_PKT_TYPES];
            for m in self.shards.iter() {
                for (o, c) in out.iter_mut().zip(f(m).iter()) {
                    *o += c.load(Ordering::Relaxed);
                }
            }
            out
        };
        MetricsSnapshot {
            packets_sent: sum_array(|m| &m.packets_sent),
            packets_received: sum_array(|m| &m.packets_received),
            requests_received: sum(|m| &m.requests_received),
            responses_received: sum(|m| &m.responses_received),
            short_packets: sum(|m| &m.short_packets),
            unknown_packet_types: sum(|m| &m.unknown_packet_types),
            unknown_rpcs: sum(|m| &m.unknown_rpcs),
            server_cant_create_rpcs: sum(|m| &m.server_cant_create_rpcs),
            peer_new_entries: sum(|m| &m.peer_new_entries),
            peer_route_errors: sum(|m| &m.peer_route_errors),
            data_xmit_errors: sum(|m| &m.data_xmit_errors),
            control_xmit_errors: sum(|m| &m.control_xmit_errors),
            resent_packets: sum(|m| &m.resent_packets),
            client_rpc_timeouts: sum(|m| &m.client_rpc_timeouts),
            server_rpc_timeouts: sum(|m| &m.server_rpc_timeouts),
            rpcs_reaped: sum(|m| &m.rpcs_reaped),
        }
    }
}

/// A point-in-time sum of all counter shards.
///
/// Per-type arrays are indexed by packet type code minus the DATA code
/// (entry 0 is DATA, entry 1 is GRANT, and so on).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub packets_sent: [u64; NUM_PKT_TYPES],
    pub packets_received: [u64; NUM_PKT_TYPES],
    pub requests_received: u64,
    pub responses_received: u64,
    pub short_packets: u64,
    pub unknown_packet_types: u64,
    pub unknown_rpcs: u64,
    pub server_cant_create_rpcs: u64,
    pub peer_new_entries: u64,
    pub peer_route_errors: u64,
    pub data_xmit_errors: u64,
    pub control_xmit_errors: u64,
    pub resent_packets: u64,
    pub client_rpc_timeouts: u64,
    pub server_rpc_timeouts: u64,
    pub rpcs_reaped: u64,
}

impl MetricsSnapshot {
    /// Packets sent with the given type code.
    pub fn sent(&self, type_code: u8) -> u64 {
        self.packets_sent[type_code as usize - PktType::Data as usize]
    }

    /// Packets received with the given type code.
    pub fn received(&self, type_code: u8) -> u64 {
        self.packets_received[type_code as usize - PktType::Data as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_striped_sum() {
        let reg = Arc::new(MetricsRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let reg = reg.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    Metrics::inc(&reg.shard().short_packets);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(reg.snapshot().short_packets, 4000);
    }

    #[test]
    fn test_per_type_indexing() {
        let reg = MetricsRegistry::new();
        reg.shard().pkt_sent(PktType::Grant);
        reg.shard().pkt_sent(PktType::Grant);
        reg.shard().pkt_received(PktType::Data);
        let snap = reg.snapshot();
        assert_eq!(snap.sent(PktType::Grant as u8), 2);
        assert_eq!(snap.received(PktType::Data as u8), 1);
        assert_eq!(snap.sent(PktType::Data as u8), 0);
    }
}
