//! Tunable transport parameters.
//!
//! Every field here has protocol effects; the defaults suit a 10 Gbps
//! datacenter fabric with eight switch priority levels.

use crate::error::{HomaError, Result};
use crate::type_alias::*;
use crate::util::math::roundup;
use crate::wire::{MAX_DATA_PER_PACKET, MAX_MESSAGE_SIZE, NUM_PRIORITIES};

/// Configuration for a [`Homa`](crate::Homa) instance.
#[derive(Debug, Clone)]
pub struct HomaConfig {
    /// A conservative estimate of the bytes that fit on the wire in the
    /// time it takes to send a full-size packet and receive a grant back.
    /// The transport keeps at least this much data authorized for every
    /// incoming message. Rounded up to full packets when used.
    pub rtt_bytes: usize,

    /// Raw uplink bandwidth, in units of 1e6 bits per second.
    pub link_mbps: u64,

    /// Highest priority level available to the transport.
    pub max_prio: Priority,

    /// Lowest priority level available to the transport.
    pub min_prio: Priority,

    /// Highest priority level used for scheduled (granted) packets.
    /// Levels above this are reserved for unscheduled bytes.
    pub max_sched_prio: Priority,

    /// Priority assignment for incoming unscheduled bytes: entry `i` is
    /// the largest message length that uses priority `i`. Entry 0 should
    /// be large enough to catch every message.
    pub unsched_cutoffs: [u32; NUM_PRIORITIES],

    /// Version tag published with `unsched_cutoffs`; bumped by the
    /// prios-changed hook so peers refresh on next contact.
    pub cutoff_version: u16,

    /// Bytes of additional authorization carried by each GRANT.
    pub grant_increment: usize,

    /// Maximum number of incoming messages granted to at any instant.
    pub max_overcommit: usize,

    /// Number of silent timer ticks before RESENDs start.
    pub resend_ticks: u32,

    /// Minimum number of timer ticks between RESENDs to the same peer.
    pub resend_interval: u32,

    /// Abort an RPC after this many unanswered RESENDs.
    pub abort_resends: u32,

    /// Upper bound on the NIC queue estimate: packets are withheld when
    /// `link_idle_time` is further than this in the future.
    pub max_nic_queue_ns: u64,

    /// Packets smaller than this bypass the throttle mechanism; they are
    /// CPU-bound, not link-bound.
    pub throttle_min_bytes: usize,

    /// Maximum payload bytes packed into one output frame. Frames larger
    /// than one packet rely on segmentation offload downstream.
    pub max_gso_size: usize,

    /// Enables additional logging.
    pub verbose: bool,
}

impl Default for HomaConfig {
    fn default() -> Self {
        Self {
            rtt_bytes: 10_000,
            link_mbps: 10_000,
            max_prio: 7,
            min_prio: 0,
            max_sched_prio: 5,
            unsched_cutoffs: [
                MAX_MESSAGE_SIZE as u32,
                MAX_MESSAGE_SIZE as u32,
                MAX_MESSAGE_SIZE as u32,
                MAX_MESSAGE_SIZE as u32,
                MAX_MESSAGE_SIZE as u32,
                MAX_MESSAGE_SIZE as u32,
                MAX_MESSAGE_SIZE as u32,
                MAX_DATA_PER_PACKET as u32,
            ],
            cutoff_version: 1,
            grant_increment: 10_000,
            max_overcommit: 8,
            resend_ticks: 5,
            resend_interval: 2,
            abort_resends: 10,
            max_nic_queue_ns: 100_000,
            throttle_min_bytes: 200,
            max_gso_size: 10_000,
            verbose: false,
        }
    }
}

impl HomaConfig {
    /// Check parameter ranges and internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.rtt_bytes == 0 {
            return Err(HomaError::InvalidConfig("rtt_bytes must be positive"));
        }
        if self.link_mbps == 0 {
            return Err(HomaError::InvalidConfig("link_mbps must be positive"));
        }
        if self.max_prio as usize >= NUM_PRIORITIES {
            return Err(HomaError::InvalidConfig("max_prio out of range"));
        }
        if self.min_prio > self.max_sched_prio || self.max_sched_prio > self.max_prio {
            return Err(HomaError::InvalidConfig(
                "require min_prio <= max_sched_prio <= max_prio",
            ));
        }
        if self.grant_increment == 0 {
            return Err(HomaError::InvalidConfig("grant_increment must be positive"));
        }
        if self.max_overcommit == 0 {
            return Err(HomaError::InvalidConfig("max_overcommit must be positive"));
        }
        if self.resend_ticks == 0 || self.abort_resends == 0 {
            return Err(HomaError::InvalidConfig(
                "resend_ticks and abort_resends must be positive",
            ));
        }
        if self.max_gso_size < MAX_DATA_PER_PACKET {
            return Err(HomaError::InvalidConfig(
                "max_gso_size smaller than one packet",
            ));
        }
        Ok(())
    }

    /// The unscheduled window: `rtt_bytes` rounded up to full packets.
    pub(crate) fn unscheduled_bytes(&self) -> usize {
        roundup(self.rtt_bytes, MAX_DATA_PER_PACKET)
    }

    /// Nanoseconds to transmit 1000 bytes on the uplink. Slightly
    /// overestimated so the NIC queue length is never underestimated.
    pub(crate) fn ns_per_kbyte(&self) -> u64 {
        (8_000_000 / self.link_mbps) * 105 / 100
    }
}
