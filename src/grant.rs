//! The grant scheduler.
//!
//! All inbound messages that need grants are kept on one global list in
//! ascending `bytes_remaining` order (SRPT). On every DATA arrival for a
//! scheduled message the RPC is repositioned and grants are redistributed
//! across the first `max_overcommit` entries, keeping each of them
//! authorized at least one RTT of data ahead of what has arrived.
//!
//! The scheduler reads and writes only the atomic mirrors on the RPC
//! (`msgin_length`, `bytes_remaining`, `incoming`), never the RPC lock,
//! so grant arbitration cannot deadlock against per-RPC processing.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::rpc::{HomaRpc, MSGIN_UNINIT};
use crate::transport::Homa;
use crate::type_alias::*;
use crate::wire::{self, PktType};

pub(crate) struct GrantState {
    /// RPCs whose inbound messages need more grants, ascending by
    /// `bytes_remaining`; ties keep insertion order.
    grantable: Vec<Arc<HomaRpc>>,
}

impl GrantState {
    pub(crate) fn new() -> Self {
        Self {
            grantable: Vec::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.grantable.len()
    }

    #[cfg(test)]
    pub(crate) fn entries(&self) -> &[Arc<HomaRpc>] {
        &self.grantable
    }
}

impl Homa {
    /// Update an RPC's position in the grantable list after inbound
    /// progress, then redistribute grants.
    pub(crate) fn manage_grants(&self, rpc: &Arc<HomaRpc>) {
        let length = rpc.msgin_length.load(Ordering::Acquire);
        if length == MSGIN_UNINIT {
            return;
        }
        let remaining = rpc.bytes_remaining.load(Ordering::Acquire);

        let mut g = self.grantable().lock().unwrap();
        if rpc.in_grantable.load(Ordering::Relaxed) {
            if remaining == 0 {
                g.grantable.retain(|r| !Arc::ptr_eq(r, rpc));
                rpc.in_grantable.store(false, Ordering::Relaxed);
            } else if let Some(mut idx) = g.grantable.iter().position(|r| Arc::ptr_eq(r, rpc)) {
                // Inbound progress only shrinks bytes_remaining, so the
                // RPC can only move toward the head.
                while idx > 0
                    && g.grantable[idx - 1].bytes_remaining.load(Ordering::Acquire) > remaining
                {
                    g.grantable.swap(idx - 1, idx);
                    idx -= 1;
                }
            }
        } else if remaining > 0 && rpc.incoming.load(Ordering::Acquire) < length {
            // Insert after every entry with equal or fewer remaining
            // bytes, preserving insertion order on ties.
            let pos = g
                .grantable
                .iter()
                .position(|r| r.bytes_remaining.load(Ordering::Acquire) > remaining)
                .unwrap_or(g.grantable.len());
            g.grantable.insert(pos, rpc.clone());
            rpc.in_grantable.store(true, Ordering::Relaxed);
        }

        self.send_grants(&g.grantable);
    }

    /// Keep the top `max_overcommit` messages granted one RTT ahead.
    fn send_grants(&self, grantable: &[Arc<HomaRpc>]) {
        let config = self.config();
        for (rank, rpc) in grantable.iter().take(config.max_overcommit).enumerate() {
            let length = rpc.msgin_length.load(Ordering::Acquire);
            if length == MSGIN_UNINIT {
                continue;
            }
            let remaining = rpc.bytes_remaining.load(Ordering::Acquire);
            let received = length - remaining;
            let target = length.min(received + config.rtt_bytes);

            // Shorter messages get higher grant priority.
            let priority = (config.max_sched_prio as i32 - rank as i32)
                .max(config.min_prio as i32) as Priority;

            let mut cur = rpc.incoming.load(Ordering::Acquire);
            while cur < target {
                let next = (cur + config.grant_increment).min(length);
                rpc.incoming.fetch_max(next, Ordering::AcqRel);
                self.xmit_control(
                    rpc,
                    PktType::Grant,
                    wire::build_grant(rpc.common(PktType::Grant), next as u32, priority),
                );
                cur = next;
            }
        }
    }

    /// Drop an RPC from the grantable list (completion, abort, free).
    pub(crate) fn remove_from_grantable(&self, rpc: &Arc<HomaRpc>) {
        if rpc.in_grantable.swap(false, Ordering::Relaxed) {
            let mut g = self.grantable().lock().unwrap();
            g.grantable.retain(|r| !Arc::ptr_eq(r, rpc));
        }
    }
}
